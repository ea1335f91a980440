//! End-to-end retry-loop behavior against a real git repository and a
//! scripted model client.

use async_trait::async_trait;
use patchsmith::agent::{PursuitState, SelfCorrectingAgent};
use patchsmith::finding::{Category, Finding, FindingDraft, Location, Severity};
use patchsmith::llm::{LlmRequest, LlmResponse, ModelClient};
use patchsmith::memory::AttemptOutcome;
use patchsmith::prompt::PromptComposer;
use patchsmith::strategy::Strategy;
use patchsmith::trace::TraceRecorder;
use patchsmith::validator::{ErrorKind, PatchValidator};
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Replays canned responses in order and records every request it saw.
struct ScriptedClient {
    responses: Mutex<Vec<String>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedClient {
    fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn generate(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        let content = if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses
                .first()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))?
        };
        Ok(LlmResponse {
            content,
            usage: None,
            model: "scripted".to_string(),
        })
    }
}

const APP_PY: &str = "import os\nimport sys\n\n\ndef run():\n    try:\n        work()\n    except:\n        pass\n";

const EXCEPT_DIFF: &str = "--- a/app.py\n+++ b/app.py\n@@ -6,4 +6,4 @@\n     try:\n         work()\n-    except:\n+    except Exception:\n         pass\n";

const IMPORT_DIFF: &str =
    "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,1 @@\n-import os\n import sys\n";

/// Diff with a prefixless content line; git rejects it as corrupt.
const CORRUPT_DIFF: &str = "--- a/app.py\n+++ b/app.py\n@@ -6,4 +6,4 @@\n     try:\nwork()\n-    except:\n+    except Exception:\n         pass\n";

/// Context lines that exist nowhere in app.py.
const MISMATCHED_BATCH_DIFF: &str = "--- a/app.py\n+++ b/app.py\n@@ -1,2 +1,1 @@\n-import os\n import json\n@@ -6,4 +6,4 @@\n     try:\n         do_work()\n-    except:\n+    except Exception:\n         pass\n";

fn patches_json(diff: &str) -> String {
    serde_json::json!({
        "patches": [{
            "file_path": "app.py",
            "diff_content": diff,
            "summary": "fix the finding"
        }]
    })
    .to_string()
}

fn git_repo(content: &str) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let out = Command::new("git")
            .current_dir(tmp.path())
            .args(args)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {:?} failed", args);
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(tmp.path().join("app.py"), content).unwrap();
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "init"]);
    tmp
}

fn finding(rule_id: &str, line: usize, category: Category) -> Finding {
    Finding::new(FindingDraft {
        id: format!("{}:app.py:{}", rule_id, line),
        rule_id: rule_id.to_string(),
        message: match rule_id {
            "E722" => "bare except".to_string(),
            "F401" => "`os` imported but unused".to_string(),
            other => format!("{} reported", other),
        },
        severity: Severity::Warning,
        category,
        location: Location {
            file: PathBuf::from("app.py"),
            line,
            column: Some(1),
            end_line: None,
            end_column: None,
        },
        tool: "ruff".to_string(),
        suggested_fix: None,
    })
    .unwrap()
}

fn agent(repo: &TempDir, client: Arc<ScriptedClient>) -> SelfCorrectingAgent {
    SelfCorrectingAgent::new(
        client,
        PatchValidator::open(repo.path()).unwrap(),
        PromptComposer::new(repo.path(), 5),
        Arc::new(TraceRecorder::disabled()),
    )
}

/// Scenario A: a clean first response succeeds in exactly one attempt.
#[tokio::test]
async fn first_attempt_success() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![patches_json(EXCEPT_DIFF)]));
    let agent = agent(&repo, client.clone());

    let findings = vec![finding("E722", 8, Category::Correctness)];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(result.success);
    assert_eq!(result.state, PursuitState::Succeeded);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].attempt, 1);
    assert_eq!(result.attempts[0].strategy, Strategy::SinglePatch);
    assert_eq!(result.attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(result.patches.len(), 1);
    assert!(result.patches[0].diff.contains("except Exception:"));
    assert_eq!(client.requests().len(), 1);
}

/// Scenario B: prose first, then a valid patch; the second prompt carries the
/// first failure.
#[tokio::test]
async fn prose_response_recorded_then_retried() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![
        "I would replace the bare except with a specific exception.".to_string(),
        patches_json(EXCEPT_DIFF),
    ]));
    let agent = agent(&repo, client.clone());

    let findings = vec![finding("E722", 8, Category::Correctness)];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts.len(), 2);

    let first = &result.attempts[0];
    assert_eq!(first.outcome, AttemptOutcome::Failure);
    assert_eq!(first.error_kind, Some(ErrorKind::MalformedDiff));
    assert!(first.error.as_deref().unwrap().contains("no patch extracted"));

    // Feedback monotonicity: attempt 2's prompt quotes attempt 1's error.
    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user.contains(first.error.as_deref().unwrap()));
    assert!(requests[1].user.contains("Attempt 1 failed with:"));
    assert!(!requests[0].user.contains("failed with:"));
}

/// Scenario C: three corrupt patches exhaust the budget; every record is a
/// malformed-diff failure and the loop stops at exactly maxRetries.
#[tokio::test]
async fn corrupt_patches_exhaust_budget() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![patches_json(CORRUPT_DIFF)]));
    let agent = agent(&repo, client.clone());

    let findings = vec![finding("F841", 6, Category::Style)];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(!result.success);
    assert!(result.patches.is_empty());
    assert_eq!(result.state, PursuitState::Exhausted);
    assert_eq!(result.attempts.len(), 3);
    for record in &result.attempts {
        assert_eq!(record.outcome, AttemptOutcome::Failure);
        assert_eq!(record.error_kind, Some(ErrorKind::MalformedDiff));
        assert!(record.error.as_deref().unwrap().contains("corrupt patch"));
    }

    // Verbatim git stderr flows into each retry prompt.
    let requests = client.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[1].user.contains("corrupt patch"));
    assert!(requests[2].user.contains("corrupt patch"));
}

/// Scenario D: a two-finding batch fails on mismatched context, the next
/// attempt goes per-finding and lands both patches.
#[tokio::test]
async fn batch_demotes_to_per_finding_patches() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![
        patches_json(MISMATCHED_BATCH_DIFF),
        patches_json(IMPORT_DIFF),
        patches_json(EXCEPT_DIFF),
    ]));
    let agent = agent(&repo, client.clone());

    let findings = vec![
        finding("F401", 1, Category::Import),
        finding("E722", 8, Category::Correctness),
    ];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(result.success, "attempts: {:?}", result.attempts);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].strategy, Strategy::BatchPatch);
    assert_eq!(
        result.attempts[0].error_kind,
        Some(ErrorKind::ContextMismatch)
    );
    // The retry works one finding at a time with extended context.
    assert!(result.attempts[1].strategy.per_finding());
    assert_eq!(result.patches.len(), 2);
    assert!(result.patches.iter().any(|p| p.diff.contains("-import os")));
    assert!(result
        .patches
        .iter()
        .any(|p| p.diff.contains("except Exception:")));
    // One batch call, then one call per finding.
    assert_eq!(client.requests().len(), 3);
}

/// Budget bound: the loop never exceeds maxRetries attempts, whatever comes
/// back.
#[tokio::test]
async fn budget_bound_holds() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec!["no diff here".to_string()]));
    let agent = agent(&repo, client.clone());

    let findings = vec![finding("E722", 8, Category::Correctness)];
    for budget in [1u32, 2, 5] {
        let result = agent.achieve_goal(&findings, budget).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts.len(), budget as usize);
        let numbers: Vec<u32> = result.attempts.iter().map(|r| r.attempt).collect();
        assert_eq!(numbers, (1..=budget).collect::<Vec<u32>>());
    }
}

/// Strategy escalation: after a context-mismatch failure, the follow-up
/// attempts stay on the contextual strategy instead of repeating the batch.
#[tokio::test]
async fn context_mismatch_escalates() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![patches_json(
        MISMATCHED_BATCH_DIFF,
    )]));
    let agent = agent(&repo, client.clone());

    let findings = vec![
        finding("F401", 1, Category::Import),
        finding("E722", 8, Category::Correctness),
    ];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts[0].strategy, Strategy::BatchPatch);
    assert_eq!(result.attempts[1].strategy, Strategy::ContextualPatch);
    assert_eq!(result.attempts[2].strategy, Strategy::ContextualPatch);
}

/// Idempotence: on an already-fixed file a no-op patch validates as a pass.
#[tokio::test]
async fn noop_apply_on_fixed_file_is_success() {
    let fixed = APP_PY.replace("except:", "except Exception:");
    let repo = git_repo(&fixed);

    let noop = "--- a/app.py\n+++ b/app.py\n@@ -6,4 +6,4 @@\n     try:\n         work()\n-    except Exception:\n+    except Exception:\n         pass\n";
    let client = Arc::new(ScriptedClient::new(vec![patches_json(noop)]));
    let agent = agent(&repo, client.clone());

    let findings = vec![finding("E722", 8, Category::Correctness)];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts.len(), 1);
}

/// Traces are emitted for failed attempts too, keyed per attempt.
#[tokio::test]
async fn failed_attempts_leave_traces() {
    let repo = git_repo(APP_PY);
    let client = Arc::new(ScriptedClient::new(vec![
        "nothing useful".to_string(),
        patches_json(EXCEPT_DIFF),
    ]));
    let tracer = Arc::new(TraceRecorder::open(repo.path()));
    let agent = SelfCorrectingAgent::new(
        client,
        PatchValidator::open(repo.path()).unwrap(),
        PromptComposer::new(repo.path(), 5),
        tracer.clone(),
    );

    let findings = vec![finding("E722", 8, Category::Correctness)];
    let result = agent.achieve_goal(&findings, 3).await.unwrap();
    assert!(result.success);

    let rows = tracer.for_finding("E722", "app.py", 8);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, 1);
    assert_eq!(rows[0].1, "failure");
    assert_eq!(rows[1].1, "success");
}

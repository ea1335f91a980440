//! The self-correcting retry loop
//!
//! One goal pursuit = one finding (or a same-file group) driven through
//! propose -> validate -> record -> retry until a patch applies or the budget
//! runs out. The loop is an explicit bounded state machine over an
//! accumulating attempt log; failure to produce a patch is a normal result,
//! not an error. Only broken preconditions (no findings, mixed files, a root
//! that is not a repository) surface as hard errors, and those are checked
//! before the first attempt.

use crate::finding::Finding;
use crate::llm::{LlmRequest, ModelClient};
use crate::memory::{AgentMemory, AttemptOutcome, AttemptRecord};
use crate::parse::{self, PatchCandidate};
use crate::prompt::{Feedback, PromptComposer};
use crate::strategy::{select_strategy, Strategy};
use crate::trace::{AttemptTrace, TraceRecorder};
use crate::validator::{ErrorKind, PatchValidator};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Lifecycle of one pursuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PursuitState {
    Pending,
    Attempting,
    Succeeded,
    Exhausted,
}

/// What a pursuit returns to the caller: a verdict plus the full attempt
/// history for reporting.
#[derive(Debug)]
pub struct GoalResult {
    pub goal_id: Uuid,
    pub success: bool,
    /// Validated patches; empty unless `success`. A demoted group pursuit can
    /// legitimately carry one patch per finding.
    pub patches: Vec<PatchCandidate>,
    pub attempts: Vec<AttemptRecord>,
    pub state: PursuitState,
}

impl GoalResult {
    pub fn total_cost_usd(&self) -> f64 {
        self.attempts.iter().map(|r| r.cost_usd).sum()
    }
}

/// Working state for one pursuit; discarded when the loop terminates.
struct GoalContext {
    goal_id: Uuid,
    findings: Vec<Finding>,
    memory: AgentMemory,
    /// Most recent failed diff body, fuel for the format-repair strategy.
    last_failed_patch: Option<String>,
    state: PursuitState,
}

/// Everything one attempt produced, before it becomes a record plus traces.
struct AttemptReport {
    outcome: AttemptOutcome,
    error: Option<String>,
    error_kind: Option<ErrorKind>,
    patches: Vec<PatchCandidate>,
    calls: Vec<CallLog>,
    usage: crate::llm::Usage,
    cost_usd: f64,
    latency_ms: u64,
}

/// One model round-trip inside an attempt, kept for tracing.
struct CallLog {
    finding_index: usize,
    prompt: String,
    system: String,
    response: String,
    model: String,
}

pub struct SelfCorrectingAgent {
    client: Arc<dyn ModelClient>,
    validator: PatchValidator,
    composer: PromptComposer,
    tracer: Arc<TraceRecorder>,
}

impl SelfCorrectingAgent {
    pub fn new(
        client: Arc<dyn ModelClient>,
        validator: PatchValidator,
        composer: PromptComposer,
        tracer: Arc<TraceRecorder>,
    ) -> Self {
        Self {
            client,
            validator,
            composer,
            tracer,
        }
    }

    /// Drive the retry loop for one finding or same-file group.
    ///
    /// Returns `Ok` with `success = false` when the budget runs out; `Err` is
    /// reserved for broken preconditions.
    pub async fn achieve_goal(&self, findings: &[Finding], max_retries: u32) -> Result<GoalResult> {
        if findings.is_empty() {
            anyhow::bail!("achieve_goal called with no findings");
        }
        let file = &findings[0].location.file;
        if findings.iter().any(|f| &f.location.file != file) {
            anyhow::bail!("A goal pursuit must stay within one file; group findings per file");
        }

        let mut ctx = GoalContext {
            goal_id: Uuid::new_v4(),
            findings: findings.to_vec(),
            memory: AgentMemory::new(),
            last_failed_patch: None,
            state: PursuitState::Pending,
        };

        let mut patches = Vec::new();

        while ctx.memory.attempts() < max_retries as usize
            && ctx.state != PursuitState::Succeeded
        {
            ctx.state = PursuitState::Attempting;
            let attempt_number = ctx.memory.next_attempt_number();

            let mut strategy = select_strategy(&ctx.findings, &ctx.memory);
            // A repair prompt with nothing to repair degrades to regenerating.
            if strategy == Strategy::FormatRepair && ctx.last_failed_patch.is_none() {
                strategy = Strategy::SinglePatch;
            }

            let report = self.run_attempt(&ctx, strategy).await;

            let record = AttemptRecord {
                attempt: attempt_number,
                strategy,
                outcome: report.outcome,
                error: report.error.clone(),
                error_kind: report.error_kind,
                timestamp: Utc::now(),
                usage: Some(report.usage),
                cost_usd: report.cost_usd,
                latency_ms: report.latency_ms,
            };

            self.emit_traces(&ctx, &record, &report);
            ctx.memory.record(record);

            match report.outcome {
                AttemptOutcome::Success => {
                    patches = report.patches;
                    ctx.state = PursuitState::Succeeded;
                }
                AttemptOutcome::Failure | AttemptOutcome::Error => {
                    if let Some(first_failed) = report.patches.first() {
                        ctx.last_failed_patch = Some(first_failed.diff.clone());
                    }
                }
            }
        }

        if ctx.state != PursuitState::Succeeded {
            ctx.state = PursuitState::Exhausted;
        }

        let success = ctx.state == PursuitState::Succeeded;
        Ok(GoalResult {
            goal_id: ctx.goal_id,
            success,
            patches,
            attempts: ctx.memory.records().to_vec(),
            state: ctx.state,
        })
    }

    /// Run one attempt with the chosen strategy. Never fails: transport and
    /// parse problems become the attempt's outcome.
    async fn run_attempt(&self, ctx: &GoalContext, strategy: Strategy) -> AttemptReport {
        let feedback_error = ctx.memory.feedback_for_next_attempt().map(str::to_string);
        let feedback = feedback_error.as_deref().map(|error| Feedback {
            attempt: ctx
                .memory
                .records()
                .iter()
                .rev()
                .find(|r| r.failed())
                .map(|r| r.attempt)
                .unwrap_or(1),
            error,
            kind: ctx.memory.last_error_kind(),
        });

        let mut report = AttemptReport {
            outcome: AttemptOutcome::Failure,
            error: None,
            error_kind: None,
            patches: Vec::new(),
            calls: Vec::new(),
            usage: crate::llm::Usage::default(),
            cost_usd: 0.0,
            latency_ms: 0,
        };

        // Per-finding strategies make one call per finding; batch and repair
        // make a single call for the whole goal.
        let call_targets: Vec<(usize, &[Finding])> = if strategy.per_finding() {
            ctx.findings
                .iter()
                .enumerate()
                .map(|(i, _)| (i, &ctx.findings[i..i + 1]))
                .collect()
        } else {
            vec![(0, ctx.findings.as_slice())]
        };
        let calls_total = call_targets.len();

        let mut valid: Vec<PatchCandidate> = Vec::new();
        let mut findings_fixed = 0usize;
        let mut failures: Vec<String> = Vec::new();
        let mut first_kind: Option<ErrorKind> = None;
        let mut failed_patch: Option<PatchCandidate> = None;

        for (finding_index, target) in call_targets {
            let bundle = match self.composer.compose(
                strategy,
                target,
                feedback,
                ctx.last_failed_patch.as_deref(),
            ) {
                Ok(bundle) => bundle,
                Err(err) => {
                    failures.push(format!("prompt composition failed: {}", err));
                    first_kind.get_or_insert(ErrorKind::Other);
                    continue;
                }
            };

            let request = LlmRequest {
                system: bundle.system.clone(),
                user: bundle.user.clone(),
                model: strategy.model(),
                json_mode: true,
            };

            let started = Instant::now();
            let response = self.client.generate(&request).await;
            report.latency_ms += started.elapsed().as_millis() as u64;

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    // Transport retries are already spent inside the client;
                    // this attempt is charged and the loop moves on.
                    report.calls.push(CallLog {
                        finding_index,
                        prompt: bundle.user,
                        system: bundle.system,
                        response: String::new(),
                        model: strategy.model().id().to_string(),
                    });
                    report.outcome = AttemptOutcome::Error;
                    report.error = Some(format!("model call failed: {}", err));
                    report.error_kind = Some(ErrorKind::Other);
                    return report;
                }
            };

            if let Some(usage) = response.usage {
                report.usage.prompt_tokens += usage.prompt_tokens;
                report.usage.completion_tokens += usage.completion_tokens;
                report.usage.total_tokens += usage.total_tokens;
                report.cost_usd += usage.calculate_cost(strategy.model());
            }

            let candidates = parse::interpret(&response.content, strategy);
            report.calls.push(CallLog {
                finding_index,
                prompt: bundle.user,
                system: bundle.system,
                response: response.content,
                model: response.model,
            });

            if candidates.is_empty() {
                failures.push("no patch extracted from model response".to_string());
                first_kind.get_or_insert(ErrorKind::MalformedDiff);
                continue;
            }

            let mut fixed_this_target = false;
            for candidate in candidates {
                let result = self.validator.validate(&candidate);
                if result.applies {
                    let mut accepted = candidate;
                    if let Some(repaired) = result.repaired_diff {
                        accepted.diff = repaired;
                    }
                    valid.push(accepted);
                    fixed_this_target = true;
                } else {
                    failures.push(format!(
                        "Git apply failed for {}: {}",
                        candidate.file_path.display(),
                        result.error
                    ));
                    if first_kind.is_none() {
                        first_kind = result.kind;
                    }
                    if failed_patch.is_none() {
                        failed_patch = Some(candidate);
                    }
                }
            }
            if fixed_this_target {
                findings_fixed += 1;
            }
        }

        // A whole-goal call succeeds if anything validated; a per-finding
        // sweep succeeds only when every finding got a patch.
        let succeeded = if strategy.per_finding() {
            findings_fixed == calls_total && !valid.is_empty()
        } else {
            !valid.is_empty()
        };

        if succeeded {
            report.outcome = AttemptOutcome::Success;
            report.patches = valid;
        } else {
            report.outcome = AttemptOutcome::Failure;
            report.error = Some(if failures.is_empty() {
                "no candidate passed validation".to_string()
            } else {
                failures.join("; ")
            });
            report.error_kind = Some(first_kind.unwrap_or(ErrorKind::Other));
            // Keep the best broken diff around for a repair attempt.
            report.patches = failed_patch.into_iter().collect();
        }

        report
    }

    /// One trace per model call, keyed by the finding that call targeted.
    fn emit_traces(&self, ctx: &GoalContext, record: &AttemptRecord, report: &AttemptReport) {
        for call in &report.calls {
            let finding = &ctx.findings[call.finding_index];
            let trace = AttemptTrace::from_attempt(
                ctx.goal_id,
                &finding.rule_id,
                &finding.location.file,
                finding.location.line,
                record,
                &call.prompt,
                &call.system,
                &call.response,
                &call.model,
            );
            self.tracer.record(&trace);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::test_finding;
    use crate::llm::LlmResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned responses in order; repeats the last one when drained.
    struct ScriptedClient {
        responses: Mutex<Vec<anyhow::Result<String>>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<anyhow::Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn generate(&self, _request: &LlmRequest) -> anyhow::Result<LlmResponse> {
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses
                    .first_mut()
                    .map(|r| match r {
                        Ok(s) => Ok(s.clone()),
                        Err(e) => Err(anyhow::anyhow!("{}", e)),
                    })
                    .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
            };
            next.map(|content| LlmResponse {
                content,
                usage: None,
                model: "scripted".to_string(),
            })
        }
    }

    fn agent_for(repo: &std::path::Path, client: ScriptedClient) -> SelfCorrectingAgent {
        SelfCorrectingAgent::new(
            Arc::new(client),
            PatchValidator::open(repo).unwrap(),
            PromptComposer::new(repo, 3),
            Arc::new(TraceRecorder::disabled()),
        )
    }

    fn test_repo(content: &str) -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let out = std::process::Command::new("git")
                .current_dir(tmp.path())
                .args(args)
                .output()
                .unwrap();
            assert!(out.status.success());
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "t@t"]);
        run(&["config", "user.name", "t"]);
        std::fs::write(tmp.path().join("app.py"), content).unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        tmp
    }

    #[tokio::test]
    async fn test_empty_findings_is_a_hard_error() {
        let repo = test_repo("x = 1\n");
        let agent = agent_for(repo.path(), ScriptedClient::new(vec![]));
        assert!(agent.achieve_goal(&[], 3).await.is_err());
    }

    #[tokio::test]
    async fn test_mixed_files_is_a_hard_error() {
        let repo = test_repo("x = 1\n");
        let agent = agent_for(repo.path(), ScriptedClient::new(vec![]));
        let findings = vec![
            test_finding("E722", "app.py", 1),
            test_finding("E722", "lib.py", 1),
        ];
        assert!(agent.achieve_goal(&findings, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_zero_budget_returns_exhausted_without_calls() {
        let repo = test_repo("x = 1\n");
        let agent = agent_for(
            repo.path(),
            ScriptedClient::new(vec![Err(anyhow::anyhow!("must not be called"))]),
        );
        let findings = vec![test_finding("E722", "app.py", 1)];

        let result = agent.achieve_goal(&findings, 0).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.state, PursuitState::Exhausted);
        assert!(result.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_counts_as_error_attempt() {
        let repo = test_repo("x = 1\n");
        let agent = agent_for(
            repo.path(),
            ScriptedClient::new(vec![
                Err(anyhow::anyhow!("rate limited after retries")),
                Err(anyhow::anyhow!("rate limited after retries")),
            ]),
        );
        let findings = vec![test_finding("E722", "app.py", 1)];

        let result = agent.achieve_goal(&findings, 2).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts.len(), 2);
        assert!(result
            .attempts
            .iter()
            .all(|r| r.outcome == AttemptOutcome::Error));
        // The transport error text is carried as feedback-visible error.
        assert!(result.attempts[0]
            .error
            .as_deref()
            .unwrap()
            .contains("rate limited"));
    }
}

//! Concurrent pursuit execution
//!
//! Pursuits for different files are independent and run concurrently up to a
//! limit; pursuits touching the same file are chained, because the validator
//! dry-runs against the shared working tree and a real apply for one pursuit
//! must not race another pursuit's check on the same file. Inside a pursuit
//! the loop stays sequential by construction.

use crate::agent::{GoalResult, SelfCorrectingAgent};
use crate::finding::Finding;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub max_retries: u32,
    /// Concurrent pursuits across distinct files.
    pub concurrency: usize,
    /// Wall-clock bound on one pursuit; unfinished attempts are abandoned.
    pub goal_timeout: Option<Duration>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            concurrency: 4,
            goal_timeout: None,
        }
    }
}

#[derive(Debug)]
pub enum PursuitStatus {
    Completed(GoalResult),
    TimedOut,
    /// Precondition failure from `achieve_goal`.
    Failed(String),
}

#[derive(Debug)]
pub struct PursuitReport {
    pub file: PathBuf,
    pub findings: usize,
    pub status: PursuitStatus,
}

impl PursuitReport {
    pub fn succeeded(&self) -> bool {
        matches!(&self.status, PursuitStatus::Completed(r) if r.success)
    }
}

/// Group findings by file, sorted by path then line, so runs are
/// deterministic regardless of input order.
pub fn group_by_file(findings: Vec<Finding>) -> Vec<Vec<Finding>> {
    let mut by_file: BTreeMap<PathBuf, Vec<Finding>> = BTreeMap::new();
    for finding in findings {
        by_file
            .entry(finding.location.file.clone())
            .or_default()
            .push(finding);
    }
    by_file
        .into_values()
        .map(|mut group| {
            group.sort_by_key(|f| f.location.line);
            group
        })
        .collect()
}

/// Run every group to completion. Groups sharing a file run back to back;
/// distinct files run concurrently up to `options.concurrency`.
pub async fn run_pursuits(
    agent: &SelfCorrectingAgent,
    groups: Vec<Vec<Finding>>,
    options: &RunnerOptions,
) -> Vec<PursuitReport> {
    let mut queues: BTreeMap<PathBuf, Vec<Vec<Finding>>> = BTreeMap::new();
    for group in groups {
        let Some(first) = group.first() else { continue };
        queues
            .entry(first.location.file.clone())
            .or_default()
            .push(group);
    }

    let tasks = queues.into_iter().map(|(file, file_groups)| async move {
        let mut reports = Vec::with_capacity(file_groups.len());
        for group in file_groups {
            let findings = group.len();
            let pursuit = agent.achieve_goal(&group, options.max_retries);
            let status = match options.goal_timeout {
                Some(limit) => match tokio::time::timeout(limit, pursuit).await {
                    Ok(Ok(result)) => PursuitStatus::Completed(result),
                    Ok(Err(err)) => PursuitStatus::Failed(err.to_string()),
                    Err(_) => PursuitStatus::TimedOut,
                },
                None => match pursuit.await {
                    Ok(result) => PursuitStatus::Completed(result),
                    Err(err) => PursuitStatus::Failed(err.to_string()),
                },
            };
            reports.push(PursuitReport {
                file: file.clone(),
                findings,
                status,
            });
        }
        reports
    });

    stream::iter(tasks)
        .buffer_unordered(options.concurrency.max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finding::test_finding;
    use crate::llm::{LlmRequest, LlmResponse, ModelClient};
    use crate::prompt::PromptComposer;
    use crate::trace::TraceRecorder;
    use crate::validator::PatchValidator;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct ProseClient;

    #[async_trait]
    impl ModelClient for ProseClient {
        async fn generate(&self, _request: &LlmRequest) -> anyhow::Result<LlmResponse> {
            Ok(LlmResponse {
                content: "I cannot produce a diff right now.".to_string(),
                usage: None,
                model: "stub".to_string(),
            })
        }
    }

    fn test_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
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
        for (name, content) in files {
            std::fs::write(tmp.path().join(name), content).unwrap();
        }
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        tmp
    }

    #[test]
    fn test_group_by_file_is_sorted_and_split() {
        let findings = vec![
            test_finding("F401", "b.py", 9),
            test_finding("E722", "a.py", 12),
            test_finding("E501", "b.py", 2),
        ];
        let groups = group_by_file(findings);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].location.file, PathBuf::from("a.py"));
        assert_eq!(groups[1][0].location.line, 2);
        assert_eq!(groups[1][1].location.line, 9);
    }

    #[tokio::test]
    async fn test_pursuits_complete_across_files() {
        let repo = test_repo(&[("a.py", "x = 1\n"), ("b.py", "y = 2\n")]);
        let agent = SelfCorrectingAgent::new(
            Arc::new(ProseClient),
            PatchValidator::open(repo.path()).unwrap(),
            PromptComposer::new(repo.path(), 3),
            Arc::new(TraceRecorder::disabled()),
        );

        let groups = group_by_file(vec![
            test_finding("E722", "a.py", 1),
            test_finding("E722", "b.py", 1),
        ]);
        let options = RunnerOptions {
            max_retries: 1,
            concurrency: 2,
            goal_timeout: None,
        };

        let reports = run_pursuits(&agent, groups, &options).await;
        assert_eq!(reports.len(), 2);
        // Prose responses never validate, but every pursuit still reports.
        for report in &reports {
            assert!(!report.succeeded());
            match &report.status {
                PursuitStatus::Completed(result) => assert_eq!(result.attempts.len(), 1),
                other => panic!("unexpected status: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_same_file_groups_both_run() {
        let repo = test_repo(&[("a.py", "x = 1\ny = 2\n")]);
        let agent = SelfCorrectingAgent::new(
            Arc::new(ProseClient),
            PatchValidator::open(repo.path()).unwrap(),
            PromptComposer::new(repo.path(), 3),
            Arc::new(TraceRecorder::disabled()),
        );

        let groups = vec![
            vec![test_finding("E722", "a.py", 1)],
            vec![test_finding("F401", "a.py", 2)],
        ];
        let options = RunnerOptions {
            max_retries: 1,
            concurrency: 4,
            goal_timeout: None,
        };

        let reports = run_pursuits(&agent, groups, &options).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.file == PathBuf::from("a.py")));
    }
}

//! Attempt memory for one goal pursuit
//!
//! An append-only log of what was tried and how it failed, scoped to a single
//! pursuit and discarded with it. The two consumers are strategy selection
//! (which strategies failed, with what error kind) and the prompt composer
//! (the most recent failure's verbatim error text). This is not a cross-run
//! learning store.

use crate::llm::Usage;
use crate::strategy::Strategy;
use crate::validator::ErrorKind;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// A candidate validated cleanly.
    Success,
    /// The loop ran but no candidate validated (or none was extracted).
    Failure,
    /// The model call itself failed after transport-level retries.
    Error,
}

/// One pass through the loop. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 1-based, strictly increasing within a pursuit.
    pub attempt: u32,
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    /// Verbatim validator (or transport) error text.
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
    pub usage: Option<Usage>,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

impl AttemptRecord {
    pub fn failed(&self) -> bool {
        self.outcome != AttemptOutcome::Success
    }
}

/// Append-only attempt log for one pursuit.
#[derive(Debug, Default)]
pub struct AgentMemory {
    records: Vec<AttemptRecord>,
}

impl AgentMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attempt number the next record must carry.
    pub fn next_attempt_number(&self) -> u32 {
        self.records.len() as u32 + 1
    }

    /// Append a record. Numbers must arrive in order; a skewed number means a
    /// caller bug, and the record is renumbered rather than trusted.
    pub fn record(&mut self, mut record: AttemptRecord) {
        let expected = self.next_attempt_number();
        if record.attempt != expected {
            eprintln!(
                "  Warning: attempt record numbered {} arrived at position {}",
                record.attempt, expected
            );
            record.attempt = expected;
        }
        self.records.push(record);
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn attempts(&self) -> usize {
        self.records.len()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.records.last()
    }

    /// Verbatim error text of the most recent failed attempt, for the next
    /// prompt. None before the first failure.
    pub fn feedback_for_next_attempt(&self) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| r.failed())
            .and_then(|r| r.error.as_deref())
    }

    /// Strategies in the order they were tried.
    pub fn strategy_history(&self) -> Vec<Strategy> {
        self.records.iter().map(|r| r.strategy).collect()
    }

    /// Error kind of the most recent attempt, if it failed.
    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last().filter(|r| r.failed()).and_then(|r| r.error_kind)
    }

    /// True when the last two attempts used `strategy` and both failed.
    pub fn failed_twice_with(&self, strategy: Strategy) -> bool {
        let n = self.records.len();
        if n < 2 {
            return false;
        }
        self.records[n - 2..]
            .iter()
            .all(|r| r.strategy == strategy && r.failed())
    }

    pub fn total_cost_usd(&self) -> f64 {
        self.records.iter().map(|r| r.cost_usd).sum()
    }
}

#[cfg(test)]
pub(crate) fn test_record(
    attempt: u32,
    strategy: Strategy,
    outcome: AttemptOutcome,
    error: Option<(&str, ErrorKind)>,
) -> AttemptRecord {
    AttemptRecord {
        attempt,
        strategy,
        outcome,
        error: error.map(|(text, _)| text.to_string()),
        error_kind: error.map(|(_, kind)| kind),
        timestamp: Utc::now(),
        usage: None,
        cost_usd: 0.0,
        latency_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_numbers_strictly_increase() {
        let mut memory = AgentMemory::new();
        assert_eq!(memory.next_attempt_number(), 1);

        memory.record(test_record(1, Strategy::SinglePatch, AttemptOutcome::Failure, None));
        memory.record(test_record(2, Strategy::SinglePatch, AttemptOutcome::Failure, None));
        assert_eq!(memory.next_attempt_number(), 3);

        let numbers: Vec<u32> = memory.records().iter().map(|r| r.attempt).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn test_skewed_number_is_renumbered() {
        let mut memory = AgentMemory::new();
        memory.record(test_record(7, Strategy::SinglePatch, AttemptOutcome::Failure, None));
        assert_eq!(memory.records()[0].attempt, 1);
    }

    #[test]
    fn test_feedback_is_latest_failure() {
        let mut memory = AgentMemory::new();
        assert!(memory.feedback_for_next_attempt().is_none());

        memory.record(test_record(
            1,
            Strategy::BatchPatch,
            AttemptOutcome::Failure,
            Some(("corrupt patch at line 11", ErrorKind::MalformedDiff)),
        ));
        memory.record(test_record(
            2,
            Strategy::SinglePatch,
            AttemptOutcome::Failure,
            Some(("patch failed: app.py:12", ErrorKind::ContextMismatch)),
        ));

        assert_eq!(
            memory.feedback_for_next_attempt(),
            Some("patch failed: app.py:12")
        );
        assert_eq!(memory.last_error_kind(), Some(ErrorKind::ContextMismatch));
    }

    #[test]
    fn test_feedback_ignores_trailing_success() {
        let mut memory = AgentMemory::new();
        memory.record(test_record(
            1,
            Strategy::SinglePatch,
            AttemptOutcome::Failure,
            Some(("boom", ErrorKind::Other)),
        ));
        memory.record(test_record(2, Strategy::SinglePatch, AttemptOutcome::Success, None));

        assert_eq!(memory.feedback_for_next_attempt(), Some("boom"));
        assert!(memory.last_error_kind().is_none());
    }

    #[test]
    fn test_failed_twice_with() {
        let mut memory = AgentMemory::new();
        memory.record(test_record(1, Strategy::BatchPatch, AttemptOutcome::Failure, None));
        assert!(!memory.failed_twice_with(Strategy::BatchPatch));

        memory.record(test_record(2, Strategy::BatchPatch, AttemptOutcome::Failure, None));
        assert!(memory.failed_twice_with(Strategy::BatchPatch));
        assert!(!memory.failed_twice_with(Strategy::SinglePatch));
    }

    #[test]
    fn test_strategy_history_order() {
        let mut memory = AgentMemory::new();
        memory.record(test_record(1, Strategy::BatchPatch, AttemptOutcome::Failure, None));
        memory.record(test_record(2, Strategy::SinglePatch, AttemptOutcome::Success, None));
        assert_eq!(
            memory.strategy_history(),
            vec![Strategy::BatchPatch, Strategy::SinglePatch]
        );
    }
}

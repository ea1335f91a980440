//! Attempt tracing
//!
//! Persists a full record of every attempt (prompt, response, validation
//! outcome, cost) in `.patchsmith/traces/`: a SQLite database for queries
//! plus one JSON file per trace for eyeballing. Keyed by (rule id, file,
//! line, attempt) so every retry for the same finding is individually
//! retrievable.
//!
//! This is a side channel. A recorder that cannot open its storage degrades
//! to a no-op, and a failed write warns and moves on; the retry loop never
//! sees either.

use crate::memory::{AttemptOutcome, AttemptRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// One trace row, everything the offline viewer needs.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptTrace {
    pub trace_id: String,
    pub goal_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rule_id: String,
    pub file: String,
    pub line: usize,
    pub attempt: u32,
    pub strategy: String,
    pub model: String,
    pub outcome: String,
    pub error_kind: Option<String>,
    pub validation_error: Option<String>,
    pub prompt: String,
    pub system_prompt: String,
    pub response: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
}

impl AttemptTrace {
    /// Assemble a trace from an attempt record plus the texts that never make
    /// it into memory.
    pub fn from_attempt(
        goal_id: Uuid,
        rule_id: &str,
        file: &Path,
        line: usize,
        record: &AttemptRecord,
        prompt: &str,
        system_prompt: &str,
        response: &str,
        model: &str,
    ) -> Self {
        let basename = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let trace_id = format!(
            "{}_{}_{}_{}_{}",
            record.strategy.name(),
            basename,
            line,
            record.attempt,
            Uuid::new_v4().simple()
        );

        Self {
            trace_id,
            goal_id,
            timestamp: record.timestamp,
            rule_id: rule_id.to_string(),
            file: file.display().to_string(),
            line,
            attempt: record.attempt,
            strategy: record.strategy.name().to_string(),
            model: model.to_string(),
            outcome: match record.outcome {
                AttemptOutcome::Success => "success",
                AttemptOutcome::Failure => "failure",
                AttemptOutcome::Error => "error",
            }
            .to_string(),
            error_kind: record.error_kind.map(|k| k.label().to_string()),
            validation_error: record.error.clone(),
            prompt: prompt.to_string(),
            system_prompt: system_prompt.to_string(),
            response: response.to_string(),
            prompt_tokens: record.usage.map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: record.usage.map(|u| u.completion_tokens).unwrap_or(0),
            cost_usd: record.cost_usd,
            latency_ms: record.latency_ms,
        }
    }
}

/// Fire-and-forget trace store.
pub struct TraceRecorder {
    trace_dir: PathBuf,
    conn: Option<Mutex<Connection>>,
}

impl TraceRecorder {
    /// Open the store under `<repo>/.patchsmith/traces/`. Storage problems
    /// disable the recorder instead of failing the run.
    pub fn open(repo_root: &Path) -> Self {
        let trace_dir = repo_root.join(".patchsmith").join("traces");
        let conn = match Self::init(&trace_dir) {
            Ok(conn) => Some(Mutex::new(conn)),
            Err(err) => {
                eprintln!("  Warning: trace store disabled: {}", err);
                None
            }
        };
        Self { trace_dir, conn }
    }

    /// A recorder that stores nothing, for callers that opt out of tracing.
    pub fn disabled() -> Self {
        Self {
            trace_dir: PathBuf::new(),
            conn: None,
        }
    }

    fn init(trace_dir: &Path) -> Result<Connection, String> {
        std::fs::create_dir_all(trace_dir)
            .map_err(|e| format!("could not create {}: {}", trace_dir.display(), e))?;
        let conn = Connection::open(trace_dir.join("traces.db"))
            .map_err(|e| format!("could not open traces.db: {}", e))?;
        conn.execute_batch(include_str!("trace_schema.sql"))
            .map_err(|e| format!("could not create schema: {}", e))?;
        Ok(conn)
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    /// Persist one trace. Errors are reported as warnings, nothing more.
    pub fn record(&self, trace: &AttemptTrace) {
        let Some(conn) = &self.conn else {
            return;
        };

        if let Err(err) = self.insert(conn, trace) {
            eprintln!("  Warning: failed to persist trace {}: {}", trace.trace_id, err);
        }
        if let Err(err) = self.write_json(trace) {
            eprintln!(
                "  Warning: failed to write trace file {}: {}",
                trace.trace_id, err
            );
        }
    }

    fn insert(&self, conn: &Mutex<Connection>, trace: &AttemptTrace) -> Result<(), String> {
        let conn = conn.lock().map_err(|_| "trace store poisoned".to_string())?;
        conn.execute(
            "INSERT OR REPLACE INTO traces (
                trace_id, goal_id, timestamp, rule_id, file, line, attempt,
                strategy, model, outcome, error_kind, validation_error,
                prompt, system_prompt, response,
                prompt_tokens, completion_tokens, cost_usd, latency_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                trace.trace_id,
                trace.goal_id.to_string(),
                trace.timestamp.to_rfc3339(),
                trace.rule_id,
                trace.file,
                trace.line as i64,
                trace.attempt as i64,
                trace.strategy,
                trace.model,
                trace.outcome,
                trace.error_kind,
                trace.validation_error,
                trace.prompt,
                trace.system_prompt,
                trace.response,
                trace.prompt_tokens as i64,
                trace.completion_tokens as i64,
                trace.cost_usd,
                trace.latency_ms as i64,
            ],
        )
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn write_json(&self, trace: &AttemptTrace) -> Result<(), String> {
        let path = self.trace_dir.join(format!("{}.json", trace.trace_id));
        let body = serde_json::to_string_pretty(trace).map_err(|e| e.to_string())?;
        std::fs::write(path, body).map_err(|e| e.to_string())
    }

    /// All traces for one finding, ordered by attempt.
    pub fn for_finding(
        &self,
        rule_id: &str,
        file: &str,
        line: usize,
    ) -> Vec<(u32, String, Option<String>)> {
        let Some(conn) = &self.conn else {
            return Vec::new();
        };
        let Ok(conn) = conn.lock() else {
            return Vec::new();
        };

        let mut stmt = match conn.prepare(
            "SELECT attempt, outcome, validation_error FROM traces
             WHERE rule_id = ?1 AND file = ?2 AND line = ?3
             ORDER BY attempt",
        ) {
            Ok(stmt) => stmt,
            Err(_) => return Vec::new(),
        };

        let rows = stmt.query_map(params![rule_id, file, line as i64], |row| {
            Ok((
                row.get::<_, i64>(0)? as u32,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        });
        match rows {
            Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;

/// Why a single attempt of a work unit did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureKind {
    /// The external command exited with a non-zero status.
    NonZeroExit(i32),
    /// Exit status was 0 but declared outputs are absent or empty.
    MissingOutputs(Vec<String>),
    /// The per-unit timeout elapsed and the process was killed.
    Timeout,
    /// The command could not be started (bad template, missing binary).
    SpawnFailed(String),
    /// The process was terminated by a signal and reported no exit code.
    Killed,
    /// The unit was found `Running` after the previous runner went away.
    Interrupted,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NonZeroExit(code) => write!(f, "exit code {code}"),
            FailureKind::MissingOutputs(paths) => {
                write!(f, "missing outputs: {}", paths.join(", "))
            }
            FailureKind::Timeout => write!(f, "timed out"),
            FailureKind::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            FailureKind::Killed => write!(f, "killed by signal"),
            FailureKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Final classification of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(FailureKind),
    Aborted,
}

/// What the executor reports back for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptResult {
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Automatic retry policy for failed units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Automatic retries allowed beyond the initial attempt.
    pub budget: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { budget: 1 }
    }
}

impl RetryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.budget.saturating_add(1)
    }
}

/// Optional resource hints forwarded to the external command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// One independently executable piece of batch work.
///
/// `key` is derived from the inputs by discovery and is stable across
/// invocations, which is what lets a resumed session recognise its units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub key: String,
    pub inputs: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_inputs: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub command: Vec<String>,
    #[serde(default)]
    pub params: IndexMap<String, String>,
    /// Paths relative to `output_dir` that must exist and be non-empty.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub resources: Resources,
}

/// Audit entry for a single attempt. Never removed from a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub outcome: Option<AttemptOutcome>,
    pub duration_ms: Option<u64>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Persisted lifecycle of one work unit within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub key: String,
    pub unit: WorkUnit,
    pub state: JobState,
    /// Total attempts ever dispatched, including interrupted ones.
    pub attempts: u32,
    /// Attempt count at which the retry budget was last reset.
    pub budget_floor: u32,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_failure: Option<FailureKind>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(unit: WorkUnit) -> Self {
        let now = Utc::now();
        Self {
            key: unit.key.clone(),
            unit,
            state: JobState::Pending,
            attempts: 0,
            budget_floor: 0,
            run_id: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            last_failure: None,
            stdout_path: None,
            stderr_path: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempts counted against the retry budget since the last reset.
    pub fn budget_used(&self) -> u32 {
        self.attempts.saturating_sub(self.budget_floor)
    }

    pub fn has_budget(&self, retry: &RetryConfig) -> bool {
        self.budget_used() < retry.max_attempts()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.history.last().and_then(|a| a.duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(key: &str) -> WorkUnit {
        WorkUnit {
            key: key.to_string(),
            inputs: vec![PathBuf::from(format!("/data/{key}.vcf"))],
            shared_inputs: Vec::new(),
            output_dir: PathBuf::from(format!("/out/{key}")),
            command: vec!["gwas".into(), "{input}".into(), "{output}".into()],
            params: IndexMap::new(),
            outputs: Vec::new(),
            resources: Resources::default(),
        }
    }

    #[test]
    fn record_creation_defaults() {
        let record = SessionRecord::new(unit("chr01"));
        assert_eq!(record.key, "chr01");
        assert_eq!(record.state, JobState::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.history.is_empty());
        assert!(record.run_id.is_none());
    }

    #[test]
    fn retry_config_default_allows_two_attempts() {
        let retry = RetryConfig::default();
        assert_eq!(retry.budget, 1);
        assert_eq!(retry.max_attempts(), 2);
        assert_eq!(RetryConfig { budget: 0 }.max_attempts(), 1);
    }

    #[test]
    fn budget_counts_from_floor() {
        let mut record = SessionRecord::new(unit("chr02"));
        let retry = RetryConfig { budget: 1 };
        record.attempts = 2;
        assert!(!record.has_budget(&retry));

        record.budget_floor = 2;
        assert_eq!(record.budget_used(), 0);
        assert!(record.has_budget(&retry));
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::NonZeroExit(3).to_string(), "exit code 3");
        assert_eq!(FailureKind::Timeout.to_string(), "timed out");
        assert_eq!(
            FailureKind::MissingOutputs(vec!["a.bam".into(), "b.bam".into()]).to_string(),
            "missing outputs: a.bam, b.bam"
        );
    }

    #[test]
    fn params_keep_insertion_order() {
        let mut u = unit("chr03");
        u.params.insert("release".into(), "1.0.0".into());
        u.params.insert("alpha".into(), "0.05".into());
        let json = serde_json::to_string(&u).unwrap();
        let back: WorkUnit = serde_json::from_str(&json).unwrap();
        let names: Vec<_> = back.params.keys().cloned().collect();
        assert_eq!(names, vec!["release", "alpha"]);
    }
}

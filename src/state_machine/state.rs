use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::job::{AttemptOutcome, AttemptRecord, AttemptResult, FailureKind, RetryConfig, SessionRecord};

/// Lifecycle states of a work unit.
///
/// Normal flow: PENDING → RUNNING → SUCCEEDED | FAILED.
/// ABORTED is reachable from any non-terminal state on session abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Aborted,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Aborted)
    }

    /// Whether `self → next` is a legal edge.
    ///
    /// `Failed → Running` is the automatic retry, `Failed → Pending` the
    /// explicit one. `Aborted → Pending` re-queues a cancelled unit and
    /// `Running → Pending` recovers a unit orphaned by a crashed runner.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Aborted)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Aborted)
                | (Running, Pending)
                | (Failed, Running)
                | (Failed, Pending)
                | (Aborted, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unit '{key}' cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub key: String,
    pub from: JobState,
    pub to: JobState,
}

/// The result of recording an attempt's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The attempt failed but the budget allows another one.
    Retry { attempt: u32, reason: FailureKind },
    /// The unit reached a terminal state.
    Complete(AttemptOutcome),
}

/// Applies lifecycle events to a `SessionRecord`.
pub struct StateMachine;

impl StateMachine {
    /// Marks the record `Running` for a new attempt and opens a history entry.
    pub fn dispatch(
        record: &mut SessionRecord,
        run_id: Uuid,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
    ) -> Result<u32, InvalidTransition> {
        Self::check(record, JobState::Running)?;
        let now = Utc::now();
        record.attempts += 1;
        record.state = JobState::Running;
        record.run_id = Some(run_id);
        record.started_at = Some(now);
        record.finished_at = None;
        record.exit_code = None;
        record.stdout_path = Some(stdout_path.clone());
        record.stderr_path = Some(stderr_path.clone());
        record.updated_at = now;
        record.history.push(AttemptRecord {
            attempt: record.attempts,
            run_id,
            started_at: now,
            finished_at: None,
            exit_code: None,
            outcome: None,
            duration_ms: None,
            stdout_path,
            stderr_path,
        });
        Ok(record.attempts)
    }

    /// Records the outcome of the running attempt.
    ///
    /// - success moves to `Succeeded`;
    /// - failure moves to `Failed` and returns `Retry` while the budget
    ///   allows another attempt, otherwise `Complete(Failed)`;
    /// - abort moves to `Aborted`.
    pub fn next(
        record: &mut SessionRecord,
        result: AttemptResult,
        retry: &RetryConfig,
    ) -> Result<Transition, InvalidTransition> {
        let target = match &result.outcome {
            AttemptOutcome::Succeeded => JobState::Succeeded,
            AttemptOutcome::Failed(_) => JobState::Failed,
            AttemptOutcome::Aborted => JobState::Aborted,
        };
        Self::check(record, target)?;

        let now = Utc::now();
        if let Some(entry) = record.history.last_mut() {
            entry.finished_at = Some(now);
            entry.exit_code = result.exit_code;
            entry.outcome = Some(result.outcome.clone());
            entry.duration_ms = Some(result.duration_ms);
        }
        record.state = target;
        record.finished_at = Some(now);
        record.exit_code = result.exit_code;
        record.updated_at = now;

        let transition = match result.outcome {
            AttemptOutcome::Failed(kind) => {
                record.last_failure = Some(kind.clone());
                if record.has_budget(retry) {
                    Transition::Retry {
                        attempt: record.attempts + 1,
                        reason: kind,
                    }
                } else {
                    Transition::Complete(AttemptOutcome::Failed(kind))
                }
            }
            AttemptOutcome::Succeeded => {
                record.last_failure = None;
                Transition::Complete(AttemptOutcome::Succeeded)
            }
            AttemptOutcome::Aborted => Transition::Complete(AttemptOutcome::Aborted),
        };
        Ok(transition)
    }

    /// Cancels a non-terminal unit. A running attempt is closed as aborted.
    pub fn abort(record: &mut SessionRecord) -> Result<(), InvalidTransition> {
        Self::check(record, JobState::Aborted)?;
        let now = Utc::now();
        if record.state == JobState::Running
            && let Some(entry) = record.history.last_mut()
            && entry.outcome.is_none()
        {
            entry.finished_at = Some(now);
            entry.outcome = Some(AttemptOutcome::Aborted);
        }
        record.state = JobState::Aborted;
        record.finished_at = Some(now);
        record.updated_at = now;
        Ok(())
    }

    /// Closes the dangling attempt of a unit left `Running` by a runner that
    /// no longer exists and returns the unit to `Pending`.
    ///
    /// The interrupted attempt stays in the history but does not consume
    /// retry budget.
    pub fn recover_interrupted(record: &mut SessionRecord) -> Result<(), InvalidTransition> {
        if record.state != JobState::Running {
            return Err(InvalidTransition {
                key: record.key.clone(),
                from: record.state,
                to: JobState::Pending,
            });
        }
        let now = Utc::now();
        if let Some(entry) = record.history.last_mut()
            && entry.outcome.is_none()
        {
            entry.finished_at = Some(now);
            entry.outcome = Some(AttemptOutcome::Failed(FailureKind::Interrupted));
        }
        record.budget_floor = (record.budget_floor + 1).min(record.attempts);
        record.last_failure = Some(FailureKind::Interrupted);
        record.state = JobState::Pending;
        record.updated_at = now;
        Ok(())
    }

    /// Returns a `Failed` or `Aborted` unit to `Pending` with a fresh budget.
    pub fn requeue(record: &mut SessionRecord) -> Result<(), InvalidTransition> {
        if !matches!(record.state, JobState::Failed | JobState::Aborted) {
            return Err(InvalidTransition {
                key: record.key.clone(),
                from: record.state,
                to: JobState::Pending,
            });
        }
        record.budget_floor = record.attempts;
        record.state = JobState::Pending;
        record.updated_at = Utc::now();
        Ok(())
    }

    fn check(record: &SessionRecord, to: JobState) -> Result<(), InvalidTransition> {
        if record.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(InvalidTransition {
                key: record.key.clone(),
                from: record.state,
                to,
            })
        }
    }
}

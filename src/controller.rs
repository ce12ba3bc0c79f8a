//! Session-level operations behind the CLI subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::GbatchConfig;
use crate::error::{GbatchError, StoreError};
use crate::executor::ProcessExecutor;
use crate::scheduler::{RunObserver, RunSummary, Scheduler, StateCounts};
use crate::state_machine::{InvalidTransition, JobState, RetryConfig, SessionRecord, StateMachine};
use crate::store::{self, SessionPlan, SessionStore};

/// Per-invocation overrides for `start`. `None` falls back to the config.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub concurrency: Option<usize>,
    pub retry_budget: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub pattern: Option<String>,
    pub command: Vec<String>,
}

/// Which log of an attempt to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub key: String,
    pub state: JobState,
    pub attempts: u32,
    pub exit_code: Option<i32>,
    pub last_failure: Option<String>,
    pub duration_ms: Option<u64>,
}

impl From<&SessionRecord> for UnitStatus {
    fn from(record: &SessionRecord) -> Self {
        Self {
            key: record.key.clone(),
            state: record.state,
            attempts: record.attempts,
            exit_code: record.exit_code,
            last_failure: record.last_failure.as_ref().map(|f| f.to_string()),
            duration_ms: record.duration_ms(),
        }
    }
}

/// Snapshot of a session as last persisted.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_units: usize,
    pub abort_requested: bool,
    pub counts: StateCounts,
    pub units: Vec<UnitStatus>,
}

pub struct Controller {
    config: GbatchConfig,
    observer: Option<Arc<dyn RunObserver>>,
    handle_interrupt: bool,
}

impl Controller {
    pub fn new(config: GbatchConfig) -> Self {
        Self {
            config,
            observer: None,
            handle_interrupt: false,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Turns Ctrl-C during a run into a session abort.
    pub fn abort_on_interrupt(mut self) -> Self {
        self.handle_interrupt = true;
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Validates the options, persists the session plan and runs it.
    ///
    /// Starting an existing session replaces its plan; units already
    /// succeeded are still skipped.
    pub async fn start(
        &self,
        input_root: &Path,
        session: &str,
        options: StartOptions,
    ) -> Result<RunSummary, GbatchError> {
        if !input_root.is_dir() {
            return Err(GbatchError::Configuration(format!(
                "input root {} is not a directory",
                input_root.display()
            )));
        }
        let command = if options.command.is_empty() {
            self.config.job.command.clone()
        } else {
            options.command
        };
        if command.is_empty() {
            return Err(GbatchError::Configuration(
                "no command given: pass one after `--` or set `command` under [job]".into(),
            ));
        }
        let concurrency = self.concurrency(options.concurrency)?;
        if options.timeout_secs == Some(0) {
            return Err(GbatchError::Configuration("timeout must be at least 1 second".into()));
        }

        let mut discovery = self.config.discovery.clone();
        if let Some(pattern) = options.pattern {
            discovery = discovery.with_pattern(pattern);
        }
        discovery
            .validate()
            .map_err(|e| GbatchError::Configuration(e.to_string()))?;

        let input_root = std::fs::canonicalize(input_root).map_err(|e| {
            GbatchError::Configuration(format!("cannot resolve {}: {e}", input_root.display()))
        })?;
        let mut job = self.config.job.clone();
        job.command = command;
        let plan = SessionPlan {
            input_root,
            base_dir: std::env::current_dir()?,
            discovery,
            job,
            retry: RetryConfig {
                budget: options.retry_budget.unwrap_or(self.config.retry_budget),
            },
            timeout_secs: options.timeout_secs.or(self.config.timeout_secs),
        };

        let store = self.open_store(session)?;
        store.update_metadata(|meta| meta.plan = Some(plan.clone()))?;
        info!(session, input = %plan.input_root.display(), "Session plan saved");
        self.run(store, &plan, concurrency).await
    }

    /// Re-runs a session from its persisted plan.
    pub async fn resume(
        &self,
        session: &str,
        concurrency: Option<usize>,
    ) -> Result<RunSummary, GbatchError> {
        let concurrency = self.concurrency(concurrency)?;
        let store = self.existing_store(session)?;
        let plan = store.metadata()?.plan.ok_or_else(|| {
            GbatchError::Configuration(format!(
                "session '{session}' has no saved plan; use `gbatch start`"
            ))
        })?;
        self.run(store, &plan, concurrency).await
    }

    /// Pure read of the persisted state.
    pub fn status(&self, session: &str) -> Result<StatusReport, GbatchError> {
        let store = self.existing_store(session)?;
        let meta = store.metadata()?;
        let records = store.records()?;
        Ok(StatusReport {
            session: meta.name,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            total_units: meta.total_units,
            abort_requested: store.abort_requested()?,
            counts: StateCounts::from_records(&records),
            units: records.iter().map(UnitStatus::from).collect(),
        })
    }

    /// Flags the session for abort; the runner stops dispatching on its next poll.
    pub fn abort(&self, session: &str) -> Result<(), GbatchError> {
        let store = self.existing_store(session)?;
        store.request_abort()?;
        warn!(session, "Abort requested");
        Ok(())
    }

    /// Moves a `Failed` unit back to `Pending` with a fresh retry budget.
    pub fn retry(&self, session: &str, key: &str) -> Result<SessionRecord, GbatchError> {
        let store = self.existing_store(session)?;
        let mut record = self.record(&store, key)?;
        if record.state != JobState::Failed {
            return Err(InvalidTransition {
                key: key.to_string(),
                from: record.state,
                to: JobState::Pending,
            }
            .into());
        }
        StateMachine::requeue(&mut record)?;
        store.upsert(&record)?;
        info!(session, key, "Unit queued for retry");
        Ok(record)
    }

    /// Last `lines` lines of the latest attempt's log, or `None` when the
    /// unit never ran.
    pub fn logs(
        &self,
        session: &str,
        key: &str,
        stream: LogStream,
        lines: usize,
    ) -> Result<Option<(PathBuf, String)>, GbatchError> {
        let store = self.existing_store(session)?;
        let record = self.record(&store, key)?;
        let path = match stream {
            LogStream::Stdout => record.stdout_path,
            LogStream::Stderr => record.stderr_path,
        };
        let Some(path) = path else {
            return Ok(None);
        };
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StoreError::io("read", &path, e).into()),
        };
        Ok(Some((path, tail(&contents, lines))))
    }

    /// Names of all sessions in the state directory.
    pub fn sessions(&self) -> Result<Vec<String>, GbatchError> {
        Ok(store::list_sessions(&self.config.state_dir)?)
    }

    async fn run(
        &self,
        store: SessionStore,
        plan: &SessionPlan,
        concurrency: usize,
    ) -> Result<RunSummary, GbatchError> {
        let store = Arc::new(store);
        let executor = Arc::new(ProcessExecutor::new(
            self.config.on_abort,
            self.config.abort_grace(),
        ));
        let mut scheduler = Scheduler::new(Arc::clone(&store), executor, concurrency)
            .with_poll_interval(self.config.poll_interval());
        if let Some(observer) = &self.observer {
            scheduler = scheduler.with_observer(Arc::clone(observer));
        }

        let interrupt = self.handle_interrupt.then(|| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!(session = %store.name(), "Interrupted, aborting session");
                    if let Err(e) = store.request_abort() {
                        error!(error = %e, "Failed to persist abort request");
                    }
                }
            })
        });

        let result = scheduler.run_session(plan).await;
        if let Some(handle) = interrupt {
            handle.abort();
        }
        store.close()?;
        result
    }

    fn concurrency(&self, requested: Option<usize>) -> Result<usize, GbatchError> {
        match requested.unwrap_or_else(|| self.config.concurrency()) {
            0 => Err(GbatchError::Configuration(
                "concurrency must be at least 1".into(),
            )),
            n => Ok(n),
        }
    }

    fn open_store(&self, session: &str) -> Result<SessionStore, GbatchError> {
        SessionStore::open(&self.config.state_dir, session).map_err(config_if_bad_name)
    }

    fn existing_store(&self, session: &str) -> Result<SessionStore, GbatchError> {
        SessionStore::open_existing(&self.config.state_dir, session)
            .map_err(config_if_bad_name)?
            .ok_or_else(|| GbatchError::SessionNotFound(session.to_string()))
    }

    fn record(&self, store: &SessionStore, key: &str) -> Result<SessionRecord, GbatchError> {
        let not_found = || GbatchError::UnitNotFound {
            session: store.name().to_string(),
            key: key.to_string(),
        };
        match store.get(key) {
            Ok(Some(record)) => Ok(record),
            Ok(None) | Err(StoreError::InvalidKey(_)) => Err(not_found()),
            Err(e) => Err(e.into()),
        }
    }
}

// A malformed session name is a usage problem, not a storage failure.
fn config_if_bad_name(e: StoreError) -> GbatchError {
    match e {
        StoreError::InvalidSessionName(name) => {
            GbatchError::Configuration(format!("invalid session name '{name}'"))
        }
        other => other.into(),
    }
}

fn tail(contents: &str, lines: usize) -> String {
    let all: Vec<&str> = contents.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

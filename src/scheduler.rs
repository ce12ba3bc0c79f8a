use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::{self, UnitContext};
use crate::error::{GbatchError, StoreError};
use crate::executor::{ExecutionContext, ExecutionResult, Executor};
use crate::state_machine::{
    AttemptOutcome, AttemptResult, FailureKind, JobState, RetryConfig, SessionRecord,
    StateMachine, Transition, WorkUnit,
};
use crate::store::{SessionPlan, SessionStore};

/// Number of records in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
}

impl StateCounts {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a SessionRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            counts.add(record.state);
        }
        counts
    }

    pub fn add(&mut self, state: JobState) {
        *self.slot(state) += 1;
    }

    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Running => self.running,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Aborted => self.aborted,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.succeeded + self.failed + self.aborted
    }

    fn slot(&mut self, state: JobState) -> &mut usize {
        match state {
            JobState::Pending => &mut self.pending,
            JobState::Running => &mut self.running,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Aborted => &mut self.aborted,
        }
    }
}

/// Outcome of one `run_session` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub counts: StateCounts,
    /// Executor invocations made by this run.
    pub invocations: usize,
    pub aborted: bool,
}

impl RunSummary {
    /// 0 all succeeded, 1 failures remain, 130 aborted by the user.
    pub fn exit_code(&self) -> u8 {
        if self.aborted {
            130
        } else if self.counts.failed > 0 || self.counts.total() != self.counts.succeeded {
            1
        } else {
            0
        }
    }
}

/// Progress notifications emitted by the dispatch loop.
#[derive(Debug)]
pub enum RunEvent<'a> {
    Started { total: usize, queued: usize },
    Dispatched { key: &'a str, attempt: u32 },
    Finished { record: &'a SessionRecord, transition: &'a Transition },
    Aborting { in_flight: usize },
}

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: RunEvent<'_>);
}

/// Classifies discovered units against the store and drives them through a
/// bounded pool of executors.
pub struct Scheduler<E: Executor> {
    store: Arc<SessionStore>,
    executor: Arc<E>,
    concurrency: usize,
    poll_interval: Duration,
    observer: Option<Arc<dyn RunObserver>>,
}

impl<E: Executor> Scheduler<E> {
    pub fn new(store: Arc<SessionStore>, executor: Arc<E>, concurrency: usize) -> Self {
        Self {
            store,
            executor,
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(250),
            observer: None,
        }
    }

    /// How often the abort flag is re-read while all slots are busy.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Enumerates the plan's work units, sorted by key.
    pub fn discover(&self, plan: &SessionPlan) -> Result<Vec<WorkUnit>, GbatchError> {
        let output_root = self.store.output_root();
        let ctx = UnitContext {
            session: self.store.name(),
            base_dir: &plan.base_dir,
            default_output_root: &output_root,
        };
        Ok(discovery::discover(&plan.input_root, &plan.discovery, &plan.job, &ctx)?)
    }

    /// Builds the dispatch queue for this run.
    ///
    /// New units get a `Pending` record immediately. Succeeded units and
    /// failed units without budget are skipped. Aborted units are re-queued
    /// with a fresh budget; units left `Running` by another run are closed as
    /// interrupted and re-queued.
    pub fn classify(
        &self,
        units: Vec<WorkUnit>,
        run_id: Uuid,
        retry: &RetryConfig,
    ) -> Result<VecDeque<SessionRecord>, GbatchError> {
        let mut queue = VecDeque::with_capacity(units.len());
        for unit in units {
            let Some(mut record) = self.store.get(&unit.key)? else {
                let record = SessionRecord::new(unit);
                self.store.upsert(&record)?;
                queue.push_back(record);
                continue;
            };
            match record.state {
                JobState::Succeeded => {
                    debug!(key = %record.key, "Skipping succeeded unit");
                    continue;
                }
                JobState::Failed if !record.has_budget(retry) => {
                    debug!(key = %record.key, attempts = record.attempts, "Retry budget exhausted, skipping");
                    continue;
                }
                JobState::Failed | JobState::Pending => {}
                JobState::Aborted => {
                    StateMachine::requeue(&mut record)?;
                }
                JobState::Running if record.run_id != Some(run_id) => {
                    warn!(key = %record.key, attempt = record.attempts, "Recovering unit interrupted by a previous run");
                    StateMachine::recover_interrupted(&mut record)?;
                }
                JobState::Running => continue,
            }
            record.unit = unit;
            self.store.upsert(&record)?;
            queue.push_back(record);
        }
        Ok(queue)
    }

    /// Runs every runnable unit of the session to a terminal state, or until
    /// the session is aborted.
    ///
    /// Only storage and discovery errors end the run early; per-unit failures
    /// are recorded and the loop carries on with the remaining units.
    pub async fn run_session(&self, plan: &SessionPlan) -> Result<RunSummary, GbatchError> {
        let run_id = Uuid::new_v4();
        let units = self.discover(plan)?;
        let total = units.len();
        self.store.clear_abort()?;
        self.store.update_metadata(|meta| {
            meta.run_id = Some(run_id);
            meta.total_units = total;
            meta.concurrency_limit = self.concurrency;
        })?;

        let mut queue = self.classify(units, run_id, &plan.retry)?;
        info!(
            session = %self.store.name(),
            %run_id,
            total,
            queued = queue.len(),
            concurrency = self.concurrency,
            "Starting run"
        );
        self.notify(RunEvent::Started {
            total,
            queued: queue.len(),
        });

        let timeout = plan.timeout_secs.map(Duration::from_secs);
        let (abort_tx, abort_rx) = watch::channel(false);
        let mut in_flight: JoinSet<(String, ExecutionResult)> = JoinSet::new();
        let mut running: HashMap<String, SessionRecord> = HashMap::new();
        let mut invocations = 0;
        let mut aborted = false;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !aborted && self.store.abort_requested()? {
                aborted = true;
                self.begin_abort(&mut queue, &abort_tx, in_flight.len())?;
            }

            while !aborted && in_flight.len() < self.concurrency {
                let Some(mut record) = queue.pop_front() else {
                    break;
                };
                let attempt = record.attempts + 1;
                let stdout_path = self.store.stdout_log(&record.key, attempt);
                let stderr_path = self.store.stderr_log(&record.key, attempt);
                StateMachine::dispatch(&mut record, run_id, stdout_path.clone(), stderr_path.clone())?;
                // persisted before the process exists so a crash leaves a trace
                self.store.upsert(&record)?;
                info!(key = %record.key, attempt, "Dispatching unit");
                self.notify(RunEvent::Dispatched {
                    key: &record.key,
                    attempt,
                });

                let ctx = ExecutionContext {
                    session: self.store.name().to_string(),
                    attempt,
                    stdout_path,
                    stderr_path,
                    timeout,
                    abort: abort_rx.clone(),
                };
                let executor = Arc::clone(&self.executor);
                let unit = record.unit.clone();
                in_flight.spawn(async move {
                    let result = executor.run(&unit, ctx).await;
                    (unit.key, result)
                });
                running.insert(record.key.clone(), record);
                invocations += 1;

                if self.store.abort_requested()? {
                    aborted = true;
                    self.begin_abort(&mut queue, &abort_tx, in_flight.len())?;
                }
            }

            if in_flight.is_empty() && (aborted || queue.is_empty()) {
                break;
            }

            let joined = tokio::select! {
                joined = in_flight.join_next() => joined,
                _ = ticker.tick() => None,
            };
            match joined {
                Some(Ok((key, result))) => {
                    let mut result = result.attempt_result();
                    if is_signal_death(&result) {
                        // a Ctrl-C can reach the child before the flag is polled
                        if !aborted && self.store.abort_requested()? {
                            aborted = true;
                            self.begin_abort(&mut queue, &abort_tx, in_flight.len())?;
                        }
                        if aborted {
                            result.outcome = AttemptOutcome::Aborted;
                        }
                    }
                    if let Some(record) = running.remove(&key) {
                        self.complete(record, result, &plan.retry, aborted, &mut queue)?;
                    }
                }
                Some(Err(e)) => error!(error = %e, "Executor task failed"),
                None => {}
            }
        }

        // tasks that panicked never reported back
        for (_, record) in running.drain() {
            let result = AttemptResult {
                outcome: AttemptOutcome::Failed(FailureKind::SpawnFailed(
                    "executor task panicked".into(),
                )),
                exit_code: None,
                duration_ms: 0,
            };
            self.complete(record, result, &plan.retry, true, &mut queue)?;
        }

        let records = self.store.records()?;
        let summary = RunSummary {
            counts: StateCounts::from_records(&records),
            invocations,
            aborted,
        };
        info!(
            session = %self.store.name(),
            succeeded = summary.counts.succeeded,
            failed = summary.counts.failed,
            aborted = summary.counts.aborted,
            invocations,
            "Run finished"
        );
        Ok(summary)
    }

    /// Records the outcome of a finished attempt and re-queues it if the
    /// budget allows. A record that is not `Running` is a bookkeeping bug
    /// and ends the run.
    fn complete(
        &self,
        mut record: SessionRecord,
        result: AttemptResult,
        retry: &RetryConfig,
        aborted: bool,
        queue: &mut VecDeque<SessionRecord>,
    ) -> Result<(), GbatchError> {
        let transition = StateMachine::next(&mut record, result, retry)?;
        self.store.upsert(&record)?;
        self.notify(RunEvent::Finished {
            record: &record,
            transition: &transition,
        });

        match &transition {
            Transition::Retry { attempt, reason } if !aborted => {
                warn!(key = %record.key, %reason, next_attempt = attempt, "Attempt failed, retrying");
                queue.push_back(record);
            }
            Transition::Retry { reason, .. } => {
                warn!(key = %record.key, %reason, "Attempt failed, not retrying after abort");
            }
            Transition::Complete(AttemptOutcome::Succeeded) => {
                info!(key = %record.key, attempt = record.attempts, "Unit succeeded");
            }
            Transition::Complete(AttemptOutcome::Failed(reason)) => {
                error!(key = %record.key, %reason, attempts = record.attempts, "Unit failed");
            }
            Transition::Complete(AttemptOutcome::Aborted) => {
                info!(key = %record.key, "Unit aborted");
            }
        }
        Ok(())
    }

    /// Stops dispatch: queued pending units become `Aborted`, in-flight
    /// executors are told to wind down.
    fn begin_abort(
        &self,
        queue: &mut VecDeque<SessionRecord>,
        abort_tx: &watch::Sender<bool>,
        in_flight: usize,
    ) -> Result<(), StoreError> {
        warn!(session = %self.store.name(), queued = queue.len(), in_flight, "Abort requested, stopping dispatch");
        abort_tx.send_replace(true);
        self.notify(RunEvent::Aborting { in_flight });
        for mut record in queue.drain(..) {
            if !record.state.is_terminal() {
                if let Err(e) = StateMachine::abort(&mut record) {
                    warn!(error = %e, "Cannot abort unit");
                    continue;
                }
                self.store.upsert(&record)?;
            }
        }
        Ok(())
    }

    fn notify(&self, event: RunEvent<'_>) {
        if let Some(observer) = &self.observer {
            observer.on_event(event);
        }
    }
}

fn is_signal_death(result: &AttemptResult) -> bool {
    matches!(result.outcome, AttemptOutcome::Failed(FailureKind::Killed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryRule, JobTemplate};
    use crate::executor::ExitCondition;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Deterministic executor: per-key exit codes, optional delay, honours abort.
    struct ScriptedExecutor {
        failing: Vec<String>,
        /// Keys whose attempts hit the timeout.
        timing_out: Vec<String>,
        /// Keys that request an abort and then die by signal, like a Ctrl-C
        /// reaching the child before the runner polls the flag.
        interrupting: Vec<String>,
        /// Exit reported once the abort is broadcast.
        on_abort: ExitCondition,
        delay: Duration,
        store: Option<Arc<SessionStore>>,
        calls: Mutex<Vec<String>>,
        seen_states: Mutex<Vec<JobState>>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn new(failing: &[&str]) -> Self {
            Self {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                timing_out: Vec::new(),
                interrupting: Vec::new(),
                on_abort: ExitCondition::Aborted,
                delay: Duration::from_millis(10),
                store: None,
                calls: Mutex::new(Vec::new()),
                seen_states: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Executor for ScriptedExecutor {
        async fn run(&self, unit: &WorkUnit, mut ctx: ExecutionContext) -> ExecutionResult {
            self.calls.lock().unwrap().push(unit.key.clone());
            if let Some(store) = &self.store {
                let record = store.get(&unit.key).unwrap().unwrap();
                assert_eq!(record.stdout_path.as_ref(), Some(&ctx.stdout_path));
                assert_eq!(record.stderr_path.as_ref(), Some(&ctx.stderr_path));
                self.seen_states.lock().unwrap().push(record.state);
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let exit = tokio::select! {
                _ = tokio::time::sleep(self.delay) => {
                    if self.interrupting.contains(&unit.key) {
                        self.store.as_ref().unwrap().request_abort().unwrap();
                        ExitCondition::Killed
                    } else if self.timing_out.contains(&unit.key) {
                        ExitCondition::Timeout
                    } else if self.failing.contains(&unit.key) {
                        ExitCondition::Exited(1)
                    } else {
                        ExitCondition::Exited(0)
                    }
                }
                _ = ctx.abort.wait_for(|aborted| *aborted) => self.on_abort.clone(),
            };
            self.active.fetch_sub(1, Ordering::SeqCst);
            ExecutionResult {
                exit,
                stdout_path: ctx.stdout_path,
                stderr_path: ctx.stderr_path,
                duration_ms: self.delay.as_millis() as u64,
                missing_outputs: Vec::new(),
            }
        }
    }

    fn plan(input: &Path, budget: u32) -> SessionPlan {
        SessionPlan {
            input_root: input.to_path_buf(),
            base_dir: input.to_path_buf(),
            discovery: DiscoveryRule::default(),
            job: JobTemplate {
                command: vec!["true".into()],
                ..Default::default()
            },
            retry: RetryConfig { budget },
            timeout_secs: None,
        }
    }

    struct Fixture {
        _tmp: TempDir,
        input: std::path::PathBuf,
        store: Arc<SessionStore>,
    }

    fn fixture(keys: &[&str]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("input");
        std::fs::create_dir(&input).unwrap();
        for key in keys {
            std::fs::write(input.join(format!("{key}.txt")), key).unwrap();
        }
        let store = Arc::new(SessionStore::open(&tmp.path().join("state"), "test").unwrap());
        Fixture {
            _tmp: tmp,
            input,
            store,
        }
    }

    fn scheduler(
        fx: &Fixture,
        executor: &Arc<ScriptedExecutor>,
        concurrency: usize,
    ) -> Scheduler<ScriptedExecutor> {
        Scheduler::new(Arc::clone(&fx.store), Arc::clone(executor), concurrency)
            .with_poll_interval(Duration::from_millis(10))
    }

    fn states(store: &SessionStore) -> Vec<(String, JobState)> {
        store
            .records()
            .unwrap()
            .into_iter()
            .map(|r| (r.key, r.state))
            .collect()
    }

    #[tokio::test]
    async fn failing_unit_is_isolated() {
        let fx = fixture(&["a", "b", "c"]);
        let exec = Arc::new(ScriptedExecutor::new(&["b"]));
        let summary = scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();

        assert_eq!(
            states(&fx.store),
            vec![
                ("a".into(), JobState::Succeeded),
                ("b".into(), JobState::Failed),
                ("c".into(), JobState::Succeeded),
            ]
        );
        assert_eq!(summary.exit_code(), 1);
        assert_eq!(fx.store.get("b").unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn zero_budget_means_single_attempt() {
        let fx = fixture(&["a", "b", "c"]);
        let exec = Arc::new(ScriptedExecutor::new(&["b"]));
        scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 0))
            .await
            .unwrap();
        assert_eq!(fx.store.get("b").unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn always_failing_unit_uses_exactly_its_budget() {
        let fx = fixture(&["x"]);
        let exec = Arc::new(ScriptedExecutor::new(&["x"]));
        let plan = plan(&fx.input, 3);
        scheduler(&fx, &exec, 1).run_session(&plan).await.unwrap();
        assert_eq!(exec.calls().len(), 4);

        let record = fx.store.get("x").unwrap().unwrap();
        assert_eq!(record.attempts, 4);
        assert_eq!(record.history.len(), 4);
        assert_eq!(record.state, JobState::Failed);

        // exhausted budget survives a resume
        let summary = scheduler(&fx, &exec, 1).run_session(&plan).await.unwrap();
        assert_eq!(summary.invocations, 0);
        assert_eq!(fx.store.get("x").unwrap().unwrap().attempts, 4);
    }

    #[tokio::test]
    async fn outcome_does_not_depend_on_concurrency() {
        let keys = ["k1", "k2", "k3", "k4", "k5", "k6"];
        let mut outcomes = Vec::new();
        for concurrency in [1, 4] {
            let fx = fixture(&keys);
            let exec = Arc::new(ScriptedExecutor::new(&["k2", "k5"]));
            scheduler(&fx, &exec, concurrency)
                .run_session(&plan(&fx.input, 1))
                .await
                .unwrap();
            outcomes.push(states(&fx.store));
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn pool_never_exceeds_concurrency() {
        let fx = fixture(&["a", "b", "c", "d", "e", "f", "g"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.delay = Duration::from_millis(30);
        let exec = Arc::new(exec);
        scheduler(&fx, &exec, 3)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();
        assert!(exec.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(exec.calls().len(), 7);
    }

    #[tokio::test]
    async fn dispatch_is_key_ordered_and_running_is_persisted_first() {
        let fx = fixture(&["c", "a", "b"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.store = Some(Arc::clone(&fx.store));
        let exec = Arc::new(exec);
        scheduler(&fx, &exec, 1)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();
        assert_eq!(exec.calls(), vec!["a", "b", "c"]);
        assert!(exec.seen_states.lock().unwrap().iter().all(|s| *s == JobState::Running));
    }

    #[tokio::test]
    async fn resume_of_completed_session_is_a_no_op() {
        let fx = fixture(&["a", "b"]);
        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let plan = plan(&fx.input, 1);
        scheduler(&fx, &exec, 2).run_session(&plan).await.unwrap();

        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let summary = scheduler(&fx, &exec, 2).run_session(&plan).await.unwrap();
        assert_eq!(summary.invocations, 0);
        assert!(exec.calls().is_empty());
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn unit_left_running_by_a_crash_is_rerun() {
        let fx = fixture(&["a", "b", "c"]);
        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let plan = plan(&fx.input, 0);
        scheduler(&fx, &exec, 1).run_session(&plan).await.unwrap();

        // simulate a runner that died after dispatching b
        let mut b = fx.store.get("b").unwrap().unwrap();
        b.state = JobState::Pending;
        StateMachine::dispatch(
            &mut b,
            Uuid::new_v4(),
            fx.store.stdout_log("b", 2),
            fx.store.stderr_log("b", 2),
        )
        .unwrap();
        fx.store.upsert(&b).unwrap();

        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let summary = scheduler(&fx, &exec, 2).run_session(&plan).await.unwrap();
        assert_eq!(exec.calls(), vec!["b"]);
        assert_eq!(summary.exit_code(), 0);

        let b = fx.store.get("b").unwrap().unwrap();
        assert_eq!(b.state, JobState::Succeeded);
        assert_eq!(
            b.history[1].outcome,
            Some(AttemptOutcome::Failed(FailureKind::Interrupted))
        );
    }

    #[tokio::test]
    async fn abort_stops_dispatch_and_leaves_nothing_running() {
        let fx = fixture(&["a", "b", "c"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.delay = Duration::from_secs(30);
        let exec = Arc::new(exec);

        let store = Arc::clone(&fx.store);
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.request_abort().unwrap();
        });
        let summary = scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();
        aborter.await.unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.exit_code(), 130);
        assert_eq!(exec.calls(), vec!["a", "b"]);
        let states = states(&fx.store);
        assert_eq!(states[2], ("c".into(), JobState::Aborted));
        assert!(states.iter().all(|(_, s)| *s != JobState::Running));

        // aborted units are re-run in full on the next resume
        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let summary = scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();
        assert_eq!(exec.calls(), vec!["a", "b", "c"]);
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn timeout_counts_against_budget_and_is_retried() {
        let fx = fixture(&["a", "slow"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.timing_out = vec!["slow".into()];
        let exec = Arc::new(exec);
        let summary = scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();

        let calls = exec.calls();
        assert_eq!(calls.iter().filter(|k| *k == "slow").count(), 2);
        let slow = fx.store.get("slow").unwrap().unwrap();
        assert_eq!(slow.state, JobState::Failed);
        assert_eq!(slow.attempts, 2);
        assert_eq!(slow.last_failure, Some(FailureKind::Timeout));
        assert!(slow.history.iter().all(|h| {
            h.outcome == Some(AttemptOutcome::Failed(FailureKind::Timeout))
        }));
        assert_eq!(
            fx.store.get("a").unwrap().unwrap().state,
            JobState::Succeeded
        );
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn units_killed_during_abort_are_aborted_not_failed() {
        let fx = fixture(&["a", "b", "c"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.delay = Duration::from_secs(30);
        exec.on_abort = ExitCondition::Killed;
        let exec = Arc::new(exec);

        let store = Arc::clone(&fx.store);
        let aborter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.request_abort().unwrap();
        });
        let summary = scheduler(&fx, &exec, 2)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();
        aborter.await.unwrap();

        assert_eq!(summary.exit_code(), 130);
        assert_eq!(exec.calls(), vec!["a", "b"]);
        for (key, state) in states(&fx.store) {
            assert_eq!(state, JobState::Aborted, "{key}");
        }
        let a = fx.store.get("a").unwrap().unwrap();
        assert_eq!(a.attempts, 1);
        assert_eq!(a.last_failure, None);
    }

    #[tokio::test]
    async fn signal_death_racing_the_abort_flag_is_aborted() {
        let fx = fixture(&["a", "b", "c"]);
        let mut exec = ScriptedExecutor::new(&[]);
        exec.interrupting = vec!["a".into()];
        exec.store = Some(Arc::clone(&fx.store));
        let exec = Arc::new(exec);
        let summary = scheduler(&fx, &exec, 1)
            .run_session(&plan(&fx.input, 1))
            .await
            .unwrap();

        assert!(summary.aborted);
        assert_eq!(summary.exit_code(), 130);
        assert_eq!(exec.calls(), vec!["a"]);
        let a = fx.store.get("a").unwrap().unwrap();
        assert_eq!(a.state, JobState::Aborted);
        assert_eq!(
            a.history[0].outcome,
            Some(AttemptOutcome::Aborted)
        );
        assert_eq!(
            states(&fx.store),
            vec![
                ("a".into(), JobState::Aborted),
                ("b".into(), JobState::Aborted),
                ("c".into(), JobState::Aborted),
            ]
        );
    }

    #[test]
    fn completing_a_unit_that_is_not_running_is_an_error() {
        let fx = fixture(&["a"]);
        let exec = Arc::new(ScriptedExecutor::new(&[]));
        let sched = scheduler(&fx, &exec, 1);
        let units = sched.discover(&plan(&fx.input, 1)).unwrap();
        let record = SessionRecord::new(units.into_iter().next().unwrap());
        fx.store.upsert(&record).unwrap();

        let mut queue = VecDeque::new();
        let result = AttemptResult {
            outcome: AttemptOutcome::Succeeded,
            exit_code: Some(0),
            duration_ms: 5,
        };
        let err = sched
            .complete(record, result, &RetryConfig { budget: 1 }, false, &mut queue)
            .unwrap_err();
        assert!(matches!(err, GbatchError::InvalidTransition(_)));
        assert!(queue.is_empty());
        assert_eq!(fx.store.get("a").unwrap().unwrap().state, JobState::Pending);
    }

    #[test]
    fn summary_exit_codes() {
        let mut summary = RunSummary {
            counts: StateCounts {
                succeeded: 3,
                ..Default::default()
            },
            invocations: 3,
            aborted: false,
        };
        assert_eq!(summary.exit_code(), 0);
        summary.counts.failed = 1;
        assert_eq!(summary.exit_code(), 1);
        summary.aborted = true;
        assert_eq!(summary.exit_code(), 130);
    }
}

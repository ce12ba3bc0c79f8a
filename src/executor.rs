//! Runs one work unit as an external process.
//!
//! [`ProcessExecutor`] is the only component that touches the outside world:
//! it renders the unit's command template, redirects stdout/stderr to the
//! per-attempt log files, enforces the timeout and the abort policy, and
//! validates declared outputs after a zero exit.
//!
//! Each unit runs in its own process group. A terminal Ctrl-C therefore only
//! reaches the runner, and the signals sent on abort or timeout reach every
//! process the command started.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::state_machine::{AttemptOutcome, AttemptResult, FailureKind, WorkUnit};

/// What happens to in-flight processes when a session is aborted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    /// Send SIGTERM, wait for the grace period, then kill and report `Aborted`.
    #[default]
    Terminate,
    /// Let the process run to completion and keep its real outcome.
    Finish,
}

/// Per-attempt context handed to an executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub session: String,
    pub attempt: u32,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub timeout: Option<Duration>,
    /// Flips to `true` when the session is aborted.
    pub abort: watch::Receiver<bool>,
}

/// How the external process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCondition {
    Exited(i32),
    Timeout,
    /// Terminated by a signal not sent by us.
    Killed,
    Aborted,
    SpawnFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit: ExitCondition,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub duration_ms: u64,
    /// Declared outputs absent or empty after a zero exit.
    pub missing_outputs: Vec<String>,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ExitCondition::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn outcome(&self) -> AttemptOutcome {
        match &self.exit {
            ExitCondition::Exited(0) if self.missing_outputs.is_empty() => AttemptOutcome::Succeeded,
            ExitCondition::Exited(0) => {
                AttemptOutcome::Failed(FailureKind::MissingOutputs(self.missing_outputs.clone()))
            }
            ExitCondition::Exited(code) => AttemptOutcome::Failed(FailureKind::NonZeroExit(*code)),
            ExitCondition::Timeout => AttemptOutcome::Failed(FailureKind::Timeout),
            ExitCondition::Killed => AttemptOutcome::Failed(FailureKind::Killed),
            ExitCondition::SpawnFailed(msg) => {
                AttemptOutcome::Failed(FailureKind::SpawnFailed(msg.clone()))
            }
            ExitCondition::Aborted => AttemptOutcome::Aborted,
        }
    }

    pub fn attempt_result(&self) -> AttemptResult {
        AttemptResult {
            outcome: self.outcome(),
            exit_code: self.exit_code(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Runs a single attempt of a work unit to completion.
pub trait Executor: Send + Sync + 'static {
    fn run(
        &self,
        unit: &WorkUnit,
        ctx: ExecutionContext,
    ) -> impl Future<Output = ExecutionResult> + Send;
}

/// Executes units as local OS processes.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    pub abort_policy: AbortPolicy,
    pub abort_grace: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            abort_policy: AbortPolicy::Terminate,
            abort_grace: Duration::from_secs(30),
        }
    }
}

impl Executor for ProcessExecutor {
    async fn run(&self, unit: &WorkUnit, ctx: ExecutionContext) -> ExecutionResult {
        let started = Instant::now();
        let result = |exit: ExitCondition, missing_outputs: Vec<String>| ExecutionResult {
            exit,
            stdout_path: ctx.stdout_path.clone(),
            stderr_path: ctx.stderr_path.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
            missing_outputs,
        };

        let already_aborted = *ctx.abort.borrow();
        if already_aborted && self.abort_policy == AbortPolicy::Terminate {
            return result(ExitCondition::Aborted, Vec::new());
        }

        let mut command = match self.prepare(unit, &ctx) {
            Ok(command) => command,
            Err(msg) => {
                warn!(key = %unit.key, error = %msg, "Failed to prepare command");
                return result(ExitCondition::SpawnFailed(msg), Vec::new());
            }
        };
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("{}: {e}", unit.command.first().map(String::as_str).unwrap_or(""));
                warn!(key = %unit.key, error = %msg, "Failed to spawn command");
                return result(ExitCondition::SpawnFailed(msg), Vec::new());
            }
        };
        // the child leads its own group, so its pid is the group id
        let pgid = child.id();
        debug!(key = %unit.key, attempt = ctx.attempt, pid = ?pgid, "Process started");

        let deadline = ctx.timeout.map(|t| TokioInstant::now() + t);
        let mut grace_deadline: Option<TokioInstant> = None;
        let mut abort = ctx.abort.clone();
        let mut watching_abort = self.abort_policy == AbortPolicy::Terminate;

        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    break match status {
                        Ok(status) => match status.code() {
                            Some(code) => ExitCondition::Exited(code),
                            None => ExitCondition::Killed,
                        },
                        Err(e) => ExitCondition::SpawnFailed(format!("wait failed: {e}")),
                    };
                }
                _ = sleep_until(deadline) => {
                    signal_group(pgid, GroupSignal::Kill, &unit.key);
                    if let Err(e) = child.kill().await {
                        warn!(key = %unit.key, error = %e, "Failed to kill timed out process");
                    }
                    break ExitCondition::Timeout;
                }
                _ = sleep_until(grace_deadline) => {
                    signal_group(pgid, GroupSignal::Kill, &unit.key);
                    if let Err(e) = child.kill().await {
                        warn!(key = %unit.key, error = %e, "Failed to kill aborted process");
                    }
                    break ExitCondition::Aborted;
                }
                changed = abort.changed(), if watching_abort => {
                    let aborted = changed.is_ok() && *abort.borrow();
                    if changed.is_err() {
                        watching_abort = false;
                    } else if aborted {
                        watching_abort = false;
                        debug!(key = %unit.key, grace_ms = self.abort_grace.as_millis() as u64, "Abort observed, terminating process group");
                        signal_group(pgid, GroupSignal::Terminate, &unit.key);
                        grace_deadline = Some(TokioInstant::now() + self.abort_grace);
                    }
                }
            }
        };

        // anything but a clean exit after our SIGTERM is the abort's doing
        let exit = match exit {
            ExitCondition::Exited(code) if code != 0 && grace_deadline.is_some() => {
                ExitCondition::Aborted
            }
            ExitCondition::Killed if grace_deadline.is_some() => ExitCondition::Aborted,
            other => other,
        };
        let missing = match exit {
            ExitCondition::Exited(0) => missing_outputs(&unit.output_dir, &unit.outputs),
            _ => Vec::new(),
        };
        result(exit, missing)
    }
}

impl ProcessExecutor {
    pub fn new(abort_policy: AbortPolicy, abort_grace: Duration) -> Self {
        Self {
            abort_policy,
            abort_grace,
        }
    }

    fn prepare(&self, unit: &WorkUnit, ctx: &ExecutionContext) -> Result<Command, String> {
        let argv = render_command(unit, &ctx.session, ctx.attempt)?;
        let (program, args) = argv.split_first().ok_or("empty command")?;

        std::fs::create_dir_all(&unit.output_dir)
            .map_err(|e| format!("cannot create {}: {e}", unit.output_dir.display()))?;
        let stdout = open_log(&ctx.stdout_path)?;
        let stderr = open_log(&ctx.stderr_path)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&unit.output_dir)
            .env("GBATCH_UNIT_KEY", &unit.key)
            .env("GBATCH_SESSION", &ctx.session)
            .env("GBATCH_OUTPUT_DIR", &unit.output_dir)
            .env("GBATCH_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(cores) = unit.resources.cores {
            command.env("GBATCH_CORES", cores.to_string());
        }
        if let Some(memory) = &unit.resources.memory {
            command.env("GBATCH_MEMORY", memory);
        }
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signals every process in the unit's group. A group that is already gone
/// is not an error.
fn signal_group(pgid: Option<u32>, signal: GroupSignal, key: &str) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pgid) = pgid else {
            return;
        };
        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pgid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(key, pgid, signal = ?sig, error = %e, "Failed to signal process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = (pgid, signal, key);
}

async fn sleep_until(deadline: Option<TokioInstant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn open_log(path: &Path) -> Result<std::fs::File, String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| format!("cannot open {}: {e}", path.display()))
}

/// Declared outputs that are missing, empty files or empty directories.
pub fn missing_outputs(output_dir: &Path, outputs: &[String]) -> Vec<String> {
    outputs
        .iter()
        .filter(|o| {
            let path = output_dir.join(o);
            match std::fs::metadata(&path) {
                Ok(meta) if meta.is_dir() => std::fs::read_dir(&path)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(true),
                Ok(meta) => meta.len() == 0,
                Err(_) => true,
            }
        })
        .cloned()
        .collect()
}

/// Expands `{placeholder}`s in the unit's argument vector.
///
/// An argument that is exactly `{inputs}` or `{shared}` expands to one
/// argument per path; embedded in a longer argument they are space-joined.
/// `{{` and `}}` produce literal braces.
pub fn render_command(unit: &WorkUnit, session: &str, attempt: u32) -> Result<Vec<String>, String> {
    let mut argv = Vec::with_capacity(unit.command.len());
    for arg in &unit.command {
        match arg.as_str() {
            "{inputs}" => argv.extend(unit.inputs.iter().map(|p| p.display().to_string())),
            "{shared}" => argv.extend(unit.shared_inputs.iter().map(|p| p.display().to_string())),
            _ => argv.push(render_arg(arg, unit, session, attempt)?),
        }
    }
    Ok(argv)
}

fn render_arg(arg: &str, unit: &WorkUnit, session: &str, attempt: u32) -> Result<String, String> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("{{") {
            out.push('{');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("}}") {
            out.push('}');
            rest = after;
        } else if tail.starts_with('}') {
            return Err(format!("unbalanced '}}' in argument '{arg}'"));
        } else {
            let end = tail
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in argument '{arg}'"))?;
            out.push_str(&placeholder(&tail[1..end], unit, session, attempt)?);
            rest = &tail[end + 1..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder(name: &str, unit: &WorkUnit, session: &str, attempt: u32) -> Result<String, String> {
    let join = |paths: &[PathBuf]| {
        paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    };
    let value = match name {
        "key" => unit.key.clone(),
        "session" => session.to_string(),
        "attempt" => attempt.to_string(),
        "output" => unit.output_dir.display().to_string(),
        "inputs" => join(&unit.inputs),
        "shared" => join(&unit.shared_inputs),
        "input" => nth_input(unit, 0)?,
        "cores" => unit
            .resources
            .cores
            .map(|c| c.to_string())
            .ok_or("no value for {cores}")?,
        "memory" => unit.resources.memory.clone().ok_or("no value for {memory}")?,
        _ => {
            if let Some(n) = name.strip_prefix("input").and_then(|n| n.parse::<usize>().ok())
                && n > 0
            {
                nth_input(unit, n - 1)?
            } else if let Some(value) = unit.params.get(name) {
                value.clone()
            } else {
                return Err(format!("unknown placeholder {{{name}}}"));
            }
        }
    };
    Ok(value)
}

fn nth_input(unit: &WorkUnit, index: usize) -> Result<String, String> {
    unit.inputs
        .get(index)
        .map(|p| p.display().to_string())
        .ok_or_else(|| format!("unit '{}' has no input #{}", unit.key, index + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Resources;
    use indexmap::IndexMap;
    use tempfile::TempDir;

    fn sh_unit(dir: &Path, script: &str, outputs: &[&str]) -> WorkUnit {
        WorkUnit {
            key: "chr01".into(),
            inputs: vec![dir.join("chr01.vcf")],
            shared_inputs: Vec::new(),
            output_dir: dir.join("out").join("chr01"),
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            params: IndexMap::new(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            resources: Resources::default(),
        }
    }

    fn ctx(dir: &Path, timeout: Option<Duration>) -> (watch::Sender<bool>, ExecutionContext) {
        let (tx, rx) = watch::channel(false);
        let ctx = ExecutionContext {
            session: "run1".into(),
            attempt: 1,
            stdout_path: dir.join("logs").join("chr01.1.stdout.log"),
            stderr_path: dir.join("logs").join("chr01.1.stderr.log"),
            timeout,
            abort: rx,
        };
        (tx, ctx)
    }

    fn executor() -> ProcessExecutor {
        ProcessExecutor::new(AbortPolicy::Terminate, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn success_with_outputs_and_logs() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(
            tmp.path(),
            "echo hello; echo oops >&2; echo $GBATCH_UNIT_KEY > result.txt",
            &["result.txt"],
        );
        let (_tx, ctx) = ctx(tmp.path(), None);

        let res = executor().run(&unit, ctx).await;
        assert_eq!(res.exit, ExitCondition::Exited(0));
        assert_eq!(res.outcome(), AttemptOutcome::Succeeded);
        assert_eq!(std::fs::read_to_string(&res.stdout_path).unwrap(), "hello\n");
        assert_eq!(std::fs::read_to_string(&res.stderr_path).unwrap(), "oops\n");
        let written = std::fs::read_to_string(unit.output_dir.join("result.txt")).unwrap();
        assert_eq!(written.trim(), "chr01");
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "exit 3", &[]);
        let (_tx, ctx) = ctx(tmp.path(), None);

        let res = executor().run(&unit, ctx).await;
        assert_eq!(res.exit_code(), Some(3));
        assert_eq!(
            res.outcome(),
            AttemptOutcome::Failed(FailureKind::NonZeroExit(3))
        );
    }

    #[tokio::test]
    async fn zero_exit_with_missing_or_empty_output_fails() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), ": > empty.txt", &["empty.txt", "absent.txt"]);
        let (_tx, ctx) = ctx(tmp.path(), None);

        let res = executor().run(&unit, ctx).await;
        assert_eq!(res.exit_code(), Some(0));
        assert_eq!(
            res.outcome(),
            AttemptOutcome::Failed(FailureKind::MissingOutputs(vec![
                "empty.txt".into(),
                "absent.txt".into()
            ]))
        );
    }

    #[tokio::test]
    async fn timeout_is_distinguished() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "sleep 5", &[]);
        let (_tx, ctx) = ctx(tmp.path(), Some(Duration::from_millis(100)));

        let res = executor().run(&unit, ctx).await;
        assert_eq!(res.exit, ExitCondition::Timeout);
        assert_eq!(res.exit_code(), None);
        assert_eq!(res.outcome(), AttemptOutcome::Failed(FailureKind::Timeout));
        assert!(res.duration_ms < 5000);
    }

    #[tokio::test]
    async fn abort_terminates_running_process() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "sleep 5", &[]);
        let (tx, ctx) = ctx(tmp.path(), None);

        let handle = tokio::spawn(async move { executor().run(&unit, ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let res = handle.await.unwrap();
        assert_eq!(res.exit, ExitCondition::Aborted);
        assert_eq!(res.outcome(), AttemptOutcome::Aborted);
    }

    #[tokio::test]
    async fn abort_terminates_the_whole_group_before_grace() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "(sleep 1; echo late > late.txt) & wait", &[]);
        let output_dir = unit.output_dir.clone();
        let (tx, ctx) = ctx(tmp.path(), None);
        let exec = ProcessExecutor::new(AbortPolicy::Terminate, Duration::from_secs(20));

        let handle = tokio::spawn(async move { exec.run(&unit, ctx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let res = handle.await.unwrap();
        assert_eq!(res.exit, ExitCondition::Aborted);
        assert!(res.duration_ms < 10_000);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!output_dir.join("late.txt").exists());
    }

    #[tokio::test]
    async fn timeout_kills_grandchildren() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(
            tmp.path(),
            "sh -c 'sleep 1; echo late > late.txt'; true",
            &[],
        );
        let output_dir = unit.output_dir.clone();
        let (_tx, ctx) = ctx(tmp.path(), Some(Duration::from_millis(200)));

        let res = executor().run(&unit, ctx).await;
        assert_eq!(res.exit, ExitCondition::Timeout);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!output_dir.join("late.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unit_runs_in_its_own_process_group() {
        use nix::unistd::{Pid, getpgid, getpgrp};

        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "echo $$ > pid.txt; sleep 1", &[]);
        let pid_file = unit.output_dir.join("pid.txt");
        let (_tx, ctx) = ctx(tmp.path(), None);

        let handle = tokio::spawn(async move { executor().run(&unit, ctx).await });
        let mut pid = None;
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(&pid_file)
                && let Ok(parsed) = text.trim().parse::<i32>()
            {
                pid = Some(Pid::from_raw(parsed));
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let pid = pid.expect("child wrote its pid");
        let group = getpgid(Some(pid)).unwrap();
        assert_eq!(group, pid);
        assert_ne!(group, getpgrp());

        let res = handle.await.unwrap();
        assert_eq!(res.exit, ExitCondition::Exited(0));
    }

    #[tokio::test]
    async fn abort_with_finish_policy_keeps_real_outcome() {
        let tmp = TempDir::new().unwrap();
        let unit = sh_unit(tmp.path(), "sleep 0.3; exit 0", &[]);
        let (tx, ctx) = ctx(tmp.path(), None);
        let exec = ProcessExecutor::new(AbortPolicy::Finish, Duration::from_millis(10));

        let handle = tokio::spawn(async move { exec.run(&unit, ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let res = handle.await.unwrap();
        assert_eq!(res.outcome(), AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let tmp = TempDir::new().unwrap();
        let mut unit = sh_unit(tmp.path(), "", &[]);
        unit.command = vec!["/definitely/not/a/binary".into()];
        let (_tx, ctx) = ctx(tmp.path(), None);

        let res = executor().run(&unit, ctx).await;
        assert!(matches!(res.exit, ExitCondition::SpawnFailed(_)));
        assert!(matches!(
            res.outcome(),
            AttemptOutcome::Failed(FailureKind::SpawnFailed(_))
        ));
    }

    #[test]
    fn render_placeholders() {
        let mut unit = sh_unit(Path::new("/data"), "", &[]);
        unit.inputs = vec![PathBuf::from("/data/a_R1.fq"), PathBuf::from("/data/a_R2.fq")];
        unit.output_dir = PathBuf::from("/out/a");
        unit.params.insert("release".into(), "1.0.0".into());
        unit.resources.cores = Some(4);
        unit.command = vec![
            "docker".into(),
            "run".into(),
            "smaffiol/gwas:{release}".into(),
            "{inputs}".into(),
            "--mates={input1},{input2}".into(),
            "-o".into(),
            "{output}/{key}.{attempt}".into(),
            "--threads={cores}".into(),
            "{{literal}}".into(),
        ];

        let argv = render_command(&unit, "run1", 2).unwrap();
        assert_eq!(
            argv,
            vec![
                "docker",
                "run",
                "smaffiol/gwas:1.0.0",
                "/data/a_R1.fq",
                "/data/a_R2.fq",
                "--mates=/data/a_R1.fq,/data/a_R2.fq",
                "-o",
                "/out/a/chr01.2",
                "--threads=4",
                "{literal}",
            ]
        );
    }

    #[test]
    fn render_rejects_unknown_placeholder() {
        let mut unit = sh_unit(Path::new("/data"), "", &[]);
        unit.command = vec!["tool".into(), "{nope}".into()];
        let err = render_command(&unit, "run1", 1).unwrap_err();
        assert_eq!(err, "unknown placeholder {nope}");

        unit.command = vec!["tool".into(), "{input3}".into()];
        assert!(render_command(&unit, "run1", 1).is_err());

        unit.command = vec!["tool".into(), "{memory}".into()];
        assert!(render_command(&unit, "run1", 1).is_err());
    }
}

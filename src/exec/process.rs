// src/exec/process.rs

//! Process supervisor.
//!
//! Owns one external process: spawning it with a given environment and
//! working directory, streaming its stdout/stderr line by line, waiting for
//! it with a timeout or a cancellation token, and tearing down its whole
//! process tree (interrupt, bounded wait, then kill).
//!
//! On unix every child is placed in its own process group, so signalling
//! `-pgid` reaches helper processes the script started as well.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::is_path_like;
use crate::errors::SpawnError;

const LIVENESS_POLL: Duration = Duration::from_millis(50);
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// What to run, where, and with which extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Quoted command line, for records and logs.
    pub fn display(&self) -> String {
        let mut parts = vec![format!("\"{}\"", self.program.display())];
        parts.extend(self.args.iter().map(|a| format!("\"{a}\"")));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of captured output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// Interleaved stdout/stderr lines in arrival order.
///
/// Yields `None` once both pipes are closed and every buffered line has been
/// delivered.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<OutputLine>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing was left to signal.
    AlreadyExited,
    /// Everything exited within the grace period.
    Graceful,
    /// The tree had to be killed.
    Forced,
}

/// Handle to a spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    child: Child,
    output: Option<OutputStream>,
}

/// Start a process. Output readers begin immediately; the caller picks the
/// stream up with [`ProcessHandle::take_output`].
pub fn spawn(spec: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
    if is_path_like(&spec.program) && !spec.program.is_file() {
        return Err(SpawnError::ExecutableNotFound(spec.program.clone()));
    }
    if !spec.working_dir.is_dir() {
        return Err(SpawnError::WorkingDirMissing(spec.working_dir.clone()));
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let program = spec.program.display().to_string();
    let mut child = cmd.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            SpawnError::ExecutableNotFound(spec.program.clone())
        } else {
            SpawnError::Os {
                program: program.clone(),
                source,
            }
        }
    })?;

    let pid = child.id().ok_or_else(|| SpawnError::Os {
        program: program.clone(),
        source: std::io::Error::other("process exited before its pid could be read"),
    })?;

    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, StreamKind::Stdout, tx.clone(), pid);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, StreamKind::Stderr, tx, pid);
    }

    info!(pid, program = %program, cwd = %spec.working_dir.display(), "spawned process");

    Ok(ProcessHandle {
        pid,
        child,
        output: Some(OutputStream { rx }),
    })
}

fn spawn_reader<R>(pipe: R, stream: StreamKind, tx: mpsc::Sender<OutputLine>, pid: u32)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Scripts may emit invalid UTF-8 despite the environment.
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(pid, ?stream, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    });
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn tree(&self) -> ProcessTree {
        ProcessTree::from_pid(self.pid)
    }

    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Wait for exit, the timeout, or the token, whichever comes first.
    /// Does not kill anything.
    pub async fn wait(
        &mut self,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> std::io::Result<WaitOutcome> {
        tokio::select! {
            biased;
            status = self.child.wait() => Ok(WaitOutcome::Exited(exit_code(status?))),
            _ = cancel.cancelled() => Ok(WaitOutcome::Cancelled),
            _ = sleep(limit) => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Wait for exit for at most `limit`. `None` if still running.
    pub async fn wait_for_exit(&mut self, limit: Duration) -> std::io::Result<Option<i32>> {
        match timeout(limit, self.child.wait()).await {
            Ok(status) => Ok(Some(exit_code(status?))),
            Err(_) => Ok(None),
        }
    }

    /// Interrupt the process tree, wait up to `grace`, then kill whatever is
    /// left. The direct child is always reaped before returning.
    pub async fn terminate(&mut self, grace: Duration) -> TerminateOutcome {
        let tree = self.tree();
        let leader_done = matches!(self.child.try_wait(), Ok(Some(_)));
        if leader_done && !tree.is_alive() {
            return TerminateOutcome::AlreadyExited;
        }

        let deadline = Instant::now() + grace;
        if !tree.interrupt() {
            let _ = self.child.wait().await;
            return TerminateOutcome::AlreadyExited;
        }

        let leader_exited = timeout(grace, self.child.wait()).await.is_ok();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = if leader_exited && tree.wait_gone(remaining).await {
            TerminateOutcome::Graceful
        } else {
            warn!(pid = self.pid, "process tree ignored interrupt; killing");
            tree.kill();
            if let Err(e) = self.child.kill().await {
                debug!(pid = self.pid, error = %e, "kill on direct child failed");
            }
            TerminateOutcome::Forced
        };
        info!(pid = self.pid, ?outcome, "terminated process tree");
        outcome
    }
}

/// A process and all of its descendants, addressed by the leader's pid.
///
/// Cheap to copy; safe to use after the leader has exited (signals to a
/// vanished group are no-ops).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessTree {
    pid: u32,
}

impl ProcessTree {
    pub fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Cooperative termination request. `false` if nothing was alive to
    /// receive it.
    pub fn interrupt(&self) -> bool {
        platform::interrupt(self.pid)
    }

    pub fn kill(&self) -> bool {
        platform::kill(self.pid)
    }

    pub fn is_alive(&self) -> bool {
        platform::is_alive(self.pid)
    }

    /// Poll until the whole tree is gone or `limit` passes.
    pub async fn wait_gone(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(LIVENESS_POLL).await;
        }
    }

    /// Same protocol as [`ProcessHandle::terminate`] for callers that only
    /// hold the pid (the stop path).
    pub async fn terminate(&self, grace: Duration) -> TerminateOutcome {
        if !self.is_alive() || !self.interrupt() {
            return TerminateOutcome::AlreadyExited;
        }
        if self.wait_gone(grace).await {
            return TerminateOutcome::Graceful;
        }
        warn!(pid = self.pid, "process tree still alive after grace; killing");
        self.kill();
        TerminateOutcome::Forced
    }
}

#[cfg(unix)]
mod platform {
    fn signal_group(pid: u32, signal: libc::c_int) -> bool {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pgid <= 0 {
            return false;
        }
        // Negative pid addresses the whole process group.
        let rc = unsafe { libc::kill(-pgid, signal) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub(super) fn interrupt(pid: u32) -> bool {
        signal_group(pid, libc::SIGINT) | signal_group(pid, libc::SIGTERM)
    }

    pub(super) fn kill(pid: u32) -> bool {
        signal_group(pid, libc::SIGKILL)
    }

    pub(super) fn is_alive(pid: u32) -> bool {
        signal_group(pid, 0)
    }
}

#[cfg(not(unix))]
mod platform {
    use std::process::{Command, Stdio};

    fn taskkill(pid: u32, force: bool) -> bool {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/PID", &pid.to_string(), "/T"]);
        if force {
            cmd.arg("/F");
        }
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    pub(super) fn interrupt(pid: u32) -> bool {
        taskkill(pid, false)
    }

    pub(super) fn kill(pid: u32) -> bool {
        taskkill(pid, true)
    }

    pub(super) fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH"])
            .stderr(Stdio::null())
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            env: vec![("DROIDFLOW_TEST".to_string(), "1".to_string())],
        }
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let mut handle = spawn(&sh("echo out; echo err 1>&2; echo $DROIDFLOW_TEST; exit 3")).unwrap();
        let mut output = handle.take_output().unwrap();
        let outcome = handle
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Exited(3));

        let mut lines = Vec::new();
        while let Some(line) = output.next().await {
            lines.push(line);
        }
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["out", "1"]);
        assert!(lines
            .iter()
            .any(|l| l.stream == StreamKind::Stderr && l.text == "err"));
    }

    #[tokio::test]
    async fn wait_times_out_without_killing() {
        let mut handle = spawn(&sh("sleep 5")).unwrap();
        let outcome = handle
            .wait(Duration::from_millis(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(handle.tree().is_alive());
        assert_eq!(
            handle.terminate(Duration::from_secs(2)).await,
            TerminateOutcome::Graceful
        );
        assert!(!handle.tree().is_alive());
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let mut handle = spawn(&sh("sleep 5")).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = handle.wait(Duration::from_secs(5), &token).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Cancelled);
        handle.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn terminate_escalates_when_interrupt_is_ignored() {
        let mut handle = spawn(&sh("trap '' INT TERM; sleep 5")).unwrap();
        // Give the shell a moment to install its trap.
        sleep(Duration::from_millis(200)).await;
        let outcome = handle.terminate(Duration::from_millis(300)).await;
        assert_eq!(outcome, TerminateOutcome::Forced);
        assert!(handle.tree().wait_gone(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn terminate_after_exit_is_a_no_op() {
        let mut handle = spawn(&sh("exit 0")).unwrap();
        handle
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            handle.terminate(Duration::from_millis(100)).await,
            TerminateOutcome::AlreadyExited
        );
        assert_eq!(
            handle.tree().terminate(Duration::from_millis(100)).await,
            TerminateOutcome::AlreadyExited
        );
    }

    #[test]
    fn missing_executable_and_working_dir() {
        let mut spec = sh("true");
        spec.program = PathBuf::from("/definitely/not/here/python3");
        assert!(matches!(spawn(&spec), Err(SpawnError::ExecutableNotFound(_))));

        let mut spec = sh("true");
        spec.working_dir = PathBuf::from("/definitely/not/here");
        assert!(matches!(spawn(&spec), Err(SpawnError::WorkingDirMissing(_))));
    }

    #[test]
    fn display_quotes_every_part() {
        let spec = CommandSpec {
            program: PathBuf::from("/usr/bin/python3"),
            args: vec!["run.py".into(), "10.0.0.2:5555".into()],
            working_dir: PathBuf::from("/tmp"),
            env: Vec::new(),
        };
        assert_eq!(spec.display(), "\"/usr/bin/python3\" \"run.py\" \"10.0.0.2:5555\"");
    }
}

//! Launches the transfer engine and watches it until it exits.
//!
//! One child per call. The child runs in its own process group so a timeout
//! or a cancellation can take down anything it spawned. Both output streams
//! go to `<log-dir>/<executionId>.log` (append mode) and, when mirroring is
//! on, to this process's stdout/stderr prefixed with the execution id.
//!
//! Whatever is left of the group when the engine itself exits is killed, so
//! no run leaves processes behind. A timed-out or cancelled run returns
//! within the kill grace plus [`DRAIN_TIMEOUT`] after the deadline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::CollectorConfig;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::error::CollectionError;

/// Upper bound on draining output after the process group is gone.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a supervised run ended. Only `Code(0)` is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Terminated by a signal it did not get from us.
    Signal(i32),
    /// Killed after exceeding its wall-clock limit.
    TimedOut,
    /// Killed through its [`CancelHandle`].
    Cancelled,
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// Exit code for the execution's result payload, when there is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(c) => Some(*c),
            _ => None,
        }
    }
}

/// How and when a supervised run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunEnd {
    pub exit: ProcessExit,
    /// When the engine exited or was killed, before output draining.
    pub ended_at: DateTime<Utc>,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(c) => write!(f, "exit code {}", c),
            Self::Signal(s) => write!(f, "signal {}", s),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Shared one-shot cancellation flag for a single execution.
///
/// Cloning yields another handle to the same flag. Once fired it stays fired.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    runtime: String,
    runtime_args: Vec<String>,
    log_dir: PathBuf,
    mirror: bool,
    kill_grace: Duration,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessSupervisor {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            runtime_args: config.runtime_args.clone(),
            log_dir: config.log_dir.clone(),
            mirror: config.mirror_output,
            kill_grace: config.kill_grace(),
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", execution_id))
    }

    /// Run `<runtime> <args…> <spec>` until it exits, times out, or is cancelled.
    ///
    /// Launch and log-file errors are returned; everything about how the
    /// child ended is reported through [`RunEnd`].
    pub async fn run(
        &self,
        spec: &Path,
        execution_id: &str,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<RunEnd, CollectionError> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let log_path = self.log_path(execution_id);
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        let header = format!(
            "[collector] {} start: {} {} {}\n",
            Utc::now().to_rfc3339(),
            self.runtime,
            self.runtime_args.join(" "),
            spec.display()
        );
        log.write_all(header.as_bytes()).await?;

        let mut cmd = Command::new(&self.runtime);
        cmd.args(&self.runtime_args)
            .arg(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| CollectionError::Launch {
            program: self.runtime.clone(),
            source,
        })?;
        let pid = child.id();
        info!(
            execution_id = %execution_id,
            pid = ?pid,
            timeout_secs = timeout.as_secs(),
            "transfer engine started"
        );

        let (tx, rx) = mpsc::unbounded_channel::<(Stream, String)>();
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, Stream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, Stream::Stderr, tx.clone())));
        }
        let prefix = format!("[{}] ", execution_id);
        let mut writer = tokio::spawn(write_log(log, rx, self.mirror.then_some(prefix)));

        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status),
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
            _ = cancel.cancelled() => Wake::Cancelled,
        };

        let exit = match wake {
            Wake::Exited(status) => {
                let exit = exit_from_status(status?);
                if let Some(pid) = pid {
                    // Background children of the engine still hold the pipes.
                    signal_group(pid, "KILL");
                }
                exit
            }
            Wake::TimedOut => {
                warn!(execution_id = %execution_id, "transfer engine timed out, killing");
                self.terminate(&mut child, pid).await;
                ProcessExit::TimedOut
            }
            Wake::Cancelled => {
                info!(execution_id = %execution_id, "transfer engine cancelled, killing");
                self.terminate(&mut child, pid).await;
                ProcessExit::Cancelled
            }
        };

        let ended_at = Utc::now();

        let pumped = async {
            for pump in &mut pumps {
                let _ = pump.await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, pumped).await.is_err() {
            warn!(execution_id = %execution_id, "engine output still open, dropping the rest");
            for pump in &pumps {
                pump.abort();
            }
        }

        let trailer = format!("[collector] {} end: {}\n", ended_at.to_rfc3339(), exit);
        let _ = tx.send((Stream::Stdout, trailer));
        drop(tx);
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
            warn!(execution_id = %execution_id, "log writer did not drain in time");
            writer.abort();
        }

        info!(execution_id = %execution_id, exit = %exit, "transfer engine finished");
        Ok(RunEnd { exit, ended_at })
    }

    /// SIGTERM the process group, then SIGKILL whatever is left after the grace period.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        match pid {
            Some(pid) => signal_group(pid, "TERM"),
            None => {
                let _ = child.start_kill();
            }
        }

        if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
            if let Some(pid) = pid {
                // Stragglers that ignored the group SIGTERM.
                signal_group(pid, "KILL");
            }
            return;
        }

        warn!(pid = ?pid, "graceful termination timed out, force killing");
        if let Some(pid) = pid {
            signal_group(pid, "KILL");
        }
        let _ = child.kill().await;
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: &str) {
    let result = std::process::Command::new("kill")
        .args([format!("-{}", signal), "--".to_string(), format!("-{}", pgid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    debug!(pgid, signal, ok = result.map(|s| s.success()).unwrap_or(false), "signalled process group");
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: &str) {}

fn exit_from_status(status: ExitStatus) -> ProcessExit {
    if let Some(code) = status.code() {
        return ProcessExit::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessExit::Signal(signal);
        }
    }
    ProcessExit::Code(-1)
}

/// Forward one output stream line by line. Invalid UTF-8 is replaced, not dropped.
async fn pump<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end_matches(['\r', '\n']).to_string();
                if tx.send((stream, line + "\n")).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

/// Sole writer of the execution log.
async fn write_log(
    mut log: File,
    mut rx: mpsc::UnboundedReceiver<(Stream, String)>,
    mirror_prefix: Option<String>,
) {
    while let Some((stream, line)) = rx.recv().await {
        if let Err(e) = log.write_all(line.as_bytes()).await {
            warn!(error = %e, "failed to write execution log");
        }
        if let Some(prefix) = &mirror_prefix {
            let text = line.trim_end_matches('\n');
            match stream {
                Stream::Stdout => println!("{prefix}{text}"),
                Stream::Stderr => eprintln!("{prefix}{text}"),
            }
        }
    }
    let _ = log.flush().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn supervisor(root: &Path, script: &str) -> (ProcessSupervisor, PathBuf) {
        let script_path = root.join("engine.sh");
        std::fs::write(&script_path, script).unwrap();
        let sup = ProcessSupervisor {
            runtime: "sh".to_string(),
            runtime_args: vec![script_path.to_string_lossy().into_owned()],
            log_dir: root.join("logs"),
            mirror: false,
            kill_grace: Duration::from_millis(500),
        };
        let spec = root.join("spec.json");
        std::fs::write(&spec, "{}").unwrap();
        (sup, spec)
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, spec) = supervisor(
            dir.path(),
            "echo \"reading $1\"\necho 'oops' 1>&2\nexit 3\n",
        );

        let exit = sup
            .run(&spec, "exec-1", Duration::from_secs(10), &CancelHandle::new())
            .await
            .unwrap()
            .exit;
        assert_eq!(exit, ProcessExit::Code(3));
        assert!(!exit.is_success());

        let log = std::fs::read_to_string(sup.log_path("exec-1")).unwrap();
        assert!(log.contains(&format!("reading {}", spec.display())));
        assert!(log.contains("oops"));
        assert!(log.contains("end: exit code 3"));
    }

    #[tokio::test]
    async fn log_is_appended_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, spec) = supervisor(dir.path(), "echo run\n");
        let cancel = CancelHandle::new();

        sup.run(&spec, "exec-2", Duration::from_secs(10), &cancel).await.unwrap();
        sup.run(&spec, "exec-2", Duration::from_secs(10), &cancel).await.unwrap();

        let log = std::fs::read_to_string(sup.log_path("exec-2")).unwrap();
        assert_eq!(log.matches("run\n").count(), 2);
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, spec) = supervisor(dir.path(), "sleep 30 &\nsleep 30\n");

        let started = Instant::now();
        let exit = sup
            .run(&spec, "exec-3", Duration::from_secs(1), &CancelHandle::new())
            .await
            .unwrap()
            .exit;
        assert_eq!(exit, ProcessExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, spec) = supervisor(dir.path(), "sleep 30\n");
        let cancel = CancelHandle::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let exit = sup
            .run(&spec, "exec-4", Duration::from_secs(60), &cancel)
            .await
            .unwrap()
            .exit;
        assert_eq!(exit, ProcessExit::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn background_children_die_with_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let (sup, spec) = supervisor(
            dir.path(),
            &format!("(sleep 2; touch '{}') &\nexit 0\n", marker.display()),
        );

        let started = Instant::now();
        let end = sup
            .run(&spec, "exec-6", Duration::from_secs(30), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(end.exit, ProcessExit::Code(0));
        assert!(started.elapsed() < Duration::from_millis(1500), "{:?}", started.elapsed());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "grandchild outlived the run");
    }

    #[tokio::test]
    async fn term_ignoring_engine_ends_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, spec) = supervisor(dir.path(), "trap '' TERM\nsleep 30\n");

        let started = Instant::now();
        let end = sup
            .run(&spec, "exec-7", Duration::from_secs(1), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(end.exit, ProcessExit::TimedOut);
        // timeout + kill grace (500ms) + drain bound, with slack
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn missing_runtime_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sup, spec) = supervisor(dir.path(), "true\n");
        sup.runtime = "/nonexistent/engine-runtime".to_string();

        let err = sup
            .run(&spec, "exec-5", Duration::from_secs(5), &CancelHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CollectionError::Launch { .. }));
    }

    #[tokio::test]
    async fn cancel_before_wait_resolves_immediately() {
        let cancel = CancelHandle::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();
        assert!(cancel.clone().is_cancelled());
    }
}

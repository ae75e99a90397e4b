//! Child process lifecycle: discovery, spawn, output capture and termination.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_core::ExecutionId;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::composer::ComposedCommand;
use crate::error::LaunchError;

/// Lines longer than this are split.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Drain bound used when the grace window is zero.
const MIN_DRAIN: Duration = Duration::from_millis(250);

/// Shim that prints the transaction marker before handing over to the tool.
const WRAP_SCRIPT: &str =
    r#"printf '%s: %s\n' "$TETHER_MARKER_PREFIX" "$TETHER_TRANSACTION_ID"; exec "$@""#;
const WRAP_ARGV0: &str = "tether-wrap";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of live output, delivered to an observer as it is read.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub execution_id: ExecutionId,
    pub stream: OutputStream,
    pub line: String,
}

/// Why supervision stopped waiting on the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Debug)]
pub struct LaunchOutcome {
    pub termination: Termination,
    /// `None` when the process ended by signal.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, whole lines in arrival order.
    pub output: String,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl LaunchOutcome {
    pub fn killed(&self) -> bool {
        self.termination != Termination::Exited
    }
}

/// Per-launch supervision controls.
pub struct Supervision {
    pub execution_id: ExecutionId,
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
    pub observer: Option<UnboundedSender<OutputChunk>>,
}

#[derive(Clone, Copy, Debug)]
pub struct ProcessLauncher {
    grace: Duration,
    max_output_bytes: usize,
    wrap_with_marker: bool,
}

impl ProcessLauncher {
    pub fn new(grace: Duration, max_output_bytes: usize, wrap_with_marker: bool) -> Self {
        Self {
            grace,
            max_output_bytes,
            wrap_with_marker: wrap_with_marker && cfg!(unix),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Resolve `program` on `PATH` (or as a path) without spawning anything.
    pub fn locate(&self, program: &str, working_dir: &Path) -> Result<PathBuf, LaunchError> {
        let search_path = std::env::var_os("PATH");
        which::which_in(program, search_path, working_dir).map_err(|_| LaunchError::NotFound {
            program: program.to_string(),
        })
    }

    /// Start the child in its own process group with piped streams.
    pub fn spawn(&self, cmd: &ComposedCommand, program: &Path) -> Result<Child, LaunchError> {
        let mut command = if self.wrap_with_marker {
            let mut c = Command::new("sh");
            c.arg("-c").arg(WRAP_SCRIPT).arg(WRAP_ARGV0).arg(program);
            c
        } else {
            Command::new(program)
        };

        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&cmd.working_dir)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(LaunchError::Spawn)
    }

    /// Feed stdin, capture output and wait for exit, timeout or cancellation.
    pub async fn supervise(
        &self,
        mut child: Child,
        stdin: Option<String>,
        ctl: Supervision,
    ) -> Result<LaunchOutcome, LaunchError> {
        let started = Instant::now();
        let pid = child.id();

        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.max_output_bytes)));
        let readers = vec![
            spawn_reader(
                BufReader::new(stdout),
                OutputStream::Stdout,
                Arc::clone(&buffer),
                &ctl,
            ),
            spawn_reader(
                BufReader::new(stderr),
                OutputStream::Stderr,
                Arc::clone(&buffer),
                &ctl,
            ),
        ];

        if let (Some(payload), Some(mut writer)) = (stdin, child.stdin.take()) {
            // A child that exits without reading gives a broken pipe; that is
            // its business, not a launch failure.
            drop(tokio::spawn(async move {
                if let Err(e) = writer.write_all(payload.as_bytes()).await {
                    debug!(error = %e, "stdin write stopped early");
                }
                let _ = writer.shutdown().await;
            }));
        }

        let cancelled = async {
            match &ctl.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let ended = tokio::select! {
            status = child.wait() => Ok(status.map_err(LaunchError::Wait)?),
            () = tokio::time::sleep(ctl.timeout) => Err(Termination::TimedOut),
            () = cancelled => Err(Termination::Cancelled),
        };

        let (termination, status) = match ended {
            Ok(status) => (Termination::Exited, Some(status)),
            Err(reason) => {
                warn!(
                    execution_id = %ctl.execution_id,
                    ?reason,
                    timeout_ms = ctl.timeout.as_millis() as u64,
                    "terminating child"
                );
                (reason, self.terminate(&mut child, pid).await)
            }
        };

        self.drain(readers, pid).await;

        let exit_code = status.and_then(|s| s.code());
        let (output, truncated) = {
            let mut buf = buffer.lock();
            (std::mem::take(&mut buf.data), buf.truncated)
        };

        Ok(LaunchOutcome {
            termination,
            exit_code,
            output,
            truncated,
            elapsed: started.elapsed(),
        })
    }

    /// Graceful signal to the group, then a forced kill once the grace window
    /// passes.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> Option<ExitStatus> {
        signal_group(pid, Signal::Terminate);
        if let Ok(Ok(status)) = tokio::time::timeout(self.grace, child.wait()).await {
            return Some(status);
        }

        signal_group(pid, Signal::Kill);
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "start_kill after group kill");
        }
        child.wait().await.ok()
    }

    /// Wait for both readers, bounded so a grandchild holding the pipes open
    /// cannot stall the launch.
    async fn drain(&self, readers: Vec<JoinHandle<()>>, pid: Option<u32>) {
        let bound = self.grace.max(MIN_DRAIN);
        let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(bound, futures::future::join_all(readers))
            .await
            .is_err()
        {
            warn!(drain_ms = bound.as_millis() as u64, "output pipes still open, abandoning");
            signal_group(pid, Signal::Kill);
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

struct OutputBuffer {
    data: String,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(cap: usize) -> Self {
        Self {
            data: String::new(),
            cap,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated || self.data.len() + line.len() + 1 > self.cap {
            self.truncated = true;
            return;
        }
        self.data.push_str(line);
        self.data.push('\n');
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    buffer: Arc<Mutex<OutputBuffer>>,
    ctl: &Supervision,
) -> JoinHandle<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let observer = ctl.observer.clone();
    let execution_id = ctl.execution_id.clone();
    tokio::spawn(read_lines(reader, stream, buffer, observer, execution_id))
}

async fn read_lines<R>(
    mut reader: R,
    stream: OutputStream,
    buffer: Arc<Mutex<OutputBuffer>>,
    observer: Option<UnboundedSender<OutputChunk>>,
    execution_id: ExecutionId,
) where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match (&mut reader).take(MAX_LINE_BYTES).read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim_end_matches(['\n', '\r']);
                buffer.lock().push_line(line);
                if let Some(tx) = &observer {
                    let _ = tx.send(OutputChunk {
                        execution_id: execution_id.clone(),
                        stream,
                        line: line.to_string(),
                    });
                }
            }
            Err(e) => {
                debug!(?stream, error = %e, "output read failed");
                break;
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
        return;
    };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a negative pid addresses the process group the
    // child leads; it has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        debug!(pid, ?signal, error = %std::io::Error::last_os_error(), "group signal not delivered");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::composer::{ENV_MARKER_PREFIX, ENV_TRANSACTION_ID};
    use tether_core::CliTool;

    fn sh(script: &str, dir: &Path) -> ComposedCommand {
        ComposedCommand {
            tool: CliTool::Gemini,
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "tether-test".into()],
            env: vec![
                (ENV_TRANSACTION_ID.into(), "txn_test".into()),
                (ENV_MARKER_PREFIX.into(), "TETHER_TXN".into()),
            ],
            stdin: None,
            working_dir: dir.to_path_buf(),
        }
    }

    fn ctl(timeout_ms: u64) -> Supervision {
        Supervision {
            execution_id: ExecutionId::from_raw("exec_test"),
            timeout: Duration::from_millis(timeout_ms),
            cancel: None,
            observer: None,
        }
    }

    async fn run(
        launcher: ProcessLauncher,
        cmd: &ComposedCommand,
        ctl: Supervision,
    ) -> LaunchOutcome {
        let program = launcher.locate(&cmd.program, &cmd.working_dir).unwrap();
        let child = launcher.spawn(cmd, &program).unwrap();
        launcher.supervise(child, cmd.stdin.clone(), ctl).await.unwrap()
    }

    #[test]
    fn wrap_script_reads_composer_env() {
        assert!(WRAP_SCRIPT.contains(&format!("${ENV_MARKER_PREFIX}")));
        assert!(WRAP_SCRIPT.contains(&format!("${ENV_TRANSACTION_ID}")));
        assert!(WRAP_SCRIPT.ends_with(r#"exec "$@""#));
    }

    #[test]
    fn locate_missing_tool() {
        let launcher = ProcessLauncher::new(Duration::from_millis(100), 1024, false);
        let err = launcher
            .locate("tether-definitely-not-installed", Path::new("/"))
            .unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }));
    }

    #[tokio::test]
    async fn captures_exit_code_and_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, false);
        let out = run(
            launcher,
            &sh("echo out; echo err >&2; exit 3", dir.path()),
            ctl(5_000),
        )
        .await;
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.exit_code, Some(3));
        assert!(out.output.contains("out\n"));
        assert!(out.output.contains("err\n"));
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn wrapper_emits_marker_first() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, true);
        let out = run(launcher, &sh("echo body", dir.path()), ctl(5_000)).await;
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.starts_with("TETHER_TXN: txn_test\n"), "{}", out.output);
        assert!(out.output.contains("body\n"));
    }

    #[tokio::test]
    async fn stdin_payload_is_delivered_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, false);
        let mut cmd = sh("cat", dir.path());
        cmd.stdin = Some("hello from stdin\nsecond".into());
        let out = run(launcher, &cmd, ctl(5_000)).await;
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.output, "hello from stdin\nsecond\n");
    }

    #[tokio::test]
    async fn output_cap_sets_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 64, false);
        let out = run(
            launcher,
            &sh("i=0; while [ $i -lt 50 ]; do echo line-$i; i=$((i+1)); done", dir.path()),
            ctl(5_000),
        )
        .await;
        assert!(out.truncated);
        assert!(out.output.len() <= 64);
        assert!(out.output.starts_with("line-0\n"));
    }

    #[tokio::test]
    async fn timeout_escalates_to_kill_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(300), 1 << 20, false);
        let started = Instant::now();
        let out = run(
            launcher,
            &sh("trap '' TERM; echo started; while :; do sleep 1; done", dir.path()),
            ctl(300),
        )
        .await;
        assert_eq!(out.termination, Termination::TimedOut);
        assert!(out.killed());
        assert_eq!(out.exit_code, None);
        assert!(out.output.contains("started"));
        // timeout + grace + drain bound, with scheduling slack
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[tokio::test]
    async fn cancellation_follows_timeout_path() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, false);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });
        let out = run(
            launcher,
            &sh("sleep 30", dir.path()),
            Supervision {
                cancel: Some(token),
                ..ctl(30_000)
            },
        )
        .await;
        assert_eq!(out.termination, Termination::Cancelled);
        assert!(out.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn observer_receives_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let out = run(
            launcher,
            &sh("echo one; echo two", dir.path()),
            Supervision {
                observer: Some(tx),
                ..ctl(5_000)
            },
        )
        .await;
        assert_eq!(out.exit_code, Some(0));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.line, "one");
        assert_eq!(second.line, "two");
        assert_eq!(first.stream, OutputStream::Stdout);
        assert_eq!(first.execution_id.as_str(), "exec_test");
    }

    #[tokio::test]
    async fn background_grandchild_does_not_stall_drain() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(Duration::from_millis(200), 1 << 20, false);
        let started = Instant::now();
        let out = run(launcher, &sh("sleep 30 & echo done", dir.path()), ctl(5_000)).await;
        assert_eq!(out.termination, Termination::Exited);
        assert_eq!(out.exit_code, Some(0));
        assert!(out.output.contains("done"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}

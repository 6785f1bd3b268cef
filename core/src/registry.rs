//! Session Registry (§4.4): the single mutable authority over the set of sessions. Owns
//! the graph construction the design notes call out explicitly — PTY Host, Recorder,
//! Terminal Model and Hub are wired together here, not discovered via a shared singleton.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::VtError;
use crate::hub::Hub;
use crate::pty::{self, PtyHandle};
use crate::recorder::{RecordingHeader, RecordingWriter};
use crate::session::{unix_now_secs, SessionId, SessionMetadata, SessionSpec, SessionStatus};
use crate::terminal::TerminalModel;

/// A session with a live PTY, recorder and terminal model. Held behind `Arc` so the
/// per-session background task can outlive the HTTP handler that triggered an action.
pub struct LiveSession {
    pub metadata: RwLock<SessionMetadata>,
    pub pty: PtyHandle,
    pub recorder: StdMutex<Option<RecordingWriter>>,
    pub terminal: StdMutex<TerminalModel>,
    pub transcript_path: PathBuf,
}

enum SessionSlot {
    Live(Arc<LiveSession>),
    /// Loaded from `index.json`/`<id>.meta.json` at startup. No live PTY; read-only.
    Recovered(SessionMetadata),
}

impl SessionSlot {
    fn metadata_snapshot(&self) -> SessionMetadataFuture {
        match self {
            SessionSlot::Live(s) => SessionMetadataFuture::Live(s.clone()),
            SessionSlot::Recovered(m) => SessionMetadataFuture::Recovered(m.clone()),
        }
    }
}

enum SessionMetadataFuture {
    Live(Arc<LiveSession>),
    Recovered(SessionMetadata),
}

impl SessionMetadataFuture {
    async fn get(self) -> SessionMetadata {
        match self {
            SessionMetadataFuture::Live(s) => s.metadata.read().await.clone(),
            SessionMetadataFuture::Recovered(m) => m,
        }
    }
}

/// Mirrors one entry in `index.json`: the subset of metadata needed to reconstruct a
/// read-only view across a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: SessionId,
}

pub struct Registry {
    sessions: DashMap<SessionId, SessionSlot>,
    hub: Arc<Hub>,
    config: Arc<Config>,
    connection_counter: AtomicU64,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Self {
        let hub = Arc::new(Hub::new(config.max_subscriber_buffer_bytes, config.max_subscriber_buffer_frames));
        Self { sessions: DashMap::new(), hub, config, connection_counter: AtomicU64::new(0) }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    pub fn next_connection_id(&self) -> crate::hub::ConnectionId {
        crate::hub::ConnectionId(self.connection_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Loads `index.json` and each listed `<id>.meta.json`, marking every entry as
    /// `exited` (no process survives a restart) and keeping its transcript around for
    /// replay. Errors reading the index are non-fatal: an empty or missing index just
    /// means a fresh `RECORDINGS_DIR`.
    pub fn recover(&self) {
        let index_path = self.config.recordings_dir.join("index.json");
        let Ok(raw) = std::fs::read_to_string(&index_path) else { return };
        let Ok(entries) = serde_json::from_str::<Vec<IndexEntry>>(&raw) else {
            warn!(path = %index_path.display(), "index.json is not valid json; skipping recovery");
            return;
        };
        for entry in entries {
            let meta_path = self.config.recordings_dir.join(format!("{}.meta.json", entry.id));
            let Ok(raw) = std::fs::read_to_string(&meta_path) else { continue };
            let Ok(mut meta) = serde_json::from_str::<SessionMetadata>(&raw) else { continue };
            meta.status = SessionStatus::Exited;
            meta.pid = None;
            if meta.exit_code.is_none() {
                meta.exit_code = Some(-1);
            }
            info!(session_id = %meta.id, "recovered session from prior run");
            self.sessions.insert(meta.id, SessionSlot::Recovered(meta));
        }
    }

    fn persist_index(&self) {
        let entries: Vec<IndexEntry> = self.sessions.iter().map(|e| IndexEntry { id: *e.key() }).collect();
        if let Ok(json) = serde_json::to_string_pretty(&entries) {
            let path = self.config.recordings_dir.join("index.json");
            if let Err(e) = std::fs::write(&path, json) {
                warn!(error = %e, "failed to persist index.json");
            }
        }
    }

    fn persist_meta(&self, meta: &SessionMetadata) {
        let path = self.config.recordings_dir.join(format!("{}.meta.json", meta.id));
        match serde_json::to_string_pretty(meta) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    warn!(session_id = %meta.id, error = %e, "failed to persist session metadata");
                }
            }
            Err(e) => warn!(session_id = %meta.id, error = %e, "failed to serialize session metadata"),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|e| matches!(e.value(), SessionSlot::Live(_))).count()
    }

    /// Create(spec) (§4.4): validates, spawns the PTY, opens the transcript, builds the
    /// terminal model, and starts the per-session fan-out task.
    pub fn create(&self, spec: SessionSpec) -> Result<SessionMetadata, VtError> {
        if spec.command.is_empty() {
            return Err(VtError::InvalidSpec("command must not be empty".into()));
        }
        let max_dim = self.config.max_terminal_dimension;
        if spec.cols == 0 || spec.rows == 0 || spec.cols as u32 > max_dim || spec.rows as u32 > max_dim {
            return Err(VtError::InvalidSpec(format!(
                "cols/rows must be within [1, {max_dim}]"
            )));
        }
        if self.active_sessions() >= self.config.max_sessions {
            return Err(VtError::ResourceExhausted("max_sessions reached".into()));
        }

        let cwd = resolve_cwd(spec.cwd.as_deref());
        let (pty, pty_rx) = pty::spawn(&spec.command, Some(&cwd), &spec.env, spec.cols, spec.rows)?;
        let pid = pty.pid();
        let session_id = SessionId::new();
        let now = unix_now_secs();

        let metadata = SessionMetadata {
            id: session_id,
            name: spec.name.clone(),
            status: SessionStatus::Running,
            command: spec.command.clone(),
            working_dir: cwd.to_string_lossy().into_owned(),
            pid: Some(pid),
            exit_code: None,
            started_at: now,
            last_modified: now,
            initial_cols: spec.cols,
            initial_rows: spec.rows,
            cols: spec.cols,
            rows: spec.rows,
            recording_degraded: false,
        };

        let transcript_path = self.config.recordings_dir.join(format!("{session_id}.cast"));
        let header = RecordingHeader {
            version: 2,
            width: spec.cols as u32,
            height: spec.rows as u32,
            timestamp: now,
            env: None,
        };
        let recorder = match RecordingWriter::open(&transcript_path, &header) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "recorder failed to open; session continues unrecorded");
                None
            }
        };
        let mut metadata = metadata;
        metadata.recording_degraded = recorder.is_none();

        let terminal = TerminalModel::new(spec.cols, spec.rows, 10_000);

        let live = Arc::new(LiveSession {
            metadata: RwLock::new(metadata.clone()),
            pty,
            recorder: StdMutex::new(recorder),
            terminal: StdMutex::new(terminal),
            transcript_path,
        });

        self.sessions.insert(session_id, SessionSlot::Live(live.clone()));
        self.persist_meta(&metadata);
        self.persist_index();
        self.hub.publish_event(session_id, serde_json::json!({"kind": "start"}));

        spawn_session_task(live, session_id, pty_rx, self.hub.clone(), self.config.clone());

        info!(session_id = %session_id, pid, command = ?spec.command, "session created");
        Ok(metadata)
    }

    pub async fn get(&self, id: SessionId) -> Result<SessionMetadata, VtError> {
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        Ok(slot.value().metadata_snapshot().get().await)
    }

    pub async fn list(&self) -> Vec<SessionMetadata> {
        let futures: Vec<_> = self.sessions.iter().map(|e| e.value().metadata_snapshot()).collect();
        let mut out = Vec::with_capacity(futures.len());
        for f in futures {
            out.push(f.get().await);
        }
        out
    }

    pub async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(u16, u16), VtError> {
        let max_dim = self.config.max_terminal_dimension;
        if cols == 0 || rows == 0 || cols as u32 > max_dim || rows as u32 > max_dim {
            return Err(VtError::InvalidSpec(format!("cols/rows must be within [1, {max_dim}]")));
        }
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        let SessionSlot::Live(live) = slot.value() else { return Err(VtError::PtyClosed) };
        let live = live.clone();
        drop(slot);

        live.pty.resize(cols, rows)?;
        live.terminal.lock().expect("terminal mutex").resize(cols, rows);
        if let Some(rec) = live.recorder.lock().expect("recorder mutex").as_ref() {
            if let Err(e) = rec.append_resize(cols, rows) {
                warn!(session_id = %id, error = %e, "failed to record resize");
            }
        }
        {
            let mut meta = live.metadata.write().await;
            meta.cols = cols;
            meta.rows = rows;
            meta.last_modified = unix_now_secs();
            self.persist_meta(&meta);
        }
        self.hub.publish_event(id, serde_json::json!({"kind": "resize", "cols": cols, "rows": rows}));
        Ok((cols, rows))
    }

    pub async fn input(&self, id: SessionId, bytes: Bytes) -> Result<(), VtError> {
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        let SessionSlot::Live(live) = slot.value() else { return Err(VtError::PtyClosed) };
        let live = live.clone();
        drop(slot);

        live.pty.write(bytes.clone()).await?;
        if self.config.record_input {
            if let Some(rec) = live.recorder.lock().expect("recorder mutex").as_ref() {
                let _ = rec.append_input(&bytes);
            }
        }
        live.metadata.write().await.last_modified = unix_now_secs();
        Ok(())
    }

    pub async fn kill(&self, id: SessionId) -> Result<(), VtError> {
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        let SessionSlot::Live(live) = slot.value() else { return Ok(()) };
        let live = live.clone();
        drop(slot);
        let _ = live.pty.kill(self.config.kill_grace).await;
        Ok(())
    }

    /// Remove(id) (§4.4): only legal once the session has exited. Leaves the transcript
    /// on disk (replay remains possible via `GET /api/sessions/:id/recording` for a
    /// window after removal is not specified by the spec's config surface, so this
    /// implementation treats "remove" as scoped to the live registry entry only).
    pub async fn remove(&self, id: SessionId) -> Result<(), VtError> {
        let status = self.get(id).await?.status;
        if status != SessionStatus::Exited {
            return Err(VtError::Conflict("session is still running".into()));
        }
        self.sessions.remove(&id);
        self.persist_index();
        Ok(())
    }

    pub fn transcript_path(&self, id: SessionId) -> Option<PathBuf> {
        Some(self.config.recordings_dir.join(format!("{id}.cast")))
    }

    /// `GET /api/sessions/:id/text`: renders the live terminal model's screen. Returns
    /// `NotFound` for unknown or recovered (PTY-less) sessions.
    pub fn text(&self, id: SessionId, styles: bool) -> Result<String, VtError> {
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        match slot.value() {
            SessionSlot::Live(live) => Ok(live.terminal.lock().expect("terminal mutex").text(styles)),
            SessionSlot::Recovered(_) => Err(VtError::NotFound(id.to_string())),
        }
    }

    /// Immediate snapshot bytes for the "always emitted on subscribe" rule (§4.5).
    pub fn snapshot(&self, id: SessionId) -> Result<Vec<u8>, VtError> {
        let slot = self.sessions.get(&id).ok_or_else(|| VtError::NotFound(id.to_string()))?;
        match slot.value() {
            SessionSlot::Live(live) => Ok(live.terminal.lock().expect("terminal mutex").snapshot(None, None)),
            SessionSlot::Recovered(_) => Err(VtError::NotFound(id.to_string())),
        }
    }
}

fn resolve_cwd(requested: Option<&Path>) -> PathBuf {
    match requested {
        Some(p) if p.exists() => p.to_path_buf(),
        Some(p) => {
            warn!(path = %p.display(), "requested working directory does not exist; falling back");
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        }
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Spawns the per-session fan-out task (§5): reads the PTY's output channel, feeds the
/// Recorder and Terminal Model, publishes to the Hub, and runs the adaptive snapshot
/// cadence (§4.5). Exits when the PTY's output channel closes, at which point it waits
/// for the exit record and finalizes session state.
fn spawn_session_task(
    live: Arc<LiveSession>,
    session_id: SessionId,
    mut pty_rx: tokio::sync::mpsc::Receiver<Bytes>,
    hub: Arc<Hub>,
    config: Arc<Config>,
) {
    tokio::spawn(async move {
        let mut current_interval = config.snapshot_min_interval;
        let mut recent_bytes: usize = 0;
        let deadline = tokio::time::sleep(current_interval);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = pty_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            if let Some(rec) = live.recorder.lock().expect("recorder mutex").as_ref() {
                                if let Err(e) = rec.append_output(&bytes) {
                                    warn!(session_id = %session_id, error = %e, "recording degraded");
                                    live.metadata.write().await.recording_degraded = true;
                                    hub.publish_event(session_id, serde_json::json!({"kind": "recording-degraded"}));
                                }
                            }
                            live.terminal.lock().expect("terminal mutex").feed(&bytes);
                            recent_bytes += bytes.len();
                            let terminal = &live.terminal;
                            hub.publish_stdout(session_id, &bytes, || {
                                terminal.lock().expect("terminal mutex").snapshot(None, None)
                            });
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    if hub.has_snapshot_subscribers(session_id) {
                        let snap = live.terminal.lock().expect("terminal mutex").snapshot(None, None);
                        hub.broadcast_snapshot(session_id, &snap);
                    }
                    current_interval = adapt_interval(current_interval, recent_bytes, &config);
                    recent_bytes = 0;
                    deadline.as_mut().reset(tokio::time::Instant::now() + current_interval);
                }
            }
        }

        let exit = live.pty.wait_exit().await;
        {
            let mut meta = live.metadata.write().await;
            meta.status = SessionStatus::Exited;
            meta.exit_code = Some(exit.code);
            meta.last_modified = unix_now_secs();
        }
        if let Some(rec) = live.recorder.lock().expect("recorder mutex").take() {
            let _ = rec.close();
        }
        let meta_snapshot = live.metadata.read().await.clone();
        persist_meta_standalone(&config, &meta_snapshot);
        hub.publish_event(session_id, serde_json::json!({"kind": "exit", "exitCode": exit.code}));
        info!(session_id = %session_id, exit_code = exit.code, "session exited");
    });
}

fn persist_meta_standalone(config: &Config, meta: &SessionMetadata) {
    let path = config.recordings_dir.join(format!("{}.meta.json", meta.id));
    if let Ok(json) = serde_json::to_string_pretty(meta) {
        let _ = std::fs::write(path, json);
    }
}

/// Adapts the snapshot cadence between the configured bounds: bursty output (lots of
/// bytes since the last tick) shrinks the interval toward the minimum; idle output grows
/// it toward the maximum. The exact curve is left to the implementer (§9); this is a
/// simple proportional step, not a PID controller.
fn adapt_interval(current: std::time::Duration, recent_bytes: usize, config: &Config) -> std::time::Duration {
    const BURST_THRESHOLD: usize = 4096;
    let min = config.snapshot_min_interval;
    let max = config.snapshot_max_interval;
    if recent_bytes >= BURST_THRESHOLD {
        let half = current / 2;
        half.max(min)
    } else {
        let grown = current + current / 4;
        grown.min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> Arc<Config> {
        Arc::new(Config {
            port: 0,
            bind_addr: "127.0.0.1".into(),
            auth_mode: crate::config::AuthMode::None,
            auth_password_hash: None,
            token_ttl: std::time::Duration::from_secs(60),
            max_sessions: 4,
            max_subscriber_buffer_bytes: 4 * 1024 * 1024,
            max_subscriber_buffer_frames: 1024,
            snapshot_min_interval: std::time::Duration::from_millis(100),
            snapshot_max_interval: std::time::Duration::from_millis(1000),
            recordings_dir: dir.to_path_buf(),
            record_input: false,
            idle_timeout: std::time::Duration::from_secs(60),
            kill_grace: std::time::Duration::from_secs(2),
            max_terminal_dimension: 1000,
        })
    }

    #[tokio::test]
    async fn create_list_and_remove_round_trip() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let spec = SessionSpec {
            command: vec!["/bin/echo".into(), "hi".into()],
            cwd: None,
            env: HashMap::new(),
            name: None,
            cols: 80,
            rows: 24,
        };
        let meta = registry.create(spec).unwrap();
        assert_eq!(registry.list().await.len(), 1);

        // Wait for the child to exit and the fan-out task to mark it.
        for _ in 0..100 {
            if registry.get(meta.id).await.unwrap().status == SessionStatus::Exited {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let final_meta = registry.get(meta.id).await.unwrap();
        assert_eq!(final_meta.status, SessionStatus::Exited);
        assert_eq!(final_meta.exit_code, Some(0));

        registry.remove(meta.id).await.unwrap();
        assert!(registry.get(meta.id).await.is_err());
    }

    #[tokio::test]
    async fn invalid_spec_rejects_empty_command() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let spec = SessionSpec { command: vec![], cwd: None, env: HashMap::new(), name: None, cols: 80, rows: 24 };
        let err = registry.create(spec).unwrap_err();
        assert!(matches!(err, VtError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn oversize_dimensions_are_rejected() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        let spec = SessionSpec {
            command: vec!["/bin/echo".into(), "hi".into()],
            cwd: None,
            env: HashMap::new(),
            name: None,
            cols: 0,
            rows: 24,
        };
        let err = registry.create(spec).unwrap_err();
        assert!(matches!(err, VtError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn resource_exhausted_past_max_sessions() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(test_config(dir.path()));
        for _ in 0..4 {
            let spec = SessionSpec {
                command: vec!["/bin/sleep".into(), "1".into()],
                cwd: None,
                env: HashMap::new(),
                name: None,
                cols: 80,
                rows: 24,
            };
            registry.create(spec).unwrap();
        }
        let spec = SessionSpec {
            command: vec!["/bin/sleep".into(), "1".into()],
            cwd: None,
            env: HashMap::new(),
            name: None,
            cols: 80,
            rows: 24,
        };
        let err = registry.create(spec).unwrap_err();
        assert!(matches!(err, VtError::ResourceExhausted(_)));
    }
}

//! Session data model (§3): identity, attributes, lifecycle status. The registry (see
//! `registry.rs`) owns the authoritative map; this module only defines the shapes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Process-wide-unique opaque session id. Sufficient entropy that guessing it is not a
/// security boundary on its own (authentication is); implemented as a v4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// Status a session can be in. Once `Exited`, a session never transitions back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Caller-supplied request to create a session (POST /api/sessions body, decoded).
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub name: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

impl SessionSpec {
    pub const DEFAULT_COLS: u16 = 80;
    pub const DEFAULT_ROWS: u16 = 24;
}

/// Full session metadata as returned by GET /api/sessions and /api/sessions/:id. Field
/// names are camelCase on the wire (§6); the struct itself stays snake_case Rust.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: SessionStatus,
    pub command: Vec<String>,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: u64,
    pub last_modified: u64,
    pub initial_cols: u16,
    pub initial_rows: u16,
    pub cols: u16,
    pub rows: u16,
    /// Set by the Recorder when a write to the transcript fails; the session keeps
    /// running but is no longer being persisted (§7 IoError propagation policy).
    pub recording_degraded: bool,
}

/// Unix timestamp in seconds, used throughout for `started_at` / `last_modified`.
pub fn unix_now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

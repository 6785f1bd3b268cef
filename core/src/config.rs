//! Server-wide configuration, loaded once from environment variables (and CLI overrides
//! applied by the binary's arg parser) at startup. No component re-reads the environment
//! after this; everything downstream is threaded through `Config`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

/// Authentication mode. `None` disables the bearer-token check entirely (local/dev use).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Password,
    SshKey,
}

impl AuthMode {
    fn from_env(raw: &str) -> Self {
        match raw {
            "none" => AuthMode::None,
            "ssh-key" => AuthMode::SshKey,
            _ => AuthMode::Password,
        }
    }
}

/// Typed server configuration. Constructed once via [`Config::from_env`], optionally
/// patched by CLI flags, then shared behind an `Arc` by every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_addr: String,
    pub auth_mode: AuthMode,
    /// argon2id hash of the configured password. Required when `auth_mode == Password`.
    pub auth_password_hash: Option<String>,
    pub token_ttl: Duration,
    pub max_sessions: usize,
    pub max_subscriber_buffer_bytes: usize,
    /// Frame-count cap for a subscriber's outbound queue. Not independently configurable
    /// in §6's env var list; fixed at the spec's documented default.
    pub max_subscriber_buffer_frames: usize,
    pub snapshot_min_interval: Duration,
    pub snapshot_max_interval: Duration,
    pub recordings_dir: PathBuf,
    pub record_input: bool,
    pub idle_timeout: Duration,
    pub kill_grace: Duration,
    /// Maximum cols/rows a session may request. Not an env var in §6; a sane implementation
    /// default (see DESIGN.md open-question log).
    pub max_terminal_dimension: u32,
}

impl Config {
    /// Load configuration from environment variables, applying the documented defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let cfg = Self {
            port: parse_env("PORT", 4022),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string()),
            auth_mode: env::var("AUTH_MODE")
                .map(|v| AuthMode::from_env(&v))
                .unwrap_or(AuthMode::Password),
            auth_password_hash: env::var("AUTH_PASSWORD_HASH").ok().filter(|s| !s.is_empty()),
            token_ttl: Duration::from_secs(parse_env("TOKEN_TTL_SECONDS", 86_400)),
            max_sessions: parse_env("MAX_SESSIONS", 64),
            max_subscriber_buffer_bytes: parse_env("MAX_SUBSCRIBER_BUFFER_BYTES", 4 * 1024 * 1024),
            max_subscriber_buffer_frames: 1024,
            snapshot_min_interval: Duration::from_millis(parse_env("SNAPSHOT_MIN_INTERVAL_MS", 100)),
            snapshot_max_interval: Duration::from_millis(parse_env("SNAPSHOT_MAX_INTERVAL_MS", 1000)),
            recordings_dir: env::var("RECORDINGS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./recordings")),
            record_input: env::var("RECORD_INPUT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            idle_timeout: Duration::from_secs(parse_env("IDLE_TIMEOUT_SECONDS", 60)),
            kill_grace: Duration::from_secs(parse_env("KILL_GRACE_SECONDS", 5)),
            max_terminal_dimension: 1000,
        };

        if cfg.auth_mode == AuthMode::Password && cfg.auth_password_hash.is_none() {
            tracing::warn!("AUTH_MODE=password but AUTH_PASSWORD_HASH is unset; login will always fail");
        }

        cfg
    }

    /// Log the effective configuration at startup. The password hash is never logged,
    /// only whether one is configured.
    pub fn log_startup(&self) {
        info!(
            port = self.port,
            bind_addr = %self.bind_addr,
            auth_mode = ?self.auth_mode,
            max_sessions = self.max_sessions,
            max_subscriber_buffer_bytes = self.max_subscriber_buffer_bytes,
            snapshot_min_ms = self.snapshot_min_interval.as_millis() as u64,
            snapshot_max_ms = self.snapshot_max_interval.as_millis() as u64,
            recordings_dir = %self.recordings_dir.display(),
            record_input = self.record_input,
            idle_timeout_s = self.idle_timeout.as_secs(),
            kill_grace_s = self.kill_grace.as_secs(),
            "server configuration loaded"
        );
        info!(
            auth_password_configured = self.auth_password_hash.is_some(),
            "auth configuration (hash redacted)"
        );
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear() {
        for k in [
            "PORT",
            "BIND_ADDR",
            "AUTH_MODE",
            "AUTH_PASSWORD_HASH",
            "TOKEN_TTL_SECONDS",
            "MAX_SESSIONS",
            "MAX_SUBSCRIBER_BUFFER_BYTES",
            "SNAPSHOT_MIN_INTERVAL_MS",
            "SNAPSHOT_MAX_INTERVAL_MS",
            "RECORDINGS_DIR",
            "RECORD_INPUT",
            "IDLE_TIMEOUT_SECONDS",
            "KILL_GRACE_SECONDS",
        ] {
            env::remove_var(k);
        }
    }

    #[test]
    fn defaults_match_spec() {
        clear();
        let cfg = Config::from_env();
        assert_eq!(cfg.port, 4022);
        assert_eq!(cfg.bind_addr, "127.0.0.1");
        assert_eq!(cfg.auth_mode, AuthMode::Password);
        assert_eq!(cfg.max_sessions, 64);
        assert_eq!(cfg.max_subscriber_buffer_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.snapshot_min_interval, Duration::from_millis(100));
        assert_eq!(cfg.snapshot_max_interval, Duration::from_millis(1000));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert!(!cfg.record_input);
    }

    #[test]
    fn env_overrides_apply() {
        clear();
        env::set_var("PORT", "9999");
        env::set_var("AUTH_MODE", "none");
        env::set_var("RECORD_INPUT", "1");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.auth_mode, AuthMode::None);
        assert!(cfg.record_input);
        clear();
    }
}

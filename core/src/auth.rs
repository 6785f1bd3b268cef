//! Authentication (§6, §9 open question): bearer tokens issued over `POST /api/auth/token`
//! and checked on every other HTTP route and on the `/ws` upgrade. Password verification
//! uses argon2id, the implementer's choice the spec leaves open — picked because it's the
//! PHC-recommended default and the crate is already the corpus's usual choice for it.

use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;

use crate::config::{AuthMode, Config};
use crate::error::VtError;

const TOKEN_BYTES: usize = 32;

/// In-memory bearer token issuer and validator. Tokens are opaque (not JWTs): the server
/// is the only party that can mint or revoke them, which makes `POST /api/auth/logout`'s
/// "invalidate server-side" contract trivial to satisfy exactly, rather than approximately
/// via a JWT denylist.
pub struct AuthState {
    tokens: DashMap<String, u64>,
}

impl AuthState {
    pub fn new() -> Self {
        Self { tokens: DashMap::new() }
    }

    /// Handles `POST /api/auth/token`. In `AuthMode::None`, any (or no) password is
    /// accepted. In `AuthMode::Password`, `password` must verify against
    /// `config.auth_password_hash`. `AuthMode::SshKey` has no password grant; the
    /// SSH-key challenge/response flow is an external collaborator (§1) this server does
    /// not implement, so it always rejects here.
    pub fn issue_token(&self, config: &Config, password: Option<&str>) -> Result<(String, u64), VtError> {
        match config.auth_mode {
            AuthMode::None => {}
            AuthMode::Password => {
                let hash = config
                    .auth_password_hash
                    .as_deref()
                    .ok_or_else(|| VtError::Unauthorized)?;
                let provided = password.ok_or(VtError::Unauthenticated)?;
                if !verify_password(provided, hash) {
                    return Err(VtError::Unauthenticated);
                }
            }
            AuthMode::SshKey => return Err(VtError::Unauthorized),
        }
        let token = generate_token();
        let expires_at = unix_now() + config.token_ttl.as_secs();
        self.tokens.insert(token.clone(), expires_at);
        Ok((token, config.token_ttl.as_secs()))
    }

    /// `GET /api/auth/verify` and the `/ws` upgrade both call this. Always true under
    /// `AuthMode::None` regardless of whether a token was ever issued.
    pub fn verify(&self, config: &Config, token: Option<&str>) -> bool {
        if config.auth_mode == AuthMode::None {
            return true;
        }
        let Some(token) = token else { return false };
        match self.tokens.get(token) {
            Some(expiry) => *expiry > unix_now(),
            None => false,
        }
    }

    /// `POST /api/auth/logout`: best-effort invalidation. Removing a token that was
    /// never issued (or already expired and reaped) is not an error.
    pub fn logout(&self, token: &str) {
        self.tokens.remove(token);
    }

    /// Periodic sweep of expired tokens so the map doesn't grow unbounded across a
    /// long-lived server process.
    pub fn sweep_expired(&self) {
        let now = unix_now();
        self.tokens.retain(|_, expiry| *expiry > now);
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Hashes a plaintext password into the argon2id PHC string stored as `AUTH_PASSWORD_HASH`.
/// Exposed for the CLI operator to generate that value; not called on the request path.
pub fn hash_password(password: &str) -> Result<String, VtError> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| VtError::IoError(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, phc_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc_hash) else { return false };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_with_mode(mode: AuthMode, hash: Option<String>) -> Config {
        let mut cfg = Config::default();
        cfg.auth_mode = mode;
        cfg.auth_password_hash = hash;
        cfg.token_ttl = Duration::from_secs(60);
        cfg
    }

    #[test]
    fn no_auth_mode_never_requires_a_token() {
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::None, None);
        assert!(auth.verify(&cfg, None));
    }

    #[test]
    fn password_mode_round_trips_through_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::Password, Some(hash));
        let (token, ttl) = auth.issue_token(&cfg, Some("correct horse")).unwrap();
        assert_eq!(ttl, 60);
        assert!(auth.verify(&cfg, Some(&token)));
    }

    #[test]
    fn wrong_password_is_unauthenticated() {
        let hash = hash_password("correct horse").unwrap();
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::Password, Some(hash));
        let err = auth.issue_token(&cfg, Some("wrong")).unwrap_err();
        assert!(matches!(err, VtError::Unauthenticated));
    }

    #[test]
    fn unknown_token_fails_verification() {
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::Password, Some(hash_password("x").unwrap()));
        assert!(!auth.verify(&cfg, Some("not-a-real-token")));
    }

    #[test]
    fn logout_revokes_the_token() {
        let hash = hash_password("pw").unwrap();
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::Password, Some(hash));
        let (token, _) = auth.issue_token(&cfg, Some("pw")).unwrap();
        assert!(auth.verify(&cfg, Some(&token)));
        auth.logout(&token);
        assert!(!auth.verify(&cfg, Some(&token)));
    }

    #[test]
    fn ssh_key_mode_has_no_password_grant() {
        let auth = AuthState::new();
        let cfg = config_with_mode(AuthMode::SshKey, None);
        let err = auth.issue_token(&cfg, Some("whatever")).unwrap_err();
        assert!(matches!(err, VtError::Unauthorized));
    }
}

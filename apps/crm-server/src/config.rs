//! Environment-driven configuration.
//!
//! Tunables:
//! - `CRM_BIND` / `CRM_PORT` — listen address (default `127.0.0.1:8091`)
//! - `CRM_STATE_DIR` — sqlite state directory (default `./state`)
//! - `CRM_EVENTS_CAPACITY` — broadcast channel capacity
//! - `CRM_EVENTS_REPLAY` — replay ring size for stream resume
//! - `CRM_ADMIN_TOKEN` / `CRM_ADMIN_TOKEN_SHA256` — bootstrap admin token
//! - `CRM_SQLITE_BUSY_MS` — sqlite busy timeout (read by the kernel)

use std::net::SocketAddr;
use std::path::PathBuf;

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_trimmed(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn bind_addr() -> Result<SocketAddr, anyhow::Error> {
    let host = env_trimmed("CRM_BIND").unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = env_parsed("CRM_PORT", 8091);
    format!("{host}:{port}")
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid CRM_BIND/CRM_PORT: {err}"))
}

pub fn state_dir() -> PathBuf {
    env_trimmed("CRM_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state"))
}

pub fn events_capacity() -> usize {
    env_parsed("CRM_EVENTS_CAPACITY", 256usize).max(8)
}

pub fn events_replay() -> usize {
    env_parsed("CRM_EVENTS_REPLAY", 256usize).max(1)
}

/// Bootstrap admin token fingerprint. `CRM_ADMIN_TOKEN_SHA256` wins
/// over hashing `CRM_ADMIN_TOKEN` locally.
pub fn admin_token_sha256() -> Option<String> {
    if let Some(fingerprint) = env_trimmed("CRM_ADMIN_TOKEN_SHA256") {
        return Some(fingerprint.to_lowercase());
    }
    env_trimmed("CRM_ADMIN_TOKEN").map(|token| crate::identity::fingerprint(&token))
}

//! Bearer-token identity.
//!
//! Tokens are never stored; the users table keeps a sha256 hex
//! fingerprint and lookups hash the presented token once at the edge.
//! The bootstrap admin from `CRM_ADMIN_TOKEN` is materialized as a
//! regular users row on startup so the ownership gate sees a real id.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crm_kernel::{Kernel, NewUser};
use crm_protocol::{Principal, Role};

use crate::problem::ApiError;

const BOOTSTRAP_ADMIN_EMAIL: &str = "admin@local";

pub fn fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let rest = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Resolve the caller or fail with 401. Unknown and missing tokens are
/// indistinguishable to the client.
pub fn require_principal(kernel: &Kernel, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let token = bearer_token(headers).ok_or_else(ApiError::unauthorized)?;
    let user = kernel
        .find_user_by_token(&fingerprint(&token))
        .map_err(ApiError::internal)?
        .ok_or_else(ApiError::unauthorized)?;
    Ok(Principal {
        id: user.id,
        role: user.role,
        email: user.email,
    })
}

pub fn require_admin(kernel: &Kernel, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let principal = require_principal(kernel, headers)?;
    if !principal.is_admin() {
        return Err(ApiError::forbidden("admin role required"));
    }
    Ok(principal)
}

/// Ensure the env-configured admin token maps to a users row. Without
/// any admin token the service still runs, it just has no way in until
/// a row is seeded out of band.
pub fn bootstrap_admin(kernel: &Kernel) -> anyhow::Result<()> {
    let Some(fp) = crate::config::admin_token_sha256() else {
        warn!("no CRM_ADMIN_TOKEN configured; admin access requires a seeded users row");
        return Ok(());
    };
    if kernel.find_user_by_token(&fp)?.is_some() {
        return Ok(());
    }
    let user = kernel.insert_user(&NewUser {
        email: BOOTSTRAP_ADMIN_EMAIL.to_string(),
        role: Role::Admin,
        token_sha256: Some(fp),
    })?;
    info!(user = user.id, "bootstrap admin user created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_trims_and_is_stable() {
        assert_eq!(fingerprint("secret"), fingerprint("  secret  "));
        assert_eq!(fingerprint("secret").len(), 64);
        assert_ne!(fingerprint("secret"), fingerprint("other"));
    }

    #[test]
    fn bearer_extraction_ignores_malformed_headers() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwdw==".parse().unwrap(),
        );
        assert!(bearer_token(&headers).is_none());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer   token-1  ".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers).as_deref(), Some("token-1"));
    }
}

// Bearer-token authentication for the ingest surface
// Device tokens are stored hashed; admin and internal tokens are static
// config values compared by hash to keep comparisons length-independent.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::database::{Database, Device};
use crate::error::IngestError;

/// SHA-256 hex digest of a token. This is what the devices table stores.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Pull the bearer token out of the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the device for an upload request.
///
/// Missing/unknown token -> 401; known but disabled device -> 403. The
/// caller still has to verify the (point_id, register_id, device_id) triple
/// against the form fields.
pub async fn authenticate_device(
    db: &Database,
    headers: &HeaderMap,
) -> Result<Device, IngestError> {
    let token = bearer_token(headers).ok_or(IngestError::Unauthorized)?;

    let device = db
        .find_device_by_token_hash(&hash_token(token))
        .await?
        .ok_or(IngestError::Unauthorized)?;

    if !device.is_enabled {
        return Err(IngestError::DeviceDisabled);
    }

    Ok(device)
}

/// Guard for the admin endpoints.
pub fn require_admin(headers: &HeaderMap, admin_token: &str) -> Result<(), IngestError> {
    require_static_token(headers, admin_token)
}

/// Guard for the internal chunk-fetch endpoint.
pub fn require_internal(headers: &HeaderMap, internal_token: &str) -> Result<(), IngestError> {
    require_static_token(headers, internal_token)
}

fn require_static_token(headers: &HeaderMap, expected: &str) -> Result<(), IngestError> {
    let token = bearer_token(headers).ok_or(IngestError::Unauthorized)?;
    if hash_token(token) != hash_token(expected) {
        return Err(IngestError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn hash_is_stable_and_hex() {
        let digest = hash_token("secret");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_token("secret"));
        assert_ne!(digest, hash_token("Secret"));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(AUTHORIZATION, "Basic abc123".parse().unwrap());
        assert!(bearer_token(&headers).is_none());

        headers.insert(AUTHORIZATION, "Bearer ".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn static_token_guard() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer right".parse().unwrap());
        assert!(require_static_token(&headers, "right").is_ok());
        assert!(require_static_token(&headers, "wrong").is_err());
    }
}

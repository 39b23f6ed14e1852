// Database models - Device
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recorder installation at one POS register.
///
/// `token_hash` stays out of every serialized form; only the admin API sees
/// device rows and even there the hash is withheld.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: Uuid,
    pub point_id: String,
    pub register_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

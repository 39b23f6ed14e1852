// Database module for SalesControl
// Provides PostgreSQL persistence for devices, audio chunks, speech segments
// and dialogues. Repositories hang off a shared `Database` handle.

pub mod chunks_repo;
pub mod devices_repo;
pub mod dialogues_repo;
pub mod migrations;
pub mod models;

pub use models::*;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Statement timeout applied to every pooled connection.
const STATEMENT_TIMEOUT: &str = "30s";

/// Shared database handle. Cheap to clone; wraps the sqlx pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL and build the connection pool.
    ///
    /// Does not run migrations; the ingest service owns those (call
    /// [`migrations::run_migrations`] there).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .context("Failed to parse DATABASE_URL")?
            .options([("statement_timeout", STATEMENT_TIMEOUT)]);

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap liveness probe used by /health.
    pub async fn ping(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

/// Derive the advisory-lock key for a device.
///
/// Advisory locks take a bigint; the first eight bytes of the device UUID are
/// stable and collision-safe enough for per-device serialization.
pub fn device_lock_key(device_id: Uuid) -> i64 {
    let bytes = device_id.as_bytes();
    i64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_per_device() {
        let id = Uuid::new_v4();
        assert_eq!(device_lock_key(id), device_lock_key(id));
    }

    #[test]
    fn lock_key_differs_between_devices() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(device_lock_key(a), device_lock_key(b));
    }
}

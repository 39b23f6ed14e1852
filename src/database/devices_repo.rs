// Devices repository for SalesControl
// Registration, lookup by token hash, enable/disable, last-seen stamping.

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use super::models::Device;
use super::Database;

impl Database {
    /// Register a device. Fails if the device_id already exists.
    pub async fn create_device(
        &self,
        device_id: Uuid,
        point_id: &str,
        register_id: &str,
        token_hash: &str,
        is_enabled: bool,
    ) -> Result<Device> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            INSERT INTO devices (device_id, point_id, register_id, token_hash, is_enabled)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING device_id, point_id, register_id, token_hash, is_enabled,
                      created_at, last_seen_at
            "#,
        )
        .bind(device_id)
        .bind(point_id)
        .bind(register_id)
        .bind(token_hash)
        .bind(is_enabled)
        .fetch_one(self.pool())
        .await
        .context("Failed to create device")?;

        Ok(device)
    }

    /// List all devices, most recently registered first.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let devices = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, point_id, register_id, token_hash, is_enabled,
                   created_at, last_seen_at
            FROM devices
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(self.pool())
        .await
        .context("Failed to list devices")?;

        Ok(devices)
    }

    /// Look up a device by the hash of its bearer token.
    pub async fn find_device_by_token_hash(&self, token_hash: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, point_id, register_id, token_hash, is_enabled,
                   created_at, last_seen_at
            FROM devices
            WHERE token_hash = $1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(self.pool())
        .await
        .context("Failed to look up device by token hash")?;

        Ok(device)
    }

    /// Toggle a device's enabled flag. Returns the updated row, or None when
    /// the device does not exist.
    pub async fn set_device_enabled(
        &self,
        device_id: Uuid,
        is_enabled: bool,
    ) -> Result<Option<Device>> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            UPDATE devices
            SET is_enabled = $2
            WHERE device_id = $1
            RETURNING device_id, point_id, register_id, token_hash, is_enabled,
                      created_at, last_seen_at
            "#,
        )
        .bind(device_id)
        .bind(is_enabled)
        .fetch_optional(self.pool())
        .await
        .context("Failed to update device")?;

        Ok(device)
    }

    /// Stamp `last_seen_at` after a successful upload.
    pub async fn touch_device_last_seen(&self, device_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen_at = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .context("Failed to stamp last_seen_at")?;

        Ok(())
    }
}

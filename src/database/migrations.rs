// Database migrations for SalesControl
// Forward-only, versioned; applied by the ingest service at startup.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

/// Run all necessary migrations to bring the database up to date.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        migrate_v1(pool).await?;
    }

    if current_version > SCHEMA_VERSION {
        log::warn!(
            "Database schema version {} is newer than this binary supports ({})",
            current_version,
            SCHEMA_VERSION
        );
    }

    Ok(())
}

/// Get the current schema version from the database.
async fn get_schema_version(pool: &PgPool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_version')",
    )
    .fetch_one(pool)
    .await
    .context("Failed to check for schema_version table")?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .context("Failed to read schema version")?;

    Ok(version.unwrap_or(0))
}

/// Initial schema creation (version 1)
async fn migrate_v1(pool: &PgPool) -> Result<()> {
    log::info!("Running database migration v1");

    let mut tx = pool.begin().await.context("Failed to begin migration v1")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS devices (
            device_id UUID PRIMARY KEY,
            point_id TEXT NOT NULL,
            register_id TEXT NOT NULL,
            token_hash TEXT NOT NULL,
            is_enabled BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_seen_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_devices_token_hash ON devices (token_hash)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audio_chunks (
            chunk_id UUID PRIMARY KEY,
            device_id UUID NOT NULL REFERENCES devices (device_id),
            point_id TEXT NOT NULL,
            register_id TEXT NOT NULL,
            start_ts TIMESTAMPTZ NOT NULL,
            end_ts TIMESTAMPTZ NOT NULL,
            duration_sec INTEGER NOT NULL,
            codec TEXT NOT NULL,
            sample_rate INTEGER NOT NULL,
            channels INTEGER NOT NULL,
            file_path TEXT NOT NULL,
            file_size BIGINT NOT NULL,
            file_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'QUEUED',
            error_reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            processing_started_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audio_chunks_status_created
         ON audio_chunks (status, created_at)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audio_chunks_device_start
         ON audio_chunks (device_id, start_ts)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS speech_segments (
            segment_id UUID PRIMARY KEY,
            chunk_id UUID NOT NULL REFERENCES audio_chunks (chunk_id),
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            CHECK (start_ms >= 0 AND end_ms > start_ms)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_speech_segments_chunk ON speech_segments (chunk_id)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dialogues (
            dialogue_id UUID PRIMARY KEY,
            device_id UUID NOT NULL REFERENCES devices (device_id),
            point_id TEXT NOT NULL,
            register_id TEXT NOT NULL,
            start_ts TIMESTAMPTZ NOT NULL,
            end_ts TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dialogues_device_start ON dialogues (device_id, start_ts)",
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dialogue_segments (
            dialogue_id UUID NOT NULL REFERENCES dialogues (dialogue_id),
            chunk_id UUID NOT NULL REFERENCES audio_chunks (chunk_id),
            segment_id UUID NOT NULL REFERENCES speech_segments (segment_id),
            PRIMARY KEY (dialogue_id, chunk_id, segment_id)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_dialogue_state (
            device_id UUID PRIMARY KEY REFERENCES devices (device_id),
            open_dialogue_id UUID NOT NULL REFERENCES dialogues (dialogue_id),
            dialogue_started_at TIMESTAMPTZ NOT NULL,
            last_speech_end_ts TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (1) ON CONFLICT DO NOTHING")
        .execute(&mut *tx)
        .await?;

    tx.commit().await.context("Failed to commit migration v1")?;

    Ok(())
}

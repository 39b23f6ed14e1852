// Database models - AudioChunk
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle states of an audio chunk.
///
/// Transitions are monotonic along QUEUED -> PROCESSING -> DONE/ERROR, with
/// the recovery path PROCESSING -> QUEUED for stuck chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStatus {
    Queued,
    Processing,
    Done,
    Error,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Queued => "QUEUED",
            ChunkStatus::Processing => "PROCESSING",
            ChunkStatus::Done => "DONE",
            ChunkStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ChunkStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(ChunkStatus::Queued),
            "PROCESSING" => Ok(ChunkStatus::Processing),
            "DONE" => Ok(ChunkStatus::Done),
            "ERROR" => Ok(ChunkStatus::Error),
            other => Err(format!("Unknown chunk status: {}", other)),
        }
    }
}

/// A persisted audio chunk row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AudioChunk {
    pub chunk_id: Uuid,
    pub device_id: Uuid,
    pub point_id: String,
    pub register_id: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_sec: i32,
    pub codec: String,
    pub sample_rate: i32,
    pub channels: i32,
    pub file_path: String,
    pub file_size: i64,
    #[serde(skip_serializing)]
    pub file_hash: String,
    pub status: String,
    pub error_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
}

impl AudioChunk {
    pub fn status(&self) -> Option<ChunkStatus> {
        self.status.parse().ok()
    }
}

/// Fields the ingest service supplies when creating a chunk row.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_id: Uuid,
    pub device_id: Uuid,
    pub point_id: String,
    pub register_id: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub duration_sec: i32,
    pub codec: String,
    pub sample_rate: i32,
    pub channels: i32,
    pub file_path: String,
    pub file_size: i64,
    pub file_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for status in [
            ChunkStatus::Queued,
            ChunkStatus::Processing,
            ChunkStatus::Done,
            ChunkStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ChunkStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown() {
        assert!("PENDING".parse::<ChunkStatus>().is_err());
    }
}

// Database models - SpeechSegment, Dialogue, DeviceDialogueState
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A maximal continuous-speech interval within one chunk.
///
/// `start_ms`/`end_ms` are measured from the chunk's `start_ts` and aligned
/// to VAD frame boundaries.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SpeechSegment {
    pub segment_id: Uuid,
    pub chunk_id: Uuid,
    pub start_ms: i32,
    pub end_ms: i32,
}

/// A contiguous run of speech on one device, stitched across chunks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dialogue {
    pub dialogue_id: Uuid,
    pub device_id: Uuid,
    pub point_id: String,
    pub register_id: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
}

/// Per-device cursor over the currently-open dialogue.
///
/// Exists iff a dialogue is open; deleted when the dialogue is closed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceDialogueState {
    pub device_id: Uuid,
    pub open_dialogue_id: Uuid,
    pub dialogue_started_at: DateTime<Utc>,
    pub last_speech_end_ts: DateTime<Utc>,
}

// Audio module for SalesControl
// Decodes OGG/Opus chunk files to PCM and segments speech with WebRTC VAD.

pub mod decoder;
pub mod vad;

pub use decoder::decode_ogg_opus;
pub use vad::{
    detect_speech_spans, FrameClassifier, SegmenterConfig, SpeechSpan, WebRtcClassifier,
};

/// All VAD processing happens at 16 kHz mono.
pub const VAD_SAMPLE_RATE: u32 = 16_000;

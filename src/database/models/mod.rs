// Database models
mod chunk;
mod device;
mod dialogue;

pub use chunk::{AudioChunk, ChunkStatus, NewChunk};
pub use device::Device;
pub use dialogue::{DeviceDialogueState, Dialogue, SpeechSegment};

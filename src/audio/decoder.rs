// OGG/Opus chunk decoding
// Demuxes the OGG container with symphonia and decodes Opus packets with
// libopus straight to 16 kHz mono, the rate the VAD consumes.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Cursor;
use symphonia::core::codecs::CODEC_TYPE_OPUS;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::VAD_SAMPLE_RATE;

/// Longest Opus frame is 120 ms; at 16 kHz mono that is 1920 samples.
const MAX_OPUS_FRAME_SAMPLES: usize = 1920;

/// Decode an in-memory OGG/Opus file to 16 kHz mono PCM.
///
/// The caller reads the file itself (so transient filesystem errors stay on
/// the retry path); any error out of here is a malformed or unsupported file,
/// which is terminal for the chunk.
pub fn decode_ogg_opus(data: &[u8]) -> Result<Vec<i16>> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(data.to_vec())), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("ogg");

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Unrecognized container format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec == CODEC_TYPE_OPUS)
        .ok_or_else(|| anyhow!("No Opus track in container"))?;
    let track_id = track.id;

    // libopus resamples internally; asking for 16 kHz mono output is valid
    // for any Opus input rate.
    let mut decoder = opus::Decoder::new(VAD_SAMPLE_RATE, opus::Channels::Mono)
        .map_err(|e| anyhow!("Failed to create Opus decoder: {}", e))?;

    let mut samples = Vec::new();
    let mut frame = vec![0i16; MAX_OPUS_FRAME_SAMPLES];

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(err) => return Err(anyhow!("Failed to read packet: {}", err)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let data = packet.buf();
        // Header packets are consumed during probing, but guard anyway.
        if data.is_empty() || data.starts_with(b"OpusHead") || data.starts_with(b"OpusTags") {
            continue;
        }

        let decoded = decoder
            .decode(data, &mut frame, false)
            .map_err(|e| anyhow!("Opus decode failed: {}", e))?;
        samples.extend_from_slice(&frame[..decoded]);
    }

    if samples.is_empty() {
        bail!("Container held no decodable audio");
    }

    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_input() {
        assert!(decode_ogg_opus(&[0u8; 64]).is_err());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(decode_ogg_opus(&[]).is_err());
    }
}

// Frame-level voice activity detection and segment smoothing
//
// The classifier labels fixed-length PCM frames speech/non-speech; a small
// hysteresis pass turns the raw labels into the ordered, disjoint segments
// the rest of the pipeline works with.

use anyhow::{anyhow, bail, Result};
use webrtc_vad::{SampleRate, Vad, VadMode};

use super::VAD_SAMPLE_RATE;

/// Labels one PCM frame. Trait seam so the smoothing logic can be tested
/// with scripted labels instead of a real model.
pub trait FrameClassifier {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool>;
}

/// WebRTC VAD-backed classifier.
///
/// Not Send (wraps a C handle); construct it inside the blocking task that
/// processes the chunk.
pub struct WebRtcClassifier {
    vad: Vad,
}

impl WebRtcClassifier {
    /// `aggressiveness` 0..=3, least to most aggressive filtering.
    pub fn new(aggressiveness: u8) -> Result<Self> {
        let mode = match aggressiveness {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => bail!("VAD aggressiveness out of range: {}", other),
        };

        Ok(Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, mode),
        })
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool> {
        self.vad
            .is_voice_segment(frame)
            .map_err(|_| anyhow!("VAD rejected frame of {} samples", frame.len()))
    }
}

/// Hysteresis parameters for smoothing frame labels into segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub frame_ms: u32,
    /// Speech frames required before a candidate segment is committed.
    pub min_speech_frames: u32,
    /// Silence tolerated inside a segment before it closes.
    pub silence_within_segment_ms: u32,
    /// Segments shorter than this are dropped.
    pub min_segment_ms: u32,
}

impl SegmenterConfig {
    pub fn new(frame_ms: u32) -> Self {
        Self {
            frame_ms,
            min_speech_frames: 3,
            silence_within_segment_ms: 300,
            min_segment_ms: 200,
        }
    }

    fn silence_tolerance_frames(&self) -> u32 {
        self.silence_within_segment_ms / self.frame_ms
    }
}

/// A speech interval within one chunk, milliseconds from chunk start,
/// aligned to frame boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSpan {
    pub start_ms: u32,
    pub end_ms: u32,
}

/// Run the classifier over `samples` and smooth the labels into segments.
///
/// Samples must be 16 kHz mono; a trailing partial frame is ignored.
pub fn detect_speech(
    samples: &[i16],
    classifier: &mut dyn FrameClassifier,
    config: SegmenterConfig,
) -> Result<Vec<SpeechSpan>> {
    let frame_len = (VAD_SAMPLE_RATE / 1000 * config.frame_ms) as usize;

    let mut labels = Vec::with_capacity(samples.len() / frame_len + 1);
    for frame in samples.chunks_exact(frame_len) {
        labels.push(classifier.is_speech(frame)?);
    }

    Ok(smooth_labels(&labels, config))
}

/// Convenience wrapper: WebRTC classifier at the given aggressiveness, then
/// smoothing with the default hysteresis for `frame_ms`.
pub fn detect_speech_spans(
    samples: &[i16],
    aggressiveness: u8,
    frame_ms: u32,
) -> Result<Vec<SpeechSpan>> {
    let mut classifier = WebRtcClassifier::new(aggressiveness)?;
    detect_speech(samples, &mut classifier, SegmenterConfig::new(frame_ms))
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    start: usize,
    last_speech: usize,
    speech_frames: u32,
}

impl Candidate {
    fn committed(&self, config: &SegmenterConfig) -> bool {
        self.speech_frames >= config.min_speech_frames
    }
}

/// Turn per-frame speech labels into segments.
///
/// Onset: the first speech frame opens a candidate, committed once
/// `min_speech_frames` speech frames accumulate before the silence tolerance
/// runs out. Offset: silence longer than the tolerance closes the segment at
/// the last speech frame, trimming the silent tail.
pub fn smooth_labels(labels: &[bool], config: SegmenterConfig) -> Vec<SpeechSpan> {
    let tolerance = config.silence_tolerance_frames() as usize;
    let mut spans = Vec::new();
    let mut candidate: Option<Candidate> = None;

    for (index, &is_speech) in labels.iter().enumerate() {
        match (candidate, is_speech) {
            (None, true) => {
                candidate = Some(Candidate {
                    start: index,
                    last_speech: index,
                    speech_frames: 1,
                });
            }
            (None, false) => {}
            (Some(mut c), true) => {
                c.last_speech = index;
                c.speech_frames += 1;
                candidate = Some(c);
            }
            (Some(c), false) => {
                if index - c.last_speech > tolerance {
                    if c.committed(&config) {
                        push_span(&mut spans, &c, config);
                    }
                    candidate = None;
                }
            }
        }
    }

    if let Some(c) = candidate {
        if c.committed(&config) {
            push_span(&mut spans, &c, config);
        }
    }

    spans
}

fn push_span(spans: &mut Vec<SpeechSpan>, candidate: &Candidate, config: SegmenterConfig) {
    let start_ms = candidate.start as u32 * config.frame_ms;
    let end_ms = (candidate.last_speech as u32 + 1) * config.frame_ms;
    if end_ms - start_ms >= config.min_segment_ms {
        spans.push(SpeechSpan { start_ms, end_ms });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmenterConfig {
        SegmenterConfig::new(30)
    }

    fn labels(pattern: &str) -> Vec<bool> {
        // 's' = speech frame, '.' = silence frame
        pattern.chars().map(|c| c == 's').collect()
    }

    #[test]
    fn continuous_speech_becomes_one_span() {
        let spans = smooth_labels(&labels("..ssssssss.."), config());
        assert_eq!(
            spans,
            vec![SpeechSpan {
                start_ms: 60,
                end_ms: 300
            }]
        );
    }

    #[test]
    fn short_blip_is_rejected_by_onset_rule() {
        // Two isolated speech frames never reach min_speech_frames = 3.
        let spans = smooth_labels(&labels("..s............s...."), config());
        assert!(spans.is_empty());
    }

    #[test]
    fn silence_within_tolerance_bridges_a_span() {
        // 5 silent frames (150 ms) sit inside the 300 ms tolerance.
        let spans = smooth_labels(&labels("ssss.....ssss"), config());
        assert_eq!(
            spans,
            vec![SpeechSpan {
                start_ms: 0,
                end_ms: 390
            }]
        );
    }

    #[test]
    fn long_silence_splits_and_trims_tails() {
        // 12 silent frames (360 ms) exceed the tolerance; both spans end at
        // their last speech frame.
        let spans = smooth_labels(&labels("ssssss............ssssss"), config());
        assert_eq!(
            spans,
            vec![
                SpeechSpan {
                    start_ms: 0,
                    end_ms: 180
                },
                SpeechSpan {
                    start_ms: 540,
                    end_ms: 720
                },
            ]
        );
    }

    #[test]
    fn committed_but_tiny_span_is_dropped() {
        // 3 speech frames commit the candidate but 90 ms < min_segment_ms.
        let spans = smooth_labels(&labels("sss............"), config());
        assert!(spans.is_empty());
    }

    #[test]
    fn trailing_speech_is_flushed_at_end() {
        let spans = smooth_labels(&labels("......ssssssss"), config());
        assert_eq!(
            spans,
            vec![SpeechSpan {
                start_ms: 180,
                end_ms: 420
            }]
        );
    }

    #[test]
    fn spans_are_ordered_and_disjoint() {
        let spans = smooth_labels(
            &labels("ssssssss............ssssssss............ssssssss"),
            config(),
        );
        assert_eq!(spans.len(), 3);
        for pair in spans.windows(2) {
            assert!(pair[0].end_ms <= pair[1].start_ms);
        }
    }

    #[test]
    fn scripted_classifier_drives_detect_speech() {
        struct Scripted(Vec<bool>, usize);
        impl FrameClassifier for Scripted {
            fn is_speech(&mut self, _frame: &[i16]) -> Result<bool> {
                let label = self.0[self.1 % self.0.len()];
                self.1 += 1;
                Ok(label)
            }
        }

        // 12 frames of 30 ms at 16 kHz: 480 samples each.
        let samples = vec![0i16; 480 * 12];
        let mut classifier = Scripted(labels("..ssssssss.."), 0);
        let spans = detect_speech(&samples, &mut classifier, config()).unwrap();
        assert_eq!(
            spans,
            vec![SpeechSpan {
                start_ms: 60,
                end_ms: 300
            }]
        );
    }
}

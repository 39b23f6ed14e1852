// Cross-chunk dialogue stitching
//
// Pure state machine: given the device's open-dialogue cursor and one chunk's
// speech segments (as absolute timestamps), produce the dialogue operations
// to run inside the chunk's commit transaction. Keeping this free of I/O
// makes replay after crash recovery deterministic and the rules testable
// without a database.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Silence-gap and max-duration rules.
#[derive(Debug, Clone, Copy)]
pub struct StitchConfig {
    pub silence_gap: Duration,
    pub max_dialogue: Duration,
}

impl StitchConfig {
    pub fn from_secs(silence_gap_sec: u64, max_dialogue_sec: u64) -> Self {
        Self {
            silence_gap: Duration::seconds(silence_gap_sec as i64),
            max_dialogue: Duration::seconds(max_dialogue_sec as i64),
        }
    }
}

/// The device's open dialogue, mirrored from the DeviceDialogueState row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDialogue {
    pub dialogue_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub last_speech_end: DateTime<Utc>,
}

/// One chunk segment translated to absolute time.
#[derive(Debug, Clone, Copy)]
pub struct AbsoluteSegment {
    pub segment_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Dialogue mutations to persist, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogueOp {
    /// Create a new dialogue row.
    Open {
        dialogue_id: Uuid,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    },
    /// Push an existing dialogue's end_ts forward.
    Extend {
        dialogue_id: Uuid,
        end_ts: DateTime<Utc>,
    },
}

/// Everything the commit transaction needs to apply for one chunk.
#[derive(Debug, Clone)]
pub struct StitchPlan {
    pub ops: Vec<DialogueOp>,
    /// (segment_id, dialogue_id) link rows, one per segment.
    pub links: Vec<(Uuid, Uuid)>,
    /// Dialogues this chunk closed: the leading-silence close of a prior
    /// dialogue plus every gap or max-duration split.
    pub closed: usize,
    /// State row after this chunk: Some = upsert, None = delete.
    pub final_state: Option<OpenDialogue>,
}

/// Run the stitching rules for one chunk.
///
/// `prior` is the DeviceDialogueState read under the device's advisory lock;
/// `chunk_start` is the chunk's `start_ts` (the reference instant for the
/// leading silence check; wall clock would make replay nondeterministic);
/// `segments` must be ordered by (start, end).
pub fn stitch_chunk(
    config: StitchConfig,
    prior: Option<OpenDialogue>,
    chunk_start: DateTime<Utc>,
    segments: &[AbsoluteSegment],
) -> StitchPlan {
    let mut ops: Vec<DialogueOp> = Vec::new();
    let mut links = Vec::with_capacity(segments.len());
    let mut closed = 0;

    // A dialogue left open across a long silent stretch is closed up front,
    // even when this chunk carries no speech at all.
    let mut open = match prior {
        Some(state) if chunk_start - state.last_speech_end >= config.silence_gap => {
            closed += 1;
            None
        }
        other => other,
    };

    for segment in segments {
        let state = match open {
            None => open_dialogue(&mut ops, segment),
            Some(state) => {
                let gap_exceeded = segment.start - state.last_speech_end >= config.silence_gap;
                let over_length = segment.end - state.started_at > config.max_dialogue;

                if gap_exceeded || over_length {
                    closed += 1;
                    open_dialogue(&mut ops, segment)
                } else {
                    extend_dialogue(&mut ops, state.dialogue_id, segment.end);
                    OpenDialogue {
                        last_speech_end: segment.end,
                        ..state
                    }
                }
            }
        };

        links.push((segment.segment_id, state.dialogue_id));
        open = Some(state);
    }

    StitchPlan {
        ops,
        links,
        closed,
        final_state: open,
    }
}

fn open_dialogue(ops: &mut Vec<DialogueOp>, segment: &AbsoluteSegment) -> OpenDialogue {
    let dialogue_id = Uuid::new_v4();
    ops.push(DialogueOp::Open {
        dialogue_id,
        start_ts: segment.start,
        end_ts: segment.end,
    });
    OpenDialogue {
        dialogue_id,
        started_at: segment.start,
        last_speech_end: segment.end,
    }
}

/// Coalesce consecutive extends of the same dialogue; a dialogue opened in
/// this very chunk just has its end pushed forward in place.
fn extend_dialogue(ops: &mut Vec<DialogueOp>, dialogue_id: Uuid, end: DateTime<Utc>) {
    match ops.last_mut() {
        Some(DialogueOp::Open {
            dialogue_id: id,
            end_ts,
            ..
        })
        | Some(DialogueOp::Extend {
            dialogue_id: id,
            end_ts,
        }) if *id == dialogue_id => {
            *end_ts = end;
        }
        _ => {
            ops.push(DialogueOp::Extend {
                dialogue_id,
                end_ts: end,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StitchConfig {
        StitchConfig::from_secs(12, 120)
    }

    fn t0() -> DateTime<Utc> {
        "2025-03-01T09:00:00Z".parse().unwrap()
    }

    fn seg(start_offset_sec: f64, end_offset_sec: f64) -> AbsoluteSegment {
        AbsoluteSegment {
            segment_id: Uuid::new_v4(),
            start: t0() + Duration::milliseconds((start_offset_sec * 1000.0) as i64),
            end: t0() + Duration::milliseconds((end_offset_sec * 1000.0) as i64),
        }
    }

    fn opened(plan: &StitchPlan) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        plan.ops
            .iter()
            .filter_map(|op| match op {
                DialogueOp::Open {
                    start_ts, end_ts, ..
                } => Some((*start_ts, *end_ts)),
                DialogueOp::Extend { .. } => None,
            })
            .collect()
    }

    #[test]
    fn single_dialogue_within_one_chunk() {
        // Speech at [1, 5) and [6, 9): one dialogue spanning both segments.
        let segments = [seg(1.0, 5.0), seg(6.0, 9.0)];
        let plan = stitch_chunk(config(), None, t0(), &segments);

        assert_eq!(opened(&plan), vec![(segments[0].start, segments[1].end)]);
        assert_eq!(plan.closed, 0);
        assert_eq!(plan.links.len(), 2);
        let dialogue_id = plan.links[0].1;
        assert!(plan.links.iter().all(|(_, d)| *d == dialogue_id));

        let state = plan.final_state.unwrap();
        assert_eq!(state.dialogue_id, dialogue_id);
        assert_eq!(state.last_speech_end, segments[1].end);
        assert_eq!(state.started_at, segments[0].start);
    }

    #[test]
    fn dialogue_spans_two_chunks() {
        // Chunk A ends with [55, 60), chunk B starts with [60, 63): gap 0s.
        let a = [seg(55.0, 60.0)];
        let plan_a = stitch_chunk(config(), None, t0(), &a);
        let state_a = plan_a.final_state.unwrap();

        let chunk_b_start = t0() + Duration::seconds(60);
        let b = [seg(60.0, 63.0)];
        let plan_b = stitch_chunk(config(), Some(state_a), chunk_b_start, &b);

        // No new dialogue: chunk B extends A's dialogue.
        assert!(opened(&plan_b).is_empty());
        assert_eq!(
            plan_b.ops,
            vec![DialogueOp::Extend {
                dialogue_id: state_a.dialogue_id,
                end_ts: b[0].end,
            }]
        );
        assert_eq!(plan_b.closed, 0);
        assert_eq!(plan_b.final_state.unwrap().dialogue_id, state_a.dialogue_id);
    }

    #[test]
    fn silence_gap_splits_dialogue() {
        // Chunk A ends with [58, 60); chunk B has speech only at [73, 74).
        // Gap is 13s >= 12s, so B opens a fresh dialogue.
        let a = [seg(58.0, 60.0)];
        let plan_a = stitch_chunk(config(), None, t0(), &a);
        let state_a = plan_a.final_state.unwrap();

        let chunk_b_start = t0() + Duration::seconds(60);
        let b = [seg(73.0, 74.0)];
        let plan_b = stitch_chunk(config(), Some(state_a), chunk_b_start, &b);

        assert_eq!(opened(&plan_b), vec![(b[0].start, b[0].end)]);
        // The old dialogue closed even though the state row is replaced, not
        // deleted.
        assert_eq!(plan_b.closed, 1);
        let state_b = plan_b.final_state.unwrap();
        assert_ne!(state_b.dialogue_id, state_a.dialogue_id);
        assert_eq!(state_b.last_speech_end, b[0].end);
    }

    #[test]
    fn long_leading_silence_closes_state_even_without_speech() {
        let state = OpenDialogue {
            dialogue_id: Uuid::new_v4(),
            started_at: t0(),
            last_speech_end: t0() + Duration::seconds(10),
        };

        // Next chunk starts 30s after the last speech: state is forgotten.
        let chunk_start = t0() + Duration::seconds(40);
        let plan = stitch_chunk(config(), Some(state), chunk_start, &[]);

        assert!(plan.ops.is_empty());
        assert!(plan.links.is_empty());
        assert_eq!(plan.closed, 1);
        assert!(plan.final_state.is_none());
    }

    #[test]
    fn silent_chunk_within_gap_leaves_state_untouched() {
        let state = OpenDialogue {
            dialogue_id: Uuid::new_v4(),
            started_at: t0(),
            last_speech_end: t0() + Duration::seconds(55),
        };

        let chunk_start = t0() + Duration::seconds(60);
        let plan = stitch_chunk(config(), Some(state), chunk_start, &[]);

        assert!(plan.ops.is_empty());
        assert_eq!(plan.closed, 0);
        assert_eq!(plan.final_state, Some(state));
    }

    #[test]
    fn max_duration_splits_continuous_speech() {
        // Back-to-back segments for 130s with no gaps: the segment that would
        // stretch the dialogue past 120s opens a new one instead.
        let mut prior: Option<OpenDialogue> = None;
        let mut all_opens = Vec::new();
        let mut total_closed = 0;

        for chunk_index in 0..3 {
            let chunk_offset = chunk_index as f64 * 50.0;
            let chunk_start = t0() + Duration::seconds(chunk_index * 50);
            let segments: Vec<AbsoluteSegment> = (0..5)
                .map(|i| {
                    let s = chunk_offset + i as f64 * 10.0;
                    seg(s, s + 10.0)
                })
                .take_while(|segment| segment.end <= t0() + Duration::seconds(130))
                .collect();
            if segments.is_empty() {
                break;
            }

            let plan = stitch_chunk(config(), prior, chunk_start, &segments);
            all_opens.extend(opened(&plan));
            total_closed += plan.closed;
            prior = plan.final_state;
        }

        assert_eq!(all_opens.len(), 2, "expected exactly two dialogues");
        assert_eq!(total_closed, 1, "the first dialogue closed at the split");
        let (first_start, first_end) = all_opens[0];
        let (second_start, _) = all_opens[1];
        // First dialogue is bounded by the limit plus at most one segment.
        assert!(first_end - first_start <= Duration::seconds(130));
        // Second starts where the first closed.
        assert_eq!(second_start, first_end);
    }

    #[test]
    fn replay_produces_identical_plan_shape() {
        // A recovered chunk replays against the same prior state; apart from
        // freshly minted ids the plan must be identical.
        let state = OpenDialogue {
            dialogue_id: Uuid::new_v4(),
            started_at: t0(),
            last_speech_end: t0() + Duration::seconds(5),
        };
        let segments = [seg(7.0, 9.0), seg(25.0, 27.0)];

        let first = stitch_chunk(config(), Some(state), t0(), &segments);
        let second = stitch_chunk(config(), Some(state), t0(), &segments);

        assert_eq!(opened(&first), opened(&second));
        assert_eq!(first.links.len(), second.links.len());
        assert_eq!(
            first.final_state.map(|s| s.last_speech_end),
            second.final_state.map(|s| s.last_speech_end)
        );
    }

    #[test]
    fn gap_exactly_at_threshold_splits() {
        let a = [seg(0.0, 10.0)];
        let plan_a = stitch_chunk(config(), None, t0(), &a);
        let state_a = plan_a.final_state.unwrap();

        // Next speech starts exactly SILENCE_GAP after the last speech end.
        let b = [seg(22.0, 23.0)];
        let plan_b = stitch_chunk(config(), Some(state_a), t0() + Duration::seconds(20), &b);

        assert_eq!(opened(&plan_b).len(), 1);
        assert_eq!(plan_b.closed, 1);
        assert_ne!(plan_b.final_state.unwrap().dialogue_id, state_a.dialogue_id);
    }
}

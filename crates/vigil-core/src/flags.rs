//! Flag state engine. Turns per-cycle detection snapshots into debounced,
//! prioritized warning flags.
//!
//! The engine owns the two condition timers (no-face-since, edge-since) and the
//! currently published flag list. It has no notion of scheduling: callers pass
//! the cycle timestamp explicitly.

use crate::types::{DetectionBox, DetectionSnapshot, Flag, FlagType};
use chrono::{DateTime, Utc};

/// How long the frame must stay empty before `NoFace` is raised.
pub const NO_FACE_THRESHOLD_MS: i64 = 3_000;
/// How long the primary face must stay in the edge margin before `FaceNearEdge` is raised.
pub const EDGE_THRESHOLD_MS: i64 = 1_500;
/// Fraction of frame width/height treated as the edge band on each side.
pub const EDGE_MARGIN_RATIO: f32 = 0.08;

/// First-true timestamps for the debounced conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionTimers {
    pub no_face_since: Option<DateTime<Utc>>,
    pub edge_since: Option<DateTime<Utc>>,
}

impl ConditionTimers {
    pub fn clear(&mut self) {
        self.no_face_since = None;
        self.edge_since = None;
    }
}

#[derive(Debug, Default)]
pub struct FlagEngine {
    timers: ConditionTimers,
    flags: Vec<Flag>,
}

impl FlagEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published flags, highest priority first.
    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }

    pub fn timers(&self) -> &ConditionTimers {
        &self.timers
    }

    /// Evaluate one detection cycle.
    ///
    /// Returns `true` when the published flag list changed.
    pub fn evaluate(
        &mut self,
        snapshot: &DetectionSnapshot,
        frame_width: u32,
        frame_height: u32,
        now: DateTime<Utc>,
    ) -> bool {
        let mut candidates: Vec<FlagType> = Vec::with_capacity(2);

        if snapshot.is_empty() {
            let since = *self.timers.no_face_since.get_or_insert(now);
            if elapsed_ms(since, now) >= NO_FACE_THRESHOLD_MS {
                candidates.push(FlagType::NoFace);
            }
            self.timers.edge_since = None;
        } else {
            self.timers.no_face_since = None;

            if snapshot.len() > 1 {
                candidates.push(FlagType::MultipleFaces);
            }

            let near_edge = snapshot
                .primary()
                .is_some_and(|face| is_near_edge(face, frame_width, frame_height));

            if near_edge {
                let since = *self.timers.edge_since.get_or_insert(now);
                // A concurrent multi-face warning takes the slot; the edge timer
                // keeps accumulating regardless.
                if elapsed_ms(since, now) >= EDGE_THRESHOLD_MS
                    && !candidates.contains(&FlagType::MultipleFaces)
                {
                    candidates.push(FlagType::FaceNearEdge);
                }
            } else {
                self.timers.edge_since = None;
            }
        }

        let ordered: Vec<FlagType> = FlagType::PRIORITY
            .iter()
            .copied()
            .filter(|t| candidates.contains(t))
            .collect();

        if ordered.is_empty() {
            return self.clear_flags();
        }

        self.publish(&ordered, now)
    }

    /// Clear published flags and both condition timers (frame or stream absent).
    ///
    /// Returns `true` when the published flag list changed.
    pub fn reset(&mut self) -> bool {
        self.timers.clear();
        self.clear_flags()
    }

    fn clear_flags(&mut self) -> bool {
        if self.flags.is_empty() {
            return false;
        }
        self.flags.clear();
        true
    }

    fn publish(&mut self, ordered: &[FlagType], now: DateTime<Utc>) -> bool {
        let unchanged = self.flags.len() == ordered.len()
            && self
                .flags
                .iter()
                .zip(ordered)
                .all(|(flag, t)| flag.flag_type == *t);
        if unchanged {
            return false;
        }

        let previous = std::mem::take(&mut self.flags);
        self.flags = ordered
            .iter()
            .map(|&flag_type| {
                previous
                    .iter()
                    .find(|f| f.flag_type == flag_type)
                    .cloned()
                    .unwrap_or_else(|| Flag::new(flag_type, self.condition_start(flag_type, now)))
            })
            .collect();

        tracing::debug!(flags = ?ordered, "published flag set changed");
        true
    }

    /// When the condition behind `flag_type` started holding.
    fn condition_start(&self, flag_type: FlagType, now: DateTime<Utc>) -> DateTime<Utc> {
        match flag_type {
            FlagType::NoFace => self.timers.no_face_since.unwrap_or(now),
            FlagType::FaceNearEdge => self.timers.edge_since.unwrap_or(now),
            FlagType::MultipleFaces => now,
        }
    }
}

/// Whether any side of `face` lies within the edge margin of the frame.
pub fn is_near_edge(face: &DetectionBox, frame_width: u32, frame_height: u32) -> bool {
    let Some(sides) = face.fractional_sides(frame_width, frame_height) else {
        return false;
    };
    sides.left <= EDGE_MARGIN_RATIO
        || sides.top <= EDGE_MARGIN_RATIO
        || sides.right >= 1.0 - EDGE_MARGIN_RATIO
        || sides.bottom >= 1.0 - EDGE_MARGIN_RATIO
}

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds()
}

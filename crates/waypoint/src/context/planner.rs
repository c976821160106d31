//! Truncation planning: which span of history to hide next.
//!
//! The planner is pure: given the raw history, the task's current
//! [`TruncationRange`], and how far over budget the last estimate was, it
//! returns the next, strictly larger range or reports that nothing more can
//! be hidden. Index 0 (the task statement) and the last `tail_keep` messages
//! are never inside a planned range.

use crate::{Message, MessageRole};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Overage ratio at or above which half of the history is elided at once.
pub const HALF_SEVERITY_RATIO: f64 = 2.0;

/// Inclusive span of message indices hidden from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationRange {
    pub start: usize,
    pub end: usize,
}

impl TruncationRange {
    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }

    /// Whether `self` covers at least everything `other` covers.
    pub fn covers(&self, other: &TruncationRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

impl std::fmt::Display for TruncationRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// How much of the history one planning step elides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Quarter,
    Half,
}

impl Severity {
    pub fn for_ratio(overage_ratio: f64) -> Self {
        if overage_ratio >= HALF_SEVERITY_RATIO {
            Severity::Half
        } else {
            Severity::Quarter
        }
    }

    fn fraction(self) -> f64 {
        match self {
            Severity::Quarter => 0.25,
            Severity::Half => 0.5,
        }
    }
}

/// Outcome of one planning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationPlan {
    /// Hide `range` from now on. `range` always covers the previous range.
    Extend {
        range: TruncationRange,
        severity: Severity,
        /// The indices newly hidden by this step.
        newly_elided: TruncationRange,
    },
    /// Nothing left that may be hidden.
    Exhausted,
}

/// Picks the next truncation range.
#[derive(Debug, Clone, Copy)]
pub struct TruncationPlanner {
    tail_keep: usize,
}

impl TruncationPlanner {
    pub fn new(tail_keep: usize) -> Self {
        Self { tail_keep }
    }

    pub fn tail_keep(&self) -> usize {
        self.tail_keep
    }

    /// Plan the next range for `history` given the current range and overage.
    ///
    /// `new_start` continues right after the current range (or at 1), the
    /// extent is a quarter or half of the history, and the end is clamped so
    /// the last `tail_keep` messages stay visible. The end is then pulled back
    /// to the nearest assistant message so a user/assistant turn is never
    /// split.
    pub fn plan(
        &self,
        history: &[Message],
        current: Option<TruncationRange>,
        overage_ratio: f64,
    ) -> TruncationPlan {
        let n = history.len();
        let severity = Severity::for_ratio(overage_ratio);
        let new_start = current.map_or(1, |r| r.end + 1);
        let extent = (n as f64 * severity.fraction()).floor() as usize;

        let Some(limit) = n.checked_sub(self.tail_keep + 1) else {
            return TruncationPlan::Exhausted;
        };
        let mut new_end = (new_start + extent).min(limit);

        while new_end > new_start && !is_turn_end(history, new_end) {
            new_end -= 1;
        }

        if new_start >= new_end {
            debug!(
                "truncation exhausted: start={new_start}, end={new_end}, messages={n}, tail_keep={}",
                self.tail_keep
            );
            return TruncationPlan::Exhausted;
        }

        let range = TruncationRange {
            start: current.map_or(new_start, |r| r.start),
            end: new_end,
        };
        TruncationPlan::Extend {
            range,
            severity,
            newly_elided: TruncationRange {
                start: new_start,
                end: new_end,
            },
        }
    }
}

/// A turn ends on an assistant message; the next kept message then starts a
/// fresh user turn.
fn is_turn_end(history: &[Message], index: usize) -> bool {
    history
        .get(index)
        .is_some_and(|m| m.role == MessageRole::Assistant)
}

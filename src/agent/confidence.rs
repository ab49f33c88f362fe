//! Confidence accumulation and the escalation decision.

use crate::retrieval::Chunk;

/// Default escalation threshold: answers below this go to the owner.
pub const DEFAULT_ESCALATION_THRESHOLD: f32 = 0.7;

/// Confidence of an answer. `Unknown` marks a run whose evidence could not be
/// scored (e.g. every tool payload was malformed); it is deliberately
/// distinguishable from a genuine 0.0, even though both escalate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    Score(f32),
    Unknown,
}

impl Confidence {
    pub fn as_score(&self) -> Option<f32> {
        match self {
            Confidence::Score(s) => Some(*s),
            Confidence::Unknown => None,
        }
    }
}

/// Per-tool-step tally of scoreable output. One tally exists per TOOLS step;
/// its confidence *replaces* the running value rather than averaging into it.
#[derive(Debug, Default, Clone)]
pub struct TurnTally {
    score_sum: f32,
    score_count: usize,
    has_verified_hit: bool,
    malformed: usize,
}

impl TurnTally {
    /// Fold one parsed tool payload into the tally.
    pub fn absorb(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            self.score_sum += chunk.score;
            self.score_count += 1;
            if chunk.is_verified {
                self.has_verified_hit = true;
            }
        }
    }

    /// Record a payload that failed to parse. Contributes no citations or
    /// scores, but keeps "could not score" distinguishable from "scored zero".
    pub fn note_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn has_verified_hit(&self) -> bool {
        self.has_verified_hit
    }

    /// Confidence for this tool step.
    ///
    /// A verified hit is absolute trust (1.0). Otherwise the mean of the
    /// observed scores. An invoked-but-empty search is evidence of absence
    /// and scores 0.0 — unless the only thing observed was malformed output,
    /// which yields `Unknown` instead of a fabricated zero.
    pub fn confidence(&self) -> Confidence {
        if self.has_verified_hit {
            Confidence::Score(1.0)
        } else if self.score_count > 0 {
            Confidence::Score(self.score_sum / self.score_count as f32)
        } else if self.malformed > 0 {
            Confidence::Unknown
        } else {
            Confidence::Score(0.0)
        }
    }
}

/// Final confidence plus the escalation flag. Derived, never persisted here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceResult {
    pub score: Confidence,
    pub escalate: bool,
}

/// Pure escalation decision: escalate iff the score is below `threshold`.
/// Unknown confidence always escalates.
pub fn assess(score: Confidence, threshold: f32) -> ConfidenceResult {
    let escalate = match score {
        Confidence::Score(s) => s < threshold,
        Confidence::Unknown => true,
    };
    ConfidenceResult { score, escalate }
}

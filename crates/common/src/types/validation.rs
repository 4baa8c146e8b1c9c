use serde::{Deserialize, Serialize};

/// Verdict on one worker answer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_complete: bool,
    /// 0–10.
    pub quality_score: u8,
    pub should_retry: bool,
    pub reasoning: String,
    /// 0.0–1.0.
    pub confidence: f64,
}

impl ValidationVerdict {
    /// Clamp fields into their documented ranges.
    pub fn normalized(mut self) -> Self {
        self.quality_score = self.quality_score.min(10);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

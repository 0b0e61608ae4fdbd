//! Amplitude-threshold speech activity detection.
//!
//! The detector only reports state; callers never route audio through it.

/// RMS above which a block counts as speech.
pub const DEFAULT_SPEAKING_THRESHOLD: f32 = 0.01;

/// Calculate RMS volume from samples (for VU meter)
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|&s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Convert RMS to dB
pub fn rms_to_db(rms: f32) -> f32 {
    if rms <= 0.0 {
        return -100.0;
    }
    20.0 * rms.log10()
}

#[derive(Debug, Clone)]
pub struct ActivityDetector {
    threshold: f32,
    speaking: bool,
    last_rms: f32,
    evaluated: u64,
}

impl ActivityDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            speaking: false,
            last_rms: 0.0,
            evaluated: 0,
        }
    }

    /// Classify one block. Returns the new speaking state only when it changed.
    pub fn observe(&mut self, block: &[f32]) -> Option<bool> {
        let rms = calculate_rms(block);
        self.last_rms = rms;
        self.evaluated += 1;

        let speaking = rms > self.threshold;
        if speaking == self.speaking {
            return None;
        }
        self.speaking = speaking;
        Some(speaking)
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn last_rms(&self) -> f32 {
        self.last_rms
    }

    /// Number of blocks classified since creation or the last reset.
    pub fn evaluated(&self) -> u64 {
        self.evaluated
    }

    /// Force the idle state. Returns `Some(false)` if it was speaking.
    pub fn reset(&mut self) -> Option<bool> {
        self.evaluated = 0;
        self.last_rms = 0.0;
        if self.speaking {
            self.speaking = false;
            Some(false)
        } else {
            None
        }
    }
}

impl Default for ActivityDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SPEAKING_THRESHOLD)
    }
}

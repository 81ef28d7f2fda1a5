//! Repeated-action detection.
//!
//! The model occasionally locks onto a failing action and repeats it forever.
//! The detector fingerprints each action and starts injecting a warning into
//! the prompt once the same fingerprint shows up three times in a row.

/// Consecutive repeats before warnings start firing.
pub const REPEAT_WARNING_THRESHOLD: u32 = 3;

/// Per-run repetition state. Reset at the start of every run.
#[derive(Debug, Default)]
pub struct LoopDetector {
    last_signature: Option<String>,
    consecutive: u32,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the action about to execute.
    ///
    /// # Returns
    /// A warning line for the next prompt once the repeat count reaches the
    /// threshold. The counter keeps growing uncapped, so the warning fires on
    /// every further repeat until a different action clears it.
    pub fn observe(&mut self, signature: &str) -> Option<String> {
        if self.last_signature.as_deref() == Some(signature) {
            self.consecutive += 1;
        } else {
            self.last_signature = Some(signature.to_string());
            self.consecutive = 1;
        }

        if self.consecutive >= REPEAT_WARNING_THRESHOLD {
            Some(format!(
                "Warning: you have repeated the same action ({}) {} times in a row. \
                 Check the screenshot to verify whether your previous attempts actually \
                 succeeded, and choose a different action if they did not.",
                signature, self.consecutive
            ))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.last_signature = None;
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

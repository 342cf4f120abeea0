/// Consecutive failure counter behind the "disabled" flag of background
/// probes: disabled after `threshold` failures in a row, enabled again by the
/// next success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureTracker {
    failures: u32,
    threshold: u32,
    disabled: bool,
}

impl FailureTracker {
    pub const fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold,
            disabled: false,
        }
    }

    /// Record one probe outcome. Returns the new value of the flag if it
    /// flipped.
    pub fn record(&mut self, ok: bool) -> Option<bool> {
        if ok {
            self.failures = 0;
            if self.disabled {
                self.disabled = false;
                return Some(false);
            }
            return None;
        }
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            if !self.disabled {
                self.disabled = true;
                return Some(true);
            }
        }
        None
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flips_after_threshold() {
        let mut t = FailureTracker::new(5);
        for _ in 0..4 {
            assert_eq!(t.record(false), None);
        }
        assert!(!t.disabled());
        assert_eq!(t.record(false), Some(true));
        assert!(t.disabled());
        // stays disabled without flipping again
        for _ in 0..7 {
            assert_eq!(t.record(false), None);
        }
        assert!(t.disabled());
        assert_eq!(t.record(true), Some(false));
        assert!(!t.disabled());
    }

    #[test]
    fn success_resets_count() {
        let mut t = FailureTracker::new(2);
        t.record(false);
        assert_eq!(t.failures(), 1);
        assert_eq!(t.record(true), None);
        assert_eq!(t.failures(), 0);
        assert_eq!(t.record(false), None);
        assert_eq!(t.record(false), Some(true));
    }
}

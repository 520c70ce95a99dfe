//! Codec degradation bookkeeping, §4.5.4 of the spec.
//!
//! Tracks how many degradation attempts have been made and enforces the
//! cooldown between them. Holds no I/O itself — the feeder calls
//! [`DegradationManager::try_trigger`] and, if it returns `true`, is clear
//! to build and send a new `prefer_jpeg=true` Init.

use std::time::{Duration, Instant};

const MAX_ATTEMPTS: u32 = 3;
const COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct DegradationManager {
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl Default for DegradationManager {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_attempt: None,
        }
    }
}

impl DegradationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= MAX_ATTEMPTS
    }

    /// Returns `true` if a new degradation attempt should be made now: the
    /// attempt budget is not exhausted and the cooldown from the last
    /// attempt has elapsed. On `true`, internally records the attempt.
    pub fn try_trigger(&mut self, now: Instant) -> bool {
        if self.exhausted() {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < COOLDOWN {
                return false;
            }
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_always_succeeds() {
        let mut d = DegradationManager::new();
        assert!(d.try_trigger(Instant::now()));
        assert_eq!(d.attempts(), 1);
    }

    #[test]
    fn cooldown_blocks_rapid_retriggers() {
        let mut d = DegradationManager::new();
        let t0 = Instant::now();
        assert!(d.try_trigger(t0));
        assert!(!d.try_trigger(t0 + Duration::from_secs(1)));
        assert!(d.try_trigger(t0 + Duration::from_secs(6)));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let mut d = DegradationManager::new();
        let mut t = Instant::now();
        for _ in 0..MAX_ATTEMPTS {
            assert!(d.try_trigger(t));
            t += Duration::from_secs(6);
        }
        assert!(d.exhausted());
        assert!(!d.try_trigger(t));
    }
}

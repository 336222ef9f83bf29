// Node self-health meter
//
// A bounded counter that climbs when the local node seems to be degraded
// (missed acks, having to refute our own death) and decays on good signals.
// Probe and suspicion timeouts scale by `1 + score`, so a struggling node
// slows down instead of flooding the cluster with false suspicions.

use parking_lot::Mutex;
use std::time::Duration;

/// Bounded self-health score in `[0, max]`.
pub struct Awareness {
    max: u8,
    score: Mutex<u8>,
}

impl Awareness {
    pub fn new(max: u8) -> Self {
        Self {
            max: max.max(1),
            score: Mutex::new(0),
        }
    }

    /// Nudge the score by `delta`, clamping to `[0, max]`.
    pub fn apply_delta(&self, delta: i32) {
        let mut score = self.score.lock();
        let next = (*score as i32 + delta).clamp(0, self.max as i32);
        if next != *score as i32 {
            tracing::debug!(old = *score, new = next, "health score changed");
            *score = next as u8;
        }
    }

    /// Current score. Zero means healthy.
    pub fn score(&self) -> u8 {
        *self.score.lock()
    }

    /// Scale a base timeout by `1 + score`.
    pub fn scale(&self, base: Duration) -> Duration {
        base * (1 + self.score() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_to_bounds() {
        let awareness = Awareness::new(8);
        awareness.apply_delta(-5);
        assert_eq!(awareness.score(), 0);

        awareness.apply_delta(100);
        assert_eq!(awareness.score(), 8);
    }

    #[test]
    fn test_scales_timeouts() {
        let awareness = Awareness::new(8);
        let base = Duration::from_millis(500);
        assert_eq!(awareness.scale(base), base);

        awareness.apply_delta(2);
        assert_eq!(awareness.scale(base), Duration::from_millis(1500));
    }

    #[test]
    fn test_decays_monotonically_under_success() {
        let awareness = Awareness::new(8);
        awareness.apply_delta(8);

        let mut last = awareness.score();
        for _ in 0..10 {
            awareness.apply_delta(-1);
            let now = awareness.score();
            assert!(now <= last);
            last = now;
        }
        assert_eq!(last, 0);
    }
}

//! Rate limiting for session error events.
//!
//! A hostile or broken peer can produce a malformed record per millisecond;
//! observers (logs, UI) must see at most one error event per interval, with
//! the number of suppressed occurrences folded into the next one.

use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct ErrorThrottle {
    interval: Duration,
    last_emit: Option<Instant>,
    suppressed: u64,
}

impl ErrorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_emit: None, suppressed: 0 }
    }

    /// Asks to emit an error at `now`. `Some(n)` grants the emission and
    /// reports how many errors were suppressed since the previous one.
    pub fn admit(&mut self, now: Instant) -> Option<u64> {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last_emit = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_is_admitted_immediately() {
        let mut throttle = ErrorThrottle::new(Duration::from_millis(100));
        assert_eq!(throttle.admit(Instant::now()), Some(0));
    }

    #[test]
    fn burst_is_collapsed_into_one_event_with_a_count() {
        let mut throttle = ErrorThrottle::new(Duration::from_millis(100));
        let t0 = Instant::now();
        assert_eq!(throttle.admit(t0), Some(0));
        for i in 1..=5 {
            assert_eq!(throttle.admit(t0 + Duration::from_millis(i)), None);
        }
        assert_eq!(throttle.admit(t0 + Duration::from_millis(150)), Some(5));
        assert_eq!(throttle.admit(t0 + Duration::from_millis(300)), Some(0));
    }
}

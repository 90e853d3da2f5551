//! Exponential backoff with full jitter for transient backend failures and
//! tunnel reconnects: 1 s → 2 s → 4 s → … capped at 60 s, each delay drawn
//! uniformly from `[0, window]`.

use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { attempt: 0, base, cap }
    }

    /// The jittered delay for the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let window = self.window();
        self.attempt = self.attempt.saturating_add(1);
        if window.is_zero() {
            return window;
        }
        let nanos = rand::thread_rng().gen_range(0..=window.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }

    /// Current (unjittered) window: `base * 2^attempt`, capped.
    fn window(&self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(30)));
        exp.min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_double_up_to_the_cap() {
        let mut b = Backoff::default();
        let mut prev = Duration::ZERO;
        for i in 0..10 {
            let window = b.window();
            assert!(window <= Duration::from_secs(60), "attempt {i} window {window:?}");
            assert!(window >= prev.min(Duration::from_secs(60)));
            prev = window;
            let _ = b.next_delay();
        }
        assert_eq!(b.window(), Duration::from_secs(60));
    }

    #[test]
    fn delays_stay_within_the_window() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for _ in 0..50 {
            let window = b.window();
            let delay = b.next_delay();
            assert!(delay <= window, "jitter {delay:?} exceeded window {window:?}");
        }
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut b = Backoff::default();
        for _ in 0..6 {
            let _ = b.next_delay();
        }
        b.reset();
        assert_eq!(b.window(), Duration::from_secs(1));
    }
}

//! Exponential backoff with jitter, shared by the Gateway<->Game stream
//! reconnector (§4.7) and the Raft RPC client (§4.9) — both need the same
//! "retry a flaky peer without hammering it" policy.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    /// Doubles on every call, capped at `max`, with +/-20% jitter so a
    /// fleet of reconnecting clients doesn't thunder in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt += 1;
        let scaled = self.base.saturating_mul(1u32 << exp).min(self.max);
        let jitter_frac = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(scaled.as_secs_f64() * jitter_frac).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let first = b.next_delay();
        let later = (0..10).map(|_| b.next_delay()).last().unwrap();
        assert!(first <= Duration::from_millis(130));
        assert!(later <= Duration::from_secs(5) + Duration::from_millis(1));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(10));
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        let d = b.next_delay();
        assert!(d <= Duration::from_millis(65));
    }
}

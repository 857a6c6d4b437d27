//! Backoff and time-budget helpers for agent invocations.

use std::time::{Duration, Instant};

use rand::Rng;

/// Delay before retry number `attempt` (0-based).
///
/// `min(max, base * 2^attempt + jitter)` with jitter uniform in
/// `[0, base * 2^attempt / 2)`.
pub fn retry_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    retry_delay_with(attempt, base_ms, max_ms, |span| rng.gen_range(0..span))
}

/// [`retry_delay`] with the jitter source supplied by the caller. `jitter` is
/// only called with a non-zero span and its result is clamped below it.
pub fn retry_delay_with(
    attempt: u32,
    base_ms: u64,
    max_ms: u64,
    jitter: impl FnOnce(u64) -> u64,
) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let exponential = base_ms.saturating_mul(factor);
    let span = exponential / 2;
    let jitter = if span == 0 {
        0
    } else {
        jitter(span).min(span - 1)
    };
    Duration::from_millis(exponential.saturating_add(jitter).min(max_ms))
}

/// Time left until `deadline`, or `None` once it has passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .filter(|remaining| !remaining.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attempt_lands_in_jitter_window() {
        for _ in 0..200 {
            let delay = retry_delay(1, 500, 2000).as_millis();
            assert!((1000..1500).contains(&delay), "delay {delay}ms");
        }
    }

    #[test]
    fn first_attempt_lands_in_jitter_window() {
        for _ in 0..200 {
            let delay = retry_delay(0, 1000, 30_000).as_millis();
            assert!((1000..1500).contains(&delay), "delay {delay}ms");
        }
    }

    #[test]
    fn delay_is_capped() {
        for _ in 0..50 {
            assert_eq!(retry_delay(3, 500, 2000), Duration::from_millis(2000));
            assert_eq!(retry_delay(5, 1000, 2000), Duration::from_millis(2000));
        }
        assert_eq!(retry_delay(80, 500, 2000), Duration::from_millis(2000));
    }

    #[test]
    fn jitter_is_clamped_to_half_the_exponential_step() {
        let delay = retry_delay_with(2, 100, 10_000, |span| {
            assert_eq!(span, 200);
            u64::MAX
        });
        assert_eq!(delay, Duration::from_millis(599));
        assert_eq!(retry_delay_with(0, 100, 10_000, |_| 0), Duration::from_millis(100));
    }

    #[test]
    fn zero_base_means_no_wait() {
        assert_eq!(retry_delay(4, 0, 1000), Duration::ZERO);
    }

    #[test]
    fn remaining_budget_expires() {
        assert!(remaining_budget(Instant::now() + Duration::from_secs(60)).is_some());
        assert!(remaining_budget(Instant::now()).is_none());
    }
}

use std::time::Duration;

use rand::Rng;

/// Exponential delay for the given 1-based attempt: `base * 2^(attempt-1)`,
/// capped at `max`.
pub fn exponential_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

/// Adds uniform jitter in `[-jitter, +jitter]` to `base`, saturating at zero.
///
/// With jitter the total wait of one attempt can come out shorter than the
/// base of the previous one.
pub fn with_jitter(base: Duration, jitter: Duration) -> Duration {
    let spread = jitter.as_millis().min(i64::MAX as u128) as i64;
    if spread == 0 {
        return base;
    }
    let offset = rand::thread_rng().gen_range(-spread..=spread);
    if offset >= 0 {
        base.saturating_add(Duration::from_millis(offset as u64))
    } else {
        base.saturating_sub(Duration::from_millis(offset.unsigned_abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::{exponential_delay, with_jitter};
    use std::time::Duration;

    #[test]
    fn exponential_delay_doubles_until_capped() {
        let base = Duration::from_millis(400);
        let max = Duration::from_secs(10);
        let delays: Vec<u128> = (1..=7)
            .map(|attempt| exponential_delay(base, attempt, max).as_millis())
            .collect();
        assert_eq!(delays, vec![400, 800, 1_600, 3_200, 6_400, 10_000, 10_000]);
    }

    #[test]
    fn exponential_delay_does_not_overflow_on_large_attempts() {
        let delay = exponential_delay(Duration::from_secs(1), u32::MAX, Duration::from_secs(10));
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(800);
        let jitter = Duration::from_millis(200);
        for _ in 0..500 {
            let waited = with_jitter(base, jitter);
            assert!(waited >= Duration::from_millis(600), "{waited:?}");
            assert!(waited <= Duration::from_millis(1_000), "{waited:?}");
        }
    }

    #[test]
    fn jitter_saturates_at_zero() {
        for _ in 0..100 {
            let waited = with_jitter(Duration::from_millis(50), Duration::from_millis(200));
            assert!(waited <= Duration::from_millis(250));
        }
        assert_eq!(
            with_jitter(Duration::from_millis(50), Duration::ZERO),
            Duration::from_millis(50)
        );
    }
}

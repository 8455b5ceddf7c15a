// Retry delay helpers

use std::time::Duration;

/// Highest doubling applied to an exponential delay.
const MAX_EXPONENT: u32 = 20;

/// Delay before retrying after `attempts_made` failures: `base * 2^(attempts_made - 1)`.
pub fn exponential_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(MAX_EXPONENT);
    base.saturating_mul(2u32.pow(exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_doubles_per_attempt() {
        let base = Duration::from_millis(2000);
        assert_eq!(exponential_delay(base, 1), Duration::from_millis(2000));
        assert_eq!(exponential_delay(base, 2), Duration::from_millis(4000));
        assert_eq!(exponential_delay(base, 3), Duration::from_millis(8000));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let base = Duration::from_millis(1);
        assert_eq!(exponential_delay(base, 500), exponential_delay(base, MAX_EXPONENT + 1));
        assert_eq!(exponential_delay(base, 0), base);
    }
}

use std::time::Duration;

/// Converts a caller-facing timeout into the millisecond value used for readiness waits:
///  `None` waits indefinitely (-1), zero skips the wait, anything else is rounded up to whole
///  milliseconds so that a tiny timeout never turns into 'don't wait at all'.
pub fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            let whole = d.as_millis();
            let ms = if d.subsec_nanos() % 1_000_000 != 0 { whole + 1 } else { whole };
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::indefinite(None, -1)]
    #[case::zero(Some(Duration::ZERO), 0)]
    #[case::one_nano(Some(Duration::from_nanos(1)), 1)]
    #[case::exact(Some(Duration::from_millis(250)), 250)]
    #[case::fraction(Some(Duration::from_micros(1200)), 2)]
    #[case::seconds(Some(Duration::from_secs(3)), 3000)]
    #[case::huge(Some(Duration::from_secs(u64::MAX)), i32::MAX)]
    fn test_timeout_ms(#[case] timeout: Option<Duration>, #[case] expected: i32) {
        assert_eq!(timeout_ms(timeout), expected);
    }
}

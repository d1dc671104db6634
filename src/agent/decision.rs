//! Renewal timing decisions.
//!
//! A threshold of zero days means "unset" and falls back to
//! [`DEFAULT_RENEWAL_THRESHOLD_DAYS`]; it never means "renew immediately".

use std::time::Duration;

use time::OffsetDateTime;

pub const DEFAULT_RENEWAL_THRESHOLD_DAYS: u32 = 30;

#[must_use]
pub fn effective_threshold_days(threshold_days: u32) -> u32 {
    if threshold_days == 0 {
        DEFAULT_RENEWAL_THRESHOLD_DAYS
    } else {
        threshold_days
    }
}

#[must_use]
pub fn renewal_threshold(threshold_days: u32) -> time::Duration {
    time::Duration::days(i64::from(effective_threshold_days(threshold_days)))
}

/// Returns true when the certificate is within `threshold_days` of expiry.
#[must_use]
pub fn should_renew(not_after: OffsetDateTime, threshold_days: u32) -> bool {
    should_renew_at(not_after, threshold_days, OffsetDateTime::now_utc())
}

/// Same as [`should_renew`] with an explicit clock. The boundary is inclusive.
#[must_use]
pub fn should_renew_at(
    not_after: OffsetDateTime,
    threshold_days: u32,
    now: OffsetDateTime,
) -> bool {
    match renewal_time(not_after, threshold_days) {
        Some(renew_at) => now >= renew_at,
        None => true,
    }
}

/// Time left until [`should_renew`] flips to true; zero once renewal is due.
#[must_use]
pub fn time_until_renewal(not_after: OffsetDateTime, threshold_days: u32) -> Duration {
    time_until_renewal_at(not_after, threshold_days, OffsetDateTime::now_utc())
}

#[must_use]
pub fn time_until_renewal_at(
    not_after: OffsetDateTime,
    threshold_days: u32,
    now: OffsetDateTime,
) -> Duration {
    let Some(renew_at) = renewal_time(not_after, threshold_days) else {
        return Duration::ZERO;
    };
    let remaining = renew_at - now;
    if remaining.is_positive() {
        remaining.unsigned_abs()
    } else {
        Duration::ZERO
    }
}

fn renewal_time(not_after: OffsetDateTime, threshold_days: u32) -> Option<OffsetDateTime> {
    not_after.checked_sub(renewal_threshold(threshold_days))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: time::Duration = time::Duration::DAY;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_750_000_000).unwrap()
    }

    #[test]
    fn test_should_renew_cases() {
        let now = now();
        let cases = [
            (now + DAY * 10, 30, true),
            (now + DAY * 50, 30, false),
            (now + DAY * 30, 30, true),
            (now - time::Duration::HOUR, 30, true),
            (now + DAY, 7, true),
            (now + DAY * 10, 7, false),
            (now + DAY * 20, 0, true),
        ];
        for (not_after, threshold, expected) in cases {
            assert_eq!(
                should_renew_at(not_after, threshold, now),
                expected,
                "not_after={not_after} threshold={threshold}"
            );
        }
    }

    #[test]
    fn test_should_renew_boundary_is_inclusive() {
        let now = now();
        let not_after = now + DAY * 30;

        assert!(should_renew_at(not_after, 30, now));
        assert!(!should_renew_at(
            not_after + time::Duration::SECOND,
            30,
            now
        ));
    }

    #[test]
    fn test_zero_threshold_matches_default() {
        let now = now();
        for days in [1, 29, 30, 31, 45, 90] {
            let not_after = now + DAY * days;
            assert_eq!(
                should_renew_at(not_after, 0, now),
                should_renew_at(not_after, DEFAULT_RENEWAL_THRESHOLD_DAYS, now)
            );
            assert_eq!(
                time_until_renewal_at(not_after, 0, now),
                time_until_renewal_at(not_after, DEFAULT_RENEWAL_THRESHOLD_DAYS, now)
            );
        }
    }

    #[test]
    fn test_time_until_renewal() {
        let now = now();

        assert_eq!(
            time_until_renewal_at(now + DAY * 60, 30, now),
            Duration::from_secs(30 * 24 * 60 * 60)
        );
        assert_eq!(time_until_renewal_at(now + DAY * 20, 30, now), Duration::ZERO);
        assert_eq!(time_until_renewal_at(now - DAY * 10, 30, now), Duration::ZERO);
    }

    #[test]
    fn test_time_until_renewal_zero_iff_due() {
        let now = now();
        for offset_hours in [-48_i64, -1, 0, 1, 719, 720, 721, 2000] {
            let not_after = now + time::Duration::hours(offset_hours);
            let remaining = time_until_renewal_at(not_after, 30, now);
            assert_eq!(
                remaining.is_zero(),
                should_renew_at(not_after, 30, now),
                "offset_hours={offset_hours}"
            );
        }
    }

    #[test]
    fn test_extreme_not_after_does_not_panic() {
        let now = now();
        assert!(should_renew_at(
            time::PrimitiveDateTime::MIN.assume_utc(),
            u32::MAX,
            now
        ));
    }
}

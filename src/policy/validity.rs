//! Freshness and staleness calculation, RFC 2616 section 13.2.3.

use std::time::{Duration, SystemTime};

use crate::entry::CacheEntry;
use crate::CacheConfig;

const DAY: Duration = Duration::from_secs(24 * 3600);

/// Initial age of the stored response at the time it was received.
///
/// `max(apparent_age, corrected_received_age)` where `apparent_age` is the
/// receive-time clock skew against the origin `Date` and the received age is
/// the `Age` header.
#[must_use]
pub fn corrected_initial_age(entry: &CacheEntry) -> Duration {
    let apparent_age = entry
        .date()
        .and_then(|date| entry.response_date.duration_since(date).ok())
        .unwrap_or_default();
    apparent_age.max(Duration::from_secs(entry.age_header()))
}

/// Age of the stored response at `now`.
#[must_use]
pub fn current_age(entry: &CacheEntry, now: SystemTime) -> Duration {
    let response_delay = entry
        .response_date
        .duration_since(entry.request_date)
        .unwrap_or_default();
    let resident_time =
        now.duration_since(entry.response_date).unwrap_or_default();
    corrected_initial_age(entry) + response_delay + resident_time
}

/// How long the stored response counts as fresh.
///
/// `s-maxage` (shared mode) wins over `max-age`, which wins over
/// `Expires - Date`. The `Last-Modified` heuristic is strictly opt-in and
/// capped at 24 hours.
#[must_use]
pub fn freshness_lifetime(entry: &CacheEntry, config: &CacheConfig) -> Duration {
    let cc = entry.cache_control();
    if config.shared {
        if let Some(secs) = cc.s_maxage {
            return Duration::from_secs(secs);
        }
    }
    if let Some(secs) = cc.max_age {
        return Duration::from_secs(secs);
    }
    if let Some(expires) = entry.expires() {
        let date = entry.date().unwrap_or(entry.response_date);
        return expires.duration_since(date).unwrap_or_default();
    }
    heuristic_lifetime(entry, config)
}

fn heuristic_lifetime(entry: &CacheEntry, config: &CacheConfig) -> Duration {
    if !config.heuristic_caching_enabled {
        return Duration::ZERO;
    }
    if let (Some(date), Some(last_modified)) =
        (entry.date(), entry.last_modified())
    {
        if let Ok(delta) = date.duration_since(last_modified) {
            let scaled = delta.as_secs_f64()
                * f64::from(config.heuristic_coefficient);
            return Duration::from_secs(scaled as u64).min(DAY);
        }
    }
    config.heuristic_default_lifetime
}

/// True while `current_age < freshness_lifetime`.
#[must_use]
pub fn is_fresh(
    entry: &CacheEntry,
    now: SystemTime,
    config: &CacheConfig,
) -> bool {
    current_age(entry, now) < freshness_lifetime(entry, config)
}

/// True when the stored response forbids serving stale.
#[must_use]
pub fn must_revalidate(entry: &CacheEntry, config: &CacheConfig) -> bool {
    let cc = entry.cache_control();
    cc.must_revalidate || (config.shared && cc.proxy_revalidate)
}

/// True while the entry may still be served stale pending revalidation.
///
/// The window is the `stale-while-revalidate` directive when present, or the
/// configured default lifetime otherwise; the mechanism as a whole is gated
/// by configuration.
#[must_use]
pub fn may_return_stale_while_revalidating(
    entry: &CacheEntry,
    now: SystemTime,
    config: &CacheConfig,
) -> bool {
    if !config.stale_while_revalidate_enabled {
        return false;
    }
    let cc = entry.cache_control();
    let window = match cc.stale_while_revalidate {
        Some(secs) => Duration::from_secs(secs),
        None => config.stale_while_revalidate_default,
    };
    if window.is_zero() {
        return false;
    }
    current_age(entry, now) < freshness_lifetime(entry, config) + window
}

/// True while a stale entry may be served in place of a 5xx origin failure.
#[must_use]
pub fn may_return_stale_if_error(
    entry: &CacheEntry,
    now: SystemTime,
    config: &CacheConfig,
) -> bool {
    if !config.stale_if_error_enabled {
        return false;
    }
    let cc = entry.cache_control();
    let window = match cc.stale_if_error {
        Some(secs) => Duration::from_secs(secs),
        None => config.stale_if_error_default,
    };
    if window.is_zero() {
        return false;
    }
    current_age(entry, now) < freshness_lifetime(entry, config) + window
}

/// True when the entry carries any validator usable for a conditional request.
#[must_use]
pub fn is_revalidatable(entry: &CacheEntry) -> bool {
    entry.etag().is_some()
        || entry.header("last-modified").is_some()
        || entry.header("date").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::CacheEntry;
    use crate::headers::fmt_http_date;
    use crate::HttpVersion;
    use std::time::UNIX_EPOCH;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn entry_with(headers: Vec<(String, String)>) -> CacheEntry {
        CacheEntry::new(
            at(0),
            at(2),
            200,
            HttpVersion::Http11,
            headers,
            None,
            "GET",
        )
    }

    fn dated(extra: &[(&str, &str)]) -> CacheEntry {
        let mut headers = vec![("date".to_string(), fmt_http_date(at(0)))];
        headers.extend(
            extra.iter().map(|(n, v)| (n.to_string(), v.to_string())),
        );
        entry_with(headers)
    }

    #[test]
    fn corrected_initial_age_uses_worst_case() {
        // Date two seconds before receipt, Age claims five.
        let entry = dated(&[("age", "5")]);
        assert_eq!(corrected_initial_age(&entry), Duration::from_secs(5));
        // Without an Age header the clock skew dominates.
        let entry = dated(&[]);
        assert_eq!(corrected_initial_age(&entry), Duration::from_secs(2));
    }

    #[test]
    fn current_age_grows_monotonically() {
        let entry = dated(&[]);
        let a1 = current_age(&entry, at(10));
        let a2 = current_age(&entry, at(60));
        assert!(a2 > a1);
        // response_delay (2s) + apparent age (2s) + resident (8s)
        assert_eq!(a1, Duration::from_secs(12));
    }

    #[test]
    fn s_maxage_wins_in_shared_mode() {
        let entry = dated(&[("cache-control", "max-age=100, s-maxage=10")]);
        let shared = CacheConfig::default();
        assert_eq!(
            freshness_lifetime(&entry, &shared),
            Duration::from_secs(10)
        );
        let private =
            CacheConfig { shared: false, ..CacheConfig::default() };
        assert_eq!(
            freshness_lifetime(&entry, &private),
            Duration::from_secs(100)
        );
    }

    #[test]
    fn expires_minus_date_as_fallback() {
        let entry = dated(&[("expires", &fmt_http_date(at(30)))]);
        let config = CacheConfig::default();
        assert_eq!(
            freshness_lifetime(&entry, &config),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn heuristic_is_strictly_opt_in() {
        let lm = UNIX_EPOCH + Duration::from_secs(1_700_000_000 - 1000);
        let entry = dated(&[("last-modified", &fmt_http_date(lm))]);
        let off = CacheConfig::default();
        assert_eq!(freshness_lifetime(&entry, &off), Duration::ZERO);
        let on = CacheConfig {
            heuristic_caching_enabled: true,
            ..CacheConfig::default()
        };
        assert_eq!(freshness_lifetime(&entry, &on), Duration::from_secs(100));
    }

    #[test]
    fn heuristic_capped_at_a_day() {
        let lm = UNIX_EPOCH + Duration::from_secs(1);
        let entry = dated(&[("last-modified", &fmt_http_date(lm))]);
        let on = CacheConfig {
            heuristic_caching_enabled: true,
            ..CacheConfig::default()
        };
        assert_eq!(freshness_lifetime(&entry, &on), DAY);
    }

    #[test]
    fn freshness_boundary_is_strict() {
        let entry = dated(&[("cache-control", "max-age=12")]);
        let config = CacheConfig::default();
        // current_age at t=10 is exactly 12s (2s delay + 2s skew + 8s).
        assert!(!is_fresh(&entry, at(10), &config));
        assert!(is_fresh(&entry, at(9), &config));
    }

    #[test]
    fn proxy_revalidate_only_fires_shared() {
        let entry = dated(&[("cache-control", "proxy-revalidate")]);
        assert!(must_revalidate(&entry, &CacheConfig::default()));
        let private =
            CacheConfig { shared: false, ..CacheConfig::default() };
        assert!(!must_revalidate(&entry, &private));
    }

    #[test]
    fn stale_while_revalidate_window() {
        let entry = dated(&[(
            "cache-control",
            "max-age=12, stale-while-revalidate=20",
        )]);
        let config = CacheConfig {
            stale_while_revalidate_enabled: true,
            ..CacheConfig::default()
        };
        assert!(may_return_stale_while_revalidating(&entry, at(20), &config));
        assert!(!may_return_stale_while_revalidating(&entry, at(40), &config));
        // Disabled configuration ignores the directive entirely.
        assert!(!may_return_stale_while_revalidating(
            &entry,
            at(20),
            &CacheConfig::default()
        ));
    }

    #[test]
    fn revalidatable_needs_some_validator() {
        assert!(is_revalidatable(&dated(&[])));
        assert!(is_revalidatable(&entry_with(vec![(
            "etag".into(),
            "\"x\"".into()
        )])));
        assert!(!is_revalidatable(&entry_with(vec![])));
    }
}

//! HTTP-date and `Cache-Control` parsing.
//!
//! Dates are accepted in the three grammars of RFC 2616 section 3.3.1
//! (RFC 1123, RFC 850, asctime). Directive parsing keeps unknown tokens
//! around so they survive a store/reload cycle, and degrades conflicting
//! duplicates to `must-revalidate` so invalid freshness information is
//! treated as stale.

use std::time::SystemTime;

use http::HeaderMap;

use crate::error::{CacheError, Result};

/// Parses an HTTP-date in any of the three allowed grammars.
pub fn parse_http_date(input: &str) -> Result<SystemTime> {
    httpdate::parse_http_date(input)
        .map_err(|_| CacheError::MalformedDate(input.to_string()))
}

/// Formats a `SystemTime` as an RFC 1123 HTTP-date.
pub fn fmt_http_date(when: SystemTime) -> String {
    httpdate::fmt_http_date(when)
}

/// Value of a `max-stale` request directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxStale {
    /// `max-stale` without an argument: any amount of staleness accepted
    Unbounded,
    /// `max-stale=N`: stale by at most N seconds
    Seconds(u64),
}

/// Parsed `Cache-Control` directives of a single message.
///
/// Unknown directives are preserved in `extensions` but otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-cache`
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `public`
    pub public: bool,
    /// `private`
    pub private: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
    /// `proxy-revalidate`
    pub proxy_revalidate: bool,
    /// `only-if-cached`
    pub only_if_cached: bool,
    /// `no-transform`
    pub no_transform: bool,
    /// `max-age=N`
    pub max_age: Option<u64>,
    /// `s-maxage=N`
    pub s_maxage: Option<u64>,
    /// `min-fresh=N`
    pub min_fresh: Option<u64>,
    /// `max-stale` / `max-stale=N`
    pub max_stale: Option<MaxStale>,
    /// `stale-while-revalidate=N`
    pub stale_while_revalidate: Option<u64>,
    /// `stale-if-error=N`
    pub stale_if_error: Option<u64>,
    /// Directives this cache does not act on, in order of appearance
    pub extensions: Vec<(String, Option<String>)>,
}

impl CacheControl {
    /// Parses every `Cache-Control` header of `headers` into one directive set.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::parse(
            headers
                .get_all(http::header::CACHE_CONTROL)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        )
    }

    /// Parses one or more comma-separated directive strings.
    pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut cc = CacheControl::default();
        let mut seen: Vec<(String, Option<String>)> = Vec::new();
        let mut conflicting = false;

        for value in values {
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let mut kv = part.splitn(2, '=');
                let name = kv.next().unwrap_or("").trim().to_ascii_lowercase();
                if name.is_empty() {
                    continue;
                }
                let arg = kv
                    .next()
                    .map(|v| v.trim().trim_matches('"').to_string());

                // When a directive appears more than once with differing
                // values its freshness information is invalid (RFC 2616
                // section 13.5.2); the response is then handled as if it
                // required revalidation.
                if let Some((_, prev)) =
                    seen.iter().find(|(n, _)| *n == name)
                {
                    if *prev != arg {
                        conflicting = true;
                    }
                    continue;
                }
                seen.push((name.clone(), arg.clone()));

                match name.as_str() {
                    "no-cache" => cc.no_cache = true,
                    "no-store" => cc.no_store = true,
                    "public" => cc.public = true,
                    "private" => cc.private = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    "proxy-revalidate" => cc.proxy_revalidate = true,
                    "only-if-cached" => cc.only_if_cached = true,
                    "no-transform" => cc.no_transform = true,
                    "max-age" => match delta_seconds(arg.as_deref()) {
                        Some(secs) => cc.max_age = Some(secs),
                        None => cc.must_revalidate = true,
                    },
                    "s-maxage" => match delta_seconds(arg.as_deref()) {
                        Some(secs) => cc.s_maxage = Some(secs),
                        None => cc.must_revalidate = true,
                    },
                    "min-fresh" => {
                        cc.min_fresh = delta_seconds(arg.as_deref());
                    }
                    "max-stale" => {
                        cc.max_stale = Some(match delta_seconds(arg.as_deref())
                        {
                            Some(secs) if arg.is_some() => {
                                MaxStale::Seconds(secs)
                            }
                            _ => MaxStale::Unbounded,
                        });
                    }
                    "stale-while-revalidate" => {
                        cc.stale_while_revalidate =
                            delta_seconds(arg.as_deref());
                    }
                    "stale-if-error" => {
                        cc.stale_if_error = delta_seconds(arg.as_deref());
                    }
                    _ => cc.extensions.push((name, arg)),
                }
            }
        }

        if conflicting {
            cc.must_revalidate = true;
        }
        cc
    }

    /// True when the message carries any explicit freshness information.
    pub fn has_explicit_freshness(&self, shared: bool) -> bool {
        self.max_age.is_some() || (shared && self.s_maxage.is_some())
    }
}

fn delta_seconds(arg: Option<&str>) -> Option<u64> {
    arg.and_then(|v| v.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn parses_rfc1123_date() {
        let when =
            parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(when, UNIX_EPOCH + Duration::from_secs(784_111_777));
    }

    #[test]
    fn parses_rfc850_date() {
        let when =
            parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT").unwrap();
        assert_eq!(when, UNIX_EPOCH + Duration::from_secs(784_111_777));
    }

    #[test]
    fn parses_asctime_date() {
        let when = parse_http_date("Sun Nov  6 08:49:37 1994").unwrap();
        assert_eq!(when, UNIX_EPOCH + Duration::from_secs(784_111_777));
    }

    #[test]
    fn rejects_garbage_date() {
        assert!(matches!(
            parse_http_date("last tuesday"),
            Err(CacheError::MalformedDate(_))
        ));
    }

    #[test]
    fn parses_bare_tokens() {
        let cc = CacheControl::parse(["no-cache, no-store, must-revalidate"]);
        assert!(cc.no_cache);
        assert!(cc.no_store);
        assert!(cc.must_revalidate);
        assert!(!cc.public);
    }

    #[test]
    fn parses_delta_seconds() {
        let cc = CacheControl::parse(["max-age=60, s-maxage=120"]);
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(120));
    }

    #[test]
    fn quoted_argument_is_unquoted() {
        let cc = CacheControl::parse(["max-age=\"60\""]);
        assert_eq!(cc.max_age, Some(60));
    }

    #[test]
    fn invalid_max_age_degrades_to_must_revalidate() {
        let cc = CacheControl::parse(["max-age=banana"]);
        assert_eq!(cc.max_age, None);
        assert!(cc.must_revalidate);
    }

    #[test]
    fn conflicting_duplicates_degrade_to_must_revalidate() {
        let cc = CacheControl::parse(["max-age=60", "max-age=120"]);
        assert_eq!(cc.max_age, Some(60));
        assert!(cc.must_revalidate);
    }

    #[test]
    fn repeated_identical_directive_is_fine() {
        let cc = CacheControl::parse(["max-age=60", "max-age=60"]);
        assert_eq!(cc.max_age, Some(60));
        assert!(!cc.must_revalidate);
    }

    #[test]
    fn max_stale_without_argument_is_unbounded() {
        let cc = CacheControl::parse(["max-stale"]);
        assert_eq!(cc.max_stale, Some(MaxStale::Unbounded));
        let cc = CacheControl::parse(["max-stale=30"]);
        assert_eq!(cc.max_stale, Some(MaxStale::Seconds(30)));
    }

    #[test]
    fn unknown_directives_are_preserved() {
        let cc = CacheControl::parse(["immutable, community=\"UCI\""]);
        assert_eq!(
            cc.extensions,
            vec![
                ("immutable".to_string(), None),
                ("community".to_string(), Some("UCI".to_string())),
            ]
        );
    }

    #[test]
    fn stale_while_revalidate_window() {
        let cc = CacheControl::parse(["max-age=1, stale-while-revalidate=59"]);
        assert_eq!(cc.stale_while_revalidate, Some(59));
    }
}

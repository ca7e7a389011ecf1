//! Building validating and unconditional refresh requests.

use http::header::{HeaderValue, CACHE_CONTROL, PRAGMA};
use http::request;

use crate::entry::{CacheEntry, Variant};

const IF_NONE_MATCH: &str = "if-none-match";
const IF_MODIFIED_SINCE: &str = "if-modified-since";

// Validators a client may have placed; an unconditional refresh must not
// carry any of them (RFC 2616 section 13.5.2 leaves the rest end-to-end).
const CLIENT_VALIDATORS: &[&str] = &[
    "if-range",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "if-modified-since",
];

/// Builds a validating request for a single stored entry.
///
/// `force_end_to_end` adds `Cache-Control: max-age=0` so no intermediary may
/// answer from its own store (`must-revalidate` firing, or a stale response
/// forced by the request).
#[must_use]
pub fn build_conditional(
    parts: &request::Parts,
    entry: &CacheEntry,
    force_end_to_end: bool,
) -> request::Parts {
    let mut out = parts.clone();
    for name in CLIENT_VALIDATORS {
        out.headers.remove(*name);
    }

    if let Some(etag) = entry.etag() {
        if let Ok(value) = HeaderValue::from_str(etag) {
            out.headers.insert(IF_NONE_MATCH, value);
        }
    }
    let since = entry.header("last-modified").or_else(|| entry.header("date"));
    if let Some(since) = since {
        if let Ok(value) = HeaderValue::from_str(since) {
            out.headers.insert(IF_MODIFIED_SINCE, value);
        }
    }

    if force_end_to_end {
        out.headers
            .insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    }
    out
}

/// Builds a validating request covering every negotiated variant.
///
/// `If-None-Match` carries the entity-tags of all complete children so the
/// origin can pick any of them with a `304`.
#[must_use]
pub fn build_conditional_from_variants(
    parts: &request::Parts,
    variants: &[Variant],
) -> request::Parts {
    let mut out = parts.clone();
    for name in CLIENT_VALIDATORS {
        out.headers.remove(*name);
    }

    let etags: Vec<&str> = variants
        .iter()
        .filter(|v| !is_partial(&v.entry))
        .filter_map(|v| v.entry.etag())
        .collect();
    if !etags.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&etags.join(", ")) {
            out.headers.insert(IF_NONE_MATCH, value);
        }
    }
    out
}

/// Builds an end-to-end refresh that bypasses every cache on the path.
///
/// Client validators are stripped so the origin must answer with a full
/// response; all other request headers pass through verbatim.
#[must_use]
pub fn build_unconditional_refresh(parts: &request::Parts) -> request::Parts {
    let mut out = parts.clone();
    for name in CLIENT_VALIDATORS {
        out.headers.remove(*name);
    }
    out.headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    out.headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    out
}

fn is_partial(entry: &CacheEntry) -> bool {
    entry.status == 206 || entry.header("content-range").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpVersion;
    use http::Request;
    use std::time::{Duration, UNIX_EPOCH};

    fn entry(headers: &[(&str, &str)]) -> CacheEntry {
        CacheEntry::new(
            UNIX_EPOCH,
            UNIX_EPOCH + Duration::from_secs(1),
            200,
            HttpVersion::Http11,
            headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            None,
            "GET",
        )
    }

    fn parts(headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::builder().uri("http://example.com/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn adds_etag_validator() {
        let e = entry(&[("etag", "\"v1\"")]);
        let out = build_conditional(&parts(&[]), &e, false);
        assert_eq!(out.headers.get(IF_NONE_MATCH).unwrap(), "\"v1\"");
        assert!(out.headers.get(IF_MODIFIED_SINCE).is_none());
    }

    #[test]
    fn falls_back_to_date_for_if_modified_since() {
        let e = entry(&[
            ("etag", "\"v1\""),
            ("last-modified", "Sun, 06 Nov 1994 08:49:37 GMT"),
        ]);
        let out = build_conditional(&parts(&[]), &e, false);
        assert_eq!(
            out.headers.get(IF_MODIFIED_SINCE).unwrap(),
            "Sun, 06 Nov 1994 08:49:37 GMT"
        );

        let e = entry(&[("date", "Mon, 07 Nov 1994 08:49:37 GMT")]);
        let out = build_conditional(&parts(&[]), &e, false);
        assert_eq!(
            out.headers.get(IF_MODIFIED_SINCE).unwrap(),
            "Mon, 07 Nov 1994 08:49:37 GMT"
        );
    }

    #[test]
    fn end_to_end_revalidation_sets_max_age_zero() {
        let e = entry(&[("etag", "\"v1\"")]);
        let out = build_conditional(&parts(&[]), &e, true);
        assert_eq!(out.headers.get(CACHE_CONTROL).unwrap(), "max-age=0");
    }

    #[test]
    fn client_validators_are_replaced() {
        let e = entry(&[("etag", "\"v1\"")]);
        let out = build_conditional(
            &parts(&[
                ("if-none-match", "\"client\""),
                ("if-range", "\"client\""),
                ("user-agent", "test"),
            ]),
            &e,
            false,
        );
        assert_eq!(out.headers.get(IF_NONE_MATCH).unwrap(), "\"v1\"");
        assert!(out.headers.get("if-range").is_none());
        assert_eq!(out.headers.get("user-agent").unwrap(), "test");
    }

    #[test]
    fn variant_revalidation_lists_all_complete_etags() {
        let variants = vec![
            Variant {
                variant_key: "{a=gzip}".into(),
                storage_key: "{a=gzip}u".into(),
                entry: entry(&[("etag", "\"g\"")]),
            },
            Variant {
                variant_key: "{a=br}".into(),
                storage_key: "{a=br}u".into(),
                entry: {
                    let mut e = entry(&[("etag", "\"partial\"")]);
                    e.status = 206;
                    e
                },
            },
            Variant {
                variant_key: "{a=deflate}".into(),
                storage_key: "{a=deflate}u".into(),
                entry: entry(&[("etag", "\"d\"")]),
            },
        ];
        let out = build_conditional_from_variants(&parts(&[]), &variants);
        assert_eq!(out.headers.get(IF_NONE_MATCH).unwrap(), "\"g\", \"d\"");
    }

    #[test]
    fn unconditional_refresh_strips_validators() {
        let out = build_unconditional_refresh(&parts(&[
            ("if-none-match", "\"x\""),
            ("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("if-unmodified-since", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("if-match", "\"x\""),
            ("accept-encoding", "gzip"),
        ]));
        for name in CLIENT_VALIDATORS {
            assert!(out.headers.get(*name).is_none(), "{name} kept");
        }
        assert_eq!(out.headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(out.headers.get(PRAGMA).unwrap(), "no-cache");
        assert_eq!(out.headers.get("accept-encoding").unwrap(), "gzip");
    }
}

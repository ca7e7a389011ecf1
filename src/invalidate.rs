//! Which stored entries an exchange invalidates.
//!
//! Unsafe methods flush the target resource outright. A response pointing at
//! another cached resource through `Content-Location` or `Location` flushes
//! that resource too, but only when its validators genuinely changed and the
//! stored copy predates the response (RFC 2616 section 13.10).

use http::{request, HeaderMap, Method};
use url::Url;

use crate::entry::CacheEntry;
use crate::headers;
use crate::CacheConfig;

/// Safe methods MUST NOT invalidate entries.
#[must_use]
pub fn is_unsafe_method(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Canonical URIs named by `Content-Location` / `Location`, resolved against
/// the effective request URI. Cross-host references are ignored; a cache may
/// only invalidate what the origin it talked to is authoritative for.
#[must_use]
pub fn location_invalidation_uris(
    request_uri: &str,
    resp_headers: &HeaderMap,
) -> Vec<String> {
    let Ok(base) = Url::parse(request_uri) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for name in ["content-location", "location"] {
        let Some(value) =
            resp_headers.get(name).and_then(|v| v.to_str().ok())
        else {
            continue;
        };
        let Ok(resolved) = base.join(value.trim()) else { continue };
        if resolved.host_str() != base.host_str() || resolved == base {
            continue;
        }
        let uri = resolved.to_string();
        if !out.contains(&uri) {
            out.push(uri);
        }
    }
    out
}

/// Whether a response supersedes a stored entry for the same resource.
///
/// True when the stored validator (`ETag`, else `Last-Modified`) differs
/// from the response's and the stored `Date` is older than the response's.
#[must_use]
pub fn supersedes(
    resp_headers: &HeaderMap,
    method: &Method,
    entry: &CacheEntry,
    config: &CacheConfig,
) -> bool {
    let new_date = resp_headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| headers::parse_http_date(v).ok());
    let stored_date = entry.date();
    let dated_later = match (stored_date, new_date) {
        (Some(stored), Some(new)) => stored < new,
        _ => false,
    };
    if !dated_later {
        return false;
    }

    let new_etag = resp_headers
        .get(http::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if let Some(new_etag) = new_etag {
        if is_weak(new_etag)
            && matches!(*method, Method::PUT | Method::DELETE)
            && !config.weak_etag_on_put_delete_allowed
        {
            return false;
        }
        return entry.etag() != Some(new_etag);
    }

    let new_last_modified = resp_headers
        .get(http::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| headers::parse_http_date(v).ok());
    match (entry.last_modified(), new_last_modified) {
        (Some(stored), Some(new)) => stored != new,
        _ => false,
    }
}

/// Storage keys belonging to a resource: the entry's own key plus every
/// registered variant child.
#[must_use]
pub fn resource_keys(primary_key: &str, entry: &CacheEntry) -> Vec<String> {
    let mut keys = vec![primary_key.to_string()];
    keys.extend(entry.variant_map.values().cloned());
    keys
}

/// True when the method invalidates its target resource regardless of the
/// response (unknown methods are treated as unsafe).
#[must_use]
pub fn invalidates_request_uri(parts: &request::Parts) -> bool {
    is_unsafe_method(&parts.method)
}

fn is_weak(etag: &str) -> bool {
    etag.trim_start().starts_with("W/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::fmt_http_date;
    use crate::HttpVersion;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn entry(headers: &[(&str, &str)]) -> CacheEntry {
        CacheEntry::new(
            at(0),
            at(0),
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

    fn resp(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<http::HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn method_safety_classification() {
        assert!(!is_unsafe_method(&Method::GET));
        assert!(!is_unsafe_method(&Method::HEAD));
        assert!(!is_unsafe_method(&Method::OPTIONS));
        assert!(!is_unsafe_method(&Method::TRACE));
        assert!(is_unsafe_method(&Method::POST));
        assert!(is_unsafe_method(&Method::PUT));
        assert!(is_unsafe_method(&Method::DELETE));
        assert!(is_unsafe_method(&Method::PATCH));
        assert!(is_unsafe_method(&Method::from_bytes(b"PURGE").unwrap()));
    }

    #[test]
    fn resolves_relative_locations_same_host_only() {
        let uris = location_invalidation_uris(
            "http://example.com/api/item",
            &resp(&[
                ("content-location", "/api/other"),
                ("location", "http://evil.example/steal"),
            ]),
        );
        assert_eq!(uris, vec!["http://example.com/api/other".to_string()]);
    }

    #[test]
    fn self_reference_is_skipped() {
        let uris = location_invalidation_uris(
            "http://example.com/api/item",
            &resp(&[("content-location", "/api/item")]),
        );
        assert!(uris.is_empty());
    }

    #[test]
    fn supersedes_needs_newer_date_and_changed_validator() {
        let config = CacheConfig::default();
        let stored = entry(&[
            ("date", &fmt_http_date(at(0))),
            ("etag", "\"v1\""),
        ]);
        let newer_changed = resp(&[
            ("date", &fmt_http_date(at(60))),
            ("etag", "\"v2\""),
        ]);
        assert!(supersedes(&newer_changed, &Method::POST, &stored, &config));

        let newer_same = resp(&[
            ("date", &fmt_http_date(at(60))),
            ("etag", "\"v1\""),
        ]);
        assert!(!supersedes(&newer_same, &Method::POST, &stored, &config));

        let older_changed = resp(&[
            ("date", &fmt_http_date(at(0) - Duration::from_secs(60))),
            ("etag", "\"v2\""),
        ]);
        assert!(!supersedes(&older_changed, &Method::POST, &stored, &config));
    }

    #[test]
    fn weak_etag_on_put_is_config_gated() {
        let stored = entry(&[
            ("date", &fmt_http_date(at(0))),
            ("etag", "\"v1\""),
        ]);
        let weak = resp(&[
            ("date", &fmt_http_date(at(60))),
            ("etag", "W/\"v2\""),
        ]);
        let config = CacheConfig::default();
        assert!(!supersedes(&weak, &Method::PUT, &stored, &config));
        let lax = CacheConfig {
            weak_etag_on_put_delete_allowed: true,
            ..CacheConfig::default()
        };
        assert!(supersedes(&weak, &Method::PUT, &stored, &lax));
        // Non-PUT/DELETE methods are not gated.
        assert!(supersedes(&weak, &Method::POST, &stored, &config));
    }

    #[test]
    fn last_modified_fallback() {
        let config = CacheConfig::default();
        let stored = entry(&[
            ("date", &fmt_http_date(at(0))),
            ("last-modified", &fmt_http_date(at(0) - Duration::from_secs(600))),
        ]);
        let changed = resp(&[
            ("date", &fmt_http_date(at(60))),
            ("last-modified", &fmt_http_date(at(30))),
        ]);
        assert!(supersedes(&changed, &Method::POST, &stored, &config));
        let unchanged = resp(&[
            ("date", &fmt_http_date(at(60))),
            (
                "last-modified",
                &fmt_http_date(at(0) - Duration::from_secs(600)),
            ),
        ]);
        assert!(!supersedes(&unchanged, &Method::POST, &stored, &config));
    }

    #[test]
    fn resource_keys_include_variants() {
        let mut parent = entry(&[("vary", "accept-encoding")]);
        parent
            .variant_map
            .insert("{a=gzip}".into(), "{a=gzip}http://e/".into());
        parent
            .variant_map
            .insert("{a=br}".into(), "{a=br}http://e/".into());
        let keys = resource_keys("http://e/", &parent);
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&"http://e/".to_string()));
        assert!(keys.contains(&"{a=gzip}http://e/".to_string()));
    }
}

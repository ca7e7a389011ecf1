//! Request-side cacheability.

use http::{request, Method, Version};

use crate::headers::CacheControl;

/// Whether a request may be answered from the local store at all.
///
/// Range requests are passed through untouched; partial-content caching is
/// not supported.
#[must_use]
pub fn is_servable_from_cache(parts: &request::Parts) -> bool {
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return false;
    }
    let cc = CacheControl::from_headers(&parts.headers);
    if cc.no_store {
        return false;
    }
    if parts.version == Version::HTTP_10 && has_pragma_no_cache(parts) {
        return false;
    }
    if parts.headers.contains_key(http::header::RANGE) {
        return false;
    }
    true
}

/// True when the client insists on a cached answer (`only-if-cached`).
///
/// A miss is answered with a synthesized 504, never forwarded.
#[must_use]
pub fn only_if_cached(parts: &request::Parts) -> bool {
    CacheControl::from_headers(&parts.headers).only_if_cached
}

fn has_pragma_no_cache(parts: &request::Parts) -> bool {
    parts
        .headers
        .get_all(http::header::PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn get(headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::builder().uri("http://example.com/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn get_and_head_are_servable() {
        assert!(is_servable_from_cache(&get(&[])));
        let head = Request::head("http://example.com/")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert!(is_servable_from_cache(&head));
        let post = Request::post("http://example.com/")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert!(!is_servable_from_cache(&post));
    }

    #[test]
    fn no_store_bypasses_cache() {
        assert!(!is_servable_from_cache(&get(&[(
            "cache-control",
            "no-store"
        )])));
    }

    #[test]
    fn range_requests_bypass_cache() {
        assert!(!is_servable_from_cache(&get(&[("range", "bytes=0-99")])));
    }

    #[test]
    fn pragma_no_cache_on_http10_bypasses_cache() {
        let mut parts = get(&[("pragma", "no-cache")]);
        assert!(is_servable_from_cache(&parts));
        parts.version = Version::HTTP_10;
        assert!(!is_servable_from_cache(&parts));
    }

    #[test]
    fn detects_only_if_cached() {
        assert!(only_if_cached(&get(&[(
            "cache-control",
            "only-if-cached"
        )])));
        assert!(!only_if_cached(&get(&[])));
    }
}

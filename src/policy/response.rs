//! Response-side storability.

use http::{request, HeaderMap};

use crate::headers::{self, CacheControl};
use crate::{CacheConfig, HttpVersion};

// Cacheable without explicit freshness information (RFC 2616 section 13.4).
const CACHEABLE_BY_DEFAULT: &[u16] = &[200, 203, 300, 301, 410];

/// Decides whether an origin response may enter the store.
///
/// The body size cap is enforced separately while the body is drained; this
/// check covers everything visible from the status line and headers.
#[must_use]
pub fn is_storable(
    req: &request::Parts,
    status: u16,
    version: HttpVersion,
    resp_headers: &HeaderMap,
    config: &CacheConfig,
) -> bool {
    let req_cc = CacheControl::from_headers(&req.headers);
    let res_cc = CacheControl::from_headers(resp_headers);

    if req_cc.no_store || res_cc.no_store {
        return false;
    }

    // Informational responses, 206 and 304 never carry a storable entity.
    if status < 200 || status == 206 || status == 304 {
        return false;
    }
    if !status_permits_storage(status, &res_cc, resp_headers, config) {
        return false;
    }

    if vary_star(resp_headers) {
        return false;
    }

    if !well_formed_metadata(resp_headers) {
        return false;
    }

    if res_cc.private && config.shared {
        return false;
    }

    if req.headers.contains_key(http::header::AUTHORIZATION)
        && config.shared
        && !(res_cc.s_maxage.is_some()
            || res_cc.must_revalidate
            || res_cc.public)
    {
        return false;
    }

    // RFC 2616 section 13.9: a query-bearing URI from a 1.0 origin must not
    // be cached since the origin may predate freshness information.
    if from_http10_origin(version, resp_headers)
        && req.uri.query().is_some()
    {
        return false;
    }

    if stale_on_arrival(resp_headers) {
        return false;
    }

    true
}

fn status_permits_storage(
    status: u16,
    res_cc: &CacheControl,
    resp_headers: &HeaderMap,
    config: &CacheConfig,
) -> bool {
    if CACHEABLE_BY_DEFAULT.contains(&status) {
        return true;
    }
    if status == 303 && !config.allow_303_caching {
        return false;
    }
    has_explicit_freshness(res_cc, resp_headers)
}

fn has_explicit_freshness(
    res_cc: &CacheControl,
    resp_headers: &HeaderMap,
) -> bool {
    resp_headers.contains_key(http::header::EXPIRES)
        || res_cc.max_age.is_some()
        || res_cc.s_maxage.is_some()
        || res_cc.must_revalidate
        || res_cc.proxy_revalidate
        || res_cc.public
}

fn vary_star(resp_headers: &HeaderMap) -> bool {
    resp_headers
        .get_all(http::header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim() == "*")
}

/// Exactly one well-formed `Date`, at most one well-formed `Expires`, and at
/// most one `Age` header.
fn well_formed_metadata(resp_headers: &HeaderMap) -> bool {
    let dates: Vec<_> = resp_headers
        .get_all(http::header::DATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if dates.len() != 1 || headers::parse_http_date(dates[0]).is_err() {
        return false;
    }

    let expires: Vec<_> = resp_headers
        .get_all(http::header::EXPIRES)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if expires.len() > 1 {
        return false;
    }
    if let Some(value) = expires.first() {
        if headers::parse_http_date(value).is_err() {
            return false;
        }
    }

    resp_headers.get_all(http::header::AGE).iter().count() <= 1
}

fn from_http10_origin(version: HttpVersion, resp_headers: &HeaderMap) -> bool {
    if version == HttpVersion::Http10 {
        return true;
    }
    // The nearest hop is described by the first Via entry.
    resp_headers
        .get(http::header::VIA)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|entry| entry.trim().split_whitespace().next())
        .is_some_and(|proto| proto == "1.0" || proto.eq_ignore_ascii_case("HTTP/1.0"))
}

/// `Expires <= Date` with no `Cache-Control` means "already expired" to
/// HTTP/1.0 recipients and is treated as non-cacheable (section 14.9.3).
fn stale_on_arrival(resp_headers: &HeaderMap) -> bool {
    if resp_headers.contains_key(http::header::CACHE_CONTROL) {
        return false;
    }
    let date = resp_headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| headers::parse_http_date(v).ok());
    let expires = resp_headers
        .get(http::header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| headers::parse_http_date(v).ok());
    match (expires, date) {
        (Some(expires), Some(date)) => expires <= date,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::fmt_http_date;
    use http::Request;
    use std::time::{Duration, SystemTime};

    fn req(uri: &str, headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn resp_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<http::HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    fn now_date() -> String {
        fmt_http_date(SystemTime::now())
    }

    fn storable(
        status: u16,
        req_headers: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> bool {
        let config = CacheConfig::default();
        is_storable(
            &req("http://example.com/a", req_headers),
            status,
            HttpVersion::Http11,
            &resp_headers(headers),
            &config,
        )
    }

    #[test]
    fn plain_200_with_date_is_storable() {
        assert!(storable(200, &[], &[("date", &now_date())]));
    }

    #[test]
    fn missing_or_duplicate_date_is_not_storable() {
        assert!(!storable(200, &[], &[]));
        let date = now_date();
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("date", &date)]
        ));
        assert!(!storable(200, &[], &[("date", "nonsense")]));
    }

    #[test]
    fn status_allowlist_and_explicit_freshness() {
        let date = now_date();
        assert!(storable(301, &[], &[("date", &date)]));
        assert!(storable(410, &[], &[("date", &date)]));
        assert!(!storable(302, &[], &[("date", &date)]));
        assert!(storable(
            302,
            &[],
            &[("date", &date), ("cache-control", "max-age=60")]
        ));
        assert!(!storable(206, &[], &[("date", &date)]));
        // 206 stays out even with explicit freshness.
        assert!(!storable(
            206,
            &[],
            &[("date", &date), ("cache-control", "max-age=60")]
        ));
        assert!(!storable(
            304,
            &[],
            &[("date", &date), ("cache-control", "max-age=60")]
        ));
        assert!(!storable(404, &[], &[("date", &date)]));
    }

    #[test]
    fn caching_303_needs_opt_in() {
        let date = now_date();
        assert!(!storable(
            303,
            &[],
            &[("date", &date), ("cache-control", "max-age=60")]
        ));
        let config = CacheConfig {
            allow_303_caching: true,
            ..CacheConfig::default()
        };
        assert!(is_storable(
            &req("http://example.com/a", &[]),
            303,
            HttpVersion::Http11,
            &resp_headers(&[
                ("date", &date),
                ("cache-control", "max-age=60")
            ]),
            &config,
        ));
    }

    #[test]
    fn no_store_blocks_either_side() {
        let date = now_date();
        assert!(!storable(
            200,
            &[("cache-control", "no-store")],
            &[("date", &date)]
        ));
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("cache-control", "no-store")]
        ));
    }

    #[test]
    fn vary_star_is_never_stored() {
        let date = now_date();
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("vary", "*")]
        ));
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("vary", "accept-encoding, *")]
        ));
    }

    #[test]
    fn private_depends_on_cache_mode() {
        let date = now_date();
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("cache-control", "private")]
        ));
        let config =
            CacheConfig { shared: false, ..CacheConfig::default() };
        assert!(is_storable(
            &req("http://example.com/a", &[]),
            200,
            HttpVersion::Http11,
            &resp_headers(&[
                ("date", &date),
                ("cache-control", "private")
            ]),
            &config,
        ));
    }

    #[test]
    fn authorization_needs_explicit_permission() {
        let date = now_date();
        let auth = [("authorization", "Bearer token")];
        assert!(!storable(200, &auth, &[("date", &date)]));
        assert!(storable(
            200,
            &auth,
            &[("date", &date), ("cache-control", "public")]
        ));
        assert!(storable(
            200,
            &auth,
            &[("date", &date), ("cache-control", "s-maxage=60")]
        ));
        assert!(storable(
            200,
            &auth,
            &[("date", &date), ("cache-control", "must-revalidate")]
        ));
    }

    #[test]
    fn http10_origin_with_query_is_not_stored() {
        let date = now_date();
        let config = CacheConfig::default();
        let headers = resp_headers(&[
            ("date", &date),
            ("expires", &fmt_http_date(SystemTime::now() + Duration::from_secs(10))),
        ]);
        assert!(!is_storable(
            &req("http://example.com/c?q=1", &[]),
            200,
            HttpVersion::Http10,
            &headers,
            &config,
        ));
        // Same origin, no query: storable.
        assert!(is_storable(
            &req("http://example.com/c", &[]),
            200,
            HttpVersion::Http10,
            &headers,
            &config,
        ));
        // 1.0 hop advertised through Via.
        let via = resp_headers(&[
            ("date", &date),
            ("via", "1.0 proxy.example"),
        ]);
        assert!(!is_storable(
            &req("http://example.com/c?q=1", &[]),
            200,
            HttpVersion::Http11,
            &via,
            &config,
        ));
    }

    #[test]
    fn expires_not_after_date_without_cache_control() {
        let date = now_date();
        assert!(!storable(
            200,
            &[],
            &[("date", &date), ("expires", &date)]
        ));
        // A Cache-Control header restores normal interpretation.
        assert!(storable(
            200,
            &[],
            &[
                ("date", &date),
                ("expires", &date),
                ("cache-control", "max-age=60")
            ]
        ));
    }
}

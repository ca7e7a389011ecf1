//! Protocol compliance fixups on both sides of the exchange.
//!
//! Requests are repaired where RFC 2616 permits and rejected where it does
//! not; the executor turns a rejection into a synthetic `400` and never
//! forwards the request. Responses get their hop-by-hop headers removed and
//! this cache's `Via` entry appended. Origin responses that merely omit
//! mandatory headers (401 without `WWW-Authenticate`, 405 without `Allow`,
//! 407 without `Proxy-Authenticate`) are forwarded unchanged.

use http::header::{HeaderName, HeaderValue};
use http::{request, HeaderMap, Method, Version};

use crate::error::{CacheError, Result};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// Entity headers have no place on a 304 validated by a strong validator
// (RFC 2616 section 10.3.5).
const ENTITY_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-range",
];

/// Repairs a request in place, or classifies it fatally non-compliant.
///
/// Fatal classification means the request MUST NOT be forwarded; the
/// executor answers with a module-generated 400.
pub fn normalize_request(
    parts: &mut request::Parts,
    has_body: bool,
) -> Result<()> {
    let has_range = parts.headers.contains_key(http::header::RANGE);
    if let Some(if_range) = parts.headers.get(http::header::IF_RANGE) {
        if !has_range {
            return Err(CacheError::MalformedRequest(
                "If-Range without a Range header".into(),
            ));
        }
        if if_range
            .to_str()
            .map(|v| v.trim_start().starts_with("W/"))
            .unwrap_or(false)
        {
            return Err(CacheError::MalformedRequest(
                "weak validator in If-Range".into(),
            ));
        }
    }

    // A bodyless GET/HEAD gains nothing from advertising an empty entity.
    if (parts.method == Method::GET || parts.method == Method::HEAD)
        && parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            == Some("0")
    {
        parts.headers.remove(http::header::CONTENT_LENGTH);
    }

    if parts.version == Version::HTTP_11
        && !parts.headers.contains_key(http::header::HOST)
    {
        if let Some(authority) = parts.uri.authority() {
            parts.headers.insert(
                http::header::HOST,
                HeaderValue::from_str(authority.as_str())?,
            );
        }
    }

    if parts.method == Method::OPTIONS
        && has_body
        && !parts.headers.contains_key(http::header::CONTENT_TYPE)
    {
        parts.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }

    Ok(())
}

/// Removes hop-by-hop headers, including those nominated by `Connection`.
pub fn scrub_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| name.trim().parse::<HeaderName>().ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Strips entity headers from a `304` bound for the client.
pub fn strip_entity_headers_from_304(headers: &mut HeaderMap) {
    for name in ENTITY_HEADERS {
        headers.remove(*name);
    }
}

/// Appends this cache's `Via` entry for the hop it represents.
pub fn add_via(headers: &mut HeaderMap, version: Version, pseudonym: &str) {
    let value = format!("{} {}", via_protocol(version), pseudonym);
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.append(http::header::VIA, value);
    }
}

fn via_protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(
        method: Method,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> request::Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn if_range_without_range_is_fatal() {
        let mut p = parts(
            Method::GET,
            "http://example.com/",
            &[("if-range", "\"v1\"")],
        );
        assert!(matches!(
            normalize_request(&mut p, false),
            Err(CacheError::MalformedRequest(_))
        ));
    }

    #[test]
    fn weak_if_range_validator_is_fatal() {
        let mut p = parts(
            Method::GET,
            "http://example.com/",
            &[("range", "bytes=0-1"), ("if-range", "W/\"v1\"")],
        );
        assert!(matches!(
            normalize_request(&mut p, false),
            Err(CacheError::MalformedRequest(_))
        ));
        let mut ok = parts(
            Method::GET,
            "http://example.com/",
            &[("range", "bytes=0-1"), ("if-range", "\"v1\"")],
        );
        assert!(normalize_request(&mut ok, false).is_ok());
    }

    #[test]
    fn strips_zero_content_length_from_get() {
        let mut p = parts(
            Method::GET,
            "http://example.com/",
            &[("content-length", "0")],
        );
        normalize_request(&mut p, false).unwrap();
        assert!(!p.headers.contains_key(http::header::CONTENT_LENGTH));

        let mut post = parts(
            Method::POST,
            "http://example.com/",
            &[("content-length", "0")],
        );
        normalize_request(&mut post, false).unwrap();
        assert!(post.headers.contains_key(http::header::CONTENT_LENGTH));
    }

    #[test]
    fn adds_host_for_http11() {
        let mut p = parts(Method::GET, "http://example.com:8080/x", &[]);
        normalize_request(&mut p, false).unwrap();
        assert_eq!(
            p.headers.get(http::header::HOST).unwrap(),
            "example.com:8080"
        );
    }

    #[test]
    fn options_with_body_gets_content_type() {
        let mut p = parts(Method::OPTIONS, "http://example.com/", &[]);
        normalize_request(&mut p, true).unwrap();
        assert_eq!(
            p.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        // Without a body no Content-Type appears.
        let mut bare = parts(Method::OPTIONS, "http://example.com/", &[]);
        normalize_request(&mut bare, false).unwrap();
        assert!(!bare.headers.contains_key(http::header::CONTENT_TYPE));
    }

    #[test]
    fn scrubs_hop_by_hop_and_connection_nominated() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "close, x-tracking".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("x-tracking", "abc".parse().unwrap());
        headers.insert("date", "Sun, 06 Nov 1994 08:49:37 GMT".parse().unwrap());
        scrub_hop_by_hop(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("keep-alive"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(!headers.contains_key("x-tracking"));
        assert!(headers.contains_key("date"));
    }

    #[test]
    fn strips_entity_headers_from_304() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/html".parse().unwrap());
        headers.insert("content-length", "120".parse().unwrap());
        headers.insert("etag", "\"v1\"".parse().unwrap());
        strip_entity_headers_from_304(&mut headers);
        assert!(!headers.contains_key("content-type"));
        assert!(!headers.contains_key("content-length"));
        assert_eq!(headers.get("etag").unwrap(), "\"v1\"");
    }

    #[test]
    fn via_entry_names_protocol_and_pseudonym() {
        let mut headers = HeaderMap::new();
        headers.insert("via", "1.1 upstream".parse().unwrap());
        add_via(&mut headers, Version::HTTP_11, "test-cache");
        let via: Vec<_> = headers
            .get_all("via")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(via, vec!["1.1 upstream", "1.1 test-cache"]);
        let mut h10 = HeaderMap::new();
        add_via(&mut h10, Version::HTTP_10, "test-cache");
        assert_eq!(h10.get("via").unwrap(), "1.0 test-cache");
    }
}

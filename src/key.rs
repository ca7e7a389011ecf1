//! Cache key derivation.
//!
//! A cache slot is identified by a [`RequestFingerprint`]: the canonical
//! request URI plus a deterministic selector over the request headers named
//! by the stored response's `Vary` field. Parent entries live under the bare
//! canonical URI; a negotiated child lives under selector + URI.

use http::{request, HeaderMap};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use url::Url;

use crate::error::{CacheError, Result};

/// A canonicalized (URI, variant-selector) pair identifying a cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestFingerprint {
    /// Canonical form of the effective request URI
    pub canonical_uri: String,
    /// Deterministic encoding of the selecting headers; empty when unvarying
    pub variant_selector: String,
}

impl RequestFingerprint {
    /// Key of the parent (or sole) entry for this resource.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.canonical_uri
    }

    /// Key the entry for this concrete variant lives under.
    #[must_use]
    pub fn storage_key(&self) -> String {
        if self.variant_selector.is_empty() {
            self.canonical_uri.clone()
        } else {
            variant_storage_key(&self.variant_selector, &self.canonical_uri)
        }
    }
}

/// Storage key for a variant child.
#[must_use]
pub fn variant_storage_key(selector: &str, canonical_uri: &str) -> String {
    format!("{selector}{canonical_uri}")
}

/// Derives the base fingerprint of a request (no variant selector yet).
pub fn fingerprint(parts: &request::Parts) -> Result<RequestFingerprint> {
    Ok(RequestFingerprint {
        canonical_uri: canonical_uri(parts)?,
        variant_selector: String::new(),
    })
}

/// Canonicalizes the effective request URI.
///
/// An absolute-form request target takes precedence over the `Host` header.
/// Scheme and host are lowercased, a port equal to the scheme default is
/// elided, an empty path becomes `/`, dot-segments are collapsed, and
/// percent-encoded unreserved octets in the path are folded to their literal
/// form. The query is preserved verbatim.
pub fn canonical_uri(parts: &request::Parts) -> Result<String> {
    let url = effective_url(parts)?;

    let mut out = String::new();
    out.push_str(url.scheme());
    out.push_str("://");
    out.push_str(url.host_str().ok_or_else(|| {
        CacheError::MalformedRequest("request target has no host".into())
    })?);
    if let Some(port) = url.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(&fold_unreserved(url.path()));
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

fn effective_url(parts: &request::Parts) -> Result<Url> {
    if parts.uri.scheme().is_some() {
        return Ok(Url::parse(&parts.uri.to_string())?);
    }

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            CacheError::MalformedRequest(
                "relative request target without Host header".into(),
            )
        })?;
    let scheme = determine_scheme(host, &parts.headers);

    let mut url = Url::parse(&format!("{scheme}://{host}/"))?;
    if let Some(path_and_query) = parts.uri.path_and_query() {
        url.set_path(path_and_query.path());
        url.set_query(path_and_query.query());
    }
    Ok(url)
}

fn determine_scheme(host: &str, headers: &HeaderMap) -> &'static str {
    if let Some(proto) =
        headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok())
    {
        return if proto.eq_ignore_ascii_case("http") { "http" } else { "https" };
    }
    if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "http"
    } else {
        "https"
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Folds `%XX` escapes of unreserved characters back to their literal form.
fn fold_unreserved(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &path[i + 1..i + 3];
            if let Ok(decoded) = u8::from_str_radix(hex, 16) {
                if is_unreserved(decoded) {
                    out.push(decoded as char);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Builds the variant selector for the given `Vary` fields.
///
/// The selector is `{name=value&...}` with names sorted, names and values
/// percent-encoded, and multi-valued headers joined with `", "`. Equivalent
/// requests always produce the same selector. Fails with
/// [`CacheError::VaryStar`] when the fields contain `*`.
pub fn variant_selector(
    vary_fields: &[String],
    req_headers: &HeaderMap,
) -> Result<String> {
    if vary_fields.is_empty() {
        return Ok(String::new());
    }
    let mut pairs: Vec<(String, String)> = Vec::with_capacity(vary_fields.len());
    for field in vary_fields {
        let name = field.trim().to_ascii_lowercase();
        if name == "*" {
            return Err(CacheError::VaryStar);
        }
        let joined = req_headers
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        pairs.push((name, joined));
    }
    pairs.sort();
    pairs.dedup();

    let encoded = pairs
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(name, NON_ALPHANUMERIC),
                utf8_percent_encode(value, NON_ALPHANUMERIC)
            )
        })
        .collect::<Vec<_>>()
        .join("&");
    Ok(format!("{{{encoded}}}"))
}

//! Whether a stored entry satisfies a presented request.

use std::time::SystemTime;

use http::{request, Method};

use crate::entry::CacheEntry;
use crate::headers::{CacheControl, MaxStale};
use crate::key;
use crate::policy::validity;
use crate::CacheConfig;

/// Outcome of matching a request against a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suitability {
    /// Serve the stored response as-is
    Suitable,
    /// The request's conditional validators match the fresh entry; a 304 is
    /// synthesized without contacting the origin
    SuitableNotModified,
    /// The entry cannot satisfy this request
    Unsuitable(Unsuitable),
}

/// Why an entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsuitable {
    /// The client forced revalidation (`no-cache` / `Pragma: no-cache`)
    RevalidationForced,
    /// A request freshness directive (`max-age`, `min-fresh`) is violated
    FreshnessConstraint,
    /// The entry is stale and the client did not allow staleness
    Stale,
    /// The entry is stale and the response demands revalidation
    MustRevalidate,
    /// The selecting headers no longer match the stored variant
    VariantMismatch,
    /// A HEAD-derived entry cannot answer a GET
    MethodMismatch,
}

/// Matches `req` against `entry`.
///
/// `lookup_selector` is the variant selector the storage lookup used; it is
/// re-derived from the entry's current `Vary` field to catch entries whose
/// selecting headers changed after a revalidation merge.
#[must_use]
pub fn check(
    req: &request::Parts,
    entry: &CacheEntry,
    lookup_selector: &str,
    now: SystemTime,
    config: &CacheConfig,
) -> Suitability {
    if entry.request_method == Method::HEAD.as_str()
        && req.method != Method::HEAD
    {
        return Suitability::Unsuitable(Unsuitable::MethodMismatch);
    }

    let req_cc = CacheControl::from_headers(&req.headers);
    if req_cc.no_cache || pragma_no_cache(req) {
        return Suitability::Unsuitable(Unsuitable::RevalidationForced);
    }

    if entry.has_vary_star() {
        return Suitability::Unsuitable(Unsuitable::VariantMismatch);
    }
    let vary_fields = entry.vary_fields();
    if !vary_fields.is_empty() {
        match key::variant_selector(&vary_fields, &req.headers) {
            Ok(selector) if selector == lookup_selector => {}
            _ => {
                return Suitability::Unsuitable(Unsuitable::VariantMismatch)
            }
        }
    }

    let fresh = validity::is_fresh(entry, now, config);
    let current_age = validity::current_age(entry, now);
    let lifetime = validity::freshness_lifetime(entry, config);

    if !fresh {
        if validity::must_revalidate(entry, config) {
            return Suitability::Unsuitable(Unsuitable::MustRevalidate);
        }
        let staleness = current_age.saturating_sub(lifetime);
        let allows_stale = match req_cc.max_stale {
            Some(MaxStale::Unbounded) => true,
            Some(MaxStale::Seconds(limit)) => {
                staleness.as_secs() <= limit
            }
            None => false,
        };
        if !allows_stale {
            return Suitability::Unsuitable(Unsuitable::Stale);
        }
    }

    if let Some(max_age) = req_cc.max_age {
        if current_age.as_secs() > max_age {
            return Suitability::Unsuitable(Unsuitable::FreshnessConstraint);
        }
    }
    if let Some(min_fresh) = req_cc.min_fresh {
        let time_to_live = lifetime.saturating_sub(current_age);
        if time_to_live.as_secs() < min_fresh {
            return Suitability::Unsuitable(Unsuitable::FreshnessConstraint);
        }
    }

    // A conditional request collapses to a synthetic 304 when the stored
    // validators match; a non-matching validator gets the full response.
    if let Some(if_none_match) = header_str(req, "if-none-match") {
        return if etag_matches(if_none_match, entry.etag()) && fresh {
            Suitability::SuitableNotModified
        } else {
            Suitability::Suitable
        };
    }
    if let Some(ims) = header_str(req, "if-modified-since") {
        if let (Ok(since), Some(last_modified)) =
            (crate::headers::parse_http_date(ims), entry.last_modified())
        {
            if last_modified <= since && fresh {
                return Suitability::SuitableNotModified;
            }
        }
        return Suitability::Suitable;
    }

    Suitability::Suitable
}

/// Whether the conditional validators that matched `entry` are strong
/// (RFC 2616 section 13.3.3).
///
/// An entity-tag match is strong when neither side is weak (`*` defers to
/// the stored tag). A bare `If-Modified-Since` match is strong only when the
/// stored `Last-Modified` predates the response `Date` by at least a minute;
/// anything closer could have been modified twice within one clock tick.
#[must_use]
pub fn matched_validator_is_strong(
    req: &request::Parts,
    entry: &CacheEntry,
) -> bool {
    if let Some(if_none_match) = header_str(req, "if-none-match") {
        let Some(stored) = entry.etag() else { return false };
        if is_weak(stored) {
            return false;
        }
        return if_none_match.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || (!is_weak(candidate) && candidate == stored)
        });
    }
    if header_str(req, "if-modified-since").is_some() {
        if let Some(last_modified) = entry.last_modified() {
            let date = entry.date().unwrap_or(entry.response_date);
            return date
                .duration_since(last_modified)
                .map_or(false, |delta| delta.as_secs() >= 60);
        }
    }
    false
}

fn is_weak(tag: &str) -> bool {
    tag.trim_start().starts_with("W/")
}

fn pragma_no_cache(req: &request::Parts) -> bool {
    req.headers
        .get_all(http::header::PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-cache"))
}

fn header_str<'a>(req: &'a request::Parts, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Weak comparison of an `If-None-Match` field against a stored entity-tag.
fn etag_matches(if_none_match: &str, stored: Option<&str>) -> bool {
    let Some(stored) = stored else { return false };
    let stored = weak_stripped(stored);
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || weak_stripped(candidate) == stored
    })
}

fn weak_stripped(tag: &str) -> &str {
    tag.trim().trim_start_matches("W/")
}

//! Folding a `304 Not Modified` back into the stored entry.

use std::collections::HashSet;
use std::time::SystemTime;

use http::HeaderMap;

use crate::entry::CacheEntry;
use crate::headers;

// The old body is reused, so properties of the body must not change
// (RFC 2616 section 13.5.3).
const EXCLUDED_FROM_UPDATE: &[&str] = &[
    "content-length",
    "content-encoding",
    "transfer-encoding",
    "content-range",
];

const WARNING: &str = "warning";

/// Result of merging a revalidation response.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// The stored entry, updated from the 304
    Updated(CacheEntry),
    /// The 304 carries a `Date` older than the stored entry's; the exchange
    /// must be retried unconditionally (RFC 2616 section 13.2.6)
    RequiresUnconditionalRetry,
}

/// Merges the headers of a `304` into `stored`.
///
/// Every header present in the 304 replaces its stored counterpart; nothing
/// else is deleted. Body-property headers are never copied from the 304.
/// Stored `1xx` warnings are dropped, `2xx` warnings retained. The entry's
/// exchange timestamps move to the validating request/response instants.
///
/// A 304 without a `Date` header is treated as dated at `response_date`
/// (the local receive clock).
#[must_use]
pub fn merge_not_modified(
    stored: &CacheEntry,
    not_modified: &HeaderMap,
    request_date: SystemTime,
    response_date: SystemTime,
) -> MergeOutcome {
    let effective_date = not_modified
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| headers::parse_http_date(v).ok())
        .unwrap_or(response_date);
    if let Some(stored_date) = stored.date() {
        if effective_date < stored_date {
            return MergeOutcome::RequiresUnconditionalRetry;
        }
    }

    let replace: HashSet<String> = not_modified
        .keys()
        .map(|name| name.as_str().to_ascii_lowercase())
        .filter(|name| !EXCLUDED_FROM_UPDATE.contains(&name.as_str()))
        .filter(|name| name != WARNING)
        .collect();

    let mut merged = stored.clone();
    merged.headers.retain(|(name, value)| {
        let name = name.to_ascii_lowercase();
        if replace.contains(&name) {
            return false;
        }
        // A validated entry sheds its transient 1xx warnings.
        if name == WARNING {
            return value.trim_start().starts_with('2');
        }
        true
    });

    for (name, value) in not_modified.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if EXCLUDED_FROM_UPDATE.contains(&lower.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        if lower == WARNING {
            if value.trim_start().starts_with('1') {
                continue;
            }
            merged.append_header(WARNING, value);
        } else {
            merged.append_header(name.as_str(), value);
        }
    }

    merged.request_date = request_date.min(response_date);
    merged.response_date = response_date;
    MergeOutcome::Updated(merged)
}

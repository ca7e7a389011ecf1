#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A semantically transparent HTTP/1.1 caching layer that sits between an
//! application issuing requests and its backend transport, following the
//! caching rules of RFC 2616 sections 13 and 14.
//!
//! Given a request, the [`CachingExecutor`] decides whether it can be
//! answered from the local store, whether a stored response must first be
//! revalidated against the origin with a conditional request, or whether the
//! request has to be forwarded untouched. Origin responses flow back through
//! a size cap and a storability check before they are committed.
//!
//! The store itself is abstract: anything implementing [`CacheManager`]
//! works. Two backends ship with the crate: [`MokaManager`] (in-memory) and
//! [`CACacheManager`] (on-disk).
//!
//! ## Basic usage
//!
//! ```rust
//! # #[cfg(feature = "manager-moka")]
//! # fn main() {
//! use std::sync::Arc;
//! use http_cache_core::{
//!     Backend, Body, CacheConfig, CachingExecutor, ExecContext, HttpCache,
//!     MokaManager, Route,
//! };
//!
//! # struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl Backend for MyTransport {
//! #     async fn execute(
//! #         &self,
//! #         _route: &Route,
//! #         _request: http::Request<Body>,
//! #         _ctx: &mut ExecContext,
//! #     ) -> http_cache_core::Result<http::Response<Body>> {
//! #         unimplemented!()
//! #     }
//! # }
//! let config = CacheConfig::default();
//! let cache = HttpCache::new(MokaManager::default(), config.clone());
//! let backend: Arc<dyn Backend> = Arc::new(MyTransport);
//! let executor = CachingExecutor::new(cache, backend, config);
//! # let _ = executor;
//! # }
//! # #[cfg(not(feature = "manager-moka"))]
//! # fn main() {}
//! ```
//!
//! Every response the executor returns carries a `Via` entry for this hop,
//! and the per-call [`ExecContext`] records how the response was produced
//! ([`CacheStatus`]). Storage failures never surface to the caller; they are
//! logged and handled as cache misses.

pub mod body;
pub mod compliance;
pub mod entry;
pub mod error;
pub mod exec;
pub mod facade;
pub mod headers;
pub mod invalidate;
pub mod key;
pub mod managers;
pub mod policy;
pub mod reader;
pub mod revalidate;
pub mod storage;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use body::Body;
pub use entry::{CacheEntry, Resource, Variant};
pub use error::{BoxError, CacheError, Result};
pub use exec::{Backend, CachingExecutor, Route};
pub use facade::{HttpCache, Lookup};
pub use headers::CacheControl;
pub use key::RequestFingerprint;
pub use reader::ReadOutcome;
pub use revalidate::AsyncValidator;
pub use storage::{CacheManager, EntryMutator};

#[cfg(feature = "manager-cacache")]
pub use managers::cacache::CACacheManager;

#[cfg(feature = "manager-moka")]
pub use managers::moka::MokaManager;

// Custom headers used to indicate cache status (hit or miss)
/// `x-cache` header: HIT if the response was served from cache, MISS if not
pub const XCACHE: &str = "x-cache";
/// `x-cache-lookup` header: HIT if a response existed in cache, MISS if not
pub const XCACHELOOKUP: &str = "x-cache-lookup";
pub(crate) const WARNING: &str = "warning";

/// How the executor produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store without contacting the origin
    CacheHit,
    /// Forwarded to the origin, no stored entry was usable
    CacheMiss,
    /// A stored entry was revalidated and then served
    Validated,
    /// Synthesized by the cache itself (400, 504, OPTIONS shortcut)
    CacheModuleResponse,
    /// The exchange failed before a response could be classified
    Failure,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CacheHit => "CACHE_HIT",
            Self::CacheMiss => "CACHE_MISS",
            Self::Validated => "VALIDATED",
            Self::CacheModuleResponse => "CACHE_MODULE_RESPONSE",
            Self::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

/// Per-call execution context handed through the pipeline.
///
/// The backend transport may stash whatever it likes in here; the cache only
/// touches `cache_status`.
#[derive(Debug, Default)]
pub struct ExecContext {
    /// Outcome classification of the most recent execution
    pub cache_status: Option<CacheStatus>,
}

impl ExecContext {
    /// A fresh context with no recorded outcome.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Running counters kept by the executor.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
}

impl CacheStats {
    /// Responses served from the store.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Requests that had to go to the origin.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Stored entries refreshed from a revalidation.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Represents an HTTP version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[non_exhaustive]
pub enum HttpVersion {
    /// HTTP Version 0.9
    #[serde(rename = "HTTP/0.9")]
    Http09,
    /// HTTP Version 1.0
    #[serde(rename = "HTTP/1.0")]
    Http10,
    /// HTTP Version 1.1
    #[serde(rename = "HTTP/1.1")]
    Http11,
    /// HTTP Version 2.0
    #[serde(rename = "HTTP/2.0")]
    H2,
    /// HTTP Version 3.0
    #[serde(rename = "HTTP/3.0")]
    H3,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HttpVersion::Http09 => write!(f, "HTTP/0.9"),
            HttpVersion::Http10 => write!(f, "HTTP/1.0"),
            HttpVersion::Http11 => write!(f, "HTTP/1.1"),
            HttpVersion::H2 => write!(f, "HTTP/2.0"),
            HttpVersion::H3 => write!(f, "HTTP/3.0"),
        }
    }
}

impl TryFrom<http::Version> for HttpVersion {
    type Error = CacheError;

    fn try_from(value: http::Version) -> Result<Self> {
        Ok(match value {
            http::Version::HTTP_09 => Self::Http09,
            http::Version::HTTP_10 => Self::Http10,
            http::Version::HTTP_11 => Self::Http11,
            http::Version::HTTP_2 => Self::H2,
            http::Version::HTTP_3 => Self::H3,
            _ => return Err(CacheError::BadVersion),
        })
    }
}

impl From<HttpVersion> for http::Version {
    fn from(value: HttpVersion) -> Self {
        match value {
            HttpVersion::Http09 => Self::HTTP_09,
            HttpVersion::Http10 => Self::HTTP_10,
            HttpVersion::Http11 => Self::HTTP_11,
            HttpVersion::H2 => Self::HTTP_2,
            HttpVersion::H3 => Self::HTTP_3,
        }
    }
}

/// Configuration of the caching layer.
///
/// Plain data; construct with struct-update syntax over
/// [`CacheConfig::default`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Evaluate responses from a shared-cache perspective (`private` is not
    /// storable, `s-maxage` and `proxy-revalidate` are honored)
    pub shared: bool,
    /// Largest body, in bytes, that will be stored; bigger responses pass
    /// through uncached
    pub max_object_size: usize,
    /// Upper bound on stored entries, enforced by the backing store
    pub max_cache_entries: u64,
    /// Concurrent-write retry budget for atomic updates
    pub max_update_retries: usize,
    /// Allow `Last-Modified` based heuristic freshness
    pub heuristic_caching_enabled: bool,
    /// Fraction of `Date - Last-Modified` used as heuristic lifetime
    pub heuristic_coefficient: f32,
    /// Heuristic lifetime when no `Last-Modified` is available
    pub heuristic_default_lifetime: Duration,
    /// Permit storing 303 responses that carry explicit freshness
    pub allow_303_caching: bool,
    /// Honor weak entity-tags on PUT/DELETE supersession checks
    pub weak_etag_on_put_delete_allowed: bool,
    /// Serve stale entries when the origin answers 5xx
    pub stale_if_error_enabled: bool,
    /// `stale-if-error` window when the directive carries no value
    pub stale_if_error_default: Duration,
    /// Serve stale entries while revalidating in the background
    pub stale_while_revalidate_enabled: bool,
    /// `stale-while-revalidate` window when the directive carries no value
    pub stale_while_revalidate_default: Duration,
    /// Worker tasks for the asynchronous validator
    pub async_validator_workers: usize,
    /// First delay after a failed background revalidation
    pub initial_backoff: Duration,
    /// Multiplier applied per consecutive failure
    pub backoff_rate: u32,
    /// Ceiling on the computed back-off delay
    pub max_backoff: Duration,
    /// Attach `x-cache` / `x-cache-lookup` diagnostic headers
    pub cache_status_headers: bool,
    /// Pseudonym used in the `Via` entry this cache appends
    pub via_pseudonym: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared: true,
            max_object_size: 8192,
            max_cache_entries: 1000,
            max_update_retries: 3,
            heuristic_caching_enabled: false,
            heuristic_coefficient: 0.1,
            heuristic_default_lifetime: Duration::ZERO,
            allow_303_caching: false,
            weak_etag_on_put_delete_allowed: false,
            stale_if_error_enabled: false,
            stale_if_error_default: Duration::ZERO,
            stale_while_revalidate_enabled: false,
            stale_while_revalidate_default: Duration::ZERO,
            async_validator_workers: 1,
            initial_backoff: Duration::from_secs(6),
            backoff_rate: 10,
            max_backoff: Duration::from_secs(86_400),
            cache_status_headers: true,
            via_pseudonym: "http-cache-core".to_string(),
        }
    }
}

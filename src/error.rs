//! Error types returned by the cache.

use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Boxed error type for backend transport failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A generic "error" for HTTP caches
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// A general error used as a catch all for other errors via anyhow
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::general))]
    General(#[from] anyhow::Error),
    /// Error from http
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::http))]
    Http(#[from] http::Error),
    /// There was an error parsing the HTTP status code
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_status_code))]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
    /// There was an error converting the header to a string
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),
    /// There was an error parsing the HTTP method
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_method))]
    InvalidMethod(#[from] http::method::InvalidMethod),
    /// There was an error parsing the URI
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_uri))]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// There was an error parsing the URL
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_url))]
    InvalidUrl(#[from] url::ParseError),
    /// There was an error parsing an HTTP header value
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing an HTTP header name
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_header_name))]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    /// Error from cacache
    #[cfg(feature = "manager-cacache")]
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::cacache))]
    CaCache(#[from] cacache::Error),
    /// Error from bincode
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::bincode))]
    Bincode(#[from] Box<bincode::ErrorKind>),
    /// I/O error while reading or writing a body resource
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::io))]
    Io(#[from] std::io::Error),
    /// There was an error parsing the HTTP request version
    #[error("Unknown HTTP version")]
    #[diagnostic(code(http_cache_core::bad_version))]
    BadVersion,
    /// Input did not match any of the three HTTP-date grammars
    #[error("unrecognized HTTP-date: {0}")]
    #[diagnostic(code(http_cache_core::malformed_date))]
    MalformedDate(String),
    /// A `Vary: *` response can never be stored or matched
    #[error("response carries Vary: * and cannot be cached")]
    #[diagnostic(code(http_cache_core::vary_star))]
    VaryStar,
    /// The request violates a hard protocol rule and cannot be forwarded
    #[error("malformed request: {0}")]
    #[diagnostic(code(http_cache_core::malformed_request))]
    MalformedRequest(String),
    /// The origin response violates a hard protocol rule
    #[error("malformed response: {0}")]
    #[diagnostic(code(http_cache_core::malformed_response))]
    MalformedResponse(String),
    /// A storage read failed; the executor treats this as a cache miss
    #[error("cache lookup failed: {0}")]
    #[diagnostic(code(http_cache_core::cache_lookup_failed))]
    CacheLookupFailed(String),
    /// A storage write failed; the executor treats this as a cache miss
    #[error("cache update failed: {0}")]
    #[diagnostic(code(http_cache_core::cache_update_failed))]
    CacheUpdateFailed(String),
    /// The atomic-update retry budget was spent without a clean write
    #[error("cache update for key {key:?} lost {attempts} concurrent-write races")]
    #[diagnostic(code(http_cache_core::cache_update_retry_exhausted))]
    CacheUpdateRetryExhausted {
        /// Storage key the update targeted
        key: String,
        /// Number of attempts made before giving up
        attempts: usize,
    },
    /// Origin I/O or protocol failure, surfaced unchanged to the client
    #[error("backend failure: {0}")]
    #[diagnostic(code(http_cache_core::backend))]
    Backend(#[source] BoxError),
    /// A primary error with close-time failures attached
    ///
    /// The primary body error takes precedence over any error raised while
    /// releasing the underlying stream; the latter are collected here.
    #[error("{primary}")]
    #[diagnostic(code(http_cache_core::suppressed))]
    WithSuppressed {
        /// The error that caused the operation to fail
        #[source]
        primary: Box<CacheError>,
        /// Failures raised while releasing resources after `primary`
        suppressed: Vec<CacheError>,
    },
}

impl CacheError {
    /// Wraps a backend transport failure
    pub fn backend<E: Into<BoxError>>(err: E) -> Self {
        Self::Backend(err.into())
    }

    /// Attaches close-time failures to `self`, preserving the primary error
    pub fn with_suppressed(self, suppressed: Vec<CacheError>) -> Self {
        if suppressed.is_empty() {
            self
        } else {
            Self::WithSuppressed { primary: Box::new(self), suppressed }
        }
    }

    /// True for storage-subsystem failures the executor must swallow
    pub fn is_cache_subsystem(&self) -> bool {
        match self {
            Self::CacheLookupFailed(_)
            | Self::CacheUpdateFailed(_)
            | Self::CacheUpdateRetryExhausted { .. }
            | Self::Bincode(_) => true,
            #[cfg(feature = "manager-cacache")]
            Self::CaCache(_) => true,
            _ => false,
        }
    }
}

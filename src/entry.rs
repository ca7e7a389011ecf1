//! The stored cache unit and its body handle.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::headers::{self, CacheControl};
use crate::HttpVersion;

/// Placeholder status stored on coordination-only parent entries.
pub const VARIANT_PARENT_STATUS: u16 = 0;

/// An ownership-transferring handle to response body bytes.
///
/// Producing bytes is idempotent for the lifetime of the resource; callers
/// may read repeatedly and get the same octets back.
#[derive(Clone)]
pub enum Resource {
    /// Bytes held in memory
    Heap(Bytes),
    /// Bytes spilled to a file
    File {
        /// Location of the backing file
        path: PathBuf,
        /// Byte length of the backing file
        len: u64,
    },
}

impl Resource {
    /// Length of the body in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Heap(data) => data.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    /// True when the resource holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the full byte content.
    pub async fn read(&self) -> Result<Bytes> {
        match self {
            Self::Heap(data) => Ok(data.clone()),
            Self::File { path, .. } => {
                let data = tokio::fs::read(path).await?;
                Ok(Bytes::from(data))
            }
        }
    }

    /// Releases the backing store.
    pub async fn dispose(self) -> Result<()> {
        match self {
            Self::Heap(_) => Ok(()),
            Self::File { path, .. } => {
                tokio::fs::remove_file(path).await?;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(data) => write!(f, "Resource::Heap({} bytes)", data.len()),
            Self::File { path, len } => {
                write!(f, "Resource::File({} bytes at {})", len, path.display())
            }
        }
    }
}

// Stored entries always persist the raw octets; a file-backed resource is
// materialized on serialization and deserializes heap-backed.
impl Serialize for Resource {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Heap(data) => serializer.serialize_bytes(data),
            Self::File { path, .. } => {
                let data =
                    std::fs::read(path).map_err(serde::ser::Error::custom)?;
                serializer.serialize_bytes(&data)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Resource;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("response body bytes")
            }

            fn visit_bytes<E: de::Error>(
                self,
                v: &[u8],
            ) -> std::result::Result<Self::Value, E> {
                Ok(Resource::Heap(Bytes::copy_from_slice(v)))
            }

            fn visit_byte_buf<E: de::Error>(
                self,
                v: Vec<u8>,
            ) -> std::result::Result<Self::Value, E> {
                Ok(Resource::Heap(Bytes::from(v)))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(Resource::Heap(Bytes::from(out)))
            }
        }

        deserializer.deserialize_byte_buf(BytesVisitor)
    }
}

/// The canonical stored unit for one variant of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Instant the originating request was sent
    pub request_date: SystemTime,
    /// Instant the originating response was received
    pub response_date: SystemTime,
    /// Status code of the stored response
    pub status: u16,
    /// Protocol version of the stored response
    pub version: HttpVersion,
    /// Ordered response headers; duplicates preserved in order
    pub headers: Vec<(String, String)>,
    /// Body handle; absent for bodyless statuses and parent entries
    pub body: Option<Resource>,
    /// variant-key to storage-key map; non-empty iff this is a parent entry
    pub variant_map: BTreeMap<String, String>,
    /// HTTP method of the originating request
    pub request_method: String,
}

impl CacheEntry {
    /// Builds an entry from a validation exchange.
    ///
    /// `request_date` is clamped so it never exceeds `response_date`.
    pub fn new(
        request_date: SystemTime,
        response_date: SystemTime,
        status: u16,
        version: HttpVersion,
        headers: Vec<(String, String)>,
        body: Option<Resource>,
        request_method: &str,
    ) -> Self {
        Self {
            request_date: request_date.min(response_date),
            response_date,
            status,
            version,
            headers,
            body,
            variant_map: BTreeMap::new(),
            request_method: request_method.to_string(),
        }
    }

    /// First value of a header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a header in stored order.
    pub fn header_values<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every value of `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Appends a value without touching existing ones.
    pub fn append_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    /// Removes every value of `name`.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Parsed `Date` header, when present and well-formed.
    #[must_use]
    pub fn date(&self) -> Option<SystemTime> {
        self.header("date").and_then(|v| headers::parse_http_date(v).ok())
    }

    /// Parsed `Expires` header, when present and well-formed.
    #[must_use]
    pub fn expires(&self) -> Option<SystemTime> {
        self.header("expires").and_then(|v| headers::parse_http_date(v).ok())
    }

    /// Parsed `Last-Modified` header, when present and well-formed.
    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.header("last-modified")
            .and_then(|v| headers::parse_http_date(v).ok())
    }

    /// Raw `ETag` header value.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.header("etag").map(str::trim)
    }

    /// `Age` header value in seconds, zero when absent or malformed.
    #[must_use]
    pub fn age_header(&self) -> u64 {
        self.header("age").and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    /// Parsed `Cache-Control` directives of the stored response.
    #[must_use]
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(self.header_values("cache-control"))
    }

    /// Header fields named by `Vary`, lowercased, in order.
    #[must_use]
    pub fn vary_fields(&self) -> Vec<String> {
        self.header_values("vary")
            .flat_map(|v| v.split(','))
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// True when the response can never be matched (`Vary: *`).
    #[must_use]
    pub fn has_vary_star(&self) -> bool {
        self.vary_fields().iter().any(|v| v == "*")
    }

    /// True when this entry only coordinates negotiated variants.
    #[must_use]
    pub fn is_variant_parent(&self) -> bool {
        !self.variant_map.is_empty()
    }

    /// Headers as an `http::HeaderMap`, skipping unparsable pairs.
    #[must_use]
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) =
                (HeaderName::from_str(name), HeaderValue::from_str(value))
            {
                map.append(name, value);
            }
        }
        map
    }

    /// Collects a `HeaderMap` into the stored ordered-pair form.
    #[must_use]
    pub fn headers_from_map(map: &HeaderMap) -> Vec<(String, String)> {
        map.iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }
}

/// One enumerated variant of a parent entry.
#[derive(Debug, Clone)]
pub struct Variant {
    /// Deterministic selector derived from the `Vary` fields
    pub variant_key: String,
    /// Storage key the child entry lives under
    pub storage_key: String,
    /// The child entry itself
    pub entry: CacheEntry,
}

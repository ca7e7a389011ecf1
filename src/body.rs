//! Response body plumbing.
//!
//! A [`Body`] is either empty, fully buffered, or a live stream handed over
//! by the backend transport. Streaming bodies own the underlying connection:
//! dropping the body (or calling [`Body::close`]) releases it.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};

/// A response body moving through the caching pipeline.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Empty,
    Full(Bytes),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// A body with no bytes.
    #[must_use]
    pub fn empty() -> Self {
        Self { inner: BodyInner::Empty }
    }

    /// A fully buffered body.
    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            Self::empty()
        } else {
            Self { inner: BodyInner::Full(data) }
        }
    }

    /// A body backed by a live byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: futures_util::Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self { inner: BodyInner::Stream(stream.boxed()) }
    }

    /// Known length of the body, when it is buffered.
    #[must_use]
    pub fn len_hint(&self) -> Option<u64> {
        match &self.inner {
            BodyInner::Empty => Some(0),
            BodyInner::Full(data) => Some(data.len() as u64),
            BodyInner::Stream(_) => None,
        }
    }

    /// True when no bytes will ever be produced.
    #[must_use]
    pub fn is_empty_hint(&self) -> bool {
        matches!(&self.inner, BodyInner::Empty)
    }

    /// True when the body is still attached to a live stream.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        matches!(&self.inner, BodyInner::Stream(_))
    }

    /// Pulls the next chunk, or `None` at end of body.
    pub async fn chunk(&mut self) -> Option<io::Result<Bytes>> {
        match &mut self.inner {
            BodyInner::Empty => None,
            BodyInner::Full(_) => {
                let BodyInner::Full(data) =
                    std::mem::replace(&mut self.inner, BodyInner::Empty)
                else {
                    unreachable!()
                };
                Some(Ok(data))
            }
            BodyInner::Stream(stream) => stream.next().await,
        }
    }

    /// Drains the body into a single buffer.
    pub async fn collect(mut self) -> io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Converts the body into a raw chunk stream.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self.inner {
            BodyInner::Empty => stream::empty().boxed(),
            BodyInner::Full(data) => stream::iter([Ok(data)]).boxed(),
            BodyInner::Stream(inner) => inner,
        }
    }

    /// Releases the underlying stream without reading further.
    pub fn close(self) {
        drop(self);
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            BodyInner::Empty => f.write_str("Body::Empty"),
            BodyInner::Full(data) => {
                write!(f, "Body::Full({} bytes)", data.len())
            }
            BodyInner::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::full(Bytes::from_static(data.as_bytes()))
    }
}

//! Size-limited response body consumption.

use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, StreamExt};

use crate::body::Body;
use crate::entry::Resource;

/// What became of a response body after draining it against the size cap.
#[derive(Debug)]
pub enum ReadOutcome {
    /// The whole body fit; it is now a reusable [`Resource`]
    Complete(Resource),
    /// The cap was exceeded; the returned body replays the buffered prefix
    /// and then hands off to the still-open tail stream, byte-for-byte what
    /// the origin sent. It owns the underlying stream and releases it on
    /// drop.
    Overflow(Body),
}

/// Drains `body` into a [`Resource`], stopping as soon as more than
/// `max_object_size` bytes have been seen.
pub async fn read_limited(
    mut body: Body,
    max_object_size: usize,
) -> io::Result<ReadOutcome> {
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total: usize = 0;

    while let Some(chunk) = body.chunk().await {
        let chunk = chunk?;
        total += chunk.len();
        chunks.push(chunk);
        if total > max_object_size {
            let prefix = stream::iter(chunks.into_iter().map(Ok));
            let reconstructed =
                Body::from_stream(prefix.chain(body.into_stream()));
            return Ok(ReadOutcome::Overflow(reconstructed));
        }
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in &chunks {
        buf.extend_from_slice(chunk);
    }
    Ok(ReadOutcome::Complete(Resource::Heap(buf.freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(chunks: &[&'static [u8]]) -> Body {
        let items: Vec<io::Result<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(c))).collect();
        Body::from_stream(stream::iter(items))
    }

    #[tokio::test]
    async fn body_within_limit_is_buffered() {
        let body = chunked(&[b"hello ", b"world"]);
        match read_limited(body, 11).await.unwrap() {
            ReadOutcome::Complete(resource) => {
                assert_eq!(&resource.read().await.unwrap()[..], b"hello world");
            }
            ReadOutcome::Overflow(_) => panic!("under the cap"),
        }
    }

    #[tokio::test]
    async fn exact_limit_is_still_complete() {
        let body = chunked(&[b"12345"]);
        assert!(matches!(
            read_limited(body, 5).await.unwrap(),
            ReadOutcome::Complete(_)
        ));
    }

    #[tokio::test]
    async fn overflow_reconstructs_identical_bytes() {
        let body = chunked(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]);
        match read_limited(body, 5).await.unwrap() {
            ReadOutcome::Overflow(reconstructed) => {
                let replay = reconstructed.collect().await.unwrap();
                assert_eq!(&replay[..], b"aaaabbbbccccdddd");
            }
            ReadOutcome::Complete(_) => panic!("expected overflow"),
        }
    }

    #[tokio::test]
    async fn read_error_propagates() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"ok")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")),
        ];
        let body = Body::from_stream(stream::iter(items));
        assert!(read_limited(body, 1024).await.is_err());
    }
}

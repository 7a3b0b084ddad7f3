use std::pin::Pin;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::body::{BoxError, ByteStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(header::CONTENT_ENCODING)?.to_str().ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            _ => None,
        }
    }
}

/// Wrap `body` so reads yield decoded bytes when `headers` declare a
/// supported content encoding. The second value tells whether wrapping
/// happened; unknown or absent encodings return the body untouched.
///
/// The decoder is built on the first read, so a malformed header is reported
/// as a read error rather than here.
pub fn wrap(headers: &HeaderMap, body: ByteStream) -> (ByteStream, bool) {
    match Encoding::from_headers(headers) {
        Some(encoding) => (
            Box::pin(LazyDecoder {
                encoding,
                state: State::Idle(Some(body)),
            }),
            true,
        ),
        None => (body, false),
    }
}

enum State {
    Idle(Option<ByteStream>),
    Active(ByteStream),
}

struct LazyDecoder {
    encoding: Encoding,
    state: State,
}

impl Stream for LazyDecoder {
    type Item = Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::Idle(body) => match body.take() {
                    Some(body) => this.state = State::Active(decoder(this.encoding, body)),
                    None => return Poll::Ready(None),
                },
                State::Active(decoded) => return decoded.as_mut().poll_next(cx),
            }
        }
    }
}

fn decoder(encoding: Encoding, body: ByteStream) -> ByteStream {
    let reader = StreamReader::new(body.map(|r| r.map_err(std::io::Error::other)));
    match encoding {
        Encoding::Gzip => Box::pin(
            ReaderStream::new(GzipDecoder::new(reader)).map(|r| r.map_err(BoxError::from)),
        ),
        Encoding::Deflate => Box::pin(
            ReaderStream::new(ZlibDecoder::new(reader)).map(|r| r.map_err(BoxError::from)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::bufread::GzipEncoder;
    use axum::http::HeaderValue;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::body::read_all;

    const PAYLOAD: &[u8] = br#"{"kind":"ConfigMapList","items":[]}"#;

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzipEncoder::new(data).read_to_end(&mut out).await.unwrap();
        out
    }

    fn split_stream(data: Vec<u8>) -> ByteStream {
        let items: Vec<Result<Bytes, BoxError>> = data
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures_util::stream::iter(items))
    }

    fn headers(encoding: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
        h
    }

    #[tokio::test]
    async fn gzip_body_is_decoded() {
        let (stream, wrapped) = wrap(&headers("gzip"), split_stream(gzip(PAYLOAD).await));
        assert!(wrapped);
        assert_eq!(read_all(stream).await.unwrap(), Bytes::from_static(PAYLOAD));
    }

    #[tokio::test]
    async fn identity_and_unknown_pass_through() {
        let (stream, wrapped) = wrap(&HeaderMap::new(), split_stream(PAYLOAD.to_vec()));
        assert!(!wrapped);
        assert_eq!(read_all(stream).await.unwrap(), Bytes::from_static(PAYLOAD));

        let (stream, wrapped) = wrap(&headers("br"), split_stream(PAYLOAD.to_vec()));
        assert!(!wrapped);
        assert_eq!(read_all(stream).await.unwrap(), Bytes::from_static(PAYLOAD));
    }

    #[tokio::test]
    async fn corrupt_gzip_fails_on_read() {
        let (stream, wrapped) = wrap(&headers("gzip"), split_stream(PAYLOAD.to_vec()));
        assert!(wrapped);
        assert!(read_all(stream).await.is_err());
    }
}

//! Content-Encoding decoding for captured bodies.

use std::io;

use axum::body::{Body, Bytes};
use axum::http::{header::CONTENT_ENCODING, Request, Response};
use tower::{service_fn, Layer, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use crate::upstream::BoxError;

/// Decode a captured body according to its `Content-Encoding`.
///
/// gzip and deflate are decoded; identity, a missing header, or an encoding
/// the decoder does not know leave the bytes untouched.
pub async fn decode_body(content_encoding: Option<&str>, raw: Bytes) -> Result<Bytes, BoxError> {
    let Some(encoding) = content_encoding
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.eq_ignore_ascii_case("identity"))
    else {
        return Ok(raw);
    };

    let captured = Response::builder()
        .header(CONTENT_ENCODING, encoding)
        .body(Body::from(raw))?;

    let mut captured = Some(captured);
    let decoder = DecompressionLayer::new().layer(service_fn(move |_: Request<()>| {
        let response = captured
            .take()
            .ok_or_else(|| io::Error::other("captured body already decoded"));
        std::future::ready(response)
    }));

    let decoded = decoder.oneshot(Request::new(())).await?;
    let body = axum::body::to_bytes(Body::new(decoded.into_body()), usize::MAX).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    // gzip of `{"ok":true}`
    const GZIPPED: &[u8] = &[
        0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x03, 0xab, 0x56, 0xca, 0xcf, 0x56,
        0xb2, 0x2a, 0x29, 0x2a, 0x4d, 0xad, 0x05, 0x00, 0x90, 0x5f, 0xd4, 0xa7, 0x0b, 0x00, 0x00,
        0x00,
    ];

    #[tokio::test]
    async fn test_identity_passthrough() {
        let raw = Bytes::from_static(b"{\"result\":1}");
        assert_eq!(decode_body(None, raw.clone()).await.unwrap(), raw);
        assert_eq!(decode_body(Some("identity"), raw.clone()).await.unwrap(), raw);
    }

    #[tokio::test]
    async fn test_gzip_decoded() {
        let decoded = decode_body(Some("gzip"), Bytes::from_static(GZIPPED)).await.unwrap();
        assert_eq!(&decoded[..], b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_an_error() {
        assert!(decode_body(Some("gzip"), Bytes::from_static(b"not gzip")).await.is_err());
    }
}

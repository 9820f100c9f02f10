//! Captured-body decoding.
//!
//! Stored response bodies are decompressed and, for JSON, pretty-printed so
//! the session record is readable. The bytes forwarded to the client are
//! never touched; decoding only affects what the store keeps.

use mime::Mime;
use tokio::io::AsyncReadExt;

use async_compression::tokio::bufread::{DeflateDecoder, GzipDecoder, ZstdDecoder};

use crate::config::MAX_BODY_SIZE;

const ENCODING_GZIP: &str = "gzip";
const ENCODING_DEFLATE: &str = "deflate";
const ENCODING_ZSTD: &str = "zstd";

/// Content headers that drive decoding, taken from the response.
#[derive(Debug, Clone, Default)]
pub(crate) struct DecodeOptions {
    pub content_type: String,
    pub content_encoding: String,
}

impl DecodeOptions {
    pub(crate) fn new(content_type: &str, content_encoding: &str) -> Self {
        DecodeOptions {
            content_type: content_type.to_owned(),
            content_encoding: content_encoding.trim().to_ascii_lowercase(),
        }
    }

    fn is_json(&self) -> bool {
        self.content_type
            .parse::<Mime>()
            .map(|m| m.subtype() == mime::JSON || m.suffix() == Some(mime::JSON))
            .unwrap_or(false)
    }
}

/// Decodes `body` for storage: decompress per `Content-Encoding`, then
/// pretty-print JSON. Bodies that fail to decode are kept as their raw
/// (lossy UTF-8) form.
pub(crate) async fn decode_body(body: &[u8], options: &DecodeOptions) -> String {
    let decompressed = match decompress(body, &options.content_encoding).await {
        Ok(bytes) => bytes,
        Err(err) => {
            log::debug!(
                "failed to decode {} body: {err}",
                display_encoding(&options.content_encoding)
            );
            return String::from_utf8_lossy(body).into_owned();
        }
    };

    let text = String::from_utf8_lossy(&decompressed).into_owned();
    if options.is_json() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            if let Ok(pretty) = serde_json::to_string_pretty(&value) {
                return pretty;
            }
        }
    }

    text
}

async fn decompress(body: &[u8], encoding: &str) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding {
        ENCODING_GZIP => {
            let mut decoder = GzipDecoder::new(body);
            decoder.read_to_end(&mut out).await?;
        }
        ENCODING_DEFLATE => {
            let mut decoder = DeflateDecoder::new(body);
            decoder.read_to_end(&mut out).await?;
        }
        ENCODING_ZSTD => {
            let mut decoder = ZstdDecoder::new(body);
            decoder.read_to_end(&mut out).await?;
        }
        "" => out.extend_from_slice(body),
        other => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported content encoding: {other}"),
            ));
        }
    }

    if out.len() > MAX_BODY_SIZE {
        out.truncate(MAX_BODY_SIZE);
    }
    Ok(out)
}

fn display_encoding(encoding: &str) -> &str {
    if encoding.is_empty() {
        "identity"
    } else {
        encoding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::{DeflateEncoder, GzipEncoder, ZstdEncoder};

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        GzipEncoder::new(data).read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn decodes_gzip() {
        let encoded = gzip(b"hello gzip").await;
        let options = DecodeOptions::new("text/plain", "gzip");
        assert_eq!(decode_body(&encoded, &options).await, "hello gzip");
    }

    #[tokio::test]
    async fn decodes_deflate() {
        let mut encoded = Vec::new();
        DeflateEncoder::new(&b"hello deflate"[..])
            .read_to_end(&mut encoded)
            .await
            .unwrap();
        let options = DecodeOptions::new("text/plain", "deflate");
        assert_eq!(decode_body(&encoded, &options).await, "hello deflate");
    }

    #[tokio::test]
    async fn decodes_zstd() {
        let mut encoded = Vec::new();
        ZstdEncoder::new(&b"hello zstd"[..])
            .read_to_end(&mut encoded)
            .await
            .unwrap();
        let options = DecodeOptions::new("text/plain", "zstd");
        assert_eq!(decode_body(&encoded, &options).await, "hello zstd");
    }

    #[tokio::test]
    async fn pretty_prints_json() {
        let options = DecodeOptions::new("application/json; charset=utf-8", "");
        let decoded = decode_body(br#"{"a":1,"b":[2,3]}"#, &options).await;
        assert!(decoded.contains("\n  \"a\": 1"));
    }

    #[tokio::test]
    async fn json_inside_gzip() {
        let encoded = gzip(br#"{"k":"v"}"#).await;
        let options = DecodeOptions::new("application/json", "gzip");
        let decoded = decode_body(&encoded, &options).await;
        assert_eq!(decoded, "{\n  \"k\": \"v\"\n}");
    }

    #[tokio::test]
    async fn unknown_encoding_keeps_raw_bytes() {
        let options = DecodeOptions::new("text/plain", "br");
        assert_eq!(decode_body(b"raw bytes", &options).await, "raw bytes");
    }

    #[tokio::test]
    async fn invalid_json_stays_text() {
        let options = DecodeOptions::new("application/json", "");
        assert_eq!(decode_body(b"not json", &options).await, "not json");
    }
}

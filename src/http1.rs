//! HTTP/1.1 request reading inside a tunnel.
//!
//! Requests are parsed straight off the decrypted stream through a
//! [`CaptureStream`], so the exact wire bytes stay available: the head is
//! re-parsed from the capture to rebuild original header order and casing,
//! and WebSocket upgrades replay those bytes verbatim to the origin.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::headers::{is_hop_by_hop, parse_raw_head, OrderedHeaderMap};
use crate::session::{PROTOCOL_HTTP10, PROTOCOL_HTTP11};
use crate::stream::{CaptureBuffer, CaptureStream};

const READ_CHUNK: usize = 4096;
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// One parsed request plus the raw material it came from.
#[derive(Debug)]
pub(crate) struct ParsedRequest {
    pub method: String,
    /// The request target exactly as written on the request line.
    pub target: String,
    /// HTTP minor version (`0` or `1`).
    pub version_minor: u8,
    /// Normalized headers for forwarding.
    pub headers: HeaderMap,
    /// Headers re-parsed from the captured bytes, order and casing intact.
    pub ordered_headers: OrderedHeaderMap,
    /// The request line and header block as captured, including the blank
    /// line.
    pub raw_head: Vec<u8>,
    pub body: Bytes,
}

impl ParsedRequest {
    pub(crate) fn protocol_label(&self) -> &'static str {
        if self.version_minor == 0 {
            PROTOCOL_HTTP10
        } else {
            PROTOCOL_HTTP11
        }
    }

    /// True when the connection must not serve another request.
    pub(crate) fn wants_close(&self) -> bool {
        if self.version_minor == 0 {
            return true;
        }
        self.headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

/// Sequential request reader over one connection.
pub(crate) struct RequestReader<IO> {
    io: CaptureStream<IO>,
    capture: CaptureBuffer,
    leftover: Vec<u8>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> RequestReader<IO> {
    pub(crate) fn new(io: IO) -> Self {
        let capture: CaptureBuffer = CaptureBuffer::default();
        RequestReader {
            io: CaptureStream::new(io, capture.clone()),
            capture,
            leftover: Vec::new(),
        }
    }

    /// Reads the next request off the wire. Returns `None` on a clean
    /// end-of-stream between requests.
    pub(crate) async fn next_request(&mut self) -> Result<Option<ParsedRequest>> {
        {
            let mut capture = self.capture.lock().expect("capture buffer poisoned");
            capture.clear();
            capture.append(&mut self.leftover);
        }

        let head_len = match self.read_head().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        let head_bytes = self.captured(|cap| cap[..head_len].to_vec());
        let (method, target, version_minor, headers) = parse_head(&head_bytes)?;

        let body_framing = framing(&headers)?;
        let (body, body_end) = match body_framing {
            Framing::Length(length) => {
                let needed = head_len + length;
                self.fill_to(needed).await?;
                (self.captured(|cap| cap[head_len..needed].to_vec()), needed)
            }
            Framing::Chunked => self.read_chunked(head_len).await?,
            Framing::None => (Vec::new(), head_len),
        };

        self.leftover = self.captured(|cap| cap[body_end..].to_vec());
        let ordered_headers = parse_raw_head(&head_bytes);

        Ok(Some(ParsedRequest {
            method,
            target,
            version_minor,
            headers,
            ordered_headers,
            raw_head: head_bytes,
            body: Bytes::from(body),
        }))
    }

    /// Writes response bytes back to the client.
    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.io.write_all(bytes).await.map_err(Error::from)?;
        self.io.flush().await.map_err(Error::from)
    }

    /// Unwraps the connection for splicing, together with any bytes read
    /// past the last parsed request.
    pub(crate) fn into_parts(self) -> (IO, Vec<u8>) {
        (self.io.into_inner(), self.leftover)
    }

    fn captured<T>(&self, f: impl FnOnce(&Vec<u8>) -> T) -> T {
        let capture = self.capture.lock().expect("capture buffer poisoned");
        f(&capture)
    }

    async fn read_head(&mut self) -> Result<Option<usize>> {
        loop {
            if let Some(pos) = self.captured(|cap| find_subsequence(cap, b"\r\n\r\n")) {
                return Ok(Some(pos + 4));
            }
            if self.captured(Vec::len) > MAX_HEAD_SIZE {
                return Err(Error::protocol("request head too large"));
            }

            let mut scratch = [0u8; READ_CHUNK];
            let n = self.io.read(&mut scratch).await.map_err(Error::from)?;
            if n == 0 {
                if self.captured(Vec::is_empty) {
                    return Ok(None);
                }
                return Err(Error::protocol("connection closed mid-request"));
            }
        }
    }

    async fn fill_to(&mut self, needed: usize) -> Result<()> {
        while self.captured(Vec::len) < needed {
            let mut scratch = [0u8; READ_CHUNK];
            let n = self.io.read(&mut scratch).await.map_err(Error::from)?;
            if n == 0 {
                return Err(Error::protocol("connection closed mid-body"));
            }
        }
        Ok(())
    }

    async fn read_chunked(&mut self, head_len: usize) -> Result<(Vec<u8>, usize)> {
        let mut pos = head_len;
        let mut body = Vec::new();

        loop {
            let line_end = self.find_from(pos, b"\r\n").await?;
            let size_line = self.captured(|cap| cap[pos..line_end].to_vec());
            let size_text = std::str::from_utf8(&size_line)
                .map_err(|_| Error::protocol("invalid chunk size line"))?;
            let size_text = size_text.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_text, 16)
                .map_err(|_| Error::protocol("invalid chunk size"))?;
            pos = line_end + 2;

            if size == 0 {
                // Trailer section: skip lines until the terminating blank.
                loop {
                    let trailer_end = self.find_from(pos, b"\r\n").await?;
                    let empty = trailer_end == pos;
                    pos = trailer_end + 2;
                    if empty {
                        return Ok((body, pos));
                    }
                }
            }

            self.fill_to(pos + size + 2).await?;
            self.captured(|cap| body.extend_from_slice(&cap[pos..pos + size]));
            pos += size + 2;
        }
    }

    async fn find_from(&mut self, start: usize, needle: &[u8]) -> Result<usize> {
        loop {
            if let Some(found) =
                self.captured(|cap| find_subsequence(&cap[start.min(cap.len())..], needle))
            {
                return Ok(start + found);
            }

            let mut scratch = [0u8; READ_CHUNK];
            let n = self.io.read(&mut scratch).await.map_err(Error::from)?;
            if n == 0 {
                return Err(Error::protocol("connection closed mid-body"));
            }
        }
    }
}

enum Framing {
    None,
    Length(usize),
    Chunked,
}

fn framing(headers: &HeaderMap) -> Result<Framing> {
    if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
        let value = te.to_str().unwrap_or("");
        if value.to_ascii_lowercase().contains("chunked") {
            return Ok(Framing::Chunked);
        }
    }

    if let Some(cl) = headers.get(http::header::CONTENT_LENGTH) {
        let length = cl
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| Error::protocol("invalid Content-Length"))?;
        return Ok(Framing::Length(length));
    }

    Ok(Framing::None)
}

fn parse_head(head: &[u8]) -> Result<(String, String, u8, HeaderMap)> {
    let mut header_storage = [httparse::EMPTY_HEADER; 100];
    let mut request = httparse::Request::new(&mut header_storage);

    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::protocol("incomplete request head"));
        }
        Err(e) => return Err(Error::protocol(e)),
    }

    let method = request
        .method
        .ok_or_else(|| Error::protocol("request line missing method"))?
        .to_owned();
    let target = request
        .path
        .ok_or_else(|| Error::protocol("request line missing target"))?
        .to_owned();
    let version_minor = request.version.unwrap_or(1) as u8;

    let mut headers = HeaderMap::new();
    for header in request.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(Error::protocol)?;
        let value = HeaderValue::from_bytes(header.value).map_err(Error::protocol)?;
        headers.append(name, value);
    }

    Ok((method, target, version_minor, headers))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Writes a full HTTP/1.1 response: status line, headers with hop-by-hop
/// fields dropped and `Content-Length` asserted from the body, then the
/// body bytes unchanged.
pub(crate) async fn write_response<W: AsyncWrite + Unpin>(
    io: &mut W,
    status: u16,
    reason: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()> {
    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || name == &http::header::CONTENT_LENGTH {
            continue;
        }
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);

    io.write_all(&out).await.map_err(Error::from)?;
    io.flush().await.map_err(Error::from)
}

/// Writes a bare error response and signals the peer to close.
pub(crate) async fn write_error_response<W: AsyncWrite + Unpin>(
    io: &mut W,
    status: u16,
    reason: &str,
) -> Result<()> {
    let response =
        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    io.write_all(response.as_bytes()).await.map_err(Error::from)?;
    io.flush().await.map_err(Error::from)
}

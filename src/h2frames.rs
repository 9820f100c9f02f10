//! HTTP/2 frame interception.
//!
//! The HTTP/2 server normalizes header casing and discards field order, so
//! the interceptor sits *below* it: the server reads through this wrapper
//! unchanged while the wrapper keeps a rolling copy of the bytes, locates
//! the connection preface, and parses every frame itself, HPACK included,
//! to recover each stream's headers exactly as sent.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use once_cell::sync::Lazy;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::headers::OrderedHeaderMap;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_WINDOW_UPDATE: u8 = 0x8;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_ACK: u8 = 0x01;
const FLAG_END_HEADERS: u8 = 0x04;
const FLAG_PADDED: u8 = 0x08;
const FLAG_PRIORITY: u8 = 0x20;

/// Frames longer than this are treated as a parser desync, not data.
const MAX_FRAME_LEN: usize = 1 << 20;
/// Highest frame type defined by the core protocol.
const MAX_FRAME_TYPE: u8 = 9;
/// Consumed-prefix threshold that triggers buffer compaction.
const COMPACT_THRESHOLD: usize = 64 * 1024;

const POOLED_CAPACITY: usize = 64 * 1024;

static FRAME_BUFFERS: Lazy<BufferPool> = Lazy::new(BufferPool::default);
static HPACK_DECODERS: Lazy<DecoderPool> = Lazy::new(DecoderPool::default);

/// LIFO freelist of frame buffers. Buffers grown past 64 KiB are dropped at
/// release instead of being retained.
#[derive(Default)]
struct BufferPool {
    stack: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn acquire(&self) -> Vec<u8> {
        self.stack
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(POOLED_CAPACITY))
    }

    fn release(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() <= POOLED_CAPACITY {
            buffer.clear();
            self.stack.lock().expect("buffer pool poisoned").push(buffer);
        }
    }
}

/// LIFO freelist of HPACK decoders, borrowed for one header block at a
/// time.
#[derive(Default)]
struct DecoderPool {
    stack: Mutex<Vec<hpack::Decoder<'static>>>,
}

impl DecoderPool {
    fn acquire(&self) -> hpack::Decoder<'static> {
        self.stack
            .lock()
            .expect("decoder pool poisoned")
            .pop()
            .unwrap_or_else(hpack::Decoder::new)
    }

    fn release(&self, decoder: hpack::Decoder<'static>) {
        self.stack
            .lock()
            .expect("decoder pool poisoned")
            .push(decoder);
    }
}

/// Captured state of one HTTP/2 stream.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamCapture {
    pub headers: OrderedHeaderMap,
    pub headers_complete: bool,
    pub data: Vec<u8>,
}

type HeadersCallback = Box<dyn Fn(u32, OrderedHeaderMap) + Send + Sync>;

/// Stream table shared between the interceptor (filling it on the read
/// path) and the request handler (draining it).
#[derive(Default)]
pub(crate) struct InterceptState {
    streams: Mutex<HashMap<u32, StreamCapture>>,
    on_headers: Mutex<Option<HeadersCallback>>,
}

impl InterceptState {
    /// Registers the callback fired whenever a stream's header block
    /// completes (END_HEADERS).
    pub(crate) fn set_headers_callback<F>(&self, callback: F)
    where
        F: Fn(u32, OrderedHeaderMap) + Send + Sync + 'static,
    {
        *self.on_headers.lock().expect("callback slot poisoned") = Some(Box::new(callback));
    }

    /// The captured header map for `stream_id`, empty if unseen.
    pub(crate) fn stream_headers(&self, stream_id: u32) -> OrderedHeaderMap {
        self.streams
            .lock()
            .expect("stream table poisoned")
            .get(&stream_id)
            .map(|s| s.headers.clone())
            .unwrap_or_default()
    }

    /// The accumulated DATA bytes for `stream_id`.
    pub(crate) fn stream_data(&self, stream_id: u32) -> Vec<u8> {
        self.streams
            .lock()
            .expect("stream table poisoned")
            .get(&stream_id)
            .map(|s| s.data.clone())
            .unwrap_or_default()
    }

    /// Forgets `stream_id`.
    pub(crate) fn cleanup_stream(&self, stream_id: u32) {
        self.streams
            .lock()
            .expect("stream table poisoned")
            .remove(&stream_id);
    }

    fn append_headers(&self, stream_id: u32, fields: Vec<(Vec<u8>, Vec<u8>)>, end_headers: bool) {
        let completed = {
            let mut streams = self.streams.lock().expect("stream table poisoned");
            let capture = streams.entry(stream_id).or_default();
            for (name, value) in fields {
                capture.headers.append(
                    &String::from_utf8_lossy(&name),
                    &String::from_utf8_lossy(&value),
                );
            }
            if end_headers {
                capture.headers_complete = true;
                Some(capture.headers.clone())
            } else {
                None
            }
        };

        if let Some(headers) = completed {
            let callback = self.on_headers.lock().expect("callback slot poisoned");
            if let Some(callback) = callback.as_ref() {
                callback(stream_id, headers);
            }
        }
    }

    fn append_data(&self, stream_id: u32, data: &[u8]) {
        let mut streams = self.streams.lock().expect("stream table poisoned");
        let capture = streams.entry(stream_id).or_default();
        capture.data.extend_from_slice(data);
    }
}

/// Wraps the connection an HTTP/2 server reads from, parsing every frame
/// that flows by.
pub(crate) struct FrameInterceptor<IO> {
    io: IO,
    state: Arc<InterceptState>,
    buffer: Vec<u8>,
    offset: usize,
    started: bool,
}

impl<IO> FrameInterceptor<IO> {
    pub(crate) fn new(io: IO) -> Self {
        FrameInterceptor {
            io,
            state: Arc::new(InterceptState::default()),
            buffer: FRAME_BUFFERS.acquire(),
            offset: 0,
            started: false,
        }
    }

    /// Shared handle to the captured streams.
    pub(crate) fn state(&self) -> Arc<InterceptState> {
        self.state.clone()
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.process_frames();
    }

    fn process_frames(&mut self) {
        if !self.started {
            self.find_start();
            if !self.started {
                return;
            }
        }

        loop {
            let available = self.buffer.len() - self.offset;
            if available < 9 {
                break;
            }

            let header = &self.buffer[self.offset..self.offset + 9];
            let length =
                ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
            let frame_type = header[3];
            let flags = header[4];
            let stream_id = (u32::from_be_bytes([header[5], header[6], header[7], header[8]]))
                & 0x7fff_ffff;

            // Implausible frames mean the scan is misaligned; slide one byte
            // and retry.
            if length > MAX_FRAME_LEN || frame_type > MAX_FRAME_TYPE {
                self.offset += 1;
                continue;
            }

            let total = 9 + length;
            if available < total {
                break;
            }

            let payload_start = self.offset + 9;
            let payload: &[u8] = &self.buffer[payload_start..payload_start + length];
            route_frame(&self.state, frame_type, flags, stream_id, payload);

            self.offset += total;

            if self.offset > COMPACT_THRESHOLD {
                self.buffer.drain(..self.offset);
                self.offset = 0;
            }
        }
    }

    fn find_start(&mut self) {
        if let Some(pos) = self
            .buffer
            .windows(PREFACE.len())
            .position(|window| window == PREFACE)
        {
            self.offset = pos + PREFACE.len();
            self.started = true;
            return;
        }

        // No preface (it may have been consumed elsewhere): sync on the
        // first plausible SETTINGS frame instead.
        for i in 0..self.buffer.len().saturating_sub(8) {
            if self.buffer[i + 3] == FRAME_SETTINGS {
                let length = ((self.buffer[i] as usize) << 16)
                    | ((self.buffer[i + 1] as usize) << 8)
                    | self.buffer[i + 2] as usize;
                if length <= 1024 && length % 6 == 0 {
                    self.offset = i;
                    self.started = true;
                    return;
                }
            }
        }
    }
}

fn route_frame(state: &InterceptState, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    match frame_type {
        FRAME_HEADERS => process_headers_frame(state, stream_id, flags, payload),
        FRAME_CONTINUATION => process_continuation_frame(state, stream_id, flags, payload),
        FRAME_DATA => process_data_frame(state, stream_id, flags, payload),
        FRAME_SETTINGS => process_settings_frame(flags, payload),
        FRAME_WINDOW_UPDATE => process_window_update_frame(payload),
        _ => {}
    }
}

fn process_headers_frame(state: &InterceptState, stream_id: u32, flags: u8, payload: &[u8]) {
    let mut block = payload;
    let mut pad_len = 0usize;

    if flags & FLAG_PADDED != 0 {
        if block.is_empty() {
            return;
        }
        pad_len = block[0] as usize;
        block = &block[1..];
    }
    if flags & FLAG_PRIORITY != 0 {
        if block.len() < 5 {
            return;
        }
        block = &block[5..];
    }
    if pad_len > block.len() {
        return;
    }
    block = &block[..block.len() - pad_len];

    if block.is_empty() {
        return;
    }

    if let Some(fields) = decode_header_block(block) {
        state.append_headers(stream_id, fields, flags & FLAG_END_HEADERS != 0);
    }
}

fn process_continuation_frame(state: &InterceptState, stream_id: u32, flags: u8, payload: &[u8]) {
    if let Some(fields) = decode_header_block(payload) {
        state.append_headers(stream_id, fields, flags & FLAG_END_HEADERS != 0);
    }
}

fn process_data_frame(state: &InterceptState, stream_id: u32, flags: u8, payload: &[u8]) {
    let mut data = payload;
    if flags & FLAG_PADDED != 0 {
        if data.is_empty() {
            return;
        }
        let pad_len = data[0] as usize;
        data = &data[1..];
        if pad_len > data.len() {
            return;
        }
        data = &data[..data.len() - pad_len];
    }
    state.append_data(stream_id, data);
}

// Parsed for completeness; the settings themselves do not matter here.
fn process_settings_frame(flags: u8, payload: &[u8]) {
    if flags & FLAG_ACK != 0 {
        return;
    }
    for entry in payload.chunks_exact(6) {
        let _id = u16::from_be_bytes([entry[0], entry[1]]);
        let _value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
    }
}

fn process_window_update_frame(payload: &[u8]) {
    if payload.len() >= 4 {
        let _increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    }
}

fn decode_header_block(block: &[u8]) -> Option<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut decoder = HPACK_DECODERS.acquire();
    let result = decoder.decode(block);
    HPACK_DECODERS.release(decoder);

    match result {
        Ok(fields) => Some(fields),
        Err(err) => {
            log::debug!("failed to decode HPACK header block: {err:?}");
            None
        }
    }
}

impl<IO> Drop for FrameInterceptor<IO> {
    fn drop(&mut self) {
        FRAME_BUFFERS.release(std::mem::take(&mut self.buffer));
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for FrameInterceptor<IO> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.io).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let filled = buf.filled().len();
            if filled > before {
                let read: Vec<u8> = buf.filled()[before..].to_vec();
                this.ingest(&read);
            }
        }
        poll
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for FrameInterceptor<IO> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn frame(frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = payload.len() as u32;
        out.extend_from_slice(&len.to_be_bytes()[1..]);
        out.push(frame_type);
        out.push(flags);
        out.extend_from_slice(&stream_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn encode_headers(fields: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut encoder = hpack::Encoder::new();
        encoder.encode(fields.iter().copied())
    }

    async fn drive<F>(wire: Vec<u8>, check: F)
    where
        F: FnOnce(Arc<InterceptState>),
    {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let mut interceptor = FrameInterceptor::new(server);
        let state = interceptor.state();

        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();

        let mut sink = Vec::new();
        interceptor.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink, wire);

        check(state);
    }

    #[tokio::test]
    async fn captures_headers_with_original_casing_and_order() {
        let block = encode_headers(&[
            (b":method", b"GET"),
            (b":path", b"/api"),
            (b"X-Custom-Header", b"one"),
            (b"accept", b"*/*"),
        ]);

        let mut wire = PREFACE.to_vec();
        wire.extend(frame(FRAME_SETTINGS, 0, 0, &[]));
        wire.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));

        drive(wire, |state| {
            let headers = state.stream_headers(1);
            assert_eq!(headers.keys(), [":method", ":path", "X-Custom-Header", "accept"]);
            assert_eq!(headers.get_ignore_case("x-custom-header").unwrap(), "one");
        })
        .await;
    }

    #[tokio::test]
    async fn headers_callback_fires_on_end_headers() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let block = encode_headers(&[(b":method", b"POST")]);
        let mut wire = PREFACE.to_vec();
        wire.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 7, &block));

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut interceptor = FrameInterceptor::new(server);

        let seen = Arc::new(AtomicU32::new(0));
        let seen_in_callback = seen.clone();
        interceptor.state().set_headers_callback(move |stream_id, headers| {
            assert_eq!(headers.keys(), [":method"]);
            seen_in_callback.store(stream_id, Ordering::SeqCst);
        });

        client.write_all(&wire).await.unwrap();
        client.shutdown().await.unwrap();
        let mut sink = Vec::new();
        interceptor.read_to_end(&mut sink).await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn continuation_extends_the_header_block() {
        let first = encode_headers(&[(b":method", b"GET")]);
        let second = encode_headers(&[(b"x-later", b"yes")]);

        let mut wire = PREFACE.to_vec();
        wire.extend(frame(FRAME_HEADERS, 0, 3, &first));
        wire.extend(frame(FRAME_CONTINUATION, FLAG_END_HEADERS, 3, &second));

        drive(wire, |state| {
            let headers = state.stream_headers(3);
            assert_eq!(headers.keys(), [":method", "x-later"]);
        })
        .await;
    }

    #[tokio::test]
    async fn data_frames_accumulate_with_padding_stripped() {
        let mut padded = vec![2u8]; // pad length
        padded.extend_from_slice(b"hello");
        padded.extend_from_slice(&[0, 0]); // padding

        let mut wire = PREFACE.to_vec();
        wire.extend(frame(FRAME_DATA, FLAG_PADDED, 5, &padded));
        wire.extend(frame(FRAME_DATA, 0, 5, b" world"));

        drive(wire, |state| {
            assert_eq!(state.stream_data(5), b"hello world");
        })
        .await;
    }

    #[tokio::test]
    async fn padded_priority_headers_frame() {
        let block = encode_headers(&[(b":path", b"/padded")]);
        let mut payload = vec![3u8]; // pad length
        payload.extend_from_slice(&[0, 0, 0, 1, 16]); // stream dependency + weight
        payload.extend_from_slice(&block);
        payload.extend_from_slice(&[0, 0, 0]); // padding

        let mut wire = PREFACE.to_vec();
        wire.extend(frame(
            FRAME_HEADERS,
            FLAG_END_HEADERS | FLAG_PADDED | FLAG_PRIORITY,
            9,
            &payload,
        ));

        drive(wire, |state| {
            let headers = state.stream_headers(9);
            assert_eq!(headers.keys(), [":path"]);
        })
        .await;
    }

    #[tokio::test]
    async fn syncs_on_settings_without_preface() {
        let block = encode_headers(&[(b":method", b"GET")]);
        let mut wire = frame(FRAME_SETTINGS, 0, 0, &[0, 3, 0, 0, 0, 100]);
        wire.extend(frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));

        drive(wire, |state| {
            assert_eq!(state.stream_headers(1).keys(), [":method"]);
        })
        .await;
    }

    #[tokio::test]
    async fn cleanup_forgets_the_stream() {
        let mut wire = PREFACE.to_vec();
        wire.extend(frame(FRAME_DATA, 0, 11, b"payload"));

        drive(wire, |state| {
            assert_eq!(state.stream_data(11), b"payload");
            state.cleanup_stream(11);
            assert!(state.stream_data(11).is_empty());
        })
        .await;
    }
}

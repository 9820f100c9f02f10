//! Captured sessions: one request/response exchange or one WebSocket
//! conversation, plus the structural diff, cURL export, and replay
//! operations over them.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::headers::{parse_cookie_header, OrderedHeaderMap};
use crate::tls::TlsProfile;

pub(crate) const PROTOCOL_HTTP10: &str = "HTTP/1.0";
pub(crate) const PROTOCOL_HTTP11: &str = "HTTP/1.1";
pub(crate) const PROTOCOL_HTTP2: &str = "HTTP/2";

/// Close code recorded when a Close frame carries no status.
pub const CLOSE_NO_STATUS_RECEIVED: u16 = 1005;

/// What kind of conversation a session captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// A plain request/response exchange.
    Http,
    /// An upgraded WebSocket conversation.
    WebSocket,
}

/// Lifecycle of a spliced WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl WebSocketState {
    pub(crate) fn label(self) -> &'static str {
        match self {
            WebSocketState::Connecting => "connecting",
            WebSocketState::Open => "open",
            WebSocketState::Closing => "closing",
            WebSocketState::Closed => "closed",
            WebSocketState::Failed => "failed",
        }
    }
}

/// Which peer a WebSocket frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Origin → client.
    Inbound,
    /// Client → origin.
    Outbound,
}

impl MessageDirection {
    pub(crate) fn label(self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }
}

/// Semantic type of a WebSocket frame, classified from its opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Continuation,
}

impl MessageKind {
    /// Classifies a raw opcode.
    pub fn from_opcode(opcode: u8) -> Self {
        match opcode {
            0x1 => MessageKind::Text,
            0x2 => MessageKind::Binary,
            0x8 => MessageKind::Close,
            0x9 => MessageKind::Ping,
            0xa => MessageKind::Pong,
            _ => MessageKind::Continuation,
        }
    }
}

/// A captured request as it appeared on the wire.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    /// Absolute URL of the request target.
    pub url: String,
    /// Header fields in original order and casing.
    pub headers: OrderedHeaderMap,
    /// Request cookies, last-wins on duplicate names.
    pub cookies: HashMap<String, String>,
    pub body: Bytes,
    pub content_type: String,
    /// True when the request asks to switch to WebSocket.
    pub is_upgrade: bool,
}

impl RequestRecord {
    /// Builds a record from parsed parts, deriving cookies, content type and
    /// the upgrade flag from the headers.
    pub fn new(method: &str, url: &str, headers: OrderedHeaderMap, body: Bytes) -> Self {
        let mut cookies = HashMap::new();
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("cookie") {
                for line in value.lines() {
                    cookies.extend(parse_cookie_header(line));
                }
            }
        }

        let content_type = headers.get_ignore_case("content-type").unwrap_or_default();
        let is_upgrade = is_websocket_upgrade(method, &headers);

        RequestRecord {
            method: method.to_owned(),
            url: url.to_owned(),
            headers,
            cookies,
            body,
            content_type,
            is_upgrade,
        }
    }

    pub(crate) fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A captured response, body decoded for readability.
#[derive(Debug, Clone, Default)]
pub struct ResponseRecord {
    pub status_code: u16,
    pub status_text: String,
    pub headers: OrderedHeaderMap,
    pub cookies: HashMap<String, String>,
    /// Decompressed (and JSON pretty-printed) body.
    pub body: String,
    pub content_type: String,
}

/// Running message statistics for one WebSocket session.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageStats {
    pub total_messages: u64,
    pub inbound_messages: u64,
    pub outbound_messages: u64,
    pub text_messages: u64,
    pub binary_messages: u64,
    pub control_frames: u64,
    pub total_bytes: u64,
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
}

/// One logged WebSocket frame.
#[derive(Debug, Clone)]
pub struct WebSocketMessage {
    pub id: String,
    pub timestamp: SystemTime,
    pub direction: MessageDirection,
    pub kind: MessageKind,
    /// Raw opcode from the frame header.
    pub opcode: u8,
    /// Payload after unmasking.
    pub payload: Vec<u8>,
    /// UTF-8 decoding of the payload for Text frames.
    pub payload_text: Option<String>,
    pub is_masked: bool,
    /// True when the frame's FIN bit was clear.
    pub is_fragment: bool,
    pub size: usize,
}

/// Everything captured about one WebSocket conversation.
#[derive(Debug, Clone)]
pub struct WebSocketRecord {
    pub state: WebSocketState,
    pub connected_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
    pub connection_duration: Duration,
    /// Snapshot of the upgrade request (not an alias of the session's).
    pub upgrade_request: Option<RequestRecord>,
    pub upgrade_response: Option<ResponseRecord>,
    pub subprotocol: String,
    pub extensions: Vec<String>,
    pub close_code: u16,
    pub close_reason: String,
    pub messages: Vec<WebSocketMessage>,
    pub stats: MessageStats,
}

impl WebSocketRecord {
    fn new(upgrade_request: RequestRecord) -> Self {
        let subprotocol = upgrade_request
            .headers
            .get_ignore_case("sec-websocket-protocol")
            .unwrap_or_default();
        let extensions = upgrade_request
            .headers
            .get_ignore_case("sec-websocket-extensions")
            .map(|line| {
                line.split(',')
                    .map(|ext| ext.trim().to_owned())
                    .filter(|ext| !ext.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        WebSocketRecord {
            state: WebSocketState::Connecting,
            connected_at: SystemTime::now(),
            disconnected_at: None,
            connection_duration: Duration::ZERO,
            upgrade_request: Some(upgrade_request),
            upgrade_response: None,
            subprotocol,
            extensions,
            close_code: 0,
            close_reason: String::new(),
            messages: Vec::new(),
            stats: MessageStats::default(),
        }
    }

    /// Appends a logged message and folds it into the statistics.
    pub fn record_message(&mut self, message: WebSocketMessage) {
        let stats = &mut self.stats;
        stats.total_messages += 1;
        match message.kind {
            MessageKind::Text => stats.text_messages += 1,
            MessageKind::Binary => stats.binary_messages += 1,
            _ => {}
        }
        match message.direction {
            MessageDirection::Inbound => {
                stats.inbound_messages += 1;
                stats.inbound_bytes += message.size as u64;
            }
            MessageDirection::Outbound => {
                stats.outbound_messages += 1;
                stats.outbound_bytes += message.size as u64;
            }
        }
        stats.total_bytes += message.size as u64;
        if (0x8..=0xa).contains(&message.opcode) {
            stats.control_frames += 1;
        }

        self.messages.push(message);
    }
}

/// One captured client↔origin interaction.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique id, a v4 UUID.
    pub id: String,
    /// Wall-clock creation time.
    pub timestamp: SystemTime,
    /// TLS parameters observed on the wire, when intercepted.
    pub tls: Option<TlsProfile>,
    pub request: RequestRecord,
    pub response: Option<ResponseRecord>,
    /// Time from capture to completed exchange.
    pub duration: Duration,
    /// Error that terminated the exchange, if any.
    pub error: Option<String>,
    /// HTTP protocol label: `HTTP/1.0`, `HTTP/1.1` or `HTTP/2`.
    pub protocol: String,
    pub kind: SessionKind,
    pub websocket: Option<WebSocketRecord>,
}

impl Session {
    /// Creates a session for `request`. Upgrade requests become WebSocket
    /// sessions with an initialized conversation record.
    pub fn new(request: RequestRecord, tls: Option<TlsProfile>, protocol: &str) -> Self {
        let (kind, websocket) = if request.is_upgrade {
            (SessionKind::WebSocket, Some(WebSocketRecord::new(request.clone())))
        } else {
            (SessionKind::Http, None)
        };

        Session {
            id: Uuid::new_v4().to_string(),
            timestamp: SystemTime::now(),
            tls,
            request,
            response: None,
            duration: Duration::ZERO,
            error: None,
            protocol: protocol.to_owned(),
            kind,
            websocket,
        }
    }

    /// Milliseconds since this session was captured.
    pub(crate) fn elapsed(&self) -> Duration {
        self.timestamp.elapsed().unwrap_or(Duration::ZERO)
    }

    /// True when both requests would forward identically: same method, URL,
    /// content type, body, and header/cookie values. Holds exactly when
    /// [`Session::request_diff`] reports no differences.
    pub fn equal_request(&self, other: &Session) -> bool {
        !self.request_diff(other).has_diffs
    }

    /// Field-by-field comparison of the two requests.
    pub fn request_diff(&self, other: &Session) -> RequestDiff {
        let a = &self.request;
        let b = &other.request;

        let method = FieldDiff::compare(&a.method, &b.method);
        let url = FieldDiff::compare(&a.url, &b.url);
        let body = FieldDiff::compare(&a.body_text(), &b.body_text());
        let content_type = FieldDiff::compare(&a.content_type, &b.content_type);
        let headers = MapDiff::compare_headers(&a.headers, &b.headers);
        let cookies = MapDiff::compare_cookies(&a.cookies, &b.cookies);

        let has_diffs = method.changed
            || url.changed
            || body.changed
            || content_type.changed
            || headers.changed
            || cookies.changed;

        RequestDiff {
            method,
            url,
            body,
            content_type,
            headers,
            cookies,
            has_diffs,
        }
    }

    /// Renders the request as a cURL command line: method, URL, headers in
    /// original order (`Host` and `Content-Length` skipped), and the body.
    pub fn to_curl(&self) -> String {
        if self.kind == SessionKind::WebSocket {
            return "WebSocket sessions cannot be converted to cURL commands.".to_owned();
        }

        let mut command = format!("curl -X {} '{}'", self.request.method, self.request.url);

        for (key, value) in self.request.headers.iter() {
            if key.eq_ignore_ascii_case("host") || key.eq_ignore_ascii_case("content-length") {
                continue;
            }
            command.push_str(&format!(" -H '{}: {}'", key, value.as_joined()));
        }

        if !self.request.body.is_empty() {
            command.push_str(&format!(" -d '{}'", self.request.body_text()));
        }

        command
    }

    /// Re-sends this request through the proxy at `localhost:proxy_port`,
    /// writing the raw request bytes so the original header order reaches
    /// the wire unchanged. HTTPS targets tunnel via CONNECT with
    /// certificate verification disabled.
    pub async fn replay(&self, proxy_port: u16) -> Result<()> {
        if self.kind == SessionKind::WebSocket {
            return Err(Error::protocol("WebSocket sessions cannot be replayed"));
        }

        let url = url::Url::parse(&self.request.url)
            .map_err(|e| Error::protocol(e).with_context(self.request.url.clone()))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::protocol("request URL has no host"))?
            .to_owned();

        let replay = tokio::time::timeout(
            crate::config::UPSTREAM_TIMEOUT,
            self.replay_inner(proxy_port, &url, &host),
        );
        match replay.await {
            Ok(result) => result,
            Err(_) => Err(Error::upstream(crate::error::TimedOut)),
        }
    }

    async fn replay_inner(&self, proxy_port: u16, url: &url::Url, host: &str) -> Result<()> {
        let stream = TcpStream::connect(("127.0.0.1", proxy_port))
            .await
            .map_err(Error::upstream)?;

        if url.scheme() == "https" {
            let port = url.port().unwrap_or(443);
            let mut stream = stream;

            let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
            stream
                .write_all(connect.as_bytes())
                .await
                .map_err(Error::upstream)?;
            read_until_head_end(&mut stream).await?;

            let config = crate::tls::insecure_client_config();
            let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
            let server_name =
                rustls::ServerName::try_from(host).map_err(|e| Error::protocol(e.to_string()))?;
            let mut tls = connector
                .connect(server_name, stream)
                .await
                .map_err(Error::upstream)?;

            let target = origin_form(url);
            tls.write_all(&self.raw_request_bytes(&target))
                .await
                .map_err(Error::upstream)?;
            tls.flush().await.map_err(Error::upstream)?;

            let mut response = [0u8; 4096];
            let _ = tls.read(&mut response).await;
        } else {
            let mut stream = stream;
            // Absolute-form target, the way proxies expect plaintext requests.
            stream
                .write_all(&self.raw_request_bytes(self.request.url.as_str()))
                .await
                .map_err(Error::upstream)?;
            stream.flush().await.map_err(Error::upstream)?;

            let mut response = [0u8; 4096];
            let _ = stream.read(&mut response).await;
        }

        Ok(())
    }

    fn raw_request_bytes(&self, target: &str) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.request.method, target).as_bytes());

        let mut saw_host = false;
        let mut saw_length = false;
        for (key, value) in self.request.headers.iter() {
            if key.eq_ignore_ascii_case("host") {
                saw_host = true;
            }
            if key.eq_ignore_ascii_case("content-length") {
                saw_length = true;
            }
            for line in value.lines() {
                raw.extend_from_slice(format!("{key}: {line}\r\n").as_bytes());
            }
        }

        if !saw_host {
            if let Ok(url) = url::Url::parse(&self.request.url) {
                if let Some(host) = url.host_str() {
                    raw.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
                }
            }
        }
        if !saw_length && !self.request.body.is_empty() {
            raw.extend_from_slice(
                format!("Content-Length: {}\r\n", self.request.body.len()).as_bytes(),
            );
        }

        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(&self.request.body);
        raw
    }
}

async fn read_until_head_end(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.map_err(Error::upstream)?;
        if n == 0 {
            return Err(Error::upstream("connection closed during CONNECT"));
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(Error::protocol("CONNECT response head too long"));
        }
    }
    Ok(head)
}

fn origin_form(url: &url::Url) -> String {
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Checks the four WebSocket upgrade requirements on a request head.
pub(crate) fn is_websocket_upgrade(method: &str, headers: &OrderedHeaderMap) -> bool {
    if method != "GET" {
        return false;
    }
    let upgrade = headers.get_ignore_case("upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return false;
    }
    if headers
        .get_ignore_case("sec-websocket-version")
        .unwrap_or_default()
        != "13"
    {
        return false;
    }
    !headers
        .get_ignore_case("sec-websocket-key")
        .unwrap_or_default()
        .is_empty()
}

/// Difference between two scalar request fields.
#[derive(Debug, Clone, Default)]
pub struct FieldDiff {
    pub original: String,
    pub other: String,
    pub changed: bool,
}

impl FieldDiff {
    fn compare(original: &str, other: &str) -> Self {
        FieldDiff {
            original: original.to_owned(),
            other: other.to_owned(),
            changed: original != other,
        }
    }
}

/// Added/removed/modified keys between two keyed collections.
#[derive(Debug, Clone, Default)]
pub struct MapDiff {
    /// Present only in the other request.
    pub added: HashMap<String, String>,
    /// Present only in the original request.
    pub removed: HashMap<String, String>,
    /// Present in both with different values.
    pub modified: HashMap<String, FieldDiff>,
    pub changed: bool,
}

impl MapDiff {
    fn compare_headers(original: &OrderedHeaderMap, other: &OrderedHeaderMap) -> Self {
        let mut diff = MapDiff::default();

        for key in original.keys() {
            let original_value = original.get(key).map(|v| v.as_joined()).unwrap_or_default();
            match other.get(key) {
                None => {
                    diff.removed.insert(key.clone(), original_value);
                }
                Some(other_value) => {
                    let other_value = other_value.as_joined();
                    if original_value != other_value {
                        diff.modified.insert(
                            key.clone(),
                            FieldDiff {
                                original: original_value,
                                other: other_value,
                                changed: true,
                            },
                        );
                    }
                }
            }
        }
        for key in other.keys() {
            if original.get(key).is_none() {
                let value = other.get(key).map(|v| v.as_joined()).unwrap_or_default();
                diff.added.insert(key.clone(), value);
            }
        }

        diff.changed =
            !diff.added.is_empty() || !diff.removed.is_empty() || !diff.modified.is_empty();
        diff
    }

    fn compare_cookies(
        original: &HashMap<String, String>,
        other: &HashMap<String, String>,
    ) -> Self {
        let mut diff = MapDiff::default();

        for (key, original_value) in original {
            match other.get(key) {
                None => {
                    diff.removed.insert(key.clone(), original_value.clone());
                }
                Some(other_value) if other_value != original_value => {
                    diff.modified.insert(
                        key.clone(),
                        FieldDiff {
                            original: original_value.clone(),
                            other: other_value.clone(),
                            changed: true,
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for (key, value) in other {
            if !original.contains_key(key) {
                diff.added.insert(key.clone(), value.clone());
            }
        }

        diff.changed =
            !diff.added.is_empty() || !diff.removed.is_empty() || !diff.modified.is_empty();
        diff
    }
}

/// The full structural comparison of two requests.
#[derive(Debug, Clone)]
pub struct RequestDiff {
    pub method: FieldDiff,
    pub url: FieldDiff,
    pub body: FieldDiff,
    pub content_type: FieldDiff,
    pub headers: MapDiff,
    pub cookies: MapDiff,
    /// OR of every sub-flag.
    pub has_diffs: bool,
}

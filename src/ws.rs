//! WebSocket splicing.
//!
//! After a successful upgrade the proxy sits between client and origin
//! reading raw RFC 6455 frames in both directions: every frame is parsed,
//! unmasked, logged onto the session, and re-emitted to the peer. Outbound
//! frames that arrive unmasked get a fresh mask on the way out, since
//! client-to-server frames must be masked.

use std::sync::Arc;
use std::time::SystemTime;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::headers::parse_raw_head;
use crate::http1::ParsedRequest;
use crate::proxy::ProxyContext;
use crate::session::{
    MessageDirection, MessageKind, ResponseRecord, WebSocketMessage, WebSocketState,
    CLOSE_NO_STATUS_RECEIVED,
};
use crate::store::SessionHandle;
use crate::stream::PrefixedStream;

/// Frames larger than this are treated as malformed, which tears the
/// connection down.
const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

const OPCODE_CLOSE: u8 = 0x8;

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// Handles an accepted WebSocket upgrade: replays the captured request to
/// the origin, forwards the handshake response, and on 101 splices frames
/// until either side closes.
pub(crate) async fn handle_upgrade<IO>(
    ctx: &ProxyContext,
    client: IO,
    leftover: Vec<u8>,
    request: &ParsedRequest,
    session: SessionHandle,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut client: Box<dyn Io> = Box::new(PrefixedStream::new(client, leftover.into()));

    let http_url = {
        let mut session = session.lock().expect("session poisoned");

        let http_url = session.request.url.clone();
        let ws_url = websocket_url(&http_url);
        session.request.url = ws_url.clone();
        if let Some(ws) = session.websocket.as_mut() {
            if let Some(upgrade) = ws.upgrade_request.as_mut() {
                upgrade.url = ws_url;
            }
        }
        http_url
    };

    let (host, port) = match upgrade_target(&http_url) {
        Ok(target) => target,
        Err(err) => return fail(&session, err),
    };
    let use_tls = port == 443;
    let ws_url = websocket_url(&http_url);

    log::debug!("splicing websocket to {ws_url}");

    let origin = match dial_origin(ctx, &host, port, use_tls).await {
        Ok(origin) => origin,
        Err(err) => return fail(&session, err),
    };
    let mut origin = origin;

    // Replay the captured upgrade request byte-for-byte.
    if let Err(err) = origin.write_all(&request.raw_head).await {
        return fail(&session, Error::upstream(err));
    }

    // Read the origin's handshake response head, forward it verbatim.
    let (head, extra) = match read_response_head(&mut origin).await {
        Ok(parts) => parts,
        Err(err) => return fail(&session, err),
    };

    let response = match parse_response_head(&head) {
        Ok(response) => response,
        Err(err) => return fail(&session, err),
    };
    let status = response.status_code;
    {
        let mut session = session.lock().expect("session poisoned");
        if let Some(ws) = session.websocket.as_mut() {
            ws.upgrade_response = Some(response.clone());
            if let Some(subprotocol) = response.headers.get_ignore_case("sec-websocket-protocol") {
                ws.subprotocol = subprotocol;
            }
        }
        session.response = Some(response);
    }

    if let Err(err) = client.write_all(&head).await {
        return fail(&session, Error::internal(err));
    }

    if status != 101 {
        let mut session = session.lock().expect("session poisoned");
        if let Some(ws) = session.websocket.as_mut() {
            ws.state = WebSocketState::Failed;
        }
        session.duration = session.elapsed();
        ctx.log_response(&session);
        return Ok(());
    }

    {
        let mut session = session.lock().expect("session poisoned");
        if let Some(ws) = session.websocket.as_mut() {
            ws.state = WebSocketState::Open;
            ws.connected_at = SystemTime::now();
        }
        ctx.log_response(&session);
    }

    // Frames the origin sent right behind its handshake belong to the
    // splice.
    let origin: Box<dyn Io> = Box::new(PrefixedStream::new(origin, extra.into()));

    splice(client, origin, &session).await;

    {
        let mut session = session.lock().expect("session poisoned");
        let now = SystemTime::now();
        if let Some(ws) = session.websocket.as_mut() {
            ws.state = WebSocketState::Closed;
            ws.disconnected_at = Some(now);
            ws.connection_duration = now
                .duration_since(ws.connected_at)
                .unwrap_or_default();
        }
        session.duration = session.elapsed();
    }

    Ok(())
}

/// Runs the two forwarding loops until the first one finishes, then tears
/// both connections down.
async fn splice(client: Box<dyn Io>, origin: Box<dyn Io>, session: &SessionHandle) {
    let (client_read, client_write) = tokio::io::split(client);
    let (origin_read, origin_write) = tokio::io::split(origin);

    let (done, mut first_done) = mpsc::channel::<()>(2);

    let outbound_session = session.clone();
    let outbound_done = done.clone();
    let outbound = tokio::spawn(async move {
        let result = forward_frames(
            client_read,
            origin_write,
            outbound_session,
            MessageDirection::Outbound,
        )
        .await;
        if let Err(err) = result {
            log::debug!("outbound websocket loop ended: {err}");
        }
        let _ = outbound_done.send(()).await;
    });

    let inbound_session = session.clone();
    let inbound = tokio::spawn(async move {
        let result = forward_frames(
            origin_read,
            client_write,
            inbound_session,
            MessageDirection::Inbound,
        )
        .await;
        if let Err(err) = result {
            log::debug!("inbound websocket loop ended: {err}");
        }
        let _ = done.send(()).await;
    });

    // First loop to finish ends the conversation; aborting the other drops
    // its halves, which closes both sockets.
    let _ = first_done.recv().await;
    outbound.abort();
    inbound.abort();
    let _ = outbound.await;
    let _ = inbound.await;
}

/// Marks the session's websocket as closing. Kept as a plain (non-async)
/// function so the `MutexGuard` never lives across an `.await` point.
fn mark_closing(session: &SessionHandle, code: u16, reason: String) {
    let mut session = session.lock().expect("session poisoned");
    if let Some(ws) = session.websocket.as_mut() {
        ws.state = WebSocketState::Closing;
        ws.close_code = code;
        ws.close_reason = reason;
    }
}

/// Reads frames from `from`, logs each onto the session, and re-emits them
/// to `to`. Returns on a Close frame, end-of-stream, or a malformed frame.
async fn forward_frames<R, W>(
    mut from: R,
    mut to: W,
    session: SessionHandle,
    direction: MessageDirection,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let mut header = [0u8; 2];
        match from.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(Error::protocol(e)),
        }

        let fin = header[0] & 0x80 != 0;
        let opcode = header[0] & 0x0f;
        let masked = header[1] & 0x80 != 0;
        let mut header_bytes = header.to_vec();

        let mut payload_len = u64::from(header[1] & 0x7f);
        if payload_len == 126 {
            let mut ext = [0u8; 2];
            from.read_exact(&mut ext).await.map_err(Error::protocol)?;
            payload_len = u64::from(u16::from_be_bytes(ext));
            header_bytes.extend_from_slice(&ext);
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            from.read_exact(&mut ext).await.map_err(Error::protocol)?;
            payload_len = u64::from_be_bytes(ext);
            header_bytes.extend_from_slice(&ext);
        }

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(Error::protocol("websocket frame too large"));
        }

        let mut mask_key = [0u8; 4];
        let has_mask = masked;
        if has_mask {
            from.read_exact(&mut mask_key).await.map_err(Error::protocol)?;
        }

        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 {
            from.read_exact(&mut payload).await.map_err(Error::protocol)?;
        }

        // Keep the masked bytes for re-emission; log the clear payload.
        let wire_payload = payload.clone();
        if has_mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask_key[i % 4];
            }
        }

        let kind = MessageKind::from_opcode(opcode);
        let message = WebSocketMessage {
            id: Uuid::new_v4().to_string(),
            timestamp: SystemTime::now(),
            direction,
            kind,
            opcode,
            payload_text: match kind {
                MessageKind::Text => Some(String::from_utf8_lossy(&payload).into_owned()),
                _ => None,
            },
            payload: payload.clone(),
            is_masked: has_mask,
            is_fragment: !fin,
            size: payload_len as usize,
        };

        {
            let mut session = session.lock().expect("session poisoned");
            if let Some(ws) = session.websocket.as_mut() {
                ws.record_message(message);
            }
        }

        if opcode == OPCODE_CLOSE {
            let (code, reason) = parse_close_payload(&payload);
            mark_closing(&session, code, reason);

            emit_frame(
                &mut to,
                &mut header_bytes,
                has_mask.then_some(mask_key),
                &wire_payload,
                &payload,
                direction,
            )
            .await?;
            return Ok(());
        }

        emit_frame(
            &mut to,
            &mut header_bytes,
            has_mask.then_some(mask_key),
            &wire_payload,
            &payload,
            direction,
        )
        .await?;
    }
}

/// Writes one frame to the peer. Outbound frames without a mask get a fresh
/// random one (the mask bit is set accordingly); everything else is
/// forwarded verbatim.
async fn emit_frame<W: AsyncWrite + Unpin>(
    to: &mut W,
    header_bytes: &mut [u8],
    mask_key: Option<[u8; 4]>,
    wire_payload: &[u8],
    clear_payload: &[u8],
    direction: MessageDirection,
) -> Result<()> {
    match (direction, mask_key) {
        (MessageDirection::Outbound, None) => {
            let fresh: [u8; 4] = rand::thread_rng().gen();
            header_bytes[1] |= 0x80;
            to.write_all(header_bytes).await.map_err(Error::internal)?;
            to.write_all(&fresh).await.map_err(Error::internal)?;

            let mut masked = clear_payload.to_vec();
            for (i, byte) in masked.iter_mut().enumerate() {
                *byte ^= fresh[i % 4];
            }
            to.write_all(&masked).await.map_err(Error::internal)?;
        }
        (_, Some(key)) => {
            to.write_all(header_bytes).await.map_err(Error::internal)?;
            to.write_all(&key).await.map_err(Error::internal)?;
            to.write_all(wire_payload).await.map_err(Error::internal)?;
        }
        (MessageDirection::Inbound, None) => {
            to.write_all(header_bytes).await.map_err(Error::internal)?;
            to.write_all(wire_payload).await.map_err(Error::internal)?;
        }
    }
    to.flush().await.map_err(Error::internal)
}

fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    } else {
        (CLOSE_NO_STATUS_RECEIVED, String::new())
    }
}

fn upgrade_target(http_url: &str) -> Result<(String, u16)> {
    let url = url::Url::parse(http_url)
        .map_err(|e| Error::protocol(e).with_context(http_url.to_owned()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::protocol("upgrade URL has no host"))?
        .to_owned();
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "https" { 443 } else { 80 });
    Ok((host, port))
}

fn websocket_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_owned()
    }
}

async fn dial_origin(
    ctx: &ProxyContext,
    host: &str,
    port: u16,
    use_tls: bool,
) -> Result<Box<dyn Io>> {
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(Error::upstream)?;

    if !use_tls {
        return Ok(Box::new(tcp));
    }

    let config = if ctx.config.insecure_upstream {
        crate::tls::insecure_client_config()
    } else {
        crate::tls::webpki_client_config()
    };
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name =
        rustls::ServerName::try_from(host).map_err(|e| Error::protocol(e.to_string()))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(Error::upstream)?;
    Ok(Box::new(tls))
}

/// Reads an HTTP response head off `io`, returning the head bytes and any
/// extra bytes read past it.
async fn read_response_head<IO: AsyncRead + Unpin>(io: &mut IO) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::new();
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head_len = pos + 4;
            let extra = buf.split_off(head_len);
            return Ok((buf, extra));
        }
        if buf.len() > 64 * 1024 {
            return Err(Error::protocol("handshake response head too large"));
        }

        let mut scratch = [0u8; 4096];
        let n = io.read(&mut scratch).await.map_err(Error::upstream)?;
        if n == 0 {
            return Err(Error::upstream("origin closed during handshake"));
        }
        buf.extend_from_slice(&scratch[..n]);
    }
}

fn parse_response_head(head: &[u8]) -> Result<ResponseRecord> {
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(Error::protocol("malformed handshake response")),
    }

    let status_code = response.code.unwrap_or(0);
    let status_text = response.reason.unwrap_or("").to_owned();
    let headers = parse_raw_head(head);
    let cookies = crate::headers::parse_cookie_pairs(
        headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("set-cookie"))
            .flat_map(|(_, value)| value.lines()),
    );
    let content_type = headers.get_ignore_case("content-type").unwrap_or_default();

    Ok(ResponseRecord {
        status_code,
        status_text,
        headers,
        cookies,
        body: String::new(),
        content_type,
    })
}

/// Marks the session failed with `err` and propagates it.
fn fail(session: &SessionHandle, err: Error) -> Result<()> {
    let mut session = session.lock().expect("session poisoned");
    if let Some(ws) = session.websocket.as_mut() {
        ws.state = WebSocketState::Failed;
    }
    session.error = Some(err.to_string());
    session.duration = session.elapsed();
    Err(err)
}

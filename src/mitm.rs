//! The CONNECT-tunnel interception driver.
//!
//! Once a CONNECT is hijacked the driver peeks the client's first TLS
//! record, mirrors its handshake parameters onto a synthesized server
//! config carrying a freshly minted leaf for the target host, replays the
//! peeked bytes into the TLS engine, and dispatches the decrypted stream by
//! negotiated ALPN: HTTP/1.1 served request-by-request, HTTP/2 through a
//! frame-capturing hyper server, WebSocket upgrades into the splicer.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::config::REQUEST_READ_TIMEOUT;
use crate::error::{Error, Result};
use crate::h2frames::FrameInterceptor;
use crate::headers::OrderedHeaderMap;
use crate::hello::looks_like_client_hello;
use crate::http1::{write_error_response, write_response, RequestReader};
use crate::session::{RequestRecord, Session, SessionKind, PROTOCOL_HTTP2};
use crate::stream::{PrefixedStream, ReplayStream, SingleConnIncoming};
use crate::tls::{TlsProfile, ALPN_H2};
use crate::upstream::forward_and_store;
use crate::proxy::ProxyContext;

const PEEK_LIMIT: usize = 4096;

/// Drives one hijacked CONNECT tunnel to completion. `prefix` holds any
/// bytes the client pipelined behind the CONNECT request.
pub(crate) async fn drive<IO>(
    ctx: ProxyContext,
    io: IO,
    prefix: Bytes,
    connect_target: String,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let host = strip_port(&connect_target);

    // Acquire the peeked ClientHello: either it was already buffered behind
    // the CONNECT, or one read on the raw connection fetches it.
    let mut io = PrefixedStream::new(io, prefix.clone());
    let hello = if looks_like_client_hello(&prefix) {
        // Consume the buffered copy so it is only ever replayed once.
        let mut consumed = vec![0u8; prefix.len()];
        io.read_exact(&mut consumed).await.map_err(Error::from)?;
        Bytes::from(consumed)
    } else {
        let mut buffer = vec![0u8; PEEK_LIMIT];
        let n = io.read(&mut buffer).await.map_err(Error::from)?;
        buffer.truncate(n);
        Bytes::from(buffer)
    };

    let profile = ctx.hello_cache.lookup_or_parse(&hello);

    let leaf = match ctx.authority.host_cert(&host) {
        Ok(leaf) => leaf,
        Err(err) => {
            log::error!("failed to mint certificate for {host}: {err}");
            let _ = write_error_response(&mut io, 500, "Internal Server Error").await;
            return Err(err);
        }
    };

    let server_config = profile
        .server_config(leaf.chain.clone(), leaf.key.clone())
        .map_err(Error::internal)?;

    // The TLS engine observes the original handshake stream unchanged.
    let replay = ReplayStream::new(io, hello);
    let acceptor = TlsAcceptor::from(Arc::new(server_config));
    let tls = acceptor.accept(replay).await.map_err(|e| {
        log::debug!("TLS handshake failed for {host}: {e}");
        Error::protocol(e)
    })?;

    let alpn = tls.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);

    let mut snapshot = (*profile).clone();
    snapshot.server_name = Some(host.clone());

    match alpn.as_deref() {
        Some(proto) if proto == ALPN_H2 => {
            serve_http2(ctx, tls, connect_target, snapshot).await
        }
        _ => serve_http1(ctx, tls, connect_target, snapshot).await,
    }
}

/// Serves decrypted HTTP/1.1 requests sequentially until the client closes,
/// a deadline passes, or the connection switches to WebSocket.
async fn serve_http1<IO>(
    ctx: ProxyContext,
    tls: IO,
    connect_target: String,
    profile: TlsProfile,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = RequestReader::new(tls);

    loop {
        let parsed = match tokio::time::timeout(REQUEST_READ_TIMEOUT, reader.next_request()).await
        {
            Err(_) => return Ok(()),
            Ok(Ok(None)) => return Ok(()),
            Ok(Ok(Some(parsed))) => parsed,
            Ok(Err(err)) => {
                log::debug!("failed to read tunneled request: {err}");
                return Err(err);
            }
        };

        let url = absolute_url(&connect_target, &parsed.target);
        let record = RequestRecord::new(
            &parsed.method,
            &url,
            parsed.ordered_headers.clone(),
            parsed.body.clone(),
        );
        let wants_close = parsed.wants_close();
        let session = Session::new(record, Some(profile.clone()), parsed.protocol_label());

        if session.kind == SessionKind::WebSocket {
            ctx.log_request(&session);
            let handle = ctx.store.store(session);
            let (io, leftover) = reader.into_parts();
            return crate::ws::handle_upgrade(&ctx, io, leftover, &parsed, handle).await;
        }

        match forward_and_store(&ctx, session).await {
            Ok(wire) => {
                let mut out = Vec::new();
                write_response(&mut out, wire.status, &wire.reason, &wire.headers, &wire.body)
                    .await?;
                reader.write_all(&out).await?;
            }
            Err(_) => {
                let mut out = Vec::new();
                write_error_response(&mut out, 502, "Bad Gateway").await?;
                reader.write_all(&out).await?;
                return Ok(());
            }
        }

        if wants_close {
            return Ok(());
        }
    }
}

/// Serves the tunnel as HTTP/2 behind the frame interceptor. The hyper
/// server reads through the interceptor, which captures original header
/// order per stream for the request handler to pick up.
async fn serve_http2<IO>(
    ctx: ProxyContext,
    tls: IO,
    connect_target: String,
    profile: TlsProfile,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let interceptor = FrameInterceptor::new(tls);
    let state = interceptor.state();

    let captured: Arc<Mutex<HashMap<u32, OrderedHeaderMap>>> = Arc::default();
    {
        let captured = captured.clone();
        state.set_headers_callback(move |_stream_id, headers| {
            // hyper's request handler cannot see the real stream id, so the
            // table is keyed by the pseudo id both sides can derive from
            // :path and :method.
            let path = headers.get_ignore_case(":path").unwrap_or_default();
            let path = path.split('?').next().unwrap_or_default();
            let method = headers.get_ignore_case(":method").unwrap_or_default();
            let key = pseudo_stream_id(path, &method);
            captured
                .lock()
                .expect("captured header table poisoned")
                .insert(key, headers);
        });
    }

    let make_service = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        let captured = captured.clone();
        let connect_target = connect_target.clone();
        let profile = profile.clone();

        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                handle_h2_request(
                    ctx.clone(),
                    captured.clone(),
                    connect_target.clone(),
                    profile.clone(),
                    request,
                )
            }))
        }
    });

    hyper::server::Server::builder(SingleConnIncoming::new(interceptor))
        .http2_only(true)
        .http2_max_concurrent_streams(250)
        .http2_max_frame_size(1024 * 1024)
        .serve(make_service)
        .await
        .map_err(Error::internal)
}

async fn handle_h2_request(
    ctx: ProxyContext,
    captured: Arc<Mutex<HashMap<u32, OrderedHeaderMap>>>,
    connect_target: String,
    profile: TlsProfile,
    request: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = request.method().to_string();
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_owned());
    let url = absolute_url(&connect_target, &target);

    // hyper does not expose the real stream id to the handler; a pseudo id
    // hashed from path+method links the request to its captured headers.
    // Identical concurrent requests can collide on it.
    let stream_id = pseudo_stream_id(request.uri().path(), &method);
    let ordered = captured
        .lock()
        .expect("captured header table poisoned")
        .remove(&stream_id)
        .unwrap_or_else(|| {
            let mut fallback = OrderedHeaderMap::new();
            for (name, value) in request.headers() {
                fallback.append(name.as_str(), value.to_str().unwrap_or_default());
            }
            fallback
        });

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(err) => {
            log::error!("failed to read HTTP/2 request body: {err}");
            return Ok(plain_response(
                StatusCode::BAD_REQUEST,
                "Error reading request body",
            ));
        }
    };

    let record = RequestRecord::new(&method, &url, ordered, body);
    let mut session = Session::new(record, Some(profile), PROTOCOL_HTTP2);

    if session.kind == SessionKind::WebSocket {
        // Extended-CONNECT style upgrades are not spliced; the attempt is
        // recorded as a failed session.
        session.error = Some("websocket upgrade over HTTP/2 is not supported".to_owned());
        if let Some(ws) = session.websocket.as_mut() {
            ws.state = crate::session::WebSocketState::Failed;
        }
        ctx.store.store(session);
        return Ok(plain_response(StatusCode::BAD_REQUEST, "Bad Request"));
    }

    match forward_and_store(&ctx, session).await {
        Ok(wire) => Ok(wire.into_hyper()),
        Err(_) => Ok(plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")),
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_owned()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn pseudo_stream_id(path: &str, method: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in path.bytes().chain(method.bytes()) {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    hash & 0x7fff_ffff
}

fn strip_port(target: &str) -> String {
    match target.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_owned(),
        _ => target.to_owned(),
    }
}

fn absolute_url(connect_target: &str, target: &str) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_owned();
    }
    format!("https://{connect_target}{target}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ports_only() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("127.0.0.1:8443"), "127.0.0.1");
    }

    #[test]
    fn absolute_urls_from_origin_form() {
        assert_eq!(
            absolute_url("example.com:443", "/api?x=1"),
            "https://example.com:443/api?x=1"
        );
        assert_eq!(
            absolute_url("example.com:443", "https://example.com/page"),
            "https://example.com/page"
        );
    }

    #[test]
    fn pseudo_stream_id_is_deterministic_and_31_bit() {
        let a = pseudo_stream_id("/api", "GET");
        assert_eq!(a, pseudo_stream_id("/api", "GET"));
        assert_ne!(a, pseudo_stream_id("/api", "POST"));
        assert_eq!(a & 0x8000_0000, 0);
    }
}

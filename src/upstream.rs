//! Forwarding captured requests to the origin and recording the exchange.
//!
//! The outbound client never follows redirects; every hop of a redirect
//! chain shows up as its own session. Response bodies are captured up to a
//! 10 MiB cap, stored decoded, and forwarded to the client byte-for-byte as
//! they arrived.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, SET_COOKIE};
use http::{HeaderMap, StatusCode};
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::Body;

use crate::body::{decode_body, DecodeOptions};
use crate::config::{MAX_BODY_SIZE, UPSTREAM_TIMEOUT};
use crate::error::{Error, Result};
use crate::headers::{is_hop_by_hop, parse_cookie_pairs, OrderedHeaderMap};
use crate::proxy::ProxyContext;
use crate::session::{ResponseRecord, Session};

/// The outbound HTTP client type: HTTPS-capable, HTTP/1.1 and HTTP/2.
pub(crate) type HttpClient = hyper::Client<hyper_rustls::HttpsConnector<HttpConnector>>;

/// Builds the origin-facing client. `insecure` skips certificate
/// verification.
pub(crate) fn build_client(insecure: bool) -> HttpClient {
    let tls = if insecure {
        crate::tls::insecure_client_config()
    } else {
        crate::tls::webpki_client_config()
    };

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_all_versions()
        .build();

    hyper::Client::builder().build(https)
}

/// The bytes to put back on the client's wire, exactly as the origin sent
/// them.
#[derive(Debug)]
pub(crate) struct WireResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WireResponse {
    /// Converts into a hyper response with hop-by-hop headers dropped.
    pub(crate) fn into_hyper(self) -> hyper::Response<Body> {
        let mut response = hyper::Response::builder()
            .status(self.status)
            .body(Body::from(self.body))
            .unwrap_or_else(|_| hyper::Response::new(Body::empty()));

        let headers = response.headers_mut();
        for (name, value) in self.headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        response
    }
}

/// Forwards `session`'s request upstream, fills in the response record,
/// publishes the session, and hands back the wire response. On upstream
/// failure the session is published with its error and a 502 record, and
/// the error is returned for the caller to surface.
pub(crate) async fn forward_and_store(
    ctx: &ProxyContext,
    mut session: Session,
) -> Result<WireResponse> {
    ctx.log_request(&session);

    let request = match build_request(&session) {
        Ok(request) => request,
        Err(err) => return fail_session(ctx, session, err),
    };

    let outcome = tokio::time::timeout(UPSTREAM_TIMEOUT, async {
        let response = ctx.client.request(request).await.map_err(Error::upstream)?;
        read_response(response).await
    })
    .await
    .unwrap_or_else(|_| Err(Error::upstream(crate::error::TimedOut)));

    let (status, mut headers, body) = match outcome {
        Ok(parts) => parts,
        Err(err) => return fail_session(ctx, session, err),
    };

    // The captured body length is authoritative from here on.
    if !body.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
            headers.insert(CONTENT_LENGTH, value);
        }
    }

    session.duration = session.elapsed();
    session.response = Some(response_record(status, &headers, &body).await);
    ctx.log_response(&session);
    ctx.store.store(session);

    Ok(WireResponse {
        status: status.as_u16(),
        reason: status
            .canonical_reason()
            .unwrap_or("Unknown Status")
            .to_owned(),
        headers,
        body,
    })
}

/// Records the failure on the session, publishes it, and propagates the
/// error. The client-facing surface is a 502.
fn fail_session(ctx: &ProxyContext, mut session: Session, err: Error) -> Result<WireResponse> {
    log::error!("forwarding {} failed: {err}", session.request.url);

    session.duration = session.elapsed();
    session.error = Some(err.to_string());
    session.response = Some(ResponseRecord {
        status_code: StatusCode::BAD_GATEWAY.as_u16(),
        status_text: "Bad Gateway".to_owned(),
        ..ResponseRecord::default()
    });
    ctx.store.store(session);

    Err(err)
}

fn build_request(session: &Session) -> Result<hyper::Request<Body>> {
    let mut request = hyper::Request::builder()
        .method(session.request.method.as_str())
        .uri(session.request.url.as_str())
        .body(Body::from(session.request.body.clone()))
        .map_err(Error::upstream)?;

    let headers = request.headers_mut();
    for (key, value) in session.request.headers.iter() {
        if is_hop_by_hop(key) {
            continue;
        }
        let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        for line in value.lines() {
            if let Ok(value) = HeaderValue::from_str(line) {
                headers.append(name.clone(), value);
            }
        }
    }
    headers.remove(CONTENT_LENGTH);
    if !session.request.body.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&session.request.body.len().to_string()) {
            headers.insert(CONTENT_LENGTH, value);
        }
    }

    Ok(request)
}

async fn read_response(response: hyper::Response<Body>) -> Result<(StatusCode, HeaderMap, Bytes)> {
    let status = response.status();
    let headers = response.headers().clone();

    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(Error::upstream)?;
        if bytes.len() + chunk.len() > MAX_BODY_SIZE {
            bytes.extend_from_slice(&chunk[..MAX_BODY_SIZE - bytes.len()]);
            break;
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok((status, headers, Bytes::from(bytes)))
}

/// Builds the stored response record: headers snapshotted in arrival order,
/// cookies pulled from `Set-Cookie`, body decompressed and pretty-printed.
pub(crate) async fn response_record(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> ResponseRecord {
    let mut ordered = OrderedHeaderMap::new();
    for (name, value) in headers.iter() {
        ordered.append(name.as_str(), value.to_str().unwrap_or_default());
    }

    let cookies = parse_cookie_pairs(
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok()),
    );

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let content_encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let options = DecodeOptions::new(&content_type, &content_encoding);
    let decoded = decode_body(body, &options).await;

    ResponseRecord {
        status_code: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_owned(),
        headers: ordered,
        cookies,
        body: decoded,
        content_type,
    }
}

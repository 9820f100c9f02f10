//! The proxy server and its embedding API.
//!
//! One TCP listener accepts plaintext HTTP requests (absolute-form targets)
//! and CONNECT tunnels. Each accepted connection is served on its own task;
//! CONNECTs are hijacked through hyper's upgrade machinery and handed to
//! the interception driver. The [`Proxy`] handle also exposes the captured
//! session store to the embedding application: listing, detail, search,
//! diff, cURL export, replay.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::api;
use crate::authority::CertAuthority;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::headers::OrderedHeaderMap;
use crate::hello::ClientHelloCache;
use crate::session::{RequestRecord, ResponseRecord, Session, SessionKind};
use crate::store::{SearchOptions, SessionStore};
use crate::upstream::{build_client, forward_and_store, HttpClient};

/// Shared state handed to every connection handler.
pub(crate) struct ProxyContext {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) store: Arc<SessionStore>,
    pub(crate) authority: Arc<CertAuthority>,
    pub(crate) hello_cache: Arc<ClientHelloCache>,
    pub(crate) client: HttpClient,
}

impl Clone for ProxyContext {
    fn clone(&self) -> Self {
        ProxyContext {
            config: self.config.clone(),
            store: self.store.clone(),
            authority: self.authority.clone(),
            hello_cache: self.hello_cache.clone(),
            client: self.client.clone(),
        }
    }
}

impl ProxyContext {
    pub(crate) fn log_request(&self, session: &Session) {
        if self.config.verbose {
            log::info!("[REQUEST] {} {}", session.request.method, session.request.url);
        } else {
            log::debug!("request {} {}", session.request.method, session.request.url);
        }
    }

    pub(crate) fn log_response(&self, session: &Session) {
        let status = session
            .response
            .as_ref()
            .map(|r| r.status_code)
            .unwrap_or(0);
        if self.config.verbose {
            log::info!("[RESPONSE] {} {}", status, session.request.url);
        } else {
            log::debug!("response {} {}", status, session.request.url);
        }
    }
}

struct RunState {
    running: bool,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// The intercepting proxy.
///
/// Create one with [`Proxy::new`], call [`start`](Proxy::start), point
/// clients at `localhost:<port>` as their HTTP proxy, and read captured
/// traffic back through the session APIs.
#[derive(Debug)]
pub struct Proxy {
    config: ProxyConfig,
    store: Arc<SessionStore>,
    state: Mutex<RunState>,
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("running", &self.running)
            .field("port", &self.port)
            .finish()
    }
}

impl Proxy {
    /// Creates a stopped proxy with the given configuration.
    pub fn new(config: ProxyConfig) -> Self {
        let store = Arc::new(SessionStore::new(config.max_sessions));
        let port = config.port;
        Proxy {
            config,
            store,
            state: Mutex::new(RunState {
                running: false,
                port,
                shutdown: None,
                task: None,
            }),
        }
    }

    /// Starts listening. Loads (or generates) the CA, binds the port, and
    /// spawns the accept loop. Returns the bound port, which differs from
    /// the configured one when it was 0.
    pub async fn start(&self) -> Result<u16> {
        {
            let state = self.state.lock().expect("proxy state poisoned");
            if state.running {
                return Err(Error::config("proxy is already running"));
            }
        }

        let config = Arc::new(self.config.clone());

        // RSA keygen is CPU-heavy; keep it off the runtime threads.
        let authority = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                CertAuthority::load_or_generate(
                    &config.cert_dir,
                    &config.ca_cert_path(),
                    &config.ca_key_path(),
                )
            })
            .await
            .map_err(Error::internal)??
        };

        let ctx = ProxyContext {
            config: config.clone(),
            store: self.store.clone(),
            authority: Arc::new(authority),
            hello_cache: Arc::new(ClientHelloCache::new()),
            client: build_client(config.insecure_upstream),
        };

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| Error::config(e).with_context(format!("binding port {}", config.port)))?;
        let port = listener.local_addr().map_err(Error::config)?.port();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        let mut state = self.state.lock().expect("proxy state poisoned");
        state.running = true;
        state.port = port;
        state.shutdown = Some(shutdown_tx);
        state.task = Some(task);

        log::info!("proxy listening on http://localhost:{port}");
        Ok(port)
    }

    /// Stops the listener. In-flight connections are dropped with it.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().expect("proxy state poisoned");
        if !state.running {
            return Err(Error::config("proxy is not running"));
        }

        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.running = false;

        log::info!("proxy stopped");
        Ok(())
    }

    /// Whether the proxy is running, and on which port.
    pub fn status(&self) -> Value {
        let state = self.state.lock().expect("proxy state poisoned");
        serde_json::json!({
            "running": state.running,
            "port": state.port,
        })
    }

    /// The port the proxy is (or will be) listening on.
    pub fn port(&self) -> u16 {
        self.state.lock().expect("proxy state poisoned").port
    }

    /// Registers a callback invoked whenever the session store changes.
    pub fn subscribe<F: Fn() + Send + Sync + 'static>(&self, callback: F) {
        self.store.subscribe(callback);
    }

    /// Summaries of all captured sessions, oldest first.
    pub fn list_sessions(&self) -> Value {
        let summaries: Vec<Value> = self
            .store
            .get_all()
            .iter()
            .map(|handle| api::session_summary(&handle.lock().expect("session poisoned")))
            .collect();
        Value::Array(summaries)
    }

    /// Full detail of one session.
    pub fn session_detail(&self, id: &str) -> Result<Value> {
        let handle = self.store.get(id)?;
        let session = handle.lock().expect("session poisoned");
        Ok(api::session_detail(&session))
    }

    /// The session rendered as a cURL command.
    pub fn session_curl(&self, id: &str) -> Result<String> {
        let handle = self.store.get(id)?;
        let session = handle.lock().expect("session poisoned");
        Ok(session.to_curl())
    }

    /// Re-sends a captured HTTP session through the running proxy.
    pub async fn replay(&self, id: &str) -> Result<()> {
        let port = self.port();
        let session = {
            let handle = self.store.get(id)?;
            let session = handle.lock().expect("session poisoned");
            if session.kind != SessionKind::Http {
                return Err(Error::protocol("replay only supports HTTP sessions"));
            }
            session.clone()
        };
        session.replay(port).await
    }

    /// Searches captured sessions; see [`SearchOptions`].
    pub fn search(&self, options: &SearchOptions) -> Result<Value> {
        let matches = self.store.search(options)?;
        let results: Vec<Value> = matches
            .iter()
            .map(|handle| api::search_entry(&handle.lock().expect("session poisoned")))
            .collect();
        Ok(Value::Array(results))
    }

    /// Structural comparison of two sessions' requests.
    pub fn compare(&self, first_id: &str, second_id: &str) -> Result<Value> {
        let first_handle = self.store.get(first_id)?;
        let second_handle = self.store.get(second_id)?;
        let first = first_handle.lock().expect("session poisoned");
        let second = second_handle.lock().expect("session poisoned");
        Ok(api::compare_sessions(&first, &second))
    }

    /// Drops every captured session.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Direct access to the session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ProxyContext,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        log::error!("accept failed: {err}");
                        continue;
                    }
                };
                log::trace!("connection from {peer}");

                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let service =
                        service_fn(move |request| route(ctx.clone(), request));
                    let served = hyper::server::conn::Http::new()
                        .serve_connection(stream, service)
                        .with_upgrades()
                        .await;
                    if let Err(err) = served {
                        log::debug!("connection ended with error: {err}");
                    }
                });
            }
        }
    }
}

/// Top-level dispatch: CONNECT goes to interception, everything else is a
/// plaintext proxy request.
async fn route(
    ctx: ProxyContext,
    request: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    if request.method() == Method::CONNECT {
        return Ok(handle_connect(ctx, request));
    }
    Ok(handle_plain(ctx, request).await)
}

/// Answers the CONNECT with 200 and drives interception on the upgraded
/// connection.
fn handle_connect(ctx: ProxyContext, request: Request<Body>) -> Response<Body> {
    let Some(target) = request.uri().authority().map(|a| a.to_string()) else {
        return plain_response(StatusCode::BAD_REQUEST, "malformed CONNECT target");
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(request).await {
            Ok(upgraded) => {
                // Recover the raw TCP stream plus whatever the client has
                // already pipelined behind the CONNECT.
                let result = match upgraded.downcast::<TcpStream>() {
                    Ok(parts) => {
                        crate::mitm::drive(ctx, parts.io, parts.read_buf, target).await
                    }
                    Err(upgraded) => {
                        crate::mitm::drive(ctx, upgraded, Bytes::new(), target).await
                    }
                };
                if let Err(err) = result {
                    log::debug!("tunnel closed: {err}");
                }
            }
            Err(err) => log::error!("CONNECT upgrade failed: {err}"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Serves an absolute-form plaintext request by forwarding it upstream and
/// recording the session.
async fn handle_plain(ctx: ProxyContext, request: Request<Body>) -> Response<Body> {
    let method = request.method().to_string();
    let url = plain_target_url(&request);
    let protocol = version_label(request.version());

    let mut ordered = OrderedHeaderMap::new();
    for (name, value) in request.headers() {
        ordered.append(name.as_str(), value.to_str().unwrap_or_default());
    }

    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(body) => body,
        Err(err) => {
            log::error!("failed to read request body: {err}");
            return plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let record = RequestRecord::new(&method, &url, ordered, body);
    let mut session = Session::new(record, None, protocol);

    if session.kind == SessionKind::WebSocket {
        // Upgrades only work on hijacked tunnels.
        session.error = Some("websocket not supported on the plaintext handler".to_owned());
        session.response = Some(ResponseRecord {
            status_code: StatusCode::BAD_REQUEST.as_u16(),
            status_text: "Bad Request".to_owned(),
            ..ResponseRecord::default()
        });
        if let Some(ws) = session.websocket.as_mut() {
            ws.state = crate::session::WebSocketState::Failed;
        }
        ctx.store.store(session);
        return plain_response(StatusCode::BAD_REQUEST, "Bad Request");
    }

    match forward_and_store(&ctx, session).await {
        Ok(wire) => wire.into_hyper(),
        Err(_) => plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway"),
    }
}

fn plain_target_url(request: &Request<Body>) -> String {
    if request.uri().authority().is_some() {
        return request.uri().to_string();
    }

    // Origin-form fallback: rebuild from the Host header.
    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}{}", host, request.uri())
}

fn version_label(version: hyper::Version) -> &'static str {
    match version {
        hyper::Version::HTTP_10 => crate::session::PROTOCOL_HTTP10,
        hyper::Version::HTTP_2 => crate::session::PROTOCOL_HTTP2,
        _ => crate::session::PROTOCOL_HTTP11,
    }
}

fn plain_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_owned()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_stopped_proxy() {
        let proxy = Proxy::new(ProxyConfig::default());
        let status = proxy.status();
        assert_eq!(status["running"], false);
        assert_eq!(status["port"], 8080);
    }

    #[test]
    fn stop_without_start_errors() {
        let proxy = Proxy::new(ProxyConfig::default());
        assert!(proxy.stop().unwrap_err().is_config());
    }

    #[test]
    fn version_labels() {
        assert_eq!(version_label(hyper::Version::HTTP_10), "HTTP/1.0");
        assert_eq!(version_label(hyper::Version::HTTP_11), "HTTP/1.1");
        assert_eq!(version_label(hyper::Version::HTTP_2), "HTTP/2");
    }
}

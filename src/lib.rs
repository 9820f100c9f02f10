#![deny(missing_debug_implementations)]

//! # httpdebugger
//!
//! An intercepting HTTP / HTTPS / WebSocket debugging proxy.
//!
//! Clients configure it as their forward proxy; HTTPS tunnels are
//! intercepted with a per-host leaf certificate minted under a local CA,
//! the request is re-originated to the true origin, and every exchange is
//! recorded as a [`Session`] the embedding application can list, search,
//! diff, export as cURL, or replay.
//!
//! - On-the-fly certificate issuance under a persisted local CA
//! - Server-side TLS that mirrors the client's ClientHello (versions,
//!   cipher suites, curves, ALPN), cached by fingerprint
//! - HTTP/1.1 and HTTP/2, with original header order and casing recovered
//!   from the wire
//! - WebSocket splicing with per-frame logging
//! - FIFO-capped in-memory session store with predicate search and
//!   structural request diff
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use httpdebugger::{Proxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), httpdebugger::Error> {
//!     let proxy = Proxy::new(ProxyConfig::default());
//!     let port = proxy.start().await?;
//!     println!("intercepting on localhost:{port}");
//!
//!     // ... point a client at the proxy, then inspect what it did:
//!     let sessions = proxy.list_sessions();
//!     for session in sessions.as_array().into_iter().flatten() {
//!         println!("{} {}", session["method"], session["url"]);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The CA certificate is written to `certs/httpCA.crt` on first start;
//! install it into the client's trust store to intercept HTTPS.

mod api;
mod authority;
mod body;
mod config;
mod error;
mod h2frames;
mod headers;
mod hello;
mod http1;
mod mitm;
mod proxy;
mod session;
mod store;
mod stream;
mod tls;
mod upstream;
mod ws;

pub use crate::authority::{CertAuthority, LeafCert};
pub use crate::config::{ProxyConfig, DEFAULT_MAX_SESSIONS, DEFAULT_PORT};
pub use crate::error::{Error, Result};
pub use crate::headers::{FieldValue, OrderedHeaderMap};
pub use crate::hello::{fingerprint, parse_client_hello, ClientHelloCache};
pub use crate::proxy::Proxy;
pub use crate::session::{
    FieldDiff, MapDiff, MessageDirection, MessageKind, MessageStats, RequestDiff, RequestRecord,
    ResponseRecord, Session, SessionKind, WebSocketMessage, WebSocketRecord, WebSocketState,
    CLOSE_NO_STATUS_RECEIVED,
};
pub use crate::store::{SearchOptions, SessionHandle, SessionStore};
pub use crate::stream::{CaptureBuffer, CaptureStream, PrefixedStream, ReplayStream, SingleConnIncoming};
pub use crate::tls::TlsProfile;

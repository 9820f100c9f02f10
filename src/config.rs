//! Proxy configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default cap on captured sessions before FIFO eviction kicks in.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Total timeout for forwarding a request upstream.
pub(crate) const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Read deadline for a single HTTP/1.1 request inside a tunnel.
pub(crate) const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured bodies are truncated at this size.
pub(crate) const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Settings for a [`Proxy`](crate::Proxy).
///
/// The defaults match a local debugging setup: port 8080, CA material under
/// `certs/`, the last 1000 sessions retained.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port the listener binds on `0.0.0.0`. Port 0 picks an ephemeral port.
    pub port: u16,
    /// Mirror each captured request/response through the logger at `info`.
    pub verbose: bool,
    /// Directory holding the CA certificate and key PEM files.
    pub cert_dir: PathBuf,
    /// File name of the CA certificate inside `cert_dir`.
    pub ca_cert_file: String,
    /// File name of the CA private key inside `cert_dir`.
    pub ca_key_file: String,
    /// Maximum number of sessions retained before the oldest is evicted.
    pub max_sessions: usize,
    /// Skip certificate verification when dialing origins.
    pub insecure_upstream: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            port: DEFAULT_PORT,
            verbose: false,
            cert_dir: PathBuf::from("certs"),
            ca_cert_file: "httpCA.crt".to_owned(),
            ca_key_file: "httpCA.key".to_owned(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            insecure_upstream: false,
        }
    }
}

impl ProxyConfig {
    /// Path of the CA certificate PEM file.
    pub fn ca_cert_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_cert_file)
    }

    /// Path of the CA key PEM file.
    pub fn ca_key_path(&self) -> PathBuf {
        self.cert_dir.join(&self.ca_key_file)
    }
}

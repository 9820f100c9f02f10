//! TLS parameter snapshots and server-side config synthesis.
//!
//! The server half of an intercepted connection should look as close as
//! possible to what the client asked for: same protocol version window, same
//! cipher suites and curves where supported, same ALPN preference order.
//! [`TlsProfile`] is the parameter set extracted from a ClientHello; it is
//! what gets cached, snapshotted onto sessions, and turned into a
//! [`rustls::ServerConfig`].

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{
    Certificate, CipherSuite, NamedGroup, PrivateKey, ProtocolVersion, ServerConfig,
    SupportedCipherSuite, SupportedKxGroup, SupportedProtocolVersion,
};
use serde_json::{json, Value};

pub(crate) const VERSION_TLS10: u16 = 0x0301;
pub(crate) const VERSION_TLS11: u16 = 0x0302;
pub(crate) const VERSION_TLS12: u16 = 0x0303;
pub(crate) const VERSION_TLS13: u16 = 0x0304;

pub(crate) const ALPN_H2: &[u8] = b"h2";
pub(crate) const ALPN_HTTP11: &[u8] = b"http/1.1";

/// TLS parameters observed in (or synthesized for) a client handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProfile {
    /// Lowest protocol version the client accepts.
    pub min_version: u16,
    /// Highest protocol version the client accepts.
    pub max_version: u16,
    /// Cipher suite ids in client preference order.
    pub cipher_suites: Vec<u16>,
    /// Supported-curves extension, client preference order.
    pub curves: Vec<u16>,
    /// ALPN protocol names in client preference order.
    pub alpn: Vec<String>,
    /// SNI host, filled in once the connection target is known.
    pub server_name: Option<String>,
}

impl Default for TlsProfile {
    /// The profile recorded when a ClientHello cannot be parsed: TLS 1.2
    /// through 1.3 with library defaults for everything else.
    fn default() -> Self {
        TlsProfile {
            min_version: VERSION_TLS12,
            max_version: VERSION_TLS13,
            cipher_suites: Vec::new(),
            curves: Vec::new(),
            alpn: Vec::new(),
            server_name: None,
        }
    }
}

impl TlsProfile {
    /// Pins both version bounds to `version`; unknown values fall back to
    /// TLS 1.2 exactly.
    pub(crate) fn set_legacy_version(&mut self, version: u16) {
        let clamped = match version {
            VERSION_TLS10 | VERSION_TLS11 | VERSION_TLS12 | VERSION_TLS13 => version,
            _ => VERSION_TLS12,
        };
        self.min_version = clamped;
        self.max_version = clamped;
    }

    /// Replaces the version window from a supported_versions extension.
    pub(crate) fn set_version_window(&mut self, min: u16, max: u16) {
        self.min_version = min;
        self.max_version = max;
    }

    /// Builds the server-side TLS configuration mirroring this profile,
    /// serving `cert_chain`/`key`. Offers that rustls cannot express fall
    /// back to library defaults rather than failing the handshake.
    pub(crate) fn server_config(
        &self,
        cert_chain: Vec<Certificate>,
        key: PrivateKey,
    ) -> Result<ServerConfig, rustls::Error> {
        let mut config = self
            .mirrored_config(cert_chain.clone(), key.clone())
            .or_else(|_| {
                ServerConfig::builder()
                    .with_safe_defaults()
                    .with_no_client_auth()
                    .with_single_cert(cert_chain, key)
            })?;

        config.alpn_protocols = self.mirrored_alpn();
        Ok(config)
    }

    fn mirrored_config(
        &self,
        cert_chain: Vec<Certificate>,
        key: PrivateKey,
    ) -> Result<ServerConfig, rustls::Error> {
        let mut suites: Vec<SupportedCipherSuite> = rustls::ALL_CIPHER_SUITES
            .iter()
            .copied()
            .filter(|s| self.cipher_suites.contains(&s.suite().get_u16()))
            .collect();
        if suites.is_empty() {
            suites = rustls::DEFAULT_CIPHER_SUITES.to_vec();
        }

        let mut groups: Vec<&'static SupportedKxGroup> = rustls::ALL_KX_GROUPS
            .iter()
            .copied()
            .filter(|g| self.curves.contains(&g.name.get_u16()))
            .collect();
        if groups.is_empty() {
            groups = rustls::ALL_KX_GROUPS.to_vec();
        }

        let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
        if self.min_version <= VERSION_TLS12 && self.max_version >= VERSION_TLS12 {
            versions.push(&rustls::version::TLS12);
        }
        if self.min_version <= VERSION_TLS13 && self.max_version >= VERSION_TLS13 {
            versions.push(&rustls::version::TLS13);
        }
        if versions.is_empty() {
            versions = rustls::DEFAULT_VERSIONS.to_vec();
        }

        ServerConfig::builder()
            .with_cipher_suites(&suites)
            .with_kx_groups(&groups)
            .with_protocol_versions(&versions)?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
    }

    /// The client's ALPN list restricted to protocols the proxy speaks,
    /// preference order preserved. An empty offer yields an empty list, which
    /// negotiates no protocol and lands on HTTP/1.1.
    fn mirrored_alpn(&self) -> Vec<Vec<u8>> {
        self.alpn
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .filter(|p| p == ALPN_H2 || p == ALPN_HTTP11)
            .collect()
    }

    /// Renders the profile for `session_detail`, with protocol names spelled
    /// out where known.
    pub fn to_json(&self) -> Value {
        json!({
            "serverName": self.server_name.clone().unwrap_or_default(),
            "minVersion": version_name(self.min_version),
            "maxVersion": version_name(self.max_version),
            "cipherSuites": self
                .cipher_suites
                .iter()
                .map(|&id| format!("{:?}", CipherSuite::from(id)))
                .collect::<Vec<_>>(),
            "curvePreferences": self
                .curves
                .iter()
                .map(|&id| format!("{:?}", NamedGroup::from(id)))
                .collect::<Vec<_>>(),
            "nextProtos": self.alpn,
        })
    }
}

/// Human name of a TLS protocol version.
pub(crate) fn version_name(version: u16) -> String {
    match version {
        VERSION_TLS10 => "TLS 1.0".to_owned(),
        VERSION_TLS11 => "TLS 1.1".to_owned(),
        VERSION_TLS12 => "TLS 1.2".to_owned(),
        VERSION_TLS13 => "TLS 1.3".to_owned(),
        0 => "Default".to_owned(),
        other => format!("{:?}", ProtocolVersion::from(other)),
    }
}

/// A verifier that accepts any server certificate. Used for dialing origins
/// with verification disabled and for replaying sessions back through the
/// proxy, whose leaf certs are not publicly trusted.
pub(crate) struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Client config trusting the standard web PKI roots.
pub(crate) fn webpki_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Client config that skips certificate verification entirely.
pub(crate) fn insecure_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    config.enable_sni = true;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_spans_tls12_to_13() {
        let profile = TlsProfile::default();
        assert_eq!(profile.min_version, VERSION_TLS12);
        assert_eq!(profile.max_version, VERSION_TLS13);
    }

    #[test]
    fn unknown_legacy_version_pins_tls12() {
        let mut profile = TlsProfile::default();
        profile.set_legacy_version(0x9999);
        assert_eq!(profile.min_version, VERSION_TLS12);
        assert_eq!(profile.max_version, VERSION_TLS12);
    }

    #[test]
    fn alpn_mirror_keeps_client_order() {
        let profile = TlsProfile {
            alpn: vec!["h2".into(), "spdy/3".into(), "http/1.1".into()],
            ..TlsProfile::default()
        };
        assert_eq!(
            profile.mirrored_alpn(),
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn version_names() {
        assert_eq!(version_name(VERSION_TLS13), "TLS 1.3");
        assert_eq!(version_name(0), "Default");
    }

    #[test]
    fn profile_json_shape() {
        let profile = TlsProfile {
            alpn: vec!["h2".into()],
            server_name: Some("example.com".into()),
            ..TlsProfile::default()
        };
        let value = profile.to_json();
        assert_eq!(value["serverName"], "example.com");
        assert_eq!(value["minVersion"], "TLS 1.2");
        assert_eq!(value["nextProtos"][0], "h2");
    }
}

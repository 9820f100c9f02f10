//! The local certificate authority and per-host leaf cache.
//!
//! Interception needs a leaf certificate for every host a client CONNECTs
//! to. A root CA is loaded from disk (or generated and persisted on first
//! run), and leaves are minted on demand, signed by that CA, and cached for
//! the process lifetime.

use std::collections::HashMap;
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use time::{Duration, OffsetDateTime};

use crate::error::{Error, Result};

const RSA_BITS: usize = 2048;
const CA_ORGANIZATION: &str = "HTTP Debugger CA";
const CA_COMMON_NAME: &str = "HTTP Debugger Root CA";
const LEAF_ORGANIZATION: &str = "HTTP Debugger";

const NOT_BEFORE_OFFSET: Duration = Duration::minutes(10);
const NOT_AFTER_OFFSET: Duration = Duration::days(90);

/// A minted leaf certificate ready to serve: DER chain plus private key in
/// the shapes rustls wants.
#[derive(Debug, Clone)]
pub struct LeafCert {
    /// The leaf certificate, DER-encoded.
    pub chain: Vec<rustls::Certificate>,
    /// The leaf's private key, PKCS#8 DER.
    pub key: rustls::PrivateKey,
}

/// The signing CA plus the per-host leaf cache.
pub struct CertAuthority {
    ca: Certificate,
    ca_cert_pem: String,
    cache: RwLock<HashMap<String, Arc<LeafCert>>>,
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAuthority")
            .field("cached_hosts", &self.cache.read().map(|c| c.len()).unwrap_or(0))
            .finish()
    }
}

impl CertAuthority {
    /// Loads the CA cert/key PEM pair from `cert_dir`, generating and
    /// persisting a fresh pair when loading fails. The directory is created
    /// if missing.
    pub fn load_or_generate(cert_dir: &Path, cert_path: &Path, key_path: &Path) -> Result<Self> {
        fs::create_dir_all(cert_dir).map_err(|e| {
            Error::config(e).with_context(format!("creating {}", cert_dir.display()))
        })?;

        match Self::load(cert_path, key_path) {
            Ok(authority) => Ok(authority),
            Err(err) => {
                log::debug!("loading CA failed ({err}), generating a new one");
                let authority = Self::generate()?;
                authority.save(cert_path, key_path)?;
                Ok(authority)
            }
        }
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path).map_err(Error::config)?;
        let key_der = read_key_pkcs8(key_path)?;

        let key_pair = KeyPair::from_der(&key_der).map_err(Error::config)?;
        let params =
            CertificateParams::from_ca_cert_pem(&cert_pem, key_pair).map_err(Error::config)?;
        let ca = Certificate::from_params(params).map_err(Error::config)?;

        Ok(CertAuthority {
            ca,
            ca_cert_pem: cert_pem,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Generates a self-signed RSA-2048 root CA without touching disk.
    pub fn generate() -> Result<Self> {
        let key_pair = new_rsa_key_pair()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        dn.push(DnType::CommonName, CA_COMMON_NAME);

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.not_before = OffsetDateTime::now_utc() - NOT_BEFORE_OFFSET;
        params.not_after = OffsetDateTime::now_utc() + NOT_AFTER_OFFSET;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let ca = Certificate::from_params(params).map_err(Error::internal)?;
        let ca_cert_pem = ca.serialize_pem().map_err(Error::internal)?;

        Ok(CertAuthority {
            ca,
            ca_cert_pem,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Persists the in-memory CA as a PEM pair: certificate plus PKCS#1
    /// private key.
    fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        fs::write(cert_path, &self.ca_cert_pem).map_err(|e| {
            Error::config(e).with_context(format!("writing {}", cert_path.display()))
        })?;

        let key_der = self.ca.serialize_private_key_der();
        let key = RsaPrivateKey::from_pkcs8_der(&key_der).map_err(Error::internal)?;
        let key_pem = key.to_pkcs1_pem(LineEnding::LF).map_err(Error::internal)?;
        fs::write(key_path, key_pem.as_bytes())
            .map_err(|e| Error::config(e).with_context(format!("writing {}", key_path.display())))
    }

    /// The CA certificate in PEM form, for installing into a client trust
    /// store.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Returns the cached leaf for `host`, minting one on first use.
    /// Double-checked so concurrent connections to a new host generate the
    /// key only once.
    pub fn host_cert(&self, host: &str) -> Result<Arc<LeafCert>> {
        {
            let cache = self.cache.read().expect("cert cache poisoned");
            if let Some(leaf) = cache.get(host) {
                return Ok(leaf.clone());
            }
        }

        let mut cache = self.cache.write().expect("cert cache poisoned");
        if let Some(leaf) = cache.get(host) {
            return Ok(leaf.clone());
        }

        let leaf = Arc::new(self.mint_leaf(host)?);
        cache.insert(host.to_owned(), leaf.clone());
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCert> {
        let key_pair = new_rsa_key_pair()?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.alg = &rcgen::PKCS_RSA_SHA256;
        params.key_pair = Some(key_pair);
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.not_before = OffsetDateTime::now_utc() - NOT_BEFORE_OFFSET;
        params.not_after = OffsetDateTime::now_utc() + NOT_AFTER_OFFSET;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        if let Ok(ip) = host.parse::<IpAddr>() {
            params.subject_alt_names = vec![SanType::IpAddress(ip)];
        } else {
            params.subject_alt_names = vec![SanType::DnsName(host.to_owned())];
            if !host.starts_with("www.") {
                params
                    .subject_alt_names
                    .push(SanType::DnsName(format!("www.{host}")));
            }
        }

        let cert = Certificate::from_params(params).map_err(Error::internal)?;
        let leaf_der = cert
            .serialize_der_with_signer(&self.ca)
            .map_err(Error::internal)?;
        let key_der = cert.serialize_private_key_der();

        Ok(LeafCert {
            chain: vec![rustls::Certificate(leaf_der)],
            key: rustls::PrivateKey(key_der),
        })
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> usize {
        self.cache.read().expect("cert cache poisoned").len()
    }
}

/// Generates an RSA-2048 key and hands it over as an rcgen key pair.
fn new_rsa_key_pair() -> Result<KeyPair> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS).map_err(Error::internal)?;
    let der = key.to_pkcs8_der().map_err(Error::internal)?;
    KeyPair::from_der(der.as_bytes()).map_err(Error::internal)
}

/// 128-bit random serial. The top bit is cleared so the DER integer stays
/// positive.
fn random_serial() -> SerialNumber {
    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    SerialNumber::from(serial.to_vec())
}

/// Reads a private key PEM file, accepting PKCS#1 (`RSA PRIVATE KEY`) or
/// PKCS#8, and normalizes to PKCS#8 DER.
fn read_key_pkcs8(key_path: &Path) -> Result<Vec<u8>> {
    let file = fs::File::open(key_path).map_err(Error::config)?;
    let mut reader = BufReader::new(file);

    let mut pkcs1 = Vec::new();
    let mut pkcs8 = Vec::new();
    for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut reader).transpose()) {
        match item.map_err(Error::config)? {
            rustls_pemfile::Item::RSAKey(der) => pkcs1.push(der),
            rustls_pemfile::Item::PKCS8Key(der) => pkcs8.push(der),
            _ => {}
        }
    }

    if let Some(der) = pkcs8.into_iter().next() {
        return Ok(der);
    }
    if let Some(der) = pkcs1.into_iter().next() {
        let key = RsaPrivateKey::from_pkcs1_der(&der).map_err(Error::config)?;
        let normalized = key.to_pkcs8_der().map_err(Error::config)?;
        return Ok(normalized.as_bytes().to_vec());
    }

    Err(Error::config("no private key found in PEM file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_mint_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("httpCA.crt");
        let key_path = dir.path().join("httpCA.key");

        let authority =
            CertAuthority::load_or_generate(dir.path(), &cert_path, &key_path).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());
        assert!(authority.ca_cert_pem().contains("BEGIN CERTIFICATE"));

        let key_pem = fs::read_to_string(&key_path).unwrap();
        assert!(key_pem.contains("BEGIN RSA PRIVATE KEY"));

        // Leaf minting caches by exact host string.
        let leaf = authority.host_cert("example.com").unwrap();
        assert_eq!(leaf.chain.len(), 1);
        let again = authority.host_cert("example.com").unwrap();
        assert!(Arc::ptr_eq(&leaf, &again));
        assert_eq!(authority.cached_hosts(), 1);

        // IP targets get an IP SAN instead of DNS names.
        let ip_leaf = authority.host_cert("127.0.0.1").unwrap();
        assert!(!ip_leaf.key.0.is_empty());
        assert_eq!(authority.cached_hosts(), 2);

        // A second start loads the persisted CA instead of regenerating.
        let reloaded =
            CertAuthority::load_or_generate(dir.path(), &cert_path, &key_path).unwrap();
        let reloaded_pem = fs::read_to_string(&cert_path).unwrap();
        assert_eq!(reloaded_pem, authority.ca_cert_pem());
        drop(reloaded);
    }
}

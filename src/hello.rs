//! Raw ClientHello parsing and the fingerprint cache.
//!
//! The first TLS record a client sends carries everything needed to mirror
//! its handshake preferences: legacy version, cipher suites, curves, ALPN,
//! and the supported_versions extension. Parsing happens at the byte level
//! because the record is consumed before any TLS library sees it, and the
//! result is cached by a cheap fingerprint so repeat connections from the
//! same client implementation skip the parse.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::tls::{TlsProfile, VERSION_TLS10, VERSION_TLS11, VERSION_TLS12, VERSION_TLS13};

const EXTENSION_SUPPORTED_CURVES: u16 = 0x000a;
const EXTENSION_ALPN: u16 = 0x0010;
const EXTENSION_SUPPORTED_VERSIONS: u16 = 0x002b;

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Minimum byte count for a record that can possibly be a ClientHello.
const MIN_CLIENT_HELLO_LEN: usize = 44;

/// Returns true if `raw` starts with a TLS handshake record carrying a
/// ClientHello.
pub fn looks_like_client_hello(raw: &[u8]) -> bool {
    raw.len() >= MIN_CLIENT_HELLO_LEN
        && raw[0] == RECORD_TYPE_HANDSHAKE
        && raw[5] == HANDSHAKE_TYPE_CLIENT_HELLO
}

/// Parses a raw TLS record into the client's handshake preferences.
pub fn parse_client_hello(raw: &[u8]) -> Result<TlsProfile> {
    if !looks_like_client_hello(raw) {
        return Err(Error::protocol("not a valid client hello"));
    }

    let record_len = u16::from_be_bytes([raw[3], raw[4]]) as usize;
    let handshake = raw
        .get(5..5 + record_len)
        .ok_or_else(|| Error::protocol("record length exceeds captured bytes"))?;

    let mut profile = TlsProfile::default();
    let mut cursor = Cursor::new(handshake);

    // Handshake header: type + 24-bit length.
    cursor.skip(4)?;
    let legacy_version = cursor.read_u16()?;
    profile.set_legacy_version(legacy_version);

    // 32-byte client random.
    cursor.skip(32)?;

    let session_id_len = cursor.read_u8()? as usize;
    cursor.skip(session_id_len)?;

    let cipher_suites_len = cursor.read_u16()? as usize;
    let cipher_bytes = cursor.take(cipher_suites_len)?;
    profile.cipher_suites = cipher_bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    let compression_len = cursor.read_u8()? as usize;
    cursor.skip(compression_len)?;

    let extensions_len = cursor.read_u16()? as usize;
    let extensions_end = cursor.pos() + extensions_len;

    while cursor.pos() < extensions_end {
        if cursor.pos() + 4 > extensions_end {
            return Err(Error::protocol("malformed extension header"));
        }
        let ext_type = cursor.read_u16()?;
        let ext_len = cursor.read_u16()? as usize;
        if cursor.pos() + ext_len > extensions_end {
            return Err(Error::protocol("malformed extension data"));
        }
        let ext_data = cursor.take(ext_len)?;

        match ext_type {
            EXTENSION_ALPN => {
                let protocols = parse_alpn(ext_data);
                if !protocols.is_empty() {
                    profile.alpn = protocols;
                }
            }
            EXTENSION_SUPPORTED_CURVES => {
                let curves = parse_supported_curves(ext_data);
                if !curves.is_empty() {
                    profile.curves = curves;
                }
            }
            EXTENSION_SUPPORTED_VERSIONS => {
                let versions = parse_supported_versions(ext_data);
                apply_version_window(&mut profile, &versions);
            }
            _ => {}
        }
    }

    Ok(profile)
}

/// Fingerprint of a raw ClientHello.
///
/// FNV-1a over bytes 100..200 plus a single `len/100` byte: a low-entropy
/// slice on purpose, so cosmetically different hellos from one client
/// implementation collapse onto the same cached profile. Records shorter
/// than 200 bytes hash in full.
pub fn fingerprint(raw: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let fold = |hash: u64, byte: u8| (hash ^ u64::from(byte)).wrapping_mul(PRIME);

    if raw.len() < 200 {
        return raw.iter().fold(OFFSET, |h, &b| fold(h, b));
    }

    let hash = raw[100..200].iter().fold(OFFSET, |h, &b| fold(h, b));
    fold(hash, (raw.len() / 100) as u8)
}

fn parse_supported_curves(data: &[u8]) -> Vec<u16> {
    if data.len() < 2 {
        return Vec::new();
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());

    data[2..end]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn parse_alpn(data: &[u8]) -> Vec<String> {
    if data.len() < 2 {
        return Vec::new();
    }

    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let end = (2 + list_len).min(data.len());
    let mut protocols = Vec::new();
    let mut offset = 2;

    while offset < end {
        let proto_len = data[offset] as usize;
        offset += 1;
        if offset + proto_len > end {
            break;
        }
        protocols.push(String::from_utf8_lossy(&data[offset..offset + proto_len]).into_owned());
        offset += proto_len;
    }

    protocols
}

fn parse_supported_versions(data: &[u8]) -> Vec<u16> {
    if data.is_empty() {
        return Vec::new();
    }

    let list_len = data[0] as usize;
    let end = (1 + list_len).min(data.len());

    data[1..end]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

fn apply_version_window(profile: &mut TlsProfile, versions: &[u16]) {
    let mut min = u16::MAX;
    let mut max = 0;

    for &version in versions {
        if is_grease(version) {
            continue;
        }
        min = min.min(version);
        max = max.max(version);
    }

    if min != u16::MAX && max != 0 {
        profile.set_version_window(clamp_version(min), clamp_version(max));
    }
}

fn clamp_version(version: u16) -> u16 {
    match version {
        VERSION_TLS10 | VERSION_TLS11 | VERSION_TLS12 | VERSION_TLS13 => version,
        _ => VERSION_TLS12,
    }
}

// GREASE values repeat one nibble: 0x0a0a, 0x1a1a, .. 0xfafa.
fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && (value >> 12) == ((value >> 4) & 0x000f)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::protocol("client hello truncated"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::protocol("client hello truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }
}

/// Process-wide cache mapping ClientHello fingerprints to parsed profiles.
///
/// Entries live for the whole process; there is no invalidation.
#[derive(Debug, Default)]
pub struct ClientHelloCache {
    cache: RwLock<HashMap<u64, Arc<TlsProfile>>>,
}

impl ClientHelloCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        ClientHelloCache::default()
    }

    /// Looks up the profile for `raw` by fingerprint.
    pub fn get(&self, raw: &[u8]) -> Option<Arc<TlsProfile>> {
        let cache = self.cache.read().expect("client hello cache poisoned");
        cache.get(&fingerprint(raw)).cloned()
    }

    /// Stores `profile` under the fingerprint of `raw`.
    pub fn set(&self, raw: &[u8], profile: Arc<TlsProfile>) {
        let mut cache = self.cache.write().expect("client hello cache poisoned");
        cache.insert(fingerprint(raw), profile);
    }

    /// Cache hit, or parse-and-store. A hello that fails to parse records
    /// the default TLS 1.2–1.3 profile so the handshake can still proceed.
    pub fn lookup_or_parse(&self, raw: &[u8]) -> Arc<TlsProfile> {
        if let Some(profile) = self.get(raw) {
            return profile;
        }

        let profile = match parse_client_hello(raw) {
            Ok(profile) => Arc::new(profile),
            Err(err) => {
                log::debug!("failed to parse client hello: {err}");
                Arc::new(TlsProfile::default())
            }
        };
        self.set(raw, profile.clone());
        profile
    }

    /// Number of distinct fingerprints cached.
    pub fn len(&self) -> usize {
        self.cache.read().expect("client hello cache poisoned").len()
    }

    /// Returns true if nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(ext_type: u16, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&ext_type.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    fn client_hello(version: u16, suites: &[u16], extensions: &[Vec<u8>]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length

        body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
        for suite in suites {
            body.extend_from_slice(&suite.to_be_bytes());
        }

        body.extend_from_slice(&[1, 0]); // one null compression method

        let ext_bytes: Vec<u8> = extensions.iter().flatten().copied().collect();
        body.extend_from_slice(&(ext_bytes.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext_bytes);

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![RECORD_TYPE_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn alpn_extension(protocols: &[&str]) -> Vec<u8> {
        let mut list = Vec::new();
        for proto in protocols {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        let mut data = (list.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&list);
        extension(EXTENSION_ALPN, &data)
    }

    #[test]
    fn rejects_non_hello_records() {
        assert!(parse_client_hello(&[0x17; 64]).is_err());
        assert!(parse_client_hello(&[0x16, 0x03, 0x01, 0x00]).is_err());
    }

    #[test]
    fn parses_version_and_suites() {
        let raw = client_hello(0x0303, &[0x1301, 0xc02f], &[]);
        let profile = parse_client_hello(&raw).unwrap();

        assert_eq!(profile.min_version, VERSION_TLS12);
        assert_eq!(profile.max_version, VERSION_TLS12);
        assert_eq!(profile.cipher_suites, vec![0x1301, 0xc02f]);
    }

    #[test]
    fn parses_alpn_in_order() {
        let raw = client_hello(0x0303, &[0x1301], &[alpn_extension(&["h2", "http/1.1"])]);
        let profile = parse_client_hello(&raw).unwrap();
        assert_eq!(profile.alpn, vec!["h2", "http/1.1"]);
    }

    #[test]
    fn supported_versions_override_legacy_and_skip_grease() {
        // GREASE 0x7a7a, then 1.3 and 1.2.
        let data = [6, 0x7a, 0x7a, 0x03, 0x04, 0x03, 0x03];
        let raw = client_hello(
            0x0303,
            &[0x1301],
            &[extension(EXTENSION_SUPPORTED_VERSIONS, &data)],
        );
        let profile = parse_client_hello(&raw).unwrap();
        assert_eq!(profile.min_version, VERSION_TLS12);
        assert_eq!(profile.max_version, VERSION_TLS13);
    }

    #[test]
    fn parses_supported_curves() {
        // x25519 (0x001d) and secp256r1 (0x0017).
        let data = [0, 4, 0x00, 0x1d, 0x00, 0x17];
        let raw = client_hello(
            0x0303,
            &[0x1301],
            &[extension(EXTENSION_SUPPORTED_CURVES, &data)],
        );
        let profile = parse_client_hello(&raw).unwrap();
        assert_eq!(profile.curves, vec![0x001d, 0x0017]);
    }

    #[test]
    fn malformed_extension_framing_errors() {
        let mut raw = client_hello(0x0303, &[0x1301], &[extension(EXTENSION_ALPN, &[0, 0])]);
        // Claim more extension bytes than the record holds.
        let len = raw.len();
        raw[len - 8] = 0xff;
        assert!(parse_client_hello(&raw).is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let raw = client_hello(0x0303, &[0x1301, 0x1302, 0x1303], &[]);
        assert_eq!(fingerprint(&raw), fingerprint(&raw));
    }

    #[test]
    fn fingerprint_matches_on_middle_slice() {
        let mut a = vec![0u8; 250];
        let mut b = vec![1u8; 250];
        for i in 100..200 {
            a[i] = i as u8;
            b[i] = i as u8;
        }
        // Same bytes 100..200 and same len/100 bucket.
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let mut c = a.clone();
        c[150] ^= 0xff;
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn short_records_hash_in_full() {
        let a = vec![7u8; 150];
        let mut b = a.clone();
        b[10] ^= 1;
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn cache_records_default_on_parse_failure() {
        let cache = ClientHelloCache::new();
        let garbage = vec![0x16u8; 60]; // right type byte, wrong everything else
        let profile = cache.lookup_or_parse(&garbage);

        assert_eq!(*profile, TlsProfile::default());
        assert_eq!(cache.len(), 1);
        // Second lookup is a hit on the same entry.
        let again = cache.lookup_or_parse(&garbage);
        assert!(Arc::ptr_eq(&profile, &again));
    }
}

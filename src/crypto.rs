//! Key schedule boundary.
//!
//! The proxy does not run a TLS handshake; record-protection keys are
//! opaque outputs of a [`KeyProvider`]. The bundled
//! [`FixedSaltKeyProvider`] derives deterministic keys with HKDF-SHA256
//! from a fixed salt, which is exactly enough for the satellite emulation
//! harness and for tests; a deployment fed by a real TLS stack implements
//! the same trait.

use ring::hkdf::{self, KeyType, Prk, Salt};

use crate::ConnectionId;

/// AES-128-GCM key length.
pub const KEY_LEN: usize = 16;
/// AEAD nonce length (96 bits).
pub const IV_LEN: usize = 12;
/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// Salt for Initial key derivation, shared with peers by convention.
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// One direction of record protection: key plus static IV.
#[derive(Clone)]
pub struct PacketKey {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; IV_LEN],
}

impl PacketKey {
    /// Nonce for one packet: the static IV with the packet number XORed
    /// into its low eight bytes.
    pub fn nonce(&self, pn: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        for (slot, byte) in nonce[4..].iter_mut().zip(pn.to_be_bytes()) {
            *slot ^= byte;
        }
        nonce
    }
}

/// Both directions of record protection from this endpoint's perspective.
#[derive(Clone)]
pub struct KeySet {
    pub tx: PacketKey,
    pub rx: PacketKey,
}

impl KeySet {
    /// The same keys seen from the other end, used by test peers.
    pub fn swapped(&self) -> Self {
        Self {
            tx: self.rx.clone(),
            rx: self.tx.clone(),
        }
    }
}

/// External source of key schedule outputs.
///
/// Initial keys are deterministic from the client's first destination CID.
/// Handshake and application keys become available after milestones the
/// provider learns about out-of-band; until then it returns `None` and the
/// engine queues outbound data.
pub trait KeyProvider: Send + Sync {
    fn initial_keys(&self, client_dcid: &ConnectionId) -> KeySet;
    fn handshake_keys(&self) -> Option<KeySet>;
    fn application_keys(&self) -> Option<KeySet>;
}

/// Deterministic provider: every key is an HKDF expansion of a fixed salt,
/// so any two parties using it independently derive matching keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedSaltKeyProvider;

impl KeyProvider for FixedSaltKeyProvider {
    fn initial_keys(&self, client_dcid: &ConnectionId) -> KeySet {
        let prk = Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(client_dcid);
        KeySet {
            tx: directional(&prk, b"server in"),
            rx: directional(&prk, b"client in"),
        }
    }

    fn handshake_keys(&self) -> Option<KeySet> {
        Some(level_keys(b"handshake secret"))
    }

    fn application_keys(&self) -> Option<KeySet> {
        Some(level_keys(b"application secret"))
    }
}

fn level_keys(label: &[u8]) -> KeySet {
    let prk = Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(label);
    KeySet {
        tx: directional(&prk, b"server in"),
        rx: directional(&prk, b"client in"),
    }
}

fn directional(prk: &Prk, label: &[u8]) -> PacketKey {
    let secret = expand(prk, label, 32);
    let prk = Salt::new(hkdf::HKDF_SHA256, &[]).extract(&secret);
    let mut key = [0; KEY_LEN];
    key.copy_from_slice(&expand(&prk, b"key", KEY_LEN));
    let mut iv = [0; IV_LEN];
    iv.copy_from_slice(&expand(&prk, b"iv", IV_LEN));
    PacketKey { key, iv }
}

struct OkmLen(usize);

impl KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn expand(prk: &Prk, label: &[u8], len: usize) -> Vec<u8> {
    let info = [label];
    let mut out = vec![0; len];
    // Infallible for the lengths used here (well under 255 hash blocks).
    let okm = prk.expand(&info, OkmLen(len)).unwrap();
    okm.fill(&mut out).unwrap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_keys_are_deterministic() {
        let provider = FixedSaltKeyProvider;
        let dcid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let a = provider.initial_keys(&dcid);
        let b = provider.initial_keys(&dcid);
        assert_eq!(a.tx.key, b.tx.key);
        assert_eq!(a.rx.iv, b.rx.iv);
    }

    #[test]
    fn keys_depend_on_the_dcid() {
        let provider = FixedSaltKeyProvider;
        let a = provider.initial_keys(&ConnectionId::new(&[1; 8]));
        let b = provider.initial_keys(&ConnectionId::new(&[2; 8]));
        assert_ne!(a.tx.key, b.tx.key);
    }

    #[test]
    fn directions_differ() {
        let provider = FixedSaltKeyProvider;
        let keys = provider.initial_keys(&ConnectionId::new(&[1; 8]));
        assert_ne!(keys.tx.key, keys.rx.key);
        let swapped = keys.swapped();
        assert_eq!(swapped.tx.key, keys.rx.key);
        assert_eq!(swapped.rx.key, keys.tx.key);
    }

    #[test]
    fn nonce_mixes_packet_number() {
        let key = PacketKey {
            key: [0; KEY_LEN],
            iv: [0x11; IV_LEN],
        };
        let n0 = key.nonce(0);
        let n1 = key.nonce(1);
        assert_ne!(n0, n1);
        assert_eq!(n0[..4], n1[..4]);
        assert_eq!(n0, [0x11; IV_LEN]);
        assert_eq!(key.nonce(1)[11], 0x11 ^ 0x01);
    }
}

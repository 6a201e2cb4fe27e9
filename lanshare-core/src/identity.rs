//! Node identity and crypto: persistent X25519 keypair, node ID, session/storage keys, AEAD seal/open.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// ChaCha20-Poly1305 nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Symmetric key shared with one peer (or used for local storage).
pub type SessionKey = [u8; 32];

/// Node public key (32 bytes, X25519). Travels in discovery datagrams and handshakes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let buf = STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Node ID: `"{ip}_{unix seconds}"`. Lexicographic order of IDs decides who dials whom.
pub fn node_id(ip: &str, started: DateTime<Utc>) -> String {
    format!("{}_{}", ip, started.timestamp())
}

/// X25519 keypair held for the whole process lifetime. Every peer link derives from it.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair from the OS entropy source.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw Diffie-Hellman output with another node's public key.
    pub fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Pairwise session key with a peer: `derive_session_key(shared_secret(peer))`.
    pub fn session_key(&self, other_public: &PublicKey) -> SessionKey {
        derive_session_key(&self.shared_secret(other_public))
    }

    /// Key for encrypting chat history at rest. Stable for the lifetime of the keypair.
    pub fn storage_key(&self) -> SessionKey {
        let mut hasher = Sha256::new();
        hasher.update(b"lanshare-storage-v1");
        hasher.update(self.secret.to_bytes());
        hasher.finalize().into()
    }
}

/// Derive a 32-byte session key from a DH shared secret.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> SessionKey {
    let mut hasher = Sha256::new();
    hasher.update(b"lanshare-session-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Output of one AEAD seal: ciphertext (with tag) and the random nonce used for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

/// ChaCha20-Poly1305 encrypt with a fresh random nonce.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok(Sealed { ciphertext, nonce })
}

/// ChaCha20-Poly1305 decrypt. Wrong key, tampered data or a mismatched nonce all fail.
pub fn open(key: &SessionKey, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Nonce(nonce.len()));
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("invalid nonce length {0}")]
    Nonce(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> SessionKey {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    #[test]
    fn key_exchange_symmetric() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_eq!(a.shared_secret(b.public_key()), b.shared_secret(a.public_key()));
        assert_eq!(a.session_key(b.public_key()), b.session_key(a.public_key()));
    }

    #[test]
    fn distinct_peers_get_distinct_keys() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let c = Keypair::generate();
        assert_ne!(a.session_key(b.public_key()), a.session_key(c.public_key()));
    }

    #[test]
    fn keypair_from_secret_bytes_is_stable() {
        let a = Keypair::from_secret_bytes([7u8; 32]);
        let b = Keypair::from_secret_bytes([7u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.storage_key(), b.storage_key());
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = random_key();
        let sealed = seal(&key, b"hello lanshare").unwrap();
        let plain = open(&key, &sealed.ciphertext, &sealed.nonce).unwrap();
        assert_eq!(plain.as_slice(), b"hello lanshare");
    }

    #[test]
    fn seal_uses_fresh_nonce() {
        let key = random_key();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let sealed = seal(&random_key(), b"secret").unwrap();
        assert!(matches!(
            open(&random_key(), &sealed.ciphertext, &sealed.nonce),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn open_tampered_ciphertext_fails() {
        let key = random_key();
        let mut sealed = seal(&key, b"secret").unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(open(&key, &sealed.ciphertext, &sealed.nonce).is_err());
    }

    #[test]
    fn open_with_other_nonce_fails() {
        let key = random_key();
        let a = seal(&key, b"one").unwrap();
        let b = seal(&key, b"two").unwrap();
        assert!(open(&key, &a.ciphertext, &b.nonce).is_err());
    }

    #[test]
    fn open_rejects_bad_nonce_length() {
        let key = random_key();
        let sealed = seal(&key, b"x").unwrap();
        assert!(matches!(
            open(&key, &sealed.ciphertext, &sealed.nonce[..8]),
            Err(CryptoError::Nonce(8))
        ));
    }

    #[test]
    fn public_key_serializes_as_base64() {
        let pk = PublicKey::from_bytes([0u8; 32]);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, "\"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=\"");
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pk);
        assert!(serde_json::from_str::<PublicKey>("\"AAAA\"").is_err());
    }

    #[test]
    fn node_id_format_orders_by_ip_string() {
        let t = DateTime::from_timestamp(100, 0).unwrap();
        assert_eq!(node_id("10.0.0.1", t), "10.0.0.1_100");
        assert!(node_id("10.0.0.1", t) < node_id("10.0.0.2", t));
    }
}

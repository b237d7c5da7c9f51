//! Pluggable crypto provider and key types.
//!
//! Every ciphertext is a Base64 string so it can replace a ticket field value
//! in place. The default [`SealedBoxProvider`] uses ChaCha20-Poly1305 for
//! symmetric sealing and X25519 + HKDF-SHA256 + ChaCha20-Poly1305 for sealing
//! to a public key.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEAL_INFO: &[u8] = b"ticket-relay sealed box v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    /// Wrong key, truncated or tampered ciphertext.
    #[error("decryption failed")]
    Decrypt,
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("invalid key length: expected {expected}, got {actual}")]
    KeyLength { expected: usize, actual: usize },
}

/// Symmetric key shared between two roles (long-term) or a client and a role
/// (session). Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        Ok(Self(decode_key(text)?))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        Ok(Self(decode_key(text)?))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        Ok(Self(decode_key(text)?))
    }

    /// Public half matching this private key.
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(*x25519_dalek::PublicKey::from(&secret).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// A role's asymmetric identity, used only during bootstrap.
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

fn decode_key(text: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::Encoding(e.to_string()))?;
    let actual = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::KeyLength { expected: KEY_LEN, actual })
}

/// The cipher suite the protocol runs on.
///
/// Implementations must be deterministic in their key handling but may use
/// randomness for nonces. A wrong key must surface as [`CryptoError::Decrypt`]
/// or [`CryptoError::Encoding`], never as a panic.
pub trait CryptoProvider: Send + Sync + 'static {
    fn generate_symmetric_key(&self) -> SymmetricKey;

    fn generate_key_pair(&self) -> KeyPair;

    fn symmetric_encrypt(&self, key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError>;

    fn symmetric_decrypt(&self, key: &SymmetricKey, ciphertext: &str) -> Result<String, CryptoError>;

    fn asymmetric_encrypt(&self, public: &PublicKey, plaintext: &str) -> Result<String, CryptoError>;

    fn asymmetric_decrypt(&self, private: &PrivateKey, ciphertext: &str) -> Result<String, CryptoError>;
}

/// ChaCha20-Poly1305 / X25519 provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedBoxProvider;

impl SealedBoxProvider {
    pub fn new() -> Self {
        Self
    }

    fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aead = ChaCha20Poly1305::new(Key::from_slice(key));
        let ct = aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);
        let aead = ChaCha20Poly1305::new(Key::from_slice(key));
        aead.decrypt(Nonce::from_slice(nonce), ct).map_err(|_| CryptoError::Decrypt)
    }

    fn derive_box_key(
        shared: &[u8; KEY_LEN],
        ephemeral: &[u8; KEY_LEN],
        recipient: &[u8; KEY_LEN],
    ) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut salt = [0u8; KEY_LEN * 2];
        salt[..KEY_LEN].copy_from_slice(ephemeral);
        salt[KEY_LEN..].copy_from_slice(recipient);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(SEAL_INFO, &mut okm).map_err(|_| CryptoError::Encrypt)?;
        Ok(okm)
    }
}

fn decode_ciphertext(ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD.decode(ciphertext).map_err(|e| CryptoError::Encoding(e.to_string()))
}

fn into_text(bytes: Vec<u8>) -> Result<String, CryptoError> {
    String::from_utf8(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
}

impl CryptoProvider for SealedBoxProvider {
    fn generate_symmetric_key(&self) -> SymmetricKey {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SymmetricKey(bytes)
    }

    fn generate_key_pair(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        KeyPair {
            public: PublicKey(*public.as_bytes()),
            private: PrivateKey(secret.to_bytes()),
        }
    }

    fn symmetric_encrypt(&self, key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
        Ok(STANDARD.encode(Self::seal(&key.0, plaintext.as_bytes())?))
    }

    fn symmetric_decrypt(&self, key: &SymmetricKey, ciphertext: &str) -> Result<String, CryptoError> {
        into_text(Self::open(&key.0, &decode_ciphertext(ciphertext)?)?)
    }

    fn asymmetric_encrypt(&self, public: &PublicKey, plaintext: &str) -> Result<String, CryptoError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let recipient = x25519_dalek::PublicKey::from(public.0);
        let shared = ephemeral.diffie_hellman(&recipient);

        let mut box_key = Self::derive_box_key(shared.as_bytes(), ephemeral_public.as_bytes(), &public.0)?;
        let sealed = Self::seal(&box_key, plaintext.as_bytes());
        box_key.zeroize();

        let sealed = sealed?;
        let mut out = Vec::with_capacity(KEY_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    fn asymmetric_decrypt(&self, private: &PrivateKey, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = decode_ciphertext(ciphertext)?;
        if raw.len() < KEY_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (ephemeral, sealed) = raw.split_at(KEY_LEN);
        let mut ephemeral_bytes = [0u8; KEY_LEN];
        ephemeral_bytes.copy_from_slice(ephemeral);

        let secret = StaticSecret::from(private.0);
        let own_public = x25519_dalek::PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_bytes));

        let mut box_key = Self::derive_box_key(shared.as_bytes(), &ephemeral_bytes, own_public.as_bytes())?;
        let opened = Self::open(&box_key, sealed);
        box_key.zeroize();
        into_text(opened?)
    }
}

//! Encryption layer
//!
//! - Symmetric: ChaCha20-Poly1305 AEAD under a session key, with the nonce
//!   carried separately in the envelope.
//! - Asymmetric: sealed boxes. A fresh X25519 ephemeral key is combined with
//!   the sender's static key so the recipient can both decrypt and
//!   authenticate the sender:
//!
//! ```text
//! ss1 = x25519(ephemeral_sk, recipient_pk)
//! ss2 = x25519(sender_sk, recipient_pk)
//! key = HKDF-SHA256(ss1 || ss2, "pss-asym-v1" || ephemeral_pk || sender_pk)
//! ```
//!
//! - Handshake: both sides feed `x25519(eph_a, eph_b)` into HKDF, salted with
//!   the topic and bound to both identities and the request id.

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::PssError;
use crate::identity::{Keypair, PublicKey};
use crate::topic::Topic;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Size of a symmetric session key.
pub const KEY_SIZE: usize = 32;

/// Domain separation for sealed boxes
const ASYM_INFO: &[u8] = b"pss-asym-v1";

/// Domain separation for handshake key agreement
const HANDSHAKE_INFO: &[u8] = b"pss-handshake-v1";

/// Symmetric session key material.
pub type SymmetricKey = [u8; KEY_SIZE];

/// ChaCha20-Poly1305 cipher bound to one key.
///
/// # Example
///
/// ```
/// use pss_core::crypto::SymmetricCipher;
///
/// let key = SymmetricCipher::generate_key();
/// let cipher = SymmetricCipher::new(&key);
/// let nonce = SymmetricCipher::generate_nonce();
///
/// let ciphertext = cipher.encrypt_with_nonce(b"hello", &nonce).unwrap();
/// let plaintext = cipher.decrypt_with_nonce(&ciphertext, &nonce).unwrap();
/// assert_eq!(plaintext, b"hello");
/// ```
pub struct SymmetricCipher {
    cipher: ChaCha20Poly1305,
}

impl SymmetricCipher {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> SymmetricKey {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with a caller-supplied nonce (not prepended to the output).
    pub fn encrypt_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, PssError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| PssError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt ciphertext produced by [`Self::encrypt_with_nonce`].
    pub fn decrypt_with_nonce(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, PssError> {
        let nonce = Nonce::from_slice(nonce);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| PssError::DecryptionFailed(format!("{}", e)))
    }
}

/// Stable identifier of a session key.
///
/// Derived from the key itself, so both ends of a session compute the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub [u8; 8]);

impl KeyId {
    pub fn of(key: &SymmetricKey) -> Self {
        let hash = blake3::hash(key);
        let mut id = [0u8; 8];
        id.copy_from_slice(&hash.as_bytes()[..8]);
        KeyId(id)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self)
    }
}

/// Asymmetrically encrypted payload.
///
/// Carries the sender's static key and the ephemeral key in clear; the
/// ciphertext only opens for the intended recipient and only if the sender
/// key is genuine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBox {
    /// Sender's static public key
    pub sender: PublicKey,
    /// Ephemeral X25519 public key for this message
    pub ephemeral: [u8; 32],
    /// AEAD ciphertext + tag
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    /// Seal `plaintext` for `recipient`.
    ///
    /// The box key mixes a fresh ephemeral agreement with the static
    /// sender/recipient agreement, so only `recipient` can open it and a
    /// successful open proves it came from `sender`.
    ///
    /// # Arguments
    ///
    /// * `sender` - The local identity, named in the box
    /// * `recipient` - Static public key of the only node able to open it
    /// * `plaintext` - The data to seal
    /// * `nonce` - Envelope nonce; the recipient needs the same one to open
    ///
    /// # Returns
    ///
    /// The sealed box, or an error if key derivation or encryption fails.
    pub fn seal(
        sender: &Keypair,
        recipient: &PublicKey,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Self, PssError> {
        let mut ephemeral_seed = [0u8; 32];
        rand::rng().fill_bytes(&mut ephemeral_seed);
        let ephemeral_secret = StaticSecret::from(ephemeral_seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let ss1 = ephemeral_secret.diffie_hellman(&recipient.to_x25519());
        let ss2 = sender.diffie_hellman(recipient);
        let key = derive_asym_key(
            ss1.as_bytes(),
            ss2.as_bytes(),
            ephemeral_public.as_bytes(),
            &sender.public_key(),
        )?;

        let ciphertext = SymmetricCipher::new(&key).encrypt_with_nonce(plaintext, nonce)?;

        Ok(Self {
            sender: sender.public_key(),
            ephemeral: *ephemeral_public.as_bytes(),
            ciphertext,
        })
    }

    /// Open a sealed box addressed to `recipient`.
    ///
    /// # Returns
    ///
    /// The plaintext, or a crypto error when the box was sealed for someone
    /// else, names a forged sender or was tampered with.
    pub fn open(&self, recipient: &Keypair, nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>, PssError> {
        let ss1 = recipient.diffie_hellman(&PublicKey(self.ephemeral));
        let ss2 = recipient.diffie_hellman(&self.sender);
        let key = derive_asym_key(ss1.as_bytes(), ss2.as_bytes(), &self.ephemeral, &self.sender)?;
        SymmetricCipher::new(&key).decrypt_with_nonce(&self.ciphertext, nonce)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PssError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PssError> {
        Ok(postcard::from_bytes(data)?)
    }
}

fn derive_asym_key(
    ss1: &[u8; 32],
    ss2: &[u8; 32],
    ephemeral: &[u8; 32],
    sender: &PublicKey,
) -> Result<SymmetricKey, PssError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ss1);
    ikm[32..].copy_from_slice(ss2);

    let mut info = Vec::with_capacity(ASYM_INFO.len() + 64);
    info.extend_from_slice(ASYM_INFO);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(sender.as_bytes());

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; KEY_SIZE];
    hk.expand(&info, &mut key)
        .map_err(|e| PssError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

/// Ephemeral X25519 share used for one handshake exchange.
pub struct EphemeralShare {
    secret: StaticSecret,
    public: [u8; 32],
}

impl EphemeralShare {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let secret = StaticSecret::from(seed);
        let public = *X25519PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    /// Derive the session key agreed with the remote share.
    ///
    /// `initiator` and `responder` must be passed in the same order on both
    /// sides.
    pub fn agree(
        &self,
        remote_share: &[u8; 32],
        topic: &Topic,
        initiator: &PublicKey,
        responder: &PublicKey,
        request_id: u64,
    ) -> Result<SymmetricKey, PssError> {
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(*remote_share));
        if !shared.was_contributory() {
            return Err(PssError::HandshakeProtocolError(
                "Non-contributory ephemeral share".to_string(),
            ));
        }

        let mut info = Vec::with_capacity(HANDSHAKE_INFO.len() + 72);
        info.extend_from_slice(HANDSHAKE_INFO);
        info.extend_from_slice(initiator.as_bytes());
        info.extend_from_slice(responder.as_bytes());
        info.extend_from_slice(&request_id.to_be_bytes());

        let hk = Hkdf::<Sha256>::new(Some(topic.as_bytes()), shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        hk.expand(&info, &mut key)
            .map_err(|e| PssError::Crypto(format!("HKDF expand failed: {}", e)))?;
        Ok(key)
    }
}

//! AES-256-GCM implementation of [`Cipher`].
//!
//! Every envelope carries its own random 96-bit nonce. The key is shared by
//! every participant; the relay and all clients start from the same
//! compiled-in default unless a passphrase is configured.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

use super::{Cipher, CryptoError, ENVELOPE_MARKER};

/// Key length for AES-256 (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
const NONCE_SIZE: usize = 12;

/// Shared key used when no passphrase is configured.
// TODO: replace with a per-session key agreed during LOGIN once the relay
// can carry a key-exchange step.
const DEFAULT_KEY: &[u8; KEY_SIZE] = b"PeerChatSharedRelayKey-2025-v1!!";

/// AES-256-GCM cipher producing `ENC:<nonce>:<ciphertext>` envelopes.
#[derive(Clone)]
pub struct AesGcmCipher {
    inner: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    /// Algorithm name reported to clients.
    pub const NAME: &'static str = "AES-256-GCM";

    /// Create a cipher from raw key bytes.
    #[must_use]
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            inner: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Create a cipher using the compiled-in shared key.
    #[must_use]
    pub fn with_default_key() -> Self {
        Self::new(DEFAULT_KEY)
    }

    /// Create a cipher from a passphrase of at least [`KEY_SIZE`] bytes.
    ///
    /// Only the first [`KEY_SIZE`] bytes are used.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the passphrase is too short.
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        let bytes = passphrase.as_bytes();
        let key: &[u8; KEY_SIZE] = bytes
            .get(..KEY_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| {
                CryptoError::InvalidKey(format!(
                    "passphrase must be at least {KEY_SIZE} bytes, got {}",
                    bytes.len()
                ))
            })?;
        Ok(Self::new(key))
    }
}

impl Cipher for AesGcmCipher {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .inner
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(format!(
            "{ENVELOPE_MARKER}{}:{}",
            BASE64.encode(nonce_bytes),
            BASE64.encode(ciphertext)
        ))
    }

    fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let body = envelope
            .trim()
            .strip_prefix(ENVELOPE_MARKER)
            .ok_or(CryptoError::NotAnEnvelope)?;
        let (nonce_b64, ciphertext_b64) = body
            .split_once(':')
            .ok_or_else(|| CryptoError::MalformedEnvelope("missing nonce separator".into()))?;

        let nonce_bytes = BASE64
            .decode(nonce_b64)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("invalid nonce encoding: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::MalformedEnvelope(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = BASE64.decode(ciphertext_b64).map_err(|e| {
            CryptoError::MalformedEnvelope(format!("invalid ciphertext encoding: {e}"))
        })?;

        self.inner
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

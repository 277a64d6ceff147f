//! Symmetric payload encryption for relay commands, peer messages and file
//! chunks.
//!
//! Defines the [`Cipher`] trait that the relay and the peer transports use
//! to seal and open payloads, plus the error type shared by implementations.
//! Whether a payload is sealed is decided by the caller; the cipher only
//! knows how.
//!
//! # Envelope format
//!
//! A sealed payload travels as ASCII text so it can sit inside a command
//! line or a `PEER_MSG` frame:
//!
//! ```text
//! ENC:<base64 nonce>:<base64 ciphertext>
//! ```
//!
//! The `ENC:` marker makes envelopes distinguishable from plaintext.

pub mod aead;

pub use aead::AesGcmCipher;

/// Prefix that identifies a sealed envelope on the wire.
pub const ENVELOPE_MARKER: &str = "ENC:";

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The supplied key material has the wrong length.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// The input does not start with the envelope marker.
    #[error("payload is not an encrypted envelope")]
    NotAnEnvelope,

    /// The envelope is structurally invalid (bad base64, bad nonce length).
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Decryption failed (corrupted ciphertext, wrong key, or tampered data).
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Keyed, stateless-per-call payload encryption.
///
/// Implementations must be safe to share between the relay's worker
/// threads and the peer listener's connection threads.
///
/// # Invariant
///
/// `open(&seal(x)?)? == x` for every byte string `x`, including the empty
/// one, and every call to `seal` uses a fresh nonce.
pub trait Cipher: Send + Sync {
    /// Human-readable algorithm name (reported by `ENCRYPTION_STATUS`).
    fn name(&self) -> &str;

    /// Encrypt `plaintext` into a self-identifying envelope.
    fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError>;

    /// Decrypt an envelope produced by [`Cipher::seal`].
    ///
    /// Surrounding whitespace is ignored.
    fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError>;

    /// Returns `true` if `bytes` carries the envelope marker.
    fn is_envelope(&self, bytes: &[u8]) -> bool {
        is_envelope(bytes)
    }
}

/// Returns `true` if `bytes` starts with [`ENVELOPE_MARKER`].
#[must_use]
pub fn is_envelope(bytes: &[u8]) -> bool {
    bytes.starts_with(ENVELOPE_MARKER.as_bytes())
}

/// Seals and opens a fixed sample, returning `true` if the cipher round-trips.
///
/// Binaries run this at start-up and fall back to plaintext when it fails.
pub fn self_test(cipher: &dyn Cipher) -> bool {
    const PROBE: &[u8] = b"peerchat cipher self-test";
    cipher
        .seal(PROBE)
        .and_then(|envelope| cipher.open(&envelope))
        .is_ok_and(|plain| plain == PROBE)
}

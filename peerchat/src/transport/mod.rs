//! Direct peer-to-peer transport for `PeerChat`.
//!
//! Peers never hold a standing connection. Every message and every file
//! goes over a fresh TCP connection to the recipient's [`PeerListener`]:
//! - [`outbound::PeerTransport`] connects, sends one `PEER_MSG` frame,
//!   waits briefly for a `PEER_ACK`, and closes.
//! - [`listener::PeerListener`] accepts on a dedicated thread and handles
//!   each inbound connection on its own short-lived thread.

pub mod listener;
pub mod outbound;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use peerchat_proto::codec::CodecError;
use peerchat_proto::crypto::CryptoError;

pub use listener::PeerListener;
pub use outbound::PeerTransport;

/// Default connect and ack timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Peer address.
        addr: SocketAddr,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// Encryption was requested but no cipher is configured.
    #[error("encryption requested but no cipher is configured")]
    NoCipher,

    /// Writing the message frame failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The message could not be sealed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of a successful [`PeerTransport::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The receiving peer acknowledged the message.
    Acknowledged {
        /// Username the receiver reported in its ack.
        by: String,
    },
    /// The message was written but no valid ack came back.
    Unacknowledged,
}

impl Delivery {
    /// Returns `true` if the receiver confirmed the message.
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged { .. })
    }
}

/// Something that arrived at the local [`PeerListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A direct message.
    Message {
        /// Sender's username.
        from: String,
        /// Plaintext body.
        text: String,
        /// Whether the message arrived sealed.
        encrypted: bool,
    },
    /// A file was received completely.
    FileReceived {
        /// Sender's username.
        from: String,
        /// Where the file was saved.
        path: PathBuf,
        /// File size in bytes.
        size: u64,
    },
    /// An incoming file transfer failed or was refused.
    FileFailed {
        /// Sender's username.
        from: String,
        /// Offered file name.
        filename: String,
        /// Human-readable failure reason.
        reason: String,
    },
}

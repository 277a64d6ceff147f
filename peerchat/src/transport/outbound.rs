//! One-shot outbound messages.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use peerchat_proto::codec;
use peerchat_proto::crypto::Cipher;
use peerchat_proto::peer::PeerFrame;

use super::{DEFAULT_TIMEOUT, Delivery, TransportError};

/// Sends direct messages on behalf of one local user.
#[derive(Clone)]
pub struct PeerTransport {
    local_user: String,
    cipher: Option<Arc<dyn Cipher>>,
    connect_timeout: Duration,
    ack_timeout: Duration,
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("local_user", &self.local_user)
            .field("encryption", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl PeerTransport {
    /// Creates a transport sending as `local_user`.
    pub fn new(local_user: impl Into<String>, cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self {
            local_user: local_user.into(),
            cipher,
            connect_timeout: DEFAULT_TIMEOUT,
            ack_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the connect and ack timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, ack: Duration) -> Self {
        self.connect_timeout = connect;
        self.ack_timeout = ack;
        self
    }

    /// Sends `text` to the peer listening on `addr`.
    ///
    /// A message counts as delivered once its frame is written. A missing
    /// or malformed ack yields [`Delivery::Unacknowledged`] rather than an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the peer is unreachable, the frame
    /// cannot be written, or `encrypt` is set without a cipher.
    pub fn send(&self, addr: SocketAddr, text: &str, encrypt: bool) -> Result<Delivery, TransportError> {
        let payload = if encrypt {
            let cipher = self.cipher.as_ref().ok_or(TransportError::NoCipher)?;
            cipher.seal(text.as_bytes())?
        } else {
            text.to_string()
        };
        let frame = PeerFrame::Message {
            from: self.local_user.clone(),
            payload,
        };

        let mut stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|source| TransportError::Connect { addr, source })?;
        stream.set_read_timeout(Some(self.ack_timeout))?;
        codec::write_frame(&mut stream, &frame.encode())?;
        tracing::debug!(peer = %addr, encrypted = encrypt, "message sent");

        let delivery = match codec::read_frame(&mut stream).map(|bytes| PeerFrame::parse(&bytes)) {
            Ok(Some(PeerFrame::Ack { user })) => Delivery::Acknowledged { by: user },
            Ok(other) => {
                tracing::warn!(peer = %addr, reply = ?other, "peer replied without a valid ack");
                Delivery::Unacknowledged
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "no ack from peer");
                Delivery::Unacknowledged
            }
        };
        Ok(delivery)
    }
}

//! Inbound peer connections: direct messages and file offers.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use peerchat_proto::{addr, codec};
use peerchat_proto::crypto::{self, Cipher};
use peerchat_proto::peer::{self, FileOffer, PeerFrame};

use super::{PeerEvent, TransportError};
use crate::transfer::{self, ProgressCallback};

/// Idle limit for a single read on an inbound connection.
const INBOUND_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything an inbound connection thread needs.
struct Inbound {
    local_user: RwLock<String>,
    cipher: Option<Arc<dyn Cipher>>,
    download_dir: PathBuf,
    events: Sender<PeerEvent>,
    progress: Option<ProgressCallback>,
}

/// Accepts peer connections on a dedicated thread.
pub struct PeerListener {
    local_addr: SocketAddr,
    inbound: Arc<Inbound>,
    stopping: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl PeerListener {
    /// Binds `addr` and starts accepting.
    ///
    /// Messages and finished transfers are reported on `events`; acks are
    /// signed with `local_user`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound or the
    /// accept thread cannot be spawned.
    pub fn bind(
        addr: impl ToSocketAddrs,
        local_user: impl Into<String>,
        cipher: Option<Arc<dyn Cipher>>,
        download_dir: impl Into<PathBuf>,
        events: Sender<PeerEvent>,
    ) -> Result<Self, TransportError> {
        Self::bind_with_progress(addr, local_user, cipher, download_dir, events, None)
    }

    /// Like [`PeerListener::bind`], reporting incoming file progress to
    /// `progress`.
    ///
    /// # Errors
    ///
    /// See [`PeerListener::bind`].
    pub fn bind_with_progress(
        addr: impl ToSocketAddrs,
        local_user: impl Into<String>,
        cipher: Option<Arc<dyn Cipher>>,
        download_dir: impl Into<PathBuf>,
        events: Sender<PeerEvent>,
        progress: Option<ProgressCallback>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let inbound = Arc::new(Inbound {
            local_user: RwLock::new(local_user.into()),
            cipher,
            download_dir: download_dir.into(),
            events,
            progress,
        });
        let stopping = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let inbound = Arc::clone(&inbound);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("peerchat-p2p-accept".to_string())
                .spawn(move || accept_loop(&listener, &inbound, &stopping))?
        };
        tracing::info!(addr = %local_addr, "peer listener started");

        Ok(Self {
            local_addr,
            inbound,
            stopping,
            accept_thread: Some(accept_thread),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port the listener is bound to, as announced at login.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Changes the username put in acks, e.g. after logging in.
    pub fn set_local_user(&self, user: impl Into<String>) {
        *self.inbound.local_user.write() = user.into();
    }

    /// Stops accepting and joins the accept thread.
    ///
    /// Connections already being handled run to completion.
    pub fn stop(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(addr::connectable(self.local_addr));
        if handle.join().is_err() {
            tracing::error!("peer accept thread panicked");
        }
        tracing::info!(addr = %self.local_addr, "peer listener stopped");
    }
}

impl Drop for PeerListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: &TcpListener, inbound: &Arc<Inbound>, stopping: &AtomicBool) {
    for incoming in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "peer accept failed");
                continue;
            }
        };
        let inbound = Arc::clone(inbound);
        let spawned = thread::Builder::new()
            .name("peerchat-p2p-conn".to_string())
            .spawn(move || handle_inbound(&inbound, stream));
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn peer connection thread");
        }
    }
}

fn handle_inbound(inbound: &Inbound, mut stream: TcpStream) {
    let peer_addr = stream.peer_addr().ok();
    if let Err(e) = stream.set_read_timeout(Some(INBOUND_READ_TIMEOUT)) {
        tracing::debug!(error = %e, "failed to set read timeout");
    }
    let payload = match codec::read_frame_or_legacy(&mut stream) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(peer = ?peer_addr, error = %e, "dropping inbound connection");
            return;
        }
    };

    if peer::is_file_offer(&payload) {
        match PeerFrame::parse(&payload) {
            Some(PeerFrame::FileOffer(offer)) => handle_file(inbound, &mut stream, &offer),
            _ => {
                let reject = PeerFrame::FileReject {
                    reason: "Invalid header".to_string(),
                };
                let _ = codec::write_frame(&mut stream, &reject.encode());
                tracing::warn!(peer = ?peer_addr, "malformed file offer");
            }
        }
        return;
    }

    match PeerFrame::parse(&payload) {
        Some(PeerFrame::Message { from, payload }) => handle_message(inbound, &mut stream, from, &payload),
        _ => tracing::debug!(peer = ?peer_addr, len = payload.len(), "ignoring unrecognised peer payload"),
    }
}

fn handle_message(inbound: &Inbound, stream: &mut TcpStream, from: String, payload: &str) {
    let encrypted = crypto::is_envelope(payload.as_bytes());
    let text = if encrypted {
        let opened = inbound
            .cipher
            .as_ref()
            .ok_or(crypto::CryptoError::DecryptionFailed)
            .and_then(|cipher| cipher.open(payload))
            .and_then(|bytes| String::from_utf8(bytes).map_err(|_| crypto::CryptoError::DecryptionFailed));
        match opened {
            Ok(text) => text,
            Err(e) => {
                // No ack: the sender sees an unacknowledged delivery.
                tracing::warn!(from = %from, error = %e, "dropping undecryptable peer message");
                return;
            }
        }
    } else {
        payload.to_string()
    };

    tracing::info!(from = %from, encrypted, "peer message received");
    let _ = inbound.events.send(PeerEvent::Message {
        from,
        text,
        encrypted,
    });

    let ack = PeerFrame::Ack {
        user: inbound.local_user.read().clone(),
    };
    if let Err(e) = codec::write_frame(stream, &ack.encode()) {
        // Legacy peers close right after sending.
        tracing::debug!(error = %e, "failed to write ack");
    }
}

fn handle_file(inbound: &Inbound, stream: &mut TcpStream, offer: &FileOffer) {
    let result = transfer::receive_file(
        stream,
        offer,
        &inbound.download_dir,
        inbound.cipher.as_deref(),
        inbound.progress.as_ref(),
    );
    let event = match result {
        Ok(path) => PeerEvent::FileReceived {
            from: offer.sender.clone(),
            path,
            size: offer.size,
        },
        Err(e) => {
            tracing::warn!(from = %offer.sender, file = %offer.filename, error = %e, "incoming transfer failed");
            PeerEvent::FileFailed {
                from: offer.sender.clone(),
                filename: offer.filename.clone(),
                reason: e.to_string(),
            }
        }
    };
    let _ = inbound.events.send(event);
}

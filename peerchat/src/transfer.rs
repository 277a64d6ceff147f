//! Direct file transfer between two clients.
//!
//! The sender opens a fresh connection to the receiver's peer listener and
//! runs this exchange, every message being one length-prefixed frame:
//!
//! ```text
//! sender                               receiver
//!   FILE_OFFER:<from>:<name>:<size>:<0|1>  ->
//!                                      <-  FILE_ACCEPT | FILE_REJECT:<reason>
//!   chunk 1 .. chunk n                  ->
//!                                      <-  FILE_COMPLETE
//! ```
//!
//! Chunks carry at most `chunk_size` bytes of file data. With encryption on,
//! each chunk is sealed on its own and travels as an envelope.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use peerchat_proto::codec::{self, CodecError};
use peerchat_proto::crypto::{Cipher, CryptoError};
use peerchat_proto::peer::{FileOffer, PeerFrame};

/// Bytes of file data per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Suffix of the file being written until the transfer completes.
const PARTIAL_SUFFIX: &str = ".part";

/// Errors that can occur during a file transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The transfer was refused, by the remote peer or by the local
    /// receiver.
    #[error("transfer rejected: {0}")]
    Rejected(String),

    /// The peer answered with something other than the expected frame.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    /// The path has no usable file name.
    #[error("not a sendable file: {}", .0.display())]
    InvalidPath(PathBuf),

    /// Encryption was requested but no cipher is configured.
    #[error("encryption requested but no cipher is configured")]
    NoCipher,

    /// The number of bytes received does not match the offer.
    #[error("size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch {
        /// Size announced in the offer.
        expected: u64,
        /// Bytes actually received.
        got: u64,
    },

    /// Framing failed (closed stream, short frame, oversized frame).
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A chunk could not be sealed or opened.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// File or socket I/O failed.
    #[error("transfer I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Snapshot of transfer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes of file data moved so far.
    pub transferred: u64,
    /// Total file size.
    pub total: u64,
}

impl TransferProgress {
    /// Completion in percent; an empty file is complete from the start.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.transferred as f64 * 100.0 / self.total as f64
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}% ({}/{} bytes)", self.percent(), self.transferred, self.total)
    }
}

/// Observer invoked after every chunk.
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Outbound side of the transfer protocol.
#[derive(Clone)]
pub struct FileSender {
    chunk_size: usize,
    cipher: Option<Arc<dyn Cipher>>,
    progress: Option<ProgressCallback>,
    timeout: Duration,
}

impl fmt::Debug for FileSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSender")
            .field("chunk_size", &self.chunk_size)
            .field("encryption", &self.cipher.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl FileSender {
    /// A sender with the default chunk size and a 30 second reply timeout.
    #[must_use]
    pub fn new(cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cipher,
            progress: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Overrides the chunk size (clamped to at least one byte).
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Reports progress to `callback` after each chunk.
    #[must_use]
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Sets the connect and reply timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Connects to `addr` and sends the file at `path`.
    ///
    /// Returns the number of bytes sent once the receiver confirms with
    /// `FILE_COMPLETE`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] on rejection, I/O failure, or a missing
    /// cipher when `encrypt` is set.
    pub fn send_file(
        &self,
        addr: SocketAddr,
        path: &Path,
        sender: &str,
        encrypt: bool,
    ) -> Result<u64, TransferError> {
        let cipher = self.cipher_for(encrypt)?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidPath(path.to_path_buf()))?
            .to_string();
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;

        let offer = FileOffer {
            sender: sender.to_string(),
            filename,
            size,
            encrypted: cipher.is_some(),
        };
        tracing::info!(peer = %addr, file = %offer.filename, size, encrypted = offer.encrypted, "offering file");
        self.send_over(&mut stream, &mut file, &offer, cipher)
    }

    /// Runs the sender side of the exchange over an established stream.
    fn send_over<S: Read + Write>(
        &self,
        stream: &mut S,
        file: &mut impl Read,
        offer: &FileOffer,
        cipher: Option<&dyn Cipher>,
    ) -> Result<u64, TransferError> {
        codec::write_frame(stream, &PeerFrame::FileOffer(offer.clone()).encode())?;
        match PeerFrame::parse(&codec::read_frame(stream)?) {
            Some(PeerFrame::FileAccept) => {}
            Some(PeerFrame::FileReject { reason }) => return Err(TransferError::Rejected(reason)),
            other => return Err(unexpected(other)),
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        while sent < offer.size {
            let n = read_chunk(file, &mut buf)?;
            if n == 0 {
                // File shrank after the offer went out.
                return Err(TransferError::SizeMismatch {
                    expected: offer.size,
                    got: sent,
                });
            }
            let chunk = &buf[..n];
            match cipher {
                Some(cipher) => codec::write_frame(stream, cipher.seal(chunk)?.as_bytes())?,
                None => codec::write_frame(stream, chunk)?,
            }
            sent += n as u64;
            self.report(sent, offer.size);
        }
        if offer.size == 0 {
            self.report(0, 0);
        }

        match PeerFrame::parse(&codec::read_frame(stream)?) {
            Some(PeerFrame::FileComplete) => {
                tracing::info!(file = %offer.filename, bytes = sent, "file sent");
                Ok(sent)
            }
            other => Err(unexpected(other)),
        }
    }

    fn cipher_for(&self, encrypt: bool) -> Result<Option<&dyn Cipher>, TransferError> {
        if !encrypt {
            return Ok(None);
        }
        self.cipher
            .as_deref()
            .map(Some)
            .ok_or(TransferError::NoCipher)
    }

    fn report(&self, transferred: u64, total: u64) {
        if let Some(callback) = &self.progress {
            callback(TransferProgress { transferred, total });
        }
    }
}

/// Receiver side of the exchange, run after the peer listener has read
/// `offer` from `stream`.
///
/// The file is written to `<download_dir>/<name>.part` and renamed to
/// `<download_dir>/<name>` after the last byte arrives. On failure the
/// partial file is removed. Returns the final path.
///
/// # Errors
///
/// Returns [`TransferError::Rejected`] if the offer was refused locally,
/// or any framing, crypto, I/O, or size error from the chunk stream.
pub fn receive_file<S: Read + Write>(
    stream: &mut S,
    offer: &FileOffer,
    download_dir: &Path,
    cipher: Option<&dyn Cipher>,
    progress: Option<&ProgressCallback>,
) -> Result<PathBuf, TransferError> {
    let Some(name) = safe_file_name(&offer.filename) else {
        return reject(stream, "Invalid file name");
    };
    let cipher = match (offer.encrypted, cipher) {
        (true, None) => return reject(stream, "Encryption not supported"),
        (true, Some(cipher)) => Some(cipher),
        (false, _) => None,
    };

    let final_path = download_dir.join(&name);
    let partial_path = download_dir.join(format!("{name}{PARTIAL_SUFFIX}"));
    let file = match fs::create_dir_all(download_dir).and_then(|()| File::create(&partial_path)) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %partial_path.display(), error = %e, "cannot create download file");
            return reject(stream, "Cannot create file");
        }
    };

    codec::write_frame(stream, &PeerFrame::FileAccept.encode())?;
    tracing::info!(from = %offer.sender, file = %name, size = offer.size, "receiving file");

    let received = receive_chunks(stream, file, offer.size, cipher, progress)
        .and_then(|()| fs::rename(&partial_path, &final_path).map_err(TransferError::from));
    if let Err(e) = received {
        let _ = fs::remove_file(&partial_path);
        return Err(e);
    }

    codec::write_frame(stream, &PeerFrame::FileComplete.encode())?;
    tracing::info!(from = %offer.sender, path = %final_path.display(), "file received");
    Ok(final_path)
}

fn receive_chunks<R: Read>(
    stream: &mut R,
    file: File,
    total: u64,
    cipher: Option<&dyn Cipher>,
    progress: Option<&ProgressCallback>,
) -> Result<(), TransferError> {
    let mut out = BufWriter::new(file);
    let mut received: u64 = 0;
    while received < total {
        let frame = codec::read_frame(stream)?;
        let chunk = match cipher {
            Some(cipher) => {
                let envelope = std::str::from_utf8(&frame).map_err(|_| CryptoError::NotAnEnvelope)?;
                cipher.open(envelope)?
            }
            None => frame,
        };
        let got = received + chunk.len() as u64;
        if got > total {
            return Err(TransferError::SizeMismatch {
                expected: total,
                got,
            });
        }
        out.write_all(&chunk)?;
        received = got;
        if let Some(callback) = progress {
            callback(TransferProgress { transferred: received, total });
        }
    }
    out.flush()?;
    Ok(())
}

fn reject<W: Write>(stream: &mut W, reason: &str) -> Result<PathBuf, TransferError> {
    tracing::warn!(%reason, "rejecting file offer");
    codec::write_frame(
        stream,
        &PeerFrame::FileReject {
            reason: reason.to_string(),
        }
        .encode(),
    )?;
    Err(TransferError::Rejected(reason.to_string()))
}

/// Reduces an offered name to its last path component.
fn safe_file_name(offered: &str) -> Option<String> {
    let last = offered.rsplit(['/', '\\']).next()?;
    match last {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}

/// Fills `buf` as far as the reader allows; returns bytes read.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn unexpected(frame: Option<PeerFrame>) -> TransferError {
    TransferError::UnexpectedReply(frame.map_or_else(|| "unrecognised frame".to_string(), |f| f.to_string()))
}

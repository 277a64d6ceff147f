//! Client side of the relay command protocol.
//!
//! A background reader thread owns the read half of the connection. It
//! opens sealed lines, folds continuation lines (those starting with
//! whitespace, as in `ROOM_HISTORY`) into the response they belong to, and
//! routes room pushes away from command responses.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use peerchat_proto::command::{self, Push};
use peerchat_proto::crypto::{self, Cipher, CryptoError};

/// How long the reader waits for more continuation lines before handing a
/// response over.
const CONTINUATION_GRACE: Duration = Duration::from_millis(50);

/// Errors returned by [`ServerClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server address could not be resolved or reached.
    #[error("failed to connect to server {addr}: {source}")]
    Connect {
        /// Server address as given.
        addr: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// No response arrived in time.
    #[error("timed out waiting for server response")]
    Timeout,

    /// The server closed the connection.
    #[error("server connection closed")]
    Disconnected,

    /// The server answered `ERROR: <reason>`.
    #[error("server error: {0}")]
    Server(String),

    /// The response did not have the expected shape.
    #[error("unexpected server response: {0}")]
    UnexpectedResponse(String),

    /// A request could not be sealed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A connection to the relay server.
pub struct ServerClient {
    writer: Mutex<TcpStream>,
    responses: Mutex<Receiver<String>>,
    pushes: Option<Receiver<String>>,
    cipher: Option<Arc<dyn Cipher>>,
    timeout: Duration,
    reader: Option<JoinHandle<()>>,
}

impl ServerClient {
    /// Connects to the server at `addr`. With a cipher, every request is
    /// sealed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the server is unreachable.
    pub fn connect(
        addr: &str,
        cipher: Option<Arc<dyn Cipher>>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let connect_err = |source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };
        let resolved = addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| connect_err(io::Error::from(io::ErrorKind::AddrNotAvailable)))?;
        let stream = TcpStream::connect_timeout(&resolved, timeout).map_err(connect_err)?;
        let read_half = stream.try_clone()?;
        read_half.set_read_timeout(Some(CONTINUATION_GRACE))?;

        let (response_tx, response_rx) = mpsc::channel();
        let (push_tx, push_rx) = mpsc::channel();
        let reader = {
            let cipher = cipher.clone();
            thread::Builder::new()
                .name("peerchat-server-reader".to_string())
                .spawn(move || read_loop(read_half, cipher.as_deref(), &response_tx, &push_tx))?
        };
        tracing::info!(server = %resolved, encrypted = cipher.is_some(), "connected to server");

        Ok(Self {
            writer: Mutex::new(stream),
            responses: Mutex::new(response_rx),
            pushes: Some(push_rx),
            cipher,
            timeout,
            reader: Some(reader),
        })
    }

    /// Sends one command line and waits for its response.
    ///
    /// `ERROR:` responses are returned as text, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`], [`ClientError::Disconnected`], or
    /// an I/O or sealing error.
    pub fn request(&self, line: &str) -> Result<String, ClientError> {
        let responses = self.responses.lock();
        // Discard anything left over from a request that timed out.
        while responses.try_recv().is_ok() {}

        let wire = match &self.cipher {
            Some(cipher) => cipher.seal(line.as_bytes())?,
            None => line.to_string(),
        };
        {
            let mut writer = self.writer.lock();
            writer.write_all(wire.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }

        match responses.recv_timeout(self.timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Disconnected),
        }
    }

    /// Like [`ServerClient::request`], turning `ERROR:` responses into
    /// [`ClientError::Server`].
    ///
    /// # Errors
    ///
    /// See [`ServerClient::request`].
    pub fn request_ok(&self, line: &str) -> Result<String, ClientError> {
        let response = self.request(line)?;
        match response.strip_prefix("ERROR:") {
            Some(reason) => Err(ClientError::Server(reason.trim().to_string())),
            None => Ok(response),
        }
    }

    /// Looks up the peer endpoint of `username`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Server`] if the user is unknown or offline.
    pub fn user_endpoint(&self, username: &str) -> Result<SocketAddr, ClientError> {
        let response = self.request_ok(&format!("GET_USER_INFO {username}"))?;
        parse_user_info(&response).ok_or(ClientError::UnexpectedResponse(response))
    }

    /// Takes the receiver of room pushes. Returns `None` after the first
    /// call.
    pub const fn take_pushes(&mut self) -> Option<Receiver<String>> {
        self.pushes.take()
    }

    /// Closes the connection and joins the reader thread.
    pub fn close(&mut self) {
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            tracing::error!("server reader thread panicked");
        }
    }
}

impl Drop for ServerClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parses a `USER_INFO:ip:port` response into a socket address.
#[must_use]
pub fn parse_user_info(response: &str) -> Option<SocketAddr> {
    let (ip, port) = command::parse_user_info(response)?;
    let ip = ip.parse().ok()?;
    Some(SocketAddr::new(ip, port))
}

/// Splits the server stream into responses and pushes.
struct LineRouter<'a> {
    responses: &'a Sender<String>,
    pushes: &'a Sender<String>,
    pending: Option<String>,
}

impl LineRouter<'_> {
    /// Handles one complete line, already stripped of its terminator.
    fn line(&mut self, line: &str, cipher: Option<&dyn Cipher>) {
        if line.starts_with([' ', '\t'])
            && let Some(pending) = self.pending.as_mut()
        {
            pending.push('\n');
            pending.push_str(line);
            return;
        }
        self.flush();

        if crypto::is_envelope(line.as_bytes()) {
            let opened = cipher
                .ok_or(CryptoError::DecryptionFailed)
                .and_then(|c| c.open(line))
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
            match opened {
                // A sealed line is always complete.
                Ok(text) => self.route(text),
                Err(e) => tracing::warn!(error = %e, "failed to open server line"),
            }
        } else {
            self.pending = Some(line.to_string());
        }
    }

    fn flush(&mut self) {
        if let Some(text) = self.pending.take() {
            self.route(text);
        }
    }

    fn route(&self, text: String) {
        let target = if Push::is_push(&text) {
            self.pushes
        } else {
            self.responses
        };
        let _ = target.send(text);
    }
}

fn read_loop(
    stream: TcpStream,
    cipher: Option<&dyn Cipher>,
    responses: &Sender<String>,
    pushes: &Sender<String>,
) {
    let mut reader = BufReader::new(stream);
    let mut router = LineRouter {
        responses,
        pushes,
        pending: None,
    };
    let mut buf = Vec::new();

    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() != Some(&b'\n') {
                    // Stream ended mid-line.
                    router.line(&String::from_utf8_lossy(&buf), cipher);
                    break;
                }
                let text = String::from_utf8_lossy(&buf);
                router.line(text.trim_end_matches(['\r', '\n']), cipher);
                buf.clear();
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                // Quiet period: whatever is pending is complete.
                if buf.is_empty() {
                    router.flush();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "server read failed");
                break;
            }
        }
    }
    router.flush();
    tracing::debug!("server reader exiting");
}

//! Relay server core: shared state, command dispatch, the per-connection
//! handler, and the accept loop.
//!
//! Each accepted TCP connection becomes one task on the [`WorkerPool`] and
//! keeps its worker until the client logs out or disconnects. Requests are
//! newline-terminated command lines, optionally sealed as envelopes; every
//! request gets exactly one response line, sealed iff the request was.
//! Invalid UTF-8 in a request is replaced rather than dropping the session,
//! and a line longer than [`MAX_LINE_LEN`] ends it.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use peerchat_proto::addr;
use peerchat_proto::command::{Command, Response};
use peerchat_proto::crypto::{self, AesGcmCipher, Cipher};

use crate::config::RelayConfig;
use crate::connection::{ConnectionHandle, ConnectionMap};
use crate::pool::{PoolError, WorkerPool};
use crate::rooms::{RoomError, RoomRegistry};
use crate::sessions::{SessionError, SessionRegistry};

const NOT_LOGGED_IN: &str = "Not logged in";
const EMPTY_TARGET: &str = "Target username cannot be empty";
const DECRYPTION_FAILED: &str = "Decryption failed";
const LINE_TOO_LONG: &str = "Request too long";

/// Longest request line accepted, excluding the newline.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// How long a response or push may block on a client that stopped reading.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while starting the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The worker pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Any other socket or thread failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// State shared by every connection handler.
pub struct RelayState {
    /// Accounts and presence.
    pub sessions: SessionRegistry,
    /// Chat rooms.
    pub rooms: RoomRegistry,
    /// Username to live connection, used for room pushes.
    pub connections: Arc<ConnectionMap>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl RelayState {
    /// Creates empty registries; `cipher` enables envelope support.
    #[must_use]
    pub fn new(cipher: Option<Arc<dyn Cipher>>) -> Self {
        let connections = Arc::new(ConnectionMap::new());
        Self {
            sessions: SessionRegistry::new(),
            rooms: RoomRegistry::new(Arc::clone(&connections), cipher.clone()),
            connections,
            cipher,
        }
    }

    /// The server cipher, if encryption is enabled.
    #[must_use]
    pub fn cipher(&self) -> Option<&Arc<dyn Cipher>> {
        self.cipher.as_ref()
    }
}

/// Per-connection session state.
#[derive(Debug)]
pub struct SessionContext {
    client_id: u64,
    peer_ip: String,
    connection: ConnectionHandle,
    user: Option<String>,
}

impl SessionContext {
    /// A fresh anonymous session for the connection `connection`.
    #[must_use]
    pub fn new(client_id: u64, peer_ip: impl Into<String>, connection: ConnectionHandle) -> Self {
        Self {
            client_id,
            peer_ip: peer_ip.into(),
            connection,
            user: None,
        }
    }

    /// Username bound to this connection, if authenticated.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
}

/// Executes one command against the shared state.
///
/// Never touches the socket: the caller writes the returned response.
pub fn dispatch(state: &RelayState, session: &mut SessionContext, command: Command) -> Response {
    match command {
        Command::Register { username, password } => {
            match state.sessions.register(&username, &password) {
                Ok(()) => Response::RegisterSuccess,
                Err(e) => Response::error(e),
            }
        }
        Command::Login {
            username,
            password,
            port,
        } => login(state, session, &username, &password, port),
        Command::Logout => {
            if session.user.is_none() {
                return Response::error(NOT_LOGGED_IN);
            }
            end_identity(state, session);
            Response::LogoutSuccess
        }
        Command::List => Response::OnlineUsers(state.sessions.list_online()),
        Command::Message { text } => {
            let Some(user) = session.user() else {
                return Response::error(NOT_LOGGED_IN);
            };
            tracing::info!(client_id = session.client_id, user = %user, message = %text, "message from client");
            Response::MessageReceived
        }
        Command::GetUserInfo { username } => {
            if session.user.is_none() {
                return Response::error(NOT_LOGGED_IN);
            }
            if username.is_empty() {
                return Response::error(EMPTY_TARGET);
            }
            match state.sessions.get_user_info(&username) {
                Ok(endpoint) => Response::UserInfo {
                    ip: endpoint.ip,
                    port: endpoint.port,
                },
                Err(e) => Response::error(e),
            }
        }
        Command::EncryptionStatus => {
            Response::EncryptionStatus(state.cipher().map(|c| c.name().to_string()))
        }
        Command::ListRooms => Response::Rooms(state.rooms.list_rooms()),
        Command::CreateRoom { room } => with_user(session, |user| {
            state
                .rooms
                .create(&room, user)
                .map(|()| Response::RoomCreated(room.clone()))
        }),
        Command::JoinRoom { room } => with_user(session, |user| {
            state
                .rooms
                .join(&room, user)
                .map(|()| Response::RoomJoined(room.clone()))
        }),
        Command::LeaveRoom { room } => with_user(session, |user| {
            state
                .rooms
                .leave(&room, user)
                .map(|()| Response::RoomLeft(room.clone()))
        }),
        Command::RoomMembers { room } => with_user(session, |user| {
            state
                .rooms
                .members(&room, user)
                .map(|members| Response::RoomMembers {
                    room: room.clone(),
                    members,
                })
        }),
        Command::RoomMsg { room, text } => with_user(session, |user| {
            state
                .rooms
                .post(&room, user, &text)
                .map(|()| Response::RoomMsgSent)
        }),
        Command::RoomHistory { room } => with_user(session, |user| {
            state
                .rooms
                .history(&room, user)
                .map(|entries| Response::RoomHistory {
                    room: room.clone(),
                    entries,
                })
        }),
    }
}

fn login(
    state: &RelayState,
    session: &mut SessionContext,
    username: &str,
    password: &str,
    port: u32,
) -> Response {
    if session.user.is_some() {
        return Response::error(SessionError::AlreadyOnline);
    }
    if let Err(e) = state.sessions.login(username, password, &session.peer_ip, port) {
        return Response::error(e);
    }
    state
        .connections
        .bind(username, session.connection.clone());
    session.user = Some(username.to_string());
    Response::LoginSuccess
}

/// Runs a room command for the authenticated user, mapping room errors to
/// `ERROR:` responses.
fn with_user(
    session: &SessionContext,
    f: impl FnOnce(&str) -> Result<Response, RoomError>,
) -> Response {
    match session.user() {
        Some(user) => f(user).unwrap_or_else(Response::error),
        None => Response::error(NOT_LOGGED_IN),
    }
}

/// Returns the session to anonymous: leaves rooms silently, drops the push
/// binding and marks the account offline.
fn end_identity(state: &RelayState, session: &mut SessionContext) {
    let Some(user) = session.user.take() else {
        return;
    };
    state.rooms.leave_all(&user);
    if state
        .connections
        .get(&user)
        .is_some_and(|bound| bound.same_connection(&session.connection))
    {
        state.connections.unbind(&user);
    }
    state.sessions.logout(&user);
}

/// Serves one client connection until logout, disconnect, or I/O error.
pub fn handle_connection(state: &RelayState, stream: TcpStream, client_id: u64) {
    let peer_ip = stream
        .peer_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(client_id, error = %e, "failed to clone client stream");
            return;
        }
    };
    if let Err(e) = writer.set_write_timeout(Some(WRITE_TIMEOUT)) {
        tracing::warn!(client_id, error = %e, "failed to set write timeout");
        return;
    }
    let connection = ConnectionHandle::new(writer);
    let mut session = SessionContext::new(client_id, peer_ip.as_str(), connection.clone());
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    tracing::info!(client_id, ip = %peer_ip, "client connected");

    loop {
        match read_request(&mut reader, &mut buf) {
            Ok(RequestLine::Line) => {}
            Ok(RequestLine::Closed) => break,
            Ok(RequestLine::TooLong) => {
                tracing::warn!(client_id, limit = MAX_LINE_LEN, "request line too long");
                let _ = connection.send_line(&Response::error(LINE_TOO_LONG).to_string());
                break;
            }
            Err(e) => {
                tracing::debug!(client_id, error = %e, "read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let request = line.trim_end_matches(['\r', '\n']);

        let (reply, logout) = process_request(state, &mut session, request);
        if let Err(e) = connection.send_line(&reply) {
            tracing::debug!(client_id, error = %e, "write failed");
            break;
        }
        if logout {
            break;
        }
    }

    end_identity(state, &mut session);
    let _ = reader.get_ref().shutdown(Shutdown::Both);
    tracing::info!(client_id, "client disconnected");
}

/// Outcome of reading one request line.
#[derive(Debug, PartialEq, Eq)]
enum RequestLine {
    /// `buf` holds a line, with its newline unless the stream ended.
    Line,
    /// End of stream before any byte.
    Closed,
    /// More than [`MAX_LINE_LEN`] bytes without a newline.
    TooLong,
}

/// Reads the next request line into `buf` as raw bytes, reading at most
/// one byte past [`MAX_LINE_LEN`].
fn read_request(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> io::Result<RequestLine> {
    buf.clear();
    let limit = u64::try_from(MAX_LINE_LEN + 1).unwrap_or(u64::MAX);
    let read = reader.take(limit).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(RequestLine::Closed);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
        return Ok(RequestLine::TooLong);
    }
    Ok(RequestLine::Line)
}

/// Unseals, parses and dispatches one request line. Returns the wire reply
/// and whether the session ended with a logout.
fn process_request(state: &RelayState, session: &mut SessionContext, request: &str) -> (String, bool) {
    let sealed = crypto::is_envelope(request.as_bytes());
    session.connection.set_speaks_envelopes(sealed);

    let plain = if sealed {
        let opened = state
            .cipher()
            .ok_or(crypto::CryptoError::DecryptionFailed)
            .and_then(|cipher| cipher.open(request))
            .and_then(|bytes| {
                String::from_utf8(bytes).map_err(|_| crypto::CryptoError::DecryptionFailed)
            });
        match opened {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(client_id = session.client_id, error = %e, "failed to open request");
                return (Response::error(DECRYPTION_FAILED).to_string(), false);
            }
        }
    } else {
        request.to_string()
    };

    let response = match Command::parse(&plain) {
        Ok(command) => {
            tracing::debug!(client_id = session.client_id, verb = command.verb(), sealed, "request");
            dispatch(state, session, command)
        }
        Err(e) => Response::error(e),
    };
    if response.is_error() {
        tracing::debug!(client_id = session.client_id, response = %response, "request rejected");
    }
    let logout = response == Response::LogoutSuccess;

    let rendered = response.to_string();
    let reply = match state.cipher() {
        Some(cipher) if sealed => cipher.seal(rendered.as_bytes()).unwrap_or_else(|e| {
            tracing::warn!(client_id = session.client_id, error = %e, "failed to seal response");
            rendered.clone()
        }),
        _ => rendered,
    };
    (reply, logout)
}

/// Builds the server cipher for `config`, disabling encryption if the
/// cipher fails its self test.
#[must_use]
pub fn server_cipher(config: &RelayConfig) -> Option<Arc<dyn Cipher>> {
    if !config.encryption {
        return None;
    }
    let cipher = AesGcmCipher::with_default_key();
    if crypto::self_test(&cipher) {
        Some(Arc::new(cipher))
    } else {
        tracing::warn!("cipher self test failed, continuing without encryption");
        None
    }
}

type LiveStreams = Mutex<HashMap<u64, TcpStream>>;

/// A running relay server.
pub struct RelayServer {
    local_addr: SocketAddr,
    state: Arc<RelayState>,
    pool: Arc<WorkerPool>,
    live: Arc<LiveStreams>,
    stopping: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Binds the listener, starts the worker pool and the accept thread.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError`] if binding or thread creation fails.
    pub fn start(config: &RelayConfig) -> Result<Self, RelayError> {
        let state = Arc::new(RelayState::new(server_cipher(config)));
        let listener = TcpListener::bind(&config.bind_addr).map_err(|source| RelayError::Bind {
            addr: config.bind_addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let pool = Arc::new(WorkerPool::new(config.workers)?);
        let live = Arc::new(LiveStreams::default());
        let stopping = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let state = Arc::clone(&state);
            let pool = Arc::clone(&pool);
            let live = Arc::clone(&live);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("peerchat-accept".to_string())
                .spawn(move || accept_loop(&listener, &state, &pool, &live, &stopping))?
        };

        tracing::info!(
            addr = %local_addr,
            workers = pool.worker_count(),
            encryption = state.cipher().is_some(),
            "relay server listening"
        );

        Ok(Self {
            local_addr,
            state,
            pool,
            live,
            stopping,
            accept_thread: Some(accept_thread),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared server state.
    #[must_use]
    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Blocks until the accept loop exits.
    pub fn wait(mut self) {
        if let Some(handle) = self.accept_thread.take()
            && handle.join().is_err()
        {
            tracing::error!("accept thread panicked");
        }
    }

    /// Stops accepting, disconnects live clients and joins every thread.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.accept_thread.take() else {
            return;
        };
        self.stopping.store(true, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = TcpStream::connect(addr::connectable(self.local_addr));
        if handle.join().is_err() {
            tracing::error!("accept thread panicked");
        }

        // No new streams can be tracked once the accept loop is gone.
        for (client_id, stream) in self.live.lock().drain() {
            tracing::debug!(client_id, "closing client connection");
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pool.shutdown();
        tracing::info!("relay server stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: &TcpListener,
    state: &Arc<RelayState>,
    pool: &WorkerPool,
    live: &Arc<LiveStreams>,
    stopping: &AtomicBool,
) {
    let next_id = AtomicU64::new(1);
    for incoming in listener.incoming() {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let client_id = next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(tracked) => {
                live.lock().insert(client_id, tracked);
            }
            Err(e) => {
                tracing::warn!(client_id, error = %e, "failed to track client stream");
                continue;
            }
        }

        let task_state = Arc::clone(state);
        let task_live = Arc::clone(live);
        let queued = pool.enqueue(move || {
            handle_connection(&task_state, stream, client_id);
            task_live.lock().remove(&client_id);
        });
        match queued {
            Ok(_) => tracing::debug!(client_id, waiting = pool.queued(), "connection queued"),
            Err(e) => {
                // The task (and the stream it owns) was dropped.
                tracing::warn!(client_id, error = %e, "rejected connection");
                live.lock().remove(&client_id);
            }
        }
    }
    tracing::debug!("accept loop exited");
}

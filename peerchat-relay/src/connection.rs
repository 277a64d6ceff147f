//! Writable handles to live command-protocol connections.
//!
//! A [`ConnectionHandle`] is shared between the connection's own handler
//! (which writes responses) and the room broadcaster (which pushes
//! notifications). Each line is written under the handle's mutex so
//! responses and pushes never interleave mid-line.
//!
//! The first failed write marks the handle failed: a timed-out write may
//! have left half a line on the wire, so nothing more is sent on it.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

struct Inner {
    writer: Mutex<Box<dyn Write + Send>>,
    speaks_envelopes: AtomicBool,
    failed: AtomicBool,
}

/// Cloneable, thread-safe writer for one client connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("speaks_envelopes", &self.speaks_envelopes())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Wraps the write half of a connection.
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(Box::new(writer)),
                speaks_envelopes: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Writes `text` followed by a newline and flushes.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the peer is gone or stopped
    /// reading, and [`io::ErrorKind::NotConnected`] once an earlier write
    /// on this connection has failed.
    pub fn send_line(&self, text: &str) -> io::Result<()> {
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let mut writer = self.inner.writer.lock();
        if self.has_failed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection write failed earlier"));
        }
        let result = writer.write_all(line.as_bytes()).and_then(|()| writer.flush());
        if result.is_err() {
            self.inner.failed.store(true, Ordering::Relaxed);
        }
        result
    }

    /// Returns `true` once a write on this connection has failed.
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Records whether the client's latest request was sealed.
    ///
    /// Pushes to this connection follow the same convention.
    pub fn set_speaks_envelopes(&self, sealed: bool) {
        self.inner.speaks_envelopes.store(sealed, Ordering::Relaxed);
    }

    /// Returns `true` if the client's latest request was sealed.
    #[must_use]
    pub fn speaks_envelopes(&self) -> bool {
        self.inner.speaks_envelopes.load(Ordering::Relaxed)
    }

    /// Returns `true` if both handles refer to the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Username to live connection lookup used for broadcast delivery.
///
/// Guarded by its own lock. In the relay's lock order this lock is always
/// taken last: after the room registry and after a room. It is never held
/// while writing to a socket.
#[derive(Debug, Default)]
pub struct ConnectionMap {
    handles: Mutex<HashMap<String, ConnectionHandle>>,
}

impl ConnectionMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `username` to `handle`, returning any previous binding.
    pub fn bind(&self, username: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.handles.lock().insert(username.to_string(), handle)
    }

    /// Removes the binding for `username`.
    pub fn unbind(&self, username: &str) -> Option<ConnectionHandle> {
        self.handles.lock().remove(username)
    }

    /// Returns the live handle for `username`, if any.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<ConnectionHandle> {
        self.handles.lock().get(username).cloned()
    }

    /// Clones the handles of every listed user that is bound, under one
    /// acquisition of the map lock.
    pub fn snapshot<'a>(
        &self,
        usernames: impl IntoIterator<Item = &'a String>,
    ) -> Vec<(String, ConnectionHandle)> {
        let handles = self.handles.lock();
        usernames
            .into_iter()
            .filter_map(|name| handles.get(name).map(|h| (name.clone(), h.clone())))
            .collect()
    }

    /// Number of bound users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns `true` if no user is bound.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

/// In-memory sink used by tests to observe what a connection received.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct CapturedWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

#[cfg(test)]
impl CapturedWriter {
    /// Everything written so far, split into lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.buf.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
impl Write for CapturedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer that fails every call, simulating a dead peer.
#[cfg(test)]
pub struct BrokenWriter;

#[cfg(test)]
impl Write for BrokenWriter {
    fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

/// Writer that fails every call and counts how often it was asked.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct CountingBrokenWriter {
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl CountingBrokenWriter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Write for CountingBrokenWriter {
    fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::from(io::ErrorKind::WouldBlock))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

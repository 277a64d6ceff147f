//! Account registry and online-presence tracking.
//!
//! Every operation runs under one registry-wide lock. Accounts live only in
//! memory and are lost when the relay restarts.

use std::collections::HashMap;

use parking_lot::Mutex;
use peerchat_proto::command::OnlineUser;

/// Lowest port a client may announce for its peer listener (exclusive).
const MIN_PEER_PORT: u32 = 1024;

/// Highest port a client may announce for its peer listener (inclusive).
const MAX_PEER_PORT: u32 = 65535;

/// Errors returned by [`SessionRegistry`] operations.
///
/// The display strings are sent to clients verbatim after `ERROR: `.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Username or password was empty.
    #[error("Username and password cannot be empty")]
    EmptyCredentials,
    /// An account with this name already exists.
    #[error("Username already exists")]
    DuplicateUser,
    /// No account with this name.
    #[error("User not found")]
    NotFound,
    /// Password did not match.
    #[error("Wrong password")]
    WrongPassword,
    /// The account already has a live session.
    #[error("User already logged in")]
    AlreadyOnline,
    /// Another online account announced the same peer port.
    #[error("Port already in use")]
    PortInUse,
    /// Peer port outside `(1024, 65535]`.
    #[error("Port must be between 1025 and 65535")]
    InvalidPort,
    /// The account exists but is offline.
    #[error("User not online")]
    NotOnline,
}

/// Address a logged-in client accepts peer connections on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// IP address the relay saw the client connect from.
    pub ip: String,
    /// Announced peer listener port.
    pub port: u16,
}

#[derive(Debug)]
struct Account {
    password: String,
    online: bool,
    endpoint: Option<Endpoint>,
}

/// In-memory account table shared by all connection handlers.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    accounts: Mutex<HashMap<String, Account>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new offline account.
    ///
    /// # Errors
    ///
    /// [`SessionError::EmptyCredentials`] or [`SessionError::DuplicateUser`].
    pub fn register(&self, username: &str, password: &str) -> Result<(), SessionError> {
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::EmptyCredentials);
        }
        let mut accounts = self.accounts.lock();
        if accounts.contains_key(username) {
            return Err(SessionError::DuplicateUser);
        }
        accounts.insert(
            username.to_string(),
            Account {
                password: password.to_string(),
                online: false,
                endpoint: None,
            },
        );
        drop(accounts);

        tracing::info!(user = %username, "account registered");
        Ok(())
    }

    /// Marks an account online and records its peer endpoint.
    ///
    /// Checks run in order: account exists, password matches, not already
    /// online, port in range, port not taken by another online account.
    ///
    /// # Errors
    ///
    /// The first failing check as a [`SessionError`].
    pub fn login(
        &self,
        username: &str,
        password: &str,
        ip: &str,
        port: u32,
    ) -> Result<(), SessionError> {
        let mut accounts = self.accounts.lock();

        let account = accounts.get(username).ok_or(SessionError::NotFound)?;
        if account.password != password {
            return Err(SessionError::WrongPassword);
        }
        if account.online {
            return Err(SessionError::AlreadyOnline);
        }
        let port = valid_peer_port(port)?;
        let taken = accounts
            .iter()
            .any(|(name, other)| {
                name != username && other.online && other.endpoint.as_ref().is_some_and(|e| e.port == port)
            });
        if taken {
            return Err(SessionError::PortInUse);
        }

        let account = accounts.get_mut(username).ok_or(SessionError::NotFound)?;
        account.online = true;
        account.endpoint = Some(Endpoint {
            ip: ip.to_string(),
            port,
        });
        drop(accounts);

        tracing::info!(user = %username, %ip, port, "user logged in");
        Ok(())
    }

    /// Clears the online state of `username`. Unknown or offline users are
    /// ignored.
    pub fn logout(&self, username: &str) {
        let mut accounts = self.accounts.lock();
        if let Some(account) = accounts.get_mut(username) {
            let was_online = account.online;
            account.online = false;
            account.endpoint = None;
            if was_online {
                tracing::info!(user = %username, "user logged out");
            }
        }
    }

    /// All online accounts, sorted by username.
    #[must_use]
    pub fn list_online(&self) -> Vec<OnlineUser> {
        let accounts = self.accounts.lock();
        let mut users: Vec<OnlineUser> = accounts
            .iter()
            .filter(|(_, account)| account.online)
            .filter_map(|(name, account)| {
                account.endpoint.as_ref().map(|e| OnlineUser {
                    username: name.clone(),
                    ip: e.ip.clone(),
                    port: e.port,
                })
            })
            .collect();
        drop(accounts);
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }

    /// Peer endpoint of an online account.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] or [`SessionError::NotOnline`].
    pub fn get_user_info(&self, username: &str) -> Result<Endpoint, SessionError> {
        let accounts = self.accounts.lock();
        let account = accounts.get(username).ok_or(SessionError::NotFound)?;
        if !account.online {
            return Err(SessionError::NotOnline);
        }
        account.endpoint.clone().ok_or(SessionError::NotOnline)
    }

    /// Returns `true` if `username` has a live session.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.accounts
            .lock()
            .get(username)
            .is_some_and(|account| account.online)
    }
}

fn valid_peer_port(port: u32) -> Result<u16, SessionError> {
    if port <= MIN_PEER_PORT || port > MAX_PEER_PORT {
        return Err(SessionError::InvalidPort);
    }
    u16::try_from(port).map_err(|_| SessionError::InvalidPort)
}

//! Chat rooms hosted by the relay server.
//!
//! Rooms are created on demand by logged-in users, hold a member set and
//! their full message history, and fan out notifications to their members'
//! command connections.
//!
//! Lock order is registry, then room, then the [`ConnectionMap`]. Only
//! [`RoomRegistry::create`] takes the registry lock for writing, and room
//! operations release the registry lock before locking the room. Pushes
//! are written with the room locked, so every member sees a room's
//! messages in history order, but never with the [`ConnectionMap`] locked.
//!
//! Rooms are ephemeral and lost on relay restart, like the accounts.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use peerchat_proto::command::{Push, RoomSummary};
use peerchat_proto::crypto::Cipher;

use crate::connection::ConnectionMap;

/// Number of most recent messages returned by `ROOM_HISTORY`.
pub const HISTORY_LIMIT: usize = 20;

/// Errors that can occur during room operations.
///
/// The display strings are sent to clients verbatim after `ERROR: `.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// The room name argument was empty.
    #[error("Room name cannot be empty")]
    EmptyName,
    /// A room with this exact name exists.
    #[error("Room already exists")]
    RoomExists,
    /// No room with this name.
    #[error("Room not found")]
    RoomNotFound,
    /// The user is already a member.
    #[error("Already in room")]
    AlreadyMember,
    /// The user is not a member.
    #[error("Not in room")]
    NotMember,
    /// A room message had no text.
    #[error("Message cannot be empty")]
    EmptyMessage,
}

#[derive(Debug)]
struct Room {
    creator: String,
    members: BTreeSet<String>,
    history: Vec<(String, String)>,
}

impl Room {
    fn require_member(&self, user: &str) -> Result<(), RoomError> {
        if self.members.contains(user) {
            Ok(())
        } else {
            Err(RoomError::NotMember)
        }
    }
}

/// Directory of live rooms plus the broadcaster that reaches their members.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    connections: Arc<ConnectionMap>,
    cipher: Option<Arc<dyn Cipher>>,
}

impl RoomRegistry {
    /// Creates an empty registry delivering through `connections`.
    ///
    /// With a cipher, notifications to clients that last spoke envelopes
    /// are sealed.
    #[must_use]
    pub fn new(connections: Arc<ConnectionMap>, cipher: Option<Arc<dyn Cipher>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections,
            cipher,
        }
    }

    /// Creates `name` with `owner` as its only member.
    ///
    /// # Errors
    ///
    /// [`RoomError::EmptyName`] or [`RoomError::RoomExists`].
    pub fn create(&self, name: &str, owner: &str) -> Result<(), RoomError> {
        if name.is_empty() {
            return Err(RoomError::EmptyName);
        }
        let mut rooms = self.rooms.write();
        if rooms.contains_key(name) {
            return Err(RoomError::RoomExists);
        }
        rooms.insert(
            name.to_string(),
            Arc::new(Mutex::new(Room {
                creator: owner.to_string(),
                members: BTreeSet::from([owner.to_string()]),
                history: Vec::new(),
            })),
        );
        drop(rooms);

        tracing::info!(room = %name, owner = %owner, "room created");
        Ok(())
    }

    /// Adds `user` to `name` and notifies the existing members.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] or [`RoomError::AlreadyMember`].
    pub fn join(&self, name: &str, user: &str) -> Result<(), RoomError> {
        self.with_room(name, |room| {
            if !room.members.insert(user.to_string()) {
                return Err(RoomError::AlreadyMember);
            }
            let push = Push::Joined {
                room: name.to_string(),
                user: user.to_string(),
            };
            self.broadcast(room.members.iter().filter(|m| *m != user), &push);
            tracing::info!(room = %name, user = %user, creator = %room.creator, "joined room");
            Ok(())
        })
    }

    /// Removes `user` from `name` and notifies the remaining members.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] or [`RoomError::NotMember`].
    pub fn leave(&self, name: &str, user: &str) -> Result<(), RoomError> {
        self.with_room(name, |room| {
            if !room.members.remove(user) {
                return Err(RoomError::NotMember);
            }
            let push = Push::Left {
                room: name.to_string(),
                user: user.to_string(),
            };
            self.broadcast(room.members.iter(), &push);
            tracing::info!(room = %name, user = %user, "left room");
            Ok(())
        })
    }

    /// Every room with its member count, sorted by name.
    #[must_use]
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read();
        let mut summaries: Vec<RoomSummary> = rooms
            .iter()
            .map(|(name, room)| RoomSummary {
                name: name.clone(),
                member_count: room.lock().members.len(),
            })
            .collect();
        drop(rooms);
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Sorted member names of `name`; `requester` must be a member.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] or [`RoomError::NotMember`].
    pub fn members(&self, name: &str, requester: &str) -> Result<Vec<String>, RoomError> {
        self.with_room(name, |room| {
            room.require_member(requester)?;
            Ok(room.members.iter().cloned().collect())
        })
    }

    /// Appends a message to the room's history and sends it to every
    /// member, the sender included. History is never truncated.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`], [`RoomError::NotMember`] or
    /// [`RoomError::EmptyMessage`].
    pub fn post(&self, name: &str, sender: &str, text: &str) -> Result<(), RoomError> {
        self.with_room(name, |room| {
            room.require_member(sender)?;
            if text.is_empty() {
                return Err(RoomError::EmptyMessage);
            }
            room.history.push((sender.to_string(), text.to_string()));

            let push = Push::RoomMessage {
                room: name.to_string(),
                sender: sender.to_string(),
                text: text.to_string(),
            };
            self.broadcast(room.members.iter(), &push);
            tracing::debug!(room = %name, sender = %sender, "room message posted");
            Ok(())
        })
    }

    /// Up to the last [`HISTORY_LIMIT`] messages, oldest first, rendered as
    /// `[sender]: text`.
    ///
    /// # Errors
    ///
    /// [`RoomError::RoomNotFound`] or [`RoomError::NotMember`].
    pub fn history(&self, name: &str, requester: &str) -> Result<Vec<String>, RoomError> {
        self.with_room(name, |room| {
            room.require_member(requester)?;
            let start = room.history.len().saturating_sub(HISTORY_LIMIT);
            Ok(room.history[start..]
                .iter()
                .map(|(sender, text)| format!("[{sender}]: {text}"))
                .collect())
        })
    }

    /// Silently removes `user` from every room; returns the rooms it left.
    pub fn leave_all(&self, user: &str) -> Vec<String> {
        let rooms = self.rooms.read();
        let mut left: Vec<String> = rooms
            .iter()
            .filter(|(_, room)| room.lock().members.remove(user))
            .map(|(name, _)| name.clone())
            .collect();
        drop(rooms);
        left.sort();
        if !left.is_empty() {
            tracing::debug!(user = %user, rooms = ?left, "removed from all rooms");
        }
        left
    }

    /// Runs `f` on room `name` with the room locked. The registry lock is
    /// only held for the lookup.
    fn with_room<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Room) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        if name.is_empty() {
            return Err(RoomError::EmptyName);
        }
        let room = self
            .rooms
            .read()
            .get(name)
            .cloned()
            .ok_or(RoomError::RoomNotFound)?;
        let mut guard = room.lock();
        f(&mut guard)
    }

    /// Best-effort delivery of `push` to each listed member that has a live
    /// connection. Failures are logged and skipped; a member whose socket
    /// stopped draining costs at most one write timeout before its
    /// connection is marked failed.
    fn broadcast<'a>(&self, targets: impl Iterator<Item = &'a String>, push: &Push) {
        let plain = push.to_string();
        for (member, handle) in self.connections.snapshot(targets) {
            if handle.has_failed() {
                continue;
            }
            let line = match &self.cipher {
                Some(cipher) if handle.speaks_envelopes() => match cipher.seal(plain.as_bytes()) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        tracing::debug!(member = %member, error = %e, "failed to seal push");
                        continue;
                    }
                },
                _ => plain.clone(),
            };
            if let Err(e) = handle.send_line(&line) {
                tracing::debug!(member = %member, error = %e, "push delivery failed");
            }
        }
    }
}

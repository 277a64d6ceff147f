//! Line-oriented command protocol between clients and the relay server.
//!
//! A client sends one command per line: a case-insensitive verb followed by
//! space-separated arguments. The server answers each command with exactly
//! one [`Response`] and may push [`Push`] notifications at any time.

use std::fmt;

/// Errors raised while parsing a command line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The line contained no verb.
    #[error("Empty command")]
    Empty,
    /// The verb is not part of the protocol (stored upper-cased).
    #[error("Unknown command: {0}")]
    Unknown(String),
    /// `LOGIN` without a numeric port argument.
    #[error("Invalid login format")]
    InvalidLoginFormat,
}

/// A parsed client command.
///
/// Missing string arguments parse as empty strings; the server decides how
/// to reject them so that authentication errors take precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `REGISTER <user> <pass>`
    Register {
        /// Requested account name.
        username: String,
        /// Password in clear text.
        password: String,
    },
    /// `LOGIN <user> <pass> <port>`
    Login {
        /// Account name.
        username: String,
        /// Password in clear text.
        password: String,
        /// Port the client's peer listener is bound to.
        port: u32,
    },
    /// `LOGOUT`
    Logout,
    /// `LIST`
    List,
    /// `MESSAGE <text...>`
    Message {
        /// Free text, logged by the server.
        text: String,
    },
    /// `GET_USER_INFO <user>`
    GetUserInfo {
        /// Account whose endpoint is requested.
        username: String,
    },
    /// `ENCRYPTION_STATUS`
    EncryptionStatus,
    /// `CREATE_ROOM <name>`
    CreateRoom {
        /// Room name.
        room: String,
    },
    /// `JOIN_ROOM <name>`
    JoinRoom {
        /// Room name.
        room: String,
    },
    /// `LEAVE_ROOM <name>`
    LeaveRoom {
        /// Room name.
        room: String,
    },
    /// `LIST_ROOMS`
    ListRooms,
    /// `ROOM_MEMBERS <name>`
    RoomMembers {
        /// Room name.
        room: String,
    },
    /// `ROOM_MSG <name> <text...>`
    RoomMsg {
        /// Room name.
        room: String,
        /// Message body.
        text: String,
    },
    /// `ROOM_HISTORY <name>`
    RoomHistory {
        /// Room name.
        room: String,
    },
}

impl Command {
    /// Parses one command line. Surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Empty`] for a blank line,
    /// [`CommandError::Unknown`] for an unrecognised verb, and
    /// [`CommandError::InvalidLoginFormat`] for a `LOGIN` without a port.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let (verb, rest) = split_token(line);
        if verb.is_empty() {
            return Err(CommandError::Empty);
        }
        let verb = verb.to_ascii_uppercase();

        let command = match verb.as_str() {
            "REGISTER" => {
                let mut args = rest.split_whitespace();
                Self::Register {
                    username: next_arg(&mut args),
                    password: next_arg(&mut args),
                }
            }
            "LOGIN" => {
                let mut args = rest.split_whitespace();
                let username = next_arg(&mut args);
                let password = next_arg(&mut args);
                let port = args
                    .next()
                    .and_then(|p| p.parse().ok())
                    .ok_or(CommandError::InvalidLoginFormat)?;
                Self::Login {
                    username,
                    password,
                    port,
                }
            }
            "LOGOUT" => Self::Logout,
            "LIST" => Self::List,
            "MESSAGE" => Self::Message {
                text: rest.trim().to_string(),
            },
            "GET_USER_INFO" => Self::GetUserInfo {
                username: first_arg(rest),
            },
            "ENCRYPTION_STATUS" => Self::EncryptionStatus,
            "CREATE_ROOM" => Self::CreateRoom {
                room: first_arg(rest),
            },
            "JOIN_ROOM" => Self::JoinRoom {
                room: first_arg(rest),
            },
            "LEAVE_ROOM" => Self::LeaveRoom {
                room: first_arg(rest),
            },
            "LIST_ROOMS" => Self::ListRooms,
            "ROOM_MEMBERS" => Self::RoomMembers {
                room: first_arg(rest),
            },
            "ROOM_MSG" => {
                let (room, text) = split_token(rest);
                Self::RoomMsg {
                    room: room.to_string(),
                    text: text.trim().to_string(),
                }
            }
            "ROOM_HISTORY" => Self::RoomHistory {
                room: first_arg(rest),
            },
            _ => return Err(CommandError::Unknown(verb)),
        };
        Ok(command)
    }

    /// The protocol verb for this command.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Login { .. } => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::List => "LIST",
            Self::Message { .. } => "MESSAGE",
            Self::GetUserInfo { .. } => "GET_USER_INFO",
            Self::EncryptionStatus => "ENCRYPTION_STATUS",
            Self::CreateRoom { .. } => "CREATE_ROOM",
            Self::JoinRoom { .. } => "JOIN_ROOM",
            Self::LeaveRoom { .. } => "LEAVE_ROOM",
            Self::ListRooms => "LIST_ROOMS",
            Self::RoomMembers { .. } => "ROOM_MEMBERS",
            Self::RoomMsg { .. } => "ROOM_MSG",
            Self::RoomHistory { .. } => "ROOM_HISTORY",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.verb();
        match self {
            Self::Register { username, password } => write!(f, "{verb} {username} {password}"),
            Self::Login {
                username,
                password,
                port,
            } => write!(f, "{verb} {username} {password} {port}"),
            Self::Message { text } => write!(f, "{verb} {text}"),
            Self::GetUserInfo { username } => write!(f, "{verb} {username}"),
            Self::CreateRoom { room }
            | Self::JoinRoom { room }
            | Self::LeaveRoom { room }
            | Self::RoomMembers { room }
            | Self::RoomHistory { room } => write!(f, "{verb} {room}"),
            Self::RoomMsg { room, text } => write!(f, "{verb} {room} {text}"),
            Self::Logout | Self::List | Self::EncryptionStatus | Self::ListRooms => f.write_str(verb),
        }
    }
}

/// One online account as reported by `LIST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    /// Account name.
    pub username: String,
    /// Address the relay saw the client connect from.
    pub ip: String,
    /// Peer listener port announced at login.
    pub port: u16,
}

/// A room as reported by `LIST_ROOMS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    /// Room name.
    pub name: String,
    /// Current number of members.
    pub member_count: usize,
}

/// A server reply to exactly one [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `REGISTER_SUCCESS`
    RegisterSuccess,
    /// `LOGIN_SUCCESS`
    LoginSuccess,
    /// `LOGOUT_SUCCESS`
    LogoutSuccess,
    /// `ONLINE_USERS: user(ip:port) ...`, or `No users online` when empty.
    OnlineUsers(Vec<OnlineUser>),
    /// `MESSAGE_RECEIVED`
    MessageReceived,
    /// `USER_INFO:ip:port`
    UserInfo {
        /// Peer IP address.
        ip: String,
        /// Peer listener port.
        port: u16,
    },
    /// `ENCRYPTION_STATUS:ENABLED:<cipher>` or `ENCRYPTION_STATUS:DISABLED`.
    EncryptionStatus(Option<String>),
    /// `ROOM_CREATED:name`
    RoomCreated(String),
    /// `ROOM_JOINED:name`
    RoomJoined(String),
    /// `ROOM_LEFT:name`
    RoomLeft(String),
    /// `ROOMS: name(n members) ...`, or `No rooms available` when empty.
    Rooms(Vec<RoomSummary>),
    /// `ROOM_MEMBERS:name: user1 user2 ...`
    RoomMembers {
        /// Room name.
        room: String,
        /// Member names.
        members: Vec<String>,
    },
    /// `ROOM_MSG_SENT`
    RoomMsgSent,
    /// `ROOM_HISTORY:name:` followed by one `\n  [sender]: text` per entry,
    /// or `ROOM_HISTORY:name:No messages`.
    RoomHistory {
        /// Room name.
        room: String,
        /// Entries already rendered as `[sender]: text`, oldest first.
        entries: Vec<String>,
    },
    /// `ERROR: <reason>`
    Error(String),
}

impl Response {
    /// Builds an error response from anything displayable.
    pub fn error(reason: impl fmt::Display) -> Self {
        Self::Error(reason.to_string())
    }

    /// Returns `true` for [`Response::Error`].
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterSuccess => f.write_str("REGISTER_SUCCESS"),
            Self::LoginSuccess => f.write_str("LOGIN_SUCCESS"),
            Self::LogoutSuccess => f.write_str("LOGOUT_SUCCESS"),
            Self::OnlineUsers(users) if users.is_empty() => f.write_str("No users online"),
            Self::OnlineUsers(users) => {
                f.write_str("ONLINE_USERS:")?;
                for user in users {
                    write!(f, " {}({}:{})", user.username, user.ip, user.port)?;
                }
                Ok(())
            }
            Self::MessageReceived => f.write_str("MESSAGE_RECEIVED"),
            Self::UserInfo { ip, port } => write!(f, "USER_INFO:{ip}:{port}"),
            Self::EncryptionStatus(Some(name)) => write!(f, "ENCRYPTION_STATUS:ENABLED:{name}"),
            Self::EncryptionStatus(None) => f.write_str("ENCRYPTION_STATUS:DISABLED"),
            Self::RoomCreated(room) => write!(f, "ROOM_CREATED:{room}"),
            Self::RoomJoined(room) => write!(f, "ROOM_JOINED:{room}"),
            Self::RoomLeft(room) => write!(f, "ROOM_LEFT:{room}"),
            Self::Rooms(rooms) if rooms.is_empty() => f.write_str("No rooms available"),
            Self::Rooms(rooms) => {
                f.write_str("ROOMS:")?;
                for room in rooms {
                    write!(f, " {}({} members)", room.name, room.member_count)?;
                }
                Ok(())
            }
            Self::RoomMembers { room, members } => {
                write!(f, "ROOM_MEMBERS:{room}:")?;
                for member in members {
                    write!(f, " {member}")?;
                }
                Ok(())
            }
            Self::RoomMsgSent => f.write_str("ROOM_MSG_SENT"),
            Self::RoomHistory { room, entries } if entries.is_empty() => {
                write!(f, "ROOM_HISTORY:{room}:No messages")
            }
            Self::RoomHistory { room, entries } => {
                write!(f, "ROOM_HISTORY:{room}:")?;
                for entry in entries {
                    write!(f, "\n  {entry}")?;
                }
                Ok(())
            }
            Self::Error(reason) => write!(f, "ERROR: {reason}"),
        }
    }
}

/// Unsolicited server-to-client notification about room activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    /// `ROOM_NOTIFICATION:<room>:<user> joined the room`
    Joined {
        /// Room name.
        room: String,
        /// Member who joined.
        user: String,
    },
    /// `ROOM_NOTIFICATION:<room>:<user> left the room`
    Left {
        /// Room name.
        room: String,
        /// Member who left.
        user: String,
    },
    /// `ROOM_MSG:<room>:<sender>:<text>`
    RoomMessage {
        /// Room name.
        room: String,
        /// Author of the message.
        sender: String,
        /// Message body.
        text: String,
    },
}

impl Push {
    /// Wire prefixes that mark a line as a push rather than a response.
    pub const PREFIXES: [&'static str; 2] = ["ROOM_NOTIFICATION:", "ROOM_MSG:"];

    /// Returns `true` if a (plaintext) server line is a push notification.
    #[must_use]
    pub fn is_push(line: &str) -> bool {
        Self::PREFIXES.iter().any(|p| line.starts_with(p))
    }
}

impl fmt::Display for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined { room, user } => {
                write!(f, "ROOM_NOTIFICATION:{room}:{user} joined the room")
            }
            Self::Left { room, user } => write!(f, "ROOM_NOTIFICATION:{room}:{user} left the room"),
            Self::RoomMessage { room, sender, text } => {
                write!(f, "ROOM_MSG:{room}:{sender}:{text}")
            }
        }
    }
}

/// Extracts `(ip, port)` from a `USER_INFO:ip:port` response line.
///
/// The port is taken after the last colon so IPv6 addresses survive.
#[must_use]
pub fn parse_user_info(line: &str) -> Option<(String, u16)> {
    let body = line.trim().strip_prefix("USER_INFO:")?;
    let (ip, port) = body.rsplit_once(':')?;
    if ip.is_empty() {
        return None;
    }
    Some((ip.to_string(), port.parse().ok()?))
}

/// Splits off the first whitespace-delimited token, returning it and the rest.
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    input
        .split_once(char::is_whitespace)
        .unwrap_or((input, ""))
}

fn first_arg(rest: &str) -> String {
    rest.split_whitespace().next().unwrap_or_default().to_string()
}

fn next_arg<'a>(args: &mut impl Iterator<Item = &'a str>) -> String {
    args.next().unwrap_or_default().to_string()
}

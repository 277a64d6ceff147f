//! Payloads exchanged directly between two clients.
//!
//! Every payload travels inside one length-prefixed frame (see
//! [`crate::codec`]). Raw file chunks also travel as frames but are opaque
//! and never parsed here.

use std::fmt;

const MSG_PREFIX: &str = "PEER_MSG:";
const ACK_PREFIX: &str = "PEER_ACK:";
const OFFER_PREFIX: &str = "FILE_OFFER:";
const REJECT_PREFIX: &str = "FILE_REJECT:";
const FILE_ACCEPT: &str = "FILE_ACCEPT";
const FILE_COMPLETE: &str = "FILE_COMPLETE";

// Prefixes written by older clients; accepted on input only.
const LEGACY_MSG_PREFIX: &str = "P2P_MSG:";
const LEGACY_ACK_PREFIX: &str = "P2P_ACK:";
const LEGACY_OFFER_PREFIX: &str = "FILE_TRANSFER:";

/// Header announcing a file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// Username of the sending peer.
    pub sender: String,
    /// Bare file name (no directories).
    pub filename: String,
    /// Exact file size in bytes.
    pub size: u64,
    /// Whether each chunk is sealed with the shared cipher.
    pub encrypted: bool,
}

impl fmt::Display for FileOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{OFFER_PREFIX}{}:{}:{}:{}",
            self.sender,
            self.filename,
            self.size,
            u8::from(self.encrypted)
        )
    }
}

impl FileOffer {
    /// Parses the body that follows the offer prefix.
    ///
    /// The sender ends at the first colon; size and flag are the last two
    /// fields, so the file name in between may itself contain colons.
    fn parse_body(body: &str) -> Option<Self> {
        let (sender, rest) = body.split_once(':')?;
        let (rest, flag) = rest.rsplit_once(':')?;
        let (filename, size) = rest.rsplit_once(':')?;
        if sender.is_empty() || filename.is_empty() {
            return None;
        }
        let encrypted = match flag {
            "1" => true,
            "0" => false,
            _ => return None,
        };
        Some(Self {
            sender: sender.to_string(),
            filename: filename.to_string(),
            size: size.parse().ok()?,
            encrypted,
        })
    }
}

/// A control payload on the peer wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    /// `PEER_MSG:<from>:<payload>`; `payload` is plain text or an envelope.
    Message {
        /// Sending username.
        from: String,
        /// Message text or sealed envelope.
        payload: String,
    },
    /// `PEER_ACK:<user>`
    Ack {
        /// Username of the receiving peer.
        user: String,
    },
    /// `FILE_OFFER:<sender>:<name>:<size>:<0|1>`
    FileOffer(FileOffer),
    /// `FILE_ACCEPT`
    FileAccept,
    /// `FILE_REJECT:<reason>`
    FileReject {
        /// Human-readable reason.
        reason: String,
    },
    /// `FILE_COMPLETE`
    FileComplete,
}

impl PeerFrame {
    /// Encodes the frame payload as UTF-8 bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses a frame payload.
    ///
    /// Returns `None` for anything that is not a recognised control
    /// payload; callers drop such input silently.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;

        if let Some(body) = strip_any(text, &[MSG_PREFIX, LEGACY_MSG_PREFIX]) {
            let (from, payload) = body.split_once(':')?;
            return Some(Self::Message {
                from: from.to_string(),
                payload: payload.to_string(),
            });
        }
        if let Some(user) = strip_any(text, &[ACK_PREFIX, LEGACY_ACK_PREFIX]) {
            return Some(Self::Ack {
                user: user.to_string(),
            });
        }
        if let Some(body) = strip_any(text, &[OFFER_PREFIX, LEGACY_OFFER_PREFIX]) {
            return FileOffer::parse_body(body).map(Self::FileOffer);
        }
        if let Some(reason) = text.strip_prefix(REJECT_PREFIX) {
            return Some(Self::FileReject {
                reason: reason.to_string(),
            });
        }
        match text {
            FILE_ACCEPT => Some(Self::FileAccept),
            FILE_COMPLETE => Some(Self::FileComplete),
            _ => None,
        }
    }
}

impl fmt::Display for PeerFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message { from, payload } => write!(f, "{MSG_PREFIX}{from}:{payload}"),
            Self::Ack { user } => write!(f, "{ACK_PREFIX}{user}"),
            Self::FileOffer(offer) => offer.fmt(f),
            Self::FileAccept => f.write_str(FILE_ACCEPT),
            Self::FileReject { reason } => write!(f, "{REJECT_PREFIX}{reason}"),
            Self::FileComplete => f.write_str(FILE_COMPLETE),
        }
    }
}

/// Returns `true` if the payload opens a file transfer.
#[must_use]
pub fn is_file_offer(bytes: &[u8]) -> bool {
    bytes.starts_with(OFFER_PREFIX.as_bytes()) || bytes.starts_with(LEGACY_OFFER_PREFIX.as_bytes())
}

fn strip_any<'a>(text: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|p| text.strip_prefix(p))
}

//! Shared protocol definitions for `PeerChat` wire formats.

pub mod addr;
pub mod codec;
pub mod command;
pub mod crypto;
pub mod peer;

//! `PeerChat` client library: relay commands, direct peer messages and
//! peer-to-peer file transfer.

pub mod client;
pub mod config;
pub mod transfer;
pub mod transport;

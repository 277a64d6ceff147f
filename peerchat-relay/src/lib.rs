//! `PeerChat` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The server
//! keeps the account registry and chat rooms, and serves the line-based
//! command protocol from a fixed worker pool.

pub mod config;
pub mod connection;
pub mod pool;
pub mod relay;
pub mod rooms;
pub mod sessions;

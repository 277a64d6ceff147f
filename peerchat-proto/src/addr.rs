//! Socket address helpers shared by the relay and the peer listener.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address a local client can connect to for a listener bound at `bound`.
///
/// Wildcard binds (`0.0.0.0`, `::`) are reached through the loopback
/// address of the same family; anything else is returned unchanged.
#[must_use]
pub const fn connectable(bound: SocketAddr) -> SocketAddr {
    let ip = match bound.ip() {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bound.port())
}

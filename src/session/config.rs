use std::net::{IpAddr, Ipv4Addr};

use crate::clock::MediaClock;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session name advertised in invitations.
    pub name: String,
    /// Control port; the data port is `port + 1`.
    pub port: u16,
    /// Local address both sockets bind to (default `0.0.0.0`).
    pub bind_address: IpAddr,
    /// Media-clock rate in Hz (default 10 kHz).
    pub clock_rate: u32,
}

impl SessionConfig {
    /// Config with defaults for everything but name and port.
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            clock_rate: MediaClock::DEFAULT_RATE,
        }
    }
}

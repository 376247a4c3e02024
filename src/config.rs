//! Driver configuration and connected-message sequencing.
//!
//! All tunables live in one explicit struct built once per driver instance
//! and handed by reference to the components that need it. Nothing here is
//! persisted; a new driver starts from defaults plus the parsed path.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::path::PortSegment;

/// Well-known TCP/UDP port for EtherNet/IP explicit messaging.
pub const ETHERNET_IP_PORT: u16 = 44818;

/// Per-frame service data capacity with an Extended Forward Open.
pub const EXTENDED_CONNECTION_SIZE: u16 = 4000;

/// Per-frame service data capacity with a standard Forward Open.
pub const STANDARD_CONNECTION_SIZE: u16 = 500;

/// Configuration for a [`crate::CipDriver`] instance.
///
/// `cid`, `csn` and `vsn` are regenerated on every `open()`; the vendor id
/// stays constant so the originator identity remains stable.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Destination IP address parsed from the connection path.
    pub address: Ipv4Addr,
    /// Destination TCP port.
    pub port: u16,
    /// Routing segments parsed from the connection path.
    pub route: Vec<PortSegment>,
    /// 8-byte sender context, constant per driver instance.
    pub context: [u8; 8],
    /// Encapsulation protocol version.
    pub protocol_version: u16,
    /// Encapsulation options word.
    pub option: u32,
    /// Timeout applied to transport connect and receive.
    pub timeout: Duration,
    /// Originator connection id.
    pub cid: [u8; 4],
    /// Connection serial number.
    pub csn: [u8; 2],
    /// Originator vendor id.
    pub vid: [u8; 2],
    /// Originator vendor serial number.
    pub vsn: [u8; 4],
    /// Frame-size class preference: `true` attempts the Extended Forward
    /// Open (4000 bytes) first, falling back to standard (500 bytes).
    /// Downgraded once, permanently, for the lifetime of the instance.
    pub extended_forward_open: bool,
}

impl DriverConfig {
    /// Builds a configuration from a parsed destination and route.
    pub fn new(address: Ipv4Addr, route: Vec<PortSegment>) -> Self {
        Self {
            address,
            port: ETHERNET_IP_PORT,
            route,
            context: *b"_cipcli_",
            protocol_version: 1,
            option: 0,
            timeout: Duration::from_secs(10),
            cid: [0x27, 0x04, 0x19, 0x71],
            csn: [0x27, 0x04],
            vid: [0x09, 0x10],
            vsn: [0x09, 0x10, 0x19, 0x71],
            extended_forward_open: true,
        }
    }

    /// Negotiated per-frame capacity for the current frame-size class.
    pub fn connection_size(&self) -> u16 {
        if self.extended_forward_open {
            EXTENDED_CONNECTION_SIZE
        } else {
            STANDARD_CONNECTION_SIZE
        }
    }

    /// Regenerates the per-connection identifiers. Called on each `open()`.
    pub(crate) fn regenerate_identifiers(&mut self) {
        self.cid = rand::random();
        self.csn = rand::random();
        self.vsn = rand::random();
    }
}

/// Cyclic sequence counter for connected frames.
///
/// Yields 1..=65534 in order, then wraps back to 1. Zero is never produced,
/// and a value is never reused before a full wrap. Every connected request
/// draws exactly one value; unconnected requests draw none.
#[derive(Debug, Clone)]
pub struct Sequencer {
    current: u16,
}

impl Sequencer {
    pub fn new() -> Self {
        Self { current: 1 }
    }

    /// Returns the current value and advances the counter.
    pub fn next(&mut self) -> u16 {
        let value = self.current;
        self.current = if value >= 65534 { 1 } else { value + 1 };
        value
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

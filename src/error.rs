use std::net::Ipv4Addr;

use advmac::MacAddr6;
use thiserror::Error;

/// Misuse of the ACD engine by its owner. Never caused by network traffic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcdError {
    #[error("an ACD session for {address} is already active")]
    AlreadyActive { address: Ipv4Addr },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArpError {
    #[error("ARP packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("unsupported ARP hardware/protocol {htype:#06x}/{ptype:#06x}")]
    Unsupported { htype: u16, ptype: u16 },

    #[error("unknown ARP operation {0}")]
    UnknownOperation(u16),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("hardware address {0} is not a usable unicast address")]
    InvalidHwaddr(MacAddr6),

    #[error("use_dhcp is disabled but no static_address is configured")]
    MissingStaticAddress,
}

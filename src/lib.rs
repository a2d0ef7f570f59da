use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

pub mod acd;
pub mod arp;
pub mod autoip;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dhcp;
pub mod error;
pub mod event;
pub mod journal;
pub mod logging;
#[cfg(unix)]
pub mod signal;
pub mod sim;
pub mod timer;
pub mod transport;

pub use coordinator::AddressCoordinator;

/// Where a candidate or published address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressOrigin {
    DhcpOffered,
    LinkLocal,
    Static,
}

/// An address that is about to be checked for conflicts. Replaced, never
/// mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CandidateAddress {
    pub ipv4: Ipv4Addr,
    pub origin: AddressOrigin,
}

/// A verified address, as handed to the rest of the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Address {
    pub network: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub origin: AddressOrigin,
}

impl Address {
    pub fn ipv4(&self) -> Ipv4Addr {
        self.network.addr()
    }
}

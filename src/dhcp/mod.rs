//! DHCPv4 client, RFC 2131.

pub mod client;
pub mod extensions;
pub mod lease;
pub mod messages;

use std::{net::Ipv4Addr, time::Duration};

pub use client::{BackoffCause, DhcpClient, DhcpEvent, DhcpStatus, DhcpTimer, Discard, Rejection};
pub use lease::DhcpLease;

pub const BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// REQUESTs sent for one offer before discovery starts over.
pub const MAX_REQUESTS: u32 = 5;
/// Cap on the exponential DISCOVER/REQUEST retransmit interval.
pub const MAX_RETRANSMIT: Duration = Duration::from_secs(60);
/// Floor for renew and rebind retries.
pub const MIN_LEASE_RETRY: Duration = Duration::from_secs(60);
/// Option 51 value meaning the lease never expires.
pub const INFINITE_LEASE: u32 = u32::MAX;

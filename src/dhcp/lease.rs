use std::{net::Ipv4Addr, time::Duration};

use dhcproto::v4;
use ipnet::Ipv4Net;

use crate::{clock::Instant, dhcp::extensions::MessageExtV4, dhcp::INFINITE_LEASE};

/// A lease as granted by a DHCPACK.
///
/// Timer values are relative to `lease_start`, the time the ACK arrived.
/// `None` durations mean the lease is infinite and nothing is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub server_id: Ipv4Addr,
    pub lease_start: Instant,
    pub lease_duration: Option<Duration>,
    /// T1
    pub renewal: Option<Duration>,
    /// T2
    pub rebinding: Option<Duration>,
}

impl DhcpLease {
    /// Build a lease from an ACK. Returns `None` if the ACK carries no
    /// address or no server identifier.
    pub fn from_ack(msg: &v4::Message, now: Instant) -> Option<Self> {
        let address = msg.yiaddr();
        if address.is_unspecified() {
            return None;
        }
        let server_id = *msg.server_id()?;

        let subnet_mask = msg
            .subnet_mask()
            .copied()
            .filter(|mask| is_contiguous(*mask))
            .unwrap_or_else(|| classful_mask(address));

        // A missing lease time is treated like an infinite one.
        let lease_secs = msg
            .lease_time()
            .filter(|secs| *secs != INFINITE_LEASE && *secs != 0);
        let (lease_duration, renewal, rebinding) = match lease_secs {
            Some(lease) => {
                let lease = u64::from(lease);
                let t2 = msg
                    .rebinding_time()
                    .map(u64::from)
                    .unwrap_or(lease * 7 / 8)
                    .min(lease);
                let t1 = msg
                    .renewal_time()
                    .map(u64::from)
                    .unwrap_or(lease / 2)
                    .min(t2);
                (
                    Some(Duration::from_secs(lease)),
                    Some(Duration::from_secs(t1)),
                    Some(Duration::from_secs(t2)),
                )
            }
            None => (None, None, None),
        };

        Some(Self {
            address,
            subnet_mask,
            gateway: msg.router().copied().filter(|gw| !gw.is_unspecified()),
            server_id,
            lease_start: now,
            lease_duration,
            renewal,
            rebinding,
        })
    }

    pub fn renew_at(&self) -> Option<Instant> {
        self.renewal.map(|t1| self.lease_start + t1)
    }

    pub fn rebind_at(&self) -> Option<Instant> {
        self.rebinding.map(|t2| self.lease_start + t2)
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.lease_duration.map(|d| self.lease_start + d)
    }

    pub fn network(&self) -> Ipv4Net {
        // prefix_len never exceeds 32
        Ipv4Net::new(self.address, prefix_len(self.subnet_mask))
            .unwrap_or_else(|_| Ipv4Net::from(self.address))
    }
}

pub fn prefix_len(mask: Ipv4Addr) -> u8 {
    u32::from(mask).leading_ones() as u8
}

fn is_contiguous(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

/// Pre-CIDR default mask for `address`.
pub fn classful_mask(address: Ipv4Addr) -> Ipv4Addr {
    match address.octets()[0] {
        0..=127 => Ipv4Addr::new(255, 0, 0, 0),
        128..=191 => Ipv4Addr::new(255, 255, 0, 0),
        _ => Ipv4Addr::new(255, 255, 255, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 240, 0)), 20);
        assert_eq!(prefix_len(Ipv4Addr::UNSPECIFIED), 0);
        assert!(is_contiguous(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(!is_contiguous(Ipv4Addr::new(255, 0, 255, 0)));
        assert_eq!(
            classful_mask(Ipv4Addr::new(10, 1, 2, 3)),
            Ipv4Addr::new(255, 0, 0, 0)
        );
        assert_eq!(
            classful_mask(Ipv4Addr::new(172, 16, 0, 1)),
            Ipv4Addr::new(255, 255, 0, 0)
        );
        assert_eq!(
            classful_mask(Ipv4Addr::new(192, 168, 1, 1)),
            Ipv4Addr::new(255, 255, 255, 0)
        );
    }
}

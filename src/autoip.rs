//! RFC 3927 link-local address selection.

use std::net::Ipv4Addr;

use advmac::MacAddr6;
use ipnet::Ipv4Net;

/// 169.254.1.0, the first usable link-local address.
const RANGE_START: u32 = u32::from_be_bytes([169, 254, 1, 0]);
/// 169.254.1.0 through 169.254.254.255.
const RANGE_SIZE: u32 = 254 * 256;

pub const LINK_LOCAL_PREFIX: u8 = 16;

/// Address for attempt `tries`, derived from the low bytes of the MAC so
/// that the same node tends to land on the same address after a reboot.
pub fn link_local_address(hwaddr: MacAddr6, tries: u32) -> Ipv4Addr {
    let mac = hwaddr.to_array();
    let seed = (u32::from(mac[4]) << 8) | u32::from(mac[3]);
    let index = seed.wrapping_add(tries) % RANGE_SIZE;
    Ipv4Addr::from(RANGE_START + index)
}

pub fn link_local_network(address: Ipv4Addr) -> Option<Ipv4Net> {
    Ipv4Net::new(address, LINK_LOCAL_PREFIX).ok()
}

pub fn is_link_local(address: Ipv4Addr) -> bool {
    let value = u32::from(address);
    (RANGE_START..RANGE_START + RANGE_SIZE).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_stay_in_range() {
        let mac = MacAddr6::new([0x02, 0x00, 0x00, 0xff, 0xfe, 0x00]);
        for tries in [0, 1, 255, 1000, u32::MAX] {
            let ip = link_local_address(mac, tries);
            assert!(is_link_local(ip), "{ip} outside link-local range");
        }
    }

    #[test]
    fn address_is_stable_per_node_and_moves_per_attempt() {
        let mac = MacAddr6::new([0x00, 0x50, 0xc2, 0x12, 0x34, 0x56]);
        let first = link_local_address(mac, 0);
        assert_eq!(first, Ipv4Addr::new(169, 254, 0x35, 0x12));
        assert_eq!(first, link_local_address(mac, 0));
        assert_eq!(link_local_address(mac, 1), Ipv4Addr::new(169, 254, 0x35, 0x13));
    }

    #[test]
    fn range_edges() {
        assert!(!is_link_local(Ipv4Addr::new(169, 254, 0, 255)));
        assert!(is_link_local(Ipv4Addr::new(169, 254, 1, 0)));
        assert!(is_link_local(Ipv4Addr::new(169, 254, 254, 255)));
        assert!(!is_link_local(Ipv4Addr::new(169, 254, 255, 0)));
    }
}

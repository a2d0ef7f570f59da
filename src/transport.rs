use std::net::Ipv4Addr;

use dhcproto::v4;

use crate::arp::ArpPacket;

/// Outbound half of the link driver.
///
/// Implementations own framing: Ethernet headers for ARP, and the
/// IP/UDP encapsulation (ports 68 -> 67) for DHCP.
pub trait Transport {
    fn send_arp(&mut self, packet: &ArpPacket);

    /// `destination` is 255.255.255.255 unless the message is unicast to a
    /// known server (renew, release).
    fn send_dhcp(&mut self, destination: Ipv4Addr, message: &v4::Message);
}

/// An inbound payload handed to the coordinator by the link driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// ARP payload, Ethernet padding allowed.
    Arp(Vec<u8>),
    /// UDP payload received on port 68.
    Dhcp(Vec<u8>),
}

impl Frame {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frame::Arp(_) => "arp",
            Frame::Dhcp(_) => "dhcp",
        }
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_arp(&mut self, packet: &ArpPacket) {
        (**self).send_arp(packet)
    }

    fn send_dhcp(&mut self, destination: Ipv4Addr, message: &v4::Message) {
        (**self).send_dhcp(destination, message)
    }
}

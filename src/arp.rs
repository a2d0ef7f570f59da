//! RFC 826 ARP for Ethernet/IPv4, plus the RFC 5227 packet shapes used by
//! address conflict detection.

use std::net::Ipv4Addr;

use advmac::MacAddr6;

use crate::error::ArpError;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const HLEN: u8 = 6;
const PLEN: u8 = 4;

/// Length of an Ethernet/IPv4 ARP payload, without Ethernet padding.
pub const ARP_PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Request = 1,
    Reply = 2,
}

/// How an outbound (or inbound) packet should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpKind {
    /// Request with an all-zero sender IP.
    Probe,
    /// Request where sender IP equals target IP.
    Announcement,
    Request,
    Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: Operation,
    pub sender_mac: MacAddr6,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr6,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// RFC 5227 2.1.1: who-has `candidate`, sent with an unspecified sender IP
    /// so no peer updates its cache.
    pub fn probe(own_mac: MacAddr6, candidate: Ipv4Addr) -> Self {
        Self {
            operation: Operation::Request,
            sender_mac: own_mac,
            sender_ip: Ipv4Addr::UNSPECIFIED,
            target_mac: MacAddr6::new([0; 6]),
            target_ip: candidate,
        }
    }

    /// RFC 5227 2.3: gratuitous request claiming `address`.
    pub fn announcement(own_mac: MacAddr6, address: Ipv4Addr) -> Self {
        Self {
            operation: Operation::Request,
            sender_mac: own_mac,
            sender_ip: address,
            target_mac: MacAddr6::new([0; 6]),
            target_ip: address,
        }
    }

    pub fn reply(own_mac: MacAddr6, address: Ipv4Addr, to: &ArpPacket) -> Self {
        Self {
            operation: Operation::Reply,
            sender_mac: own_mac,
            sender_ip: address,
            target_mac: to.sender_mac,
            target_ip: to.sender_ip,
        }
    }

    pub fn kind(&self) -> ArpKind {
        match self.operation {
            Operation::Reply => ArpKind::Reply,
            Operation::Request if self.sender_ip.is_unspecified() => ArpKind::Probe,
            Operation::Request if self.sender_ip == self.target_ip => ArpKind::Announcement,
            Operation::Request => ArpKind::Request,
        }
    }

    /// Parse an ARP payload. Trailing Ethernet padding is ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArpError> {
        if bytes.len() < ARP_PACKET_LEN {
            return Err(ArpError::Truncated(bytes.len()));
        }
        let htype = u16::from_be_bytes([bytes[0], bytes[1]]);
        let ptype = u16::from_be_bytes([bytes[2], bytes[3]]);
        if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || bytes[4] != HLEN || bytes[5] != PLEN {
            return Err(ArpError::Unsupported { htype, ptype });
        }
        let operation = match u16::from_be_bytes([bytes[6], bytes[7]]) {
            1 => Operation::Request,
            2 => Operation::Reply,
            other => return Err(ArpError::UnknownOperation(other)),
        };

        Ok(Self {
            operation,
            sender_mac: mac_at(bytes, 8),
            sender_ip: ip_at(bytes, 14),
            target_mac: mac_at(bytes, 18),
            target_ip: ip_at(bytes, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut out = [0u8; ARP_PACKET_LEN];
        out[0..2].copy_from_slice(&HTYPE_ETHERNET.to_be_bytes());
        out[2..4].copy_from_slice(&PTYPE_IPV4.to_be_bytes());
        out[4] = HLEN;
        out[5] = PLEN;
        out[6..8].copy_from_slice(&(self.operation as u16).to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac.to_array());
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac.to_array());
        out[24..28].copy_from_slice(&self.target_ip.octets());
        out
    }
}

fn mac_at(bytes: &[u8], offset: usize) -> MacAddr6 {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[offset..offset + 6]);
    MacAddr6::new(mac)
}

fn ip_at(bytes: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    )
}

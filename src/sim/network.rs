use std::{collections::VecDeque, net::Ipv4Addr};

use advmac::MacAddr6;
use dhcproto::{v4, Encodable};
use tracing::{debug, trace, warn};

use super::server::{DhcpV4Response, SimDhcpServer};
use crate::{
    arp::{ArpKind, ArpPacket},
    transport::{Frame, Transport},
};

/// Everything the node put on the wire, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Arp(ArpPacket),
    Dhcp {
        destination: Ipv4Addr,
        message: v4::Message,
    },
}

/// Another station on the segment that owns `ip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimHost {
    pub mac: MacAddr6,
    pub ip: Ipv4Addr,
    /// Answer gratuitous claims on `ip` with an announcement of its own.
    pub defends: bool,
}

/// One Ethernet segment seen from the node: an optional DHCP server and a
/// set of hosts that answer ARP. Whatever they send back is queued until
/// the owner collects it with [`SimNetwork::take_inbound`].
#[derive(Default)]
pub struct SimNetwork {
    server: Option<SimDhcpServer>,
    hosts: Vec<SimHost>,
    pub sent: Vec<Sent>,
    inbound: VecDeque<Frame>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(server: SimDhcpServer) -> Self {
        Self {
            server: Some(server),
            ..Self::default()
        }
    }

    pub fn set_server(&mut self, server: Option<SimDhcpServer>) {
        self.server = server;
    }

    pub fn server(&self) -> Option<&SimDhcpServer> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut SimDhcpServer> {
        self.server.as_mut()
    }

    pub fn add_host(&mut self, mac: MacAddr6, ip: Ipv4Addr, defends: bool) {
        debug!(%mac, %ip, defends, "host joined segment");
        self.hosts.push(SimHost { mac, ip, defends });
    }

    pub fn remove_host(&mut self, ip: Ipv4Addr) {
        self.hosts.retain(|h| h.ip != ip);
    }

    /// Queue a frame as if another station had sent it.
    pub fn inject(&mut self, frame: Frame) {
        self.inbound.push_back(frame);
    }

    pub fn take_inbound(&mut self) -> Vec<Frame> {
        self.inbound.drain(..).collect()
    }

    pub fn take_sent(&mut self) -> Vec<Sent> {
        std::mem::take(&mut self.sent)
    }

    pub fn arp_sent(&self) -> impl Iterator<Item = &ArpPacket> {
        self.sent.iter().filter_map(|s| match s {
            Sent::Arp(p) => Some(p),
            Sent::Dhcp { .. } => None,
        })
    }

    pub fn dhcp_sent(&self) -> impl Iterator<Item = (Ipv4Addr, &v4::Message)> {
        self.sent.iter().filter_map(|s| match s {
            Sent::Dhcp {
                destination,
                message,
            } => Some((*destination, message)),
            Sent::Arp(_) => None,
        })
    }

    fn answer_hosts(&mut self, packet: &ArpPacket) {
        let kind = packet.kind();
        for host in &self.hosts {
            let answer = match kind {
                ArpKind::Probe | ArpKind::Request if packet.target_ip == host.ip => {
                    ArpPacket::reply(host.mac, host.ip, packet)
                }
                ArpKind::Announcement if host.defends && packet.sender_ip == host.ip => {
                    ArpPacket::announcement(host.mac, host.ip)
                }
                _ => continue,
            };
            trace!(host = %host.mac, ip = %host.ip, ?kind, "host answered");
            self.inbound.push_back(Frame::Arp(answer.to_bytes().to_vec()));
        }
    }
}

impl Transport for SimNetwork {
    fn send_arp(&mut self, packet: &ArpPacket) {
        self.sent.push(Sent::Arp(packet.clone()));
        self.answer_hosts(packet);
    }

    fn send_dhcp(&mut self, destination: Ipv4Addr, message: &v4::Message) {
        self.sent.push(Sent::Dhcp {
            destination,
            message: message.clone(),
        });
        let Some(server) = self.server.as_mut() else {
            return;
        };
        match server.handle_message(message) {
            DhcpV4Response::Message(reply) => match reply.to_vec() {
                Ok(bytes) => self.inbound.push_back(Frame::Dhcp(bytes)),
                Err(e) => warn!(%e, "failed to encode server reply"),
            },
            DhcpV4Response::NoResponse(reason) => {
                trace!(reason = reason.as_str(), "server did not answer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::messages;

    const NODE: MacAddr6 = MacAddr6::new([0x00, 0x50, 0xc2, 0x12, 0x34, 0x56]);
    const PEER: MacAddr6 = MacAddr6::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x07]);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

    fn inbound_arp(net: &mut SimNetwork) -> Vec<ArpPacket> {
        net.take_inbound()
            .into_iter()
            .filter_map(|f| match f {
                Frame::Arp(bytes) => ArpPacket::parse(&bytes).ok(),
                Frame::Dhcp(_) => None,
            })
            .collect()
    }

    #[test]
    fn hosts_answer_probes_for_their_address() {
        let mut net = SimNetwork::new();
        net.add_host(PEER, PEER_IP, false);

        net.send_arp(&ArpPacket::probe(NODE, Ipv4Addr::new(10, 0, 0, 8)));
        assert!(net.take_inbound().is_empty());

        net.send_arp(&ArpPacket::probe(NODE, PEER_IP));
        let answers = inbound_arp(&mut net);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].kind(), ArpKind::Reply);
        assert_eq!(answers[0].sender_ip, PEER_IP);
        assert_eq!(answers[0].target_mac, NODE);
        assert_eq!(net.arp_sent().count(), 2);
    }

    #[test]
    fn only_defending_hosts_answer_announcements() {
        let mut net = SimNetwork::new();
        net.add_host(PEER, PEER_IP, false);
        net.send_arp(&ArpPacket::announcement(NODE, PEER_IP));
        assert!(net.take_inbound().is_empty());

        net.remove_host(PEER_IP);
        net.add_host(PEER, PEER_IP, true);
        net.send_arp(&ArpPacket::announcement(NODE, PEER_IP));
        let answers = inbound_arp(&mut net);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].kind(), ArpKind::Announcement);
    }

    #[test]
    fn dhcp_goes_to_the_server() {
        let mut net = SimNetwork::with_server(SimDhcpServer::lab());
        net.send_dhcp(Ipv4Addr::BROADCAST, &messages::discover(NODE, 9, None));

        let inbound = net.take_inbound();
        assert!(matches!(inbound.as_slice(), [Frame::Dhcp(_)]));
        let (destination, message) = net.dhcp_sent().next().unwrap();
        assert_eq!(destination, Ipv4Addr::BROADCAST);
        assert_eq!(message.xid(), 9);

        net.set_server(None);
        net.send_dhcp(Ipv4Addr::BROADCAST, &messages::discover(NODE, 10, None));
        assert!(net.take_inbound().is_empty());
    }
}

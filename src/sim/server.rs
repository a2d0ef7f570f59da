use std::{
    collections::{HashMap, HashSet},
    net::Ipv4Addr,
};

use advmac::MacAddr6;
use dhcproto::v4::{self, DhcpOption, Flags};
use ipnet::Ipv4Net;
use tracing::{debug, field, info, instrument, warn, Span};

use crate::dhcp::extensions::MessageExtV4;

const ADDRESS_LEASE_TIME: u32 = 3600;

#[derive(Debug, Clone)]
pub struct V4Subnet {
    pub net: Ipv4Net,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NoResponse {
    NoValidMac,
    Discarded,
    WrongServerId,
    NoMessageType,
    PoolExhausted,
    /// Lease bookkeeping only, DECLINE and RELEASE get no answer.
    Recorded,
    Muted,
}

impl NoResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoResponse::NoValidMac => "NoValidMac",
            NoResponse::Discarded => "Discarded",
            NoResponse::WrongServerId => "WrongServerId",
            NoResponse::NoMessageType => "NoMessageType",
            NoResponse::PoolExhausted => "PoolExhausted",
            NoResponse::Recorded => "Recorded",
            NoResponse::Muted => "Muted",
        }
    }
}

pub enum DhcpV4Response {
    Message(v4::Message),
    NoResponse(NoResponse),
}

/// A small in-memory DHCP server for one subnet.
///
/// Addresses are handed out from `pool_start` upwards. Declined addresses
/// are never offered again.
pub struct SimDhcpServer {
    pub server_id: Ipv4Addr,
    pub subnet: V4Subnet,
    pub dns: Vec<Ipv4Addr>,
    pub lease_time: u32,
    /// While set, nothing is answered. Used to let leases run out.
    pub muted: bool,
    pool_start: Ipv4Addr,
    bindings: HashMap<MacAddr6, Ipv4Addr>,
    declined: HashSet<Ipv4Addr>,
}

impl SimDhcpServer {
    pub fn new(subnet: V4Subnet, pool_start: Ipv4Addr) -> Self {
        Self {
            server_id: subnet.gateway,
            subnet,
            dns: Vec::new(),
            lease_time: ADDRESS_LEASE_TIME,
            muted: false,
            pool_start,
            bindings: HashMap::new(),
            declined: HashSet::new(),
        }
    }

    /// 10.0.0.0/24 with the server on .1 and the pool from .5.
    pub fn lab() -> Self {
        Self::new(
            V4Subnet {
                net: Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 24),
                gateway: Ipv4Addr::new(10, 0, 0, 1),
            },
            Ipv4Addr::new(10, 0, 0, 5),
        )
    }

    pub fn binding(&self, mac: &MacAddr6) -> Option<Ipv4Addr> {
        self.bindings.get(mac).copied()
    }

    pub fn is_declined(&self, ip: Ipv4Addr) -> bool {
        self.declined.contains(&ip)
    }

    fn is_free(&self, ip: Ipv4Addr, mac: &MacAddr6) -> bool {
        self.subnet.net.contains(&ip)
            && ip != self.subnet.gateway
            && ip != self.subnet.net.broadcast()
            && !self.declined.contains(&ip)
            && self.bindings.iter().all(|(m, bound)| m == mac || *bound != ip)
    }

    fn allocate(&mut self, mac: MacAddr6, requested: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        if let Some(ip) = self.bindings.get(&mac).copied() {
            if !self.declined.contains(&ip) {
                return Some(ip);
            }
        }
        let ip = requested
            .filter(|ip| self.is_free(*ip, &mac))
            .or_else(|| {
                self.subnet
                    .net
                    .hosts()
                    .filter(|ip| *ip >= self.pool_start)
                    .find(|ip| self.is_free(*ip, &mac))
            })?;
        self.bindings.insert(mac, ip);
        Some(ip)
    }

    pub fn handle_message(&mut self, msg: &v4::Message) -> DhcpV4Response {
        if self.muted {
            return DhcpV4Response::NoResponse(NoResponse::Muted);
        }
        // servers should only respond to BootRequest messages
        let message_type = match msg.opcode() {
            v4::Opcode::BootRequest => match msg.message_type() {
                Some(mt) => *mt,
                None => return DhcpV4Response::NoResponse(NoResponse::NoMessageType),
            },
            _ => return DhcpV4Response::NoResponse(NoResponse::Discarded),
        };
        let mac_addr = match MacAddr6::try_from(msg.chaddr()).ok() {
            Some(ma) => ma,
            None => return DhcpV4Response::NoResponse(NoResponse::NoValidMac),
        };

        match message_type {
            v4::MessageType::Discover => self.handle_discover(mac_addr, msg),
            v4::MessageType::Request => self.handle_request(mac_addr, msg),
            v4::MessageType::Decline => self.handle_decline(mac_addr, msg),
            v4::MessageType::Release => self.handle_release(mac_addr, msg),
            _ => DhcpV4Response::NoResponse(NoResponse::Discarded),
        }
    }

    fn reply(&self, msg: &v4::Message, yiaddr: Ipv4Addr, message_type: v4::MessageType) -> v4::Message {
        let unspecified = Ipv4Addr::UNSPECIFIED;
        let mut reply = v4::Message::new_with_id(
            msg.xid(),
            unspecified,
            yiaddr,
            unspecified,
            msg.giaddr(),
            msg.chaddr(),
        );
        reply.set_opcode(v4::Opcode::BootReply);
        reply.set_flags(msg.flags());
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(message_type));
        opts.insert(DhcpOption::ServerIdentifier(self.server_id));
        if message_type != v4::MessageType::Nak {
            opts.insert(DhcpOption::SubnetMask(self.subnet.net.netmask()));
            opts.insert(DhcpOption::Router(vec![self.subnet.gateway]));
            if !self.dns.is_empty() {
                opts.insert(DhcpOption::DomainNameServer(self.dns.clone()));
            }
            opts.insert(DhcpOption::AddressLeaseTime(self.lease_time));
            opts.insert(DhcpOption::Renewal(self.lease_time / 2));
            opts.insert(DhcpOption::Rebinding(self.lease_time / 8 * 7));
        }
        reply
    }

    /// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.1>
    #[instrument(skip(self, msg), fields(mac = field::Empty, xid = %msg.xid()))]
    fn handle_discover(&mut self, mac_addr: MacAddr6, msg: &v4::Message) -> DhcpV4Response {
        Span::current().record("mac", field::display(mac_addr));
        let Some(ip) = self.allocate(mac_addr, msg.requested_ip_addr().copied()) else {
            warn!("pool exhausted");
            return DhcpV4Response::NoResponse(NoResponse::PoolExhausted);
        };
        info!(ipv4 = %ip, "DHCPOffer");
        DhcpV4Response::Message(self.reply(msg, ip, v4::MessageType::Offer))
    }

    /// <https://datatracker.ietf.org/doc/html/rfc2131#section-4.3.2>
    #[instrument(skip(self, msg), fields(mac = field::Empty, xid = %msg.xid()))]
    fn handle_request(&mut self, mac_addr: MacAddr6, msg: &v4::Message) -> DhcpV4Response {
        Span::current().record("mac", field::display(mac_addr));

        let variant_tuple = (msg.server_id(), msg.ciaddr(), msg.requested_ip_addr());
        let requested = match variant_tuple {
            (Some(server_id), Ipv4Addr::UNSPECIFIED, Some(requested_ip)) => {
                debug!("variant: selecting");
                if server_id != &self.server_id {
                    info!(%server_id, "SELECTING server id did not match");
                    return DhcpV4Response::NoResponse(NoResponse::WrongServerId);
                }
                *requested_ip
            }
            (None, Ipv4Addr::UNSPECIFIED, Some(requested_ip)) => {
                debug!("variant: init-reboot");
                *requested_ip
            }
            (None, ciaddr, None) if !ciaddr.is_unspecified() => {
                debug!("variant: renew or rebind");
                ciaddr
            }
            _ => {
                info!("Unrecognized DHCPREQUEST variant");
                return DhcpV4Response::NoResponse(NoResponse::Discarded);
            }
        };

        if self.binding(&mac_addr) == Some(requested) && !self.declined.contains(&requested) {
            info!(ipv4 = %requested, "DHCPAck");
            DhcpV4Response::Message(self.reply(msg, requested, v4::MessageType::Ack))
        } else {
            warn!(ipv4 = %requested, bound = ?self.binding(&mac_addr), "sending DHCPNak");
            let mut reply = self.reply(msg, Ipv4Addr::UNSPECIFIED, v4::MessageType::Nak);
            reply.set_flags(Flags::default().set_broadcast());
            DhcpV4Response::Message(reply)
        }
    }

    fn handle_decline(&mut self, mac_addr: MacAddr6, msg: &v4::Message) -> DhcpV4Response {
        if let Some(ip) = msg.requested_ip_addr() {
            warn!(%mac_addr, ipv4 = %ip, "DHCPDecline, address marked in use");
            self.declined.insert(*ip);
            if self.bindings.get(&mac_addr) == Some(ip) {
                self.bindings.remove(&mac_addr);
            }
        }
        DhcpV4Response::NoResponse(NoResponse::Recorded)
    }

    fn handle_release(&mut self, mac_addr: MacAddr6, msg: &v4::Message) -> DhcpV4Response {
        info!(%mac_addr, ipv4 = %msg.ciaddr(), "DHCPRelease");
        if self.bindings.get(&mac_addr) == Some(&msg.ciaddr()) {
            self.bindings.remove(&mac_addr);
        }
        DhcpV4Response::NoResponse(NoResponse::Recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::messages;

    const TEST_MAC: MacAddr6 = MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    const TEST_MAC_2: MacAddr6 = MacAddr6::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    fn expect_message(response: DhcpV4Response) -> v4::Message {
        match response {
            DhcpV4Response::Message(msg) => msg,
            DhcpV4Response::NoResponse(reason) => {
                panic!("Expected a reply, got NoResponse({})", reason.as_str())
            }
        }
    }

    #[test]
    fn discover_returns_offer_from_pool() {
        let mut server = SimDhcpServer::lab();
        let reply = expect_message(server.handle_message(&messages::discover(TEST_MAC, 0x1234, None)));

        assert_eq!(reply.message_type(), Some(&v4::MessageType::Offer));
        assert_eq!(reply.yiaddr(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(reply.xid(), 0x1234);
        assert_eq!(&reply.chaddr()[0..6], &TEST_MAC.to_array());

        let other = expect_message(server.handle_message(&messages::discover(TEST_MAC_2, 1, None)));
        assert_eq!(other.yiaddr(), Ipv4Addr::new(10, 0, 0, 6));
    }

    #[test]
    fn discover_honours_free_hint() {
        let mut server = SimDhcpServer::lab();
        let hint = Ipv4Addr::new(10, 0, 0, 42);
        let reply = expect_message(server.handle_message(&messages::discover(TEST_MAC, 1, Some(hint))));
        assert_eq!(reply.yiaddr(), hint);
    }

    #[test]
    fn request_selecting_acks_bound_address() {
        let mut server = SimDhcpServer::lab();
        let offer = expect_message(server.handle_message(&messages::discover(TEST_MAC, 7, None)));
        let request = messages::request_selecting(TEST_MAC, 7, "node", offer.yiaddr(), server.server_id);
        let ack = expect_message(server.handle_message(&request));

        assert_eq!(ack.message_type(), Some(&v4::MessageType::Ack));
        assert_eq!(ack.yiaddr(), offer.yiaddr());
        assert_eq!(ack.lease_time(), Some(ADDRESS_LEASE_TIME));
        assert_eq!(ack.router(), Some(&Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn request_for_other_server_is_ignored() {
        let mut server = SimDhcpServer::lab();
        server.handle_message(&messages::discover(TEST_MAC, 7, None));
        let request = messages::request_selecting(
            TEST_MAC,
            7,
            "node",
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 254),
        );
        assert!(matches!(
            server.handle_message(&request),
            DhcpV4Response::NoResponse(NoResponse::WrongServerId)
        ));
    }

    #[test]
    fn declined_address_is_not_offered_again() {
        let mut server = SimDhcpServer::lab();
        let offer = expect_message(server.handle_message(&messages::discover(TEST_MAC, 7, None)));
        server.handle_message(&messages::decline(TEST_MAC, 7, offer.yiaddr(), server.server_id));
        assert!(server.is_declined(offer.yiaddr()));

        let again = expect_message(server.handle_message(&messages::discover(TEST_MAC, 8, Some(offer.yiaddr()))));
        assert_eq!(again.yiaddr(), Ipv4Addr::new(10, 0, 0, 6));
    }

    #[test]
    fn renew_of_unknown_address_is_nakked() {
        let mut server = SimDhcpServer::lab();
        let renew = messages::request_renewing(TEST_MAC, 3, "node", Ipv4Addr::new(10, 0, 0, 77));
        let nak = expect_message(server.handle_message(&renew));
        assert_eq!(nak.message_type(), Some(&v4::MessageType::Nak));
        assert_eq!(nak.yiaddr(), Ipv4Addr::UNSPECIFIED);
    }
}

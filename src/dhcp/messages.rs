//! Client-side message builders.
//!
//! <https://datatracker.ietf.org/doc/html/rfc2131#section-4.4.1> Table 5 lists
//! which fields and options go into each client message.

use std::net::Ipv4Addr;

use advmac::MacAddr6;
use dhcproto::v4::{self, DhcpOption, Flags, OptionCode};

/// Client identifier, type 1 (Ethernet) followed by the MAC.
fn client_id(hwaddr: MacAddr6) -> Vec<u8> {
    let mut id = Vec::with_capacity(7);
    id.push(1);
    id.extend_from_slice(&hwaddr.to_array());
    id
}

fn parameter_request_list() -> DhcpOption {
    DhcpOption::ParameterRequestList(vec![
        OptionCode::SubnetMask,
        OptionCode::Router,
        OptionCode::DomainNameServer,
        OptionCode::AddressLeaseTime,
        OptionCode::Renewal,
        OptionCode::Rebinding,
    ])
}

fn base(hwaddr: MacAddr6, xid: u32, ciaddr: Ipv4Addr, message_type: v4::MessageType) -> v4::Message {
    let unspecified = Ipv4Addr::UNSPECIFIED;
    let mut msg = v4::Message::new_with_id(
        xid,
        ciaddr,
        unspecified,
        unspecified,
        unspecified,
        &hwaddr.to_array(),
    );
    msg.set_opcode(v4::Opcode::BootRequest);
    // without an address of our own we can only hear broadcast replies
    if ciaddr.is_unspecified() {
        msg.set_flags(Flags::default().set_broadcast());
    }
    let opts = msg.opts_mut();
    opts.insert(DhcpOption::MessageType(message_type));
    opts.insert(DhcpOption::ClientIdentifier(client_id(hwaddr)));
    msg
}

pub fn discover(hwaddr: MacAddr6, xid: u32, requested: Option<Ipv4Addr>) -> v4::Message {
    let mut msg = base(hwaddr, xid, Ipv4Addr::UNSPECIFIED, v4::MessageType::Discover);
    let opts = msg.opts_mut();
    opts.insert(parameter_request_list());
    if let Some(ip) = requested {
        opts.insert(DhcpOption::RequestedIpAddress(ip));
    }
    msg
}

/// REQUEST in SELECTING state: ciaddr zero, server id and requested ip set.
pub fn request_selecting(
    hwaddr: MacAddr6,
    xid: u32,
    hostname: &str,
    requested: Ipv4Addr,
    server_id: Ipv4Addr,
) -> v4::Message {
    let mut msg = base(hwaddr, xid, Ipv4Addr::UNSPECIFIED, v4::MessageType::Request);
    let opts = msg.opts_mut();
    opts.insert(DhcpOption::RequestedIpAddress(requested));
    opts.insert(DhcpOption::ServerIdentifier(server_id));
    opts.insert(parameter_request_list());
    if !hostname.is_empty() {
        opts.insert(DhcpOption::Hostname(hostname.to_string()));
    }
    msg
}

/// REQUEST in RENEWING or REBINDING state: ciaddr set, no server id and no
/// requested ip. The two differ only in destination.
pub fn request_renewing(hwaddr: MacAddr6, xid: u32, hostname: &str, ciaddr: Ipv4Addr) -> v4::Message {
    let mut msg = base(hwaddr, xid, ciaddr, v4::MessageType::Request);
    let opts = msg.opts_mut();
    opts.insert(parameter_request_list());
    if !hostname.is_empty() {
        opts.insert(DhcpOption::Hostname(hostname.to_string()));
    }
    msg
}

pub fn decline(hwaddr: MacAddr6, xid: u32, address: Ipv4Addr, server_id: Ipv4Addr) -> v4::Message {
    let mut msg = base(hwaddr, xid, Ipv4Addr::UNSPECIFIED, v4::MessageType::Decline);
    let opts = msg.opts_mut();
    opts.insert(DhcpOption::RequestedIpAddress(address));
    opts.insert(DhcpOption::ServerIdentifier(server_id));
    msg
}

pub fn release(hwaddr: MacAddr6, xid: u32, address: Ipv4Addr, server_id: Ipv4Addr) -> v4::Message {
    let mut msg = base(hwaddr, xid, address, v4::MessageType::Release);
    msg.opts_mut()
        .insert(DhcpOption::ServerIdentifier(server_id));
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::extensions::MessageExtV4;

    const MAC: MacAddr6 = MacAddr6::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

    #[test]
    fn discover_carries_client_id_and_hint() {
        let msg = discover(MAC, 0xAABBCCDD, Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(msg.xid(), 0xAABBCCDD);
        assert_eq!(msg.message_type(), Some(&v4::MessageType::Discover));
        assert_eq!(msg.requested_ip_addr(), Some(&Ipv4Addr::new(10, 0, 0, 5)));
        assert!(msg.flags().broadcast());
        assert_eq!(&msg.chaddr()[0..6], &MAC.to_array());
        assert!(msg.opts().iter().any(|o| matches!(
            o.1,
            DhcpOption::ClientIdentifier(id) if id[0] == 1 && id[1..] == MAC.to_array()
        )));
    }

    #[test]
    fn renewing_request_is_unicast_shaped() {
        let ip = Ipv4Addr::new(10, 0, 0, 5);
        let msg = request_renewing(MAC, 7, "node", ip);
        assert_eq!(msg.ciaddr(), ip);
        assert_eq!(msg.server_id(), None);
        assert_eq!(msg.requested_ip_addr(), None);
        assert!(!msg.flags().broadcast());
        assert_eq!(msg.hostname(), Some("node"));
    }

    #[test]
    fn decline_names_address_and_server() {
        let msg = decline(
            MAC,
            9,
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        assert_eq!(msg.message_type(), Some(&v4::MessageType::Decline));
        assert_eq!(msg.ciaddr(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(msg.requested_ip_addr(), Some(&Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(msg.server_id(), Some(&Ipv4Addr::new(10, 0, 0, 1)));
    }
}

use dhcproto::v4::{self, DhcpOption};
use std::net::Ipv4Addr;

/// Helpers for reading options out of a dhcproto::v4::Message
pub trait MessageExtV4 {
    fn message_type(&self) -> Option<&v4::MessageType>;
    fn server_id(&self) -> Option<&Ipv4Addr>;
    fn requested_ip_addr(&self) -> Option<&Ipv4Addr>;
    fn subnet_mask(&self) -> Option<&Ipv4Addr>;
    /// First router listed, if any.
    fn router(&self) -> Option<&Ipv4Addr>;
    fn lease_time(&self) -> Option<u32>;
    fn renewal_time(&self) -> Option<u32>;
    fn rebinding_time(&self) -> Option<u32>;
    fn hostname(&self) -> Option<&str>;
}

impl MessageExtV4 for v4::Message {
    fn message_type(&self) -> Option<&v4::MessageType> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::MessageType(mt) => Some(mt),
            _ => None,
        })
    }

    fn server_id(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::ServerIdentifier(addr) => Some(addr),
            _ => None,
        })
    }

    fn requested_ip_addr(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::RequestedIpAddress(addr) => Some(addr),
            _ => None,
        })
    }

    fn subnet_mask(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::SubnetMask(mask) => Some(mask),
            _ => None,
        })
    }

    fn router(&self) -> Option<&Ipv4Addr> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::Router(routers) => routers.first(),
            _ => None,
        })
    }

    fn lease_time(&self) -> Option<u32> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::AddressLeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    fn renewal_time(&self) -> Option<u32> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::Renewal(secs) => Some(*secs),
            _ => None,
        })
    }

    fn rebinding_time(&self) -> Option<u32> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::Rebinding(secs) => Some(*secs),
            _ => None,
        })
    }

    fn hostname(&self) -> Option<&str> {
        self.opts().iter().find_map(|o| match o.1 {
            DhcpOption::Hostname(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

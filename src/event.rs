use crate::{acd::AcdCallback, dhcp::DhcpStatus, Address};

/// Receiver for network state changes, typically the display or status LED
/// driver. Every hook is optional.
pub trait NetworkEventSink {
    fn acd_callback(&mut self, _callback: AcdCallback) {}

    fn dhcp_status(&mut self, _status: DhcpStatus) {}

    /// `None` when the address is withdrawn.
    fn address_changed(&mut self, _address: Option<Address>) {}

    fn link_up(&mut self) {}

    fn link_down(&mut self) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NetworkEventSink for NoopSink {}

impl<S: NetworkEventSink + ?Sized> NetworkEventSink for &mut S {
    fn acd_callback(&mut self, callback: AcdCallback) {
        (**self).acd_callback(callback)
    }

    fn dhcp_status(&mut self, status: DhcpStatus) {
        (**self).dhcp_status(status)
    }

    fn address_changed(&mut self, address: Option<Address>) {
        (**self).address_changed(address)
    }

    fn link_up(&mut self) {
        (**self).link_up()
    }

    fn link_down(&mut self) {
        (**self).link_down()
    }
}

/// Everything a sink can be told, as a value. Used by recording and
/// journaling sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "event", content = "value", rename_all = "snake_case")]
pub enum NetworkEvent {
    AcdCallback(AcdCallback),
    DhcpStatus(DhcpStatus),
    AddressChanged(Option<Address>),
    LinkUp,
    LinkDown,
}

impl NetworkEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkEvent::AcdCallback(_) => "acd_callback",
            NetworkEvent::DhcpStatus(_) => "dhcp_status",
            NetworkEvent::AddressChanged(_) => "address_changed",
            NetworkEvent::LinkUp => "link_up",
            NetworkEvent::LinkDown => "link_down",
        }
    }
}

/// Sink that keeps every event in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub events: Vec<NetworkEvent>,
}

impl RecordingSink {
    pub fn take(&mut self) -> Vec<NetworkEvent> {
        std::mem::take(&mut self.events)
    }
}

impl NetworkEventSink for RecordingSink {
    fn acd_callback(&mut self, callback: AcdCallback) {
        self.events.push(NetworkEvent::AcdCallback(callback));
    }

    fn dhcp_status(&mut self, status: DhcpStatus) {
        self.events.push(NetworkEvent::DhcpStatus(status));
    }

    fn address_changed(&mut self, address: Option<Address>) {
        self.events.push(NetworkEvent::AddressChanged(address));
    }

    fn link_up(&mut self) {
        self.events.push(NetworkEvent::LinkUp);
    }

    fn link_down(&mut self) {
        self.events.push(NetworkEvent::LinkDown);
    }
}

//! Ties the DHCP client and conflict detection together and owns the one
//! address the node exposes.
//!
//! Everything is driven by the owner: frames are queued with
//! [`AddressCoordinator::on_frame_received`] and handled, in arrival order,
//! at the next [`AddressCoordinator::tick`], before any timer runs.

use std::{collections::VecDeque, sync::Arc};

use advmac::MacAddr6;
use arc_swap::ArcSwap;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    acd::{AcdCallback, AcdEngine, AcdMode, AcdState, RATE_LIMIT_INTERVAL},
    arp::{ArpPacket, Operation},
    autoip,
    clock::Instant,
    config::NodeConfig,
    dhcp::{DhcpClient, DhcpEvent, DhcpLease, DhcpStatus, Rejection},
    event::NetworkEventSink,
    timer::Epoch,
    transport::{Frame, Transport},
    Address, AddressOrigin, CandidateAddress,
};

pub const FRAME_QUEUE_CAPACITY: usize = 64;

pub struct AddressCoordinator<T: Transport, S: NetworkEventSink> {
    config: Arc<ArcSwap<NodeConfig>>,
    /// Snapshot taken at link-up.
    snapshot: Arc<NodeConfig>,
    transport: T,
    sink: S,
    acd: AcdEngine,
    dhcp: DhcpClient,
    frames: VecDeque<Frame>,
    link_up: bool,
    link_epoch: Epoch,
    now: Instant,
    /// Verified address, the only one anybody outside gets to see.
    current: Option<Address>,
    /// What the running ACD session will publish on `IpOk`.
    session_address: Option<Address>,
    /// Published static or link-local address to go back to if a DHCP
    /// candidate is rejected.
    fallback: Option<Address>,
    fallback_started: bool,
    /// No fallback session may start before this, set when a fallback
    /// address is declined.
    fallback_hold: Option<Instant>,
    link_local_tries: u32,
}

fn seed_from_mac(mac: MacAddr6) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&mac.to_array());
    u64::from_be_bytes(bytes)
}

fn engines(config: &NodeConfig, seed: u64) -> (AcdEngine, DhcpClient) {
    let acd = AcdEngine::new(config.hwaddr, seed);
    // separate stream so xids do not track probe delays
    let dhcp = DhcpClient::new(
        config.hwaddr,
        config.hostname.clone(),
        seed.rotate_left(17) ^ 0x9e37_79b9_7f4a_7c15,
    );
    (acd, dhcp)
}

impl<T: Transport, S: NetworkEventSink> AddressCoordinator<T, S> {
    /// Random delays and transaction ids are seeded from the hardware
    /// address.
    pub fn new(config: Arc<ArcSwap<NodeConfig>>, transport: T, sink: S) -> Self {
        let seed = seed_from_mac(config.load().hwaddr);
        Self::with_seed(config, transport, sink, seed)
    }

    pub fn with_seed(config: Arc<ArcSwap<NodeConfig>>, transport: T, sink: S, seed: u64) -> Self {
        let snapshot = config.load_full();
        let (acd, dhcp) = engines(&snapshot, seed);
        Self {
            acd,
            dhcp,
            config,
            snapshot,
            transport,
            sink,
            frames: VecDeque::with_capacity(FRAME_QUEUE_CAPACITY),
            link_up: false,
            link_epoch: 0,
            now: Instant::ZERO,
            current: None,
            session_address: None,
            fallback: None,
            fallback_started: false,
            fallback_hold: None,
            link_local_tries: 0,
        }
    }

    pub fn current_address(&self) -> Option<Address> {
        self.current
    }

    pub fn dhcp_status(&self) -> DhcpStatus {
        self.dhcp.status()
    }

    pub fn acd_state(&self) -> AcdState {
        self.acd.state()
    }

    pub fn acd(&self) -> &AcdEngine {
        &self.acd
    }

    pub fn dhcp(&self) -> &DhcpClient {
        &self.dhcp
    }

    #[cfg(test)]
    pub(crate) fn dhcp_mut(&mut self) -> &mut DhcpClient {
        &mut self.dhcp
    }

    pub fn is_link_up(&self) -> bool {
        self.link_up
    }

    pub fn link_epoch(&self) -> Epoch {
        self.link_epoch
    }

    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Earliest pending deadline of either engine.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.acd.next_deadline(), self.dhcp.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    #[instrument(skip_all, fields(now = %now, epoch = self.link_epoch))]
    pub fn on_link_up(&mut self, now: Instant) {
        self.now = now;
        if self.link_up {
            debug!("link already up");
            return;
        }

        let snapshot = self.config.load_full();
        if snapshot.hwaddr != self.snapshot.hwaddr {
            info!(old = %self.snapshot.hwaddr, new = %snapshot.hwaddr, "hardware address changed");
            (self.acd, self.dhcp) = engines(&snapshot, seed_from_mac(snapshot.hwaddr));
        }
        self.dhcp.set_hostname(snapshot.hostname.clone());
        self.dhcp
            .set_fallback_after_tries(snapshot.fallback_after_tries);
        self.snapshot = snapshot;
        self.link_up = true;

        info!(
            mac = %self.snapshot.hwaddr,
            use_dhcp = self.snapshot.use_dhcp,
            acd = self.snapshot.acd,
            "link up"
        );
        self.sink.link_up();

        if self.snapshot.use_dhcp {
            self.dhcp.start(now, &mut self.transport);
            self.process_dhcp_events(now);
        } else if let Some(address) = self.static_address() {
            self.verify(address, AcdMode::Passive, now);
        } else {
            error!("DHCP disabled and no static address configured, staying unconfigured");
        }
    }

    #[instrument(skip_all, fields(epoch = self.link_epoch))]
    pub fn on_link_down(&mut self) {
        if !self.link_up {
            debug!("link already down");
            return;
        }
        info!(address = ?self.current.map(|a| a.network), "link down");

        self.link_up = false;
        self.link_epoch = self.link_epoch.wrapping_add(1);
        self.acd.end_session();
        self.session_address = None;
        self.dhcp.stop();
        self.process_dhcp_events(self.now);
        let dropped = self.frames.len();
        self.frames.clear();
        if dropped > 0 {
            debug!(dropped, "dropped queued frames");
        }
        self.fallback = None;
        self.fallback_started = false;
        self.fallback_hold = None;
        self.link_local_tries = 0;
        self.publish(None);
        self.sink.link_down();
    }

    /// Queue an inbound frame for the next tick. The oldest frame is dropped
    /// when the queue is full.
    pub fn on_frame_received(&mut self, frame: Frame) {
        if !self.link_up {
            trace!(kind = frame.as_str(), "link down, dropping frame");
            return;
        }
        if self.frames.len() >= FRAME_QUEUE_CAPACITY {
            if let Some(old) = self.frames.pop_front() {
                warn!(kind = old.as_str(), capacity = FRAME_QUEUE_CAPACITY, "frame queue full, dropping oldest");
            }
        }
        self.frames.push_back(frame);
    }

    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        if !self.link_up {
            return;
        }

        while let Some(frame) = self.frames.pop_front() {
            self.handle_frame(frame, now);
        }

        self.dhcp.tick(now, &mut self.transport);
        self.process_dhcp_events(now);

        while let Some(callback) = self.acd.tick(now, &mut self.transport) {
            self.handle_acd(callback, now);
        }

        if self.fallback_hold.is_some_and(|until| now >= until) {
            debug!("fallback hold over");
            self.fallback_hold = None;
            self.resume_fallback(now);
        }
    }

    /// Hand a DHCP lease back to the server and withdraw it.
    pub fn release(&mut self, now: Instant) {
        self.now = now;
        if self.session_origin() == Some(AddressOrigin::DhcpOffered) {
            self.acd.end_session();
            self.session_address = None;
        }
        self.dhcp.release(now, &mut self.transport);
        self.process_dhcp_events(now);
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Arp(bytes) => {
                let packet = match ArpPacket::parse(&bytes) {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(%e, "dropping ARP frame");
                        return;
                    }
                };
                self.answer_arp(&packet);
                if let Some(callback) = self.acd.on_arp(&packet, now, &mut self.transport) {
                    self.handle_acd(callback, now);
                }
            }
            Frame::Dhcp(bytes) => {
                if let Err(reason) = self.dhcp.on_frame(&bytes, now, &mut self.transport) {
                    debug!(reason = reason.as_str(), len = bytes.len(), "dropping DHCP frame");
                }
                self.process_dhcp_events(now);
            }
        }
    }

    /// Reply to requests for the published address.
    fn answer_arp(&mut self, packet: &ArpPacket) {
        let Some(current) = self.current else {
            return;
        };
        let ip = current.ipv4();
        if packet.operation != Operation::Request
            || packet.target_ip != ip
            || packet.sender_ip == ip
            || packet.sender_mac == self.snapshot.hwaddr
        {
            return;
        }
        trace!(%ip, asker = %packet.sender_mac, "answering ARP request");
        let reply = ArpPacket::reply(self.snapshot.hwaddr, ip, packet);
        self.transport.send_arp(&reply);
    }

    fn handle_acd(&mut self, callback: AcdCallback, now: Instant) {
        self.sink.acd_callback(callback);
        match callback {
            AcdCallback::IpOk => self.on_verified(now),
            AcdCallback::RestartClient => {
                let Some(rejected) = self.session_address.take() else {
                    return;
                };
                match rejected.origin {
                    AddressOrigin::DhcpOffered => {
                        self.dhcp
                            .address_rejected(now, Rejection::Conflict, &mut self.transport);
                        self.process_dhcp_events(now);
                        self.resume_fallback(now);
                    }
                    AddressOrigin::LinkLocal => {
                        self.link_local_tries = self.link_local_tries.wrapping_add(1);
                        info!(ip = %rejected.ipv4(), tries = self.link_local_tries, "link-local address taken, trying another");
                        self.start_link_local(now);
                    }
                    AddressOrigin::Static => {
                        warn!(ip = %rejected.ipv4(), "static address in use by another host");
                    }
                }
            }
            AcdCallback::Decline => {
                let Some(lost) = self.session_address else {
                    return;
                };
                if self.current.map(|a| a.ipv4()) == Some(lost.ipv4()) {
                    self.publish(None);
                }
                match lost.origin {
                    AddressOrigin::DhcpOffered => {
                        self.acd.end_session();
                        self.session_address = None;
                        self.dhcp
                            .address_rejected(now, Rejection::RateLimited, &mut self.transport);
                        self.process_dhcp_events(now);
                        self.resume_fallback(now);
                    }
                    // the engine keeps its session and republishes once the
                    // rate limit is over, unless DHCP takes the engine first
                    AddressOrigin::Static => {
                        self.fallback = None;
                        self.hold_fallback(now);
                    }
                    AddressOrigin::LinkLocal => {
                        self.acd.end_session();
                        self.session_address = None;
                        self.fallback = None;
                        self.link_local_tries = self.link_local_tries.wrapping_add(1);
                        self.hold_fallback(now);
                    }
                }
            }
        }
    }

    fn on_verified(&mut self, now: Instant) {
        let Some(address) = self.session_address else {
            return;
        };
        if address.origin == AddressOrigin::DhcpOffered {
            self.dhcp.address_verified(now);
            self.process_dhcp_events(now);
            self.fallback = None;
            self.fallback_started = false;
        } else {
            self.fallback = Some(address);
        }
        self.publish(Some(address));
    }

    fn process_dhcp_events(&mut self, now: Instant) {
        loop {
            let events = self.dhcp.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_dhcp_event(event, now);
            }
        }
    }

    fn handle_dhcp_event(&mut self, event: DhcpEvent, now: Instant) {
        match event {
            DhcpEvent::Status(status) => self.sink.dhcp_status(status),
            DhcpEvent::Acknowledged(lease) => {
                let address = lease_address(&lease);
                self.verify(address, AcdMode::Active, now);
            }
            DhcpEvent::Renewed(lease) => {
                let address = lease_address(&lease);
                if self.session_origin() == Some(AddressOrigin::DhcpOffered) {
                    self.session_address = Some(address);
                }
                let current = self.current;
                match current {
                    Some(current) if current.origin == AddressOrigin::DhcpOffered && current != address => {
                        info!(network = %address.network, gateway = ?address.gateway, "lease parameters changed");
                        self.publish(Some(address));
                    }
                    _ => {}
                }
            }
            DhcpEvent::LeaseLost => {
                if self.session_origin() == Some(AddressOrigin::DhcpOffered) {
                    self.acd.end_session();
                    self.session_address = None;
                }
                if self.current.map(|a| a.origin) == Some(AddressOrigin::DhcpOffered) {
                    self.publish(None);
                }
                self.resume_fallback(now);
            }
            DhcpEvent::DiscoveryStalled { tries } => {
                if self.fallback_started {
                    return;
                }
                info!(tries, "no DHCP lease yet, starting fallback");
                self.fallback_started = true;
                self.start_fallback(now);
            }
        }
    }

    /// Start checking `address`, or take it as is when conflict detection is
    /// turned off.
    fn verify(&mut self, address: Address, mode: AcdMode, now: Instant) {
        self.acd.end_session();
        self.session_address = Some(address);

        if !self.snapshot.acd {
            info!(network = %address.network, origin = ?address.origin, "conflict detection disabled, using address as is");
            self.on_verified(now);
            return;
        }

        let candidate = CandidateAddress {
            ipv4: address.ipv4(),
            origin: address.origin,
        };
        if let Err(e) = self.acd.begin_session(candidate, mode, now) {
            error!(%e, "could not start conflict detection");
            self.session_address = None;
        }
    }

    fn hold_fallback(&mut self, now: Instant) {
        let until = now + RATE_LIMIT_INTERVAL;
        info!(%until, "fallback address declined, holding off");
        self.fallback_hold = Some(until);
    }

    fn start_fallback(&mut self, now: Instant) {
        if self.fallback_hold.is_some_and(|until| now < until) {
            debug!("fallback on hold");
            return;
        }
        if let Some(address) = self.static_address() {
            self.verify(address, AcdMode::Passive, now);
        } else if self.snapshot.link_local_fallback {
            self.start_link_local(now);
        } else {
            info!("no fallback address configured");
        }
    }

    fn start_link_local(&mut self, now: Instant) {
        let ip = autoip::link_local_address(self.snapshot.hwaddr, self.link_local_tries);
        let Some(network) = autoip::link_local_network(ip) else {
            return;
        };
        self.verify(
            Address {
                network,
                gateway: None,
                origin: AddressOrigin::LinkLocal,
            },
            AcdMode::Active,
            now,
        );
    }

    /// Go back to guarding the fallback address after a DHCP candidate or
    /// lease went away, or restart the fallback if it never got published.
    fn resume_fallback(&mut self, now: Instant) {
        if self.acd.state() != AcdState::Off || !self.link_up {
            return;
        }
        let fallback = self.fallback;
        match fallback {
            Some(address) if self.current == Some(address) => {
                debug!(network = %address.network, "resuming monitoring of fallback address");
                self.verify(address, AcdMode::Passive, now);
            }
            _ if self.fallback_started => self.start_fallback(now),
            _ => {}
        }
    }

    fn static_address(&self) -> Option<Address> {
        self.snapshot.static_address.map(|s| Address {
            network: s.address,
            gateway: s.gateway,
            origin: AddressOrigin::Static,
        })
    }

    fn session_origin(&self) -> Option<AddressOrigin> {
        self.session_address.map(|a| a.origin)
    }

    fn publish(&mut self, address: Option<Address>) {
        if self.current == address {
            return;
        }
        match address {
            Some(a) => info!(network = %a.network, gateway = ?a.gateway, origin = ?a.origin, "address published"),
            None => info!(previous = ?self.current.map(|a| a.network), "address withdrawn"),
        }
        self.current = address;
        self.sink.address_changed(address);
    }
}

fn lease_address(lease: &DhcpLease) -> Address {
    Address {
        network: lease.network(),
        gateway: lease.gateway,
        origin: AddressOrigin::DhcpOffered,
    }
}

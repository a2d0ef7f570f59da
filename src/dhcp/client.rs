use std::{net::Ipv4Addr, time::Duration};

use advmac::MacAddr6;
use compact_str::CompactString;
use dhcproto::{v4, Decodable};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    acd::{jitter, PROBE_WAIT, RATE_LIMIT_INTERVAL},
    clock::Instant,
    dhcp::{
        extensions::MessageExtV4, lease::DhcpLease, messages, BROADCAST, MAX_REQUESTS,
        MAX_RETRANSMIT, MIN_LEASE_RETRY,
    },
    timer::{TimerEntry, TimerQueue},
    transport::Transport,
};

/// Lease status as seen from outside the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DhcpStatus {
    Off,
    Requesting,
    Bound,
    Renewing,
    BackingOff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpEvent {
    Status(DhcpStatus),
    /// ACK received for a new address. It must be verified and reported
    /// back through [`DhcpClient::address_verified`] or
    /// [`DhcpClient::address_rejected`].
    Acknowledged(DhcpLease),
    /// Same address, fresh timers.
    Renewed(DhcpLease),
    LeaseLost,
    /// `tries` DISCOVERs went unanswered.
    DiscoveryStalled { tries: u32 },
}

/// Why an acknowledged address is being given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    /// Someone answered our probes.
    Conflict,
    /// We lost the address after too many conflicts.
    RateLimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackoffCause {
    Declined(Rejection),
    Nak,
    LeaseExpired,
    AddressChanged,
}

/// Reasons an inbound DHCP frame was ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Discard {
    Malformed,
    NotReply,
    XidMismatch,
    ChaddrMismatch,
    NoMessageType,
    /// OFFER or ACK without yiaddr or server identifier.
    Incomplete,
    UnexpectedInState,
}

impl Discard {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discard::Malformed => "Malformed",
            Discard::NotReply => "NotReply",
            Discard::XidMismatch => "XidMismatch",
            Discard::ChaddrMismatch => "ChaddrMismatch",
            Discard::NoMessageType => "NoMessageType",
            Discard::Incomplete => "Incomplete",
            Discard::UnexpectedInState => "UnexpectedInState",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpTimer {
    Retransmit,
    Renew,
    Rebind,
    Expire,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Offer {
    address: Ipv4Addr,
    server_id: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientState {
    Off,
    Selecting,
    Requesting { offer: Offer },
    /// ACK received, address under conflict detection.
    Checking { lease: DhcpLease },
    Bound { lease: DhcpLease },
    Renewing { lease: DhcpLease, rebinding: bool },
    BackingOff { cause: BackoffCause },
}

impl ClientState {
    fn status(&self) -> DhcpStatus {
        match self {
            ClientState::Off => DhcpStatus::Off,
            ClientState::Selecting | ClientState::Requesting { .. } | ClientState::Checking { .. } => {
                DhcpStatus::Requesting
            }
            ClientState::Bound { .. } => DhcpStatus::Bound,
            ClientState::Renewing { .. } => DhcpStatus::Renewing,
            ClientState::BackingOff { .. } => DhcpStatus::BackingOff,
        }
    }

    fn lease(&self) -> Option<&DhcpLease> {
        match self {
            ClientState::Checking { lease }
            | ClientState::Bound { lease }
            | ClientState::Renewing { lease, .. } => Some(lease),
            _ => None,
        }
    }
}

pub struct DhcpClient {
    hwaddr: MacAddr6,
    hostname: CompactString,
    rng: StdRng,
    state: ClientState,
    xid: u32,
    tries: u32,
    stall_reported: bool,
    fallback_after_tries: u32,
    last_address: Option<Ipv4Addr>,
    timers: TimerQueue<DhcpTimer>,
    events: Vec<DhcpEvent>,
}

impl DhcpClient {
    pub fn new(hwaddr: MacAddr6, hostname: CompactString, seed: u64) -> Self {
        Self {
            hwaddr,
            hostname,
            rng: StdRng::seed_from_u64(seed),
            state: ClientState::Off,
            xid: 0,
            tries: 0,
            stall_reported: false,
            fallback_after_tries: 4,
            last_address: None,
            timers: TimerQueue::new(),
            events: Vec::new(),
        }
    }

    pub fn set_hostname(&mut self, hostname: CompactString) {
        self.hostname = hostname;
    }

    /// Number of unanswered DISCOVERs after which `DiscoveryStalled` is raised.
    pub fn set_fallback_after_tries(&mut self, tries: u32) {
        self.fallback_after_tries = tries.max(1);
    }

    pub fn status(&self) -> DhcpStatus {
        self.state.status()
    }

    /// The lease being checked, held, or renewed.
    pub fn lease(&self) -> Option<&DhcpLease> {
        self.state.lease()
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn take_events(&mut self) -> Vec<DhcpEvent> {
        std::mem::take(&mut self.events)
    }

    #[cfg(test)]
    pub(crate) fn timers_mut(&mut self) -> &mut TimerQueue<DhcpTimer> {
        &mut self.timers
    }

    pub fn start<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        if self.state != ClientState::Off {
            debug!(status = ?self.status(), "DHCP client already running");
            return;
        }
        info!(mac = %self.hwaddr, "starting DHCP client");
        self.begin_discovery(now, transport);
    }

    /// Go quiet without telling anyone. Used when the link drops.
    pub fn stop(&mut self) {
        self.timers.advance_epoch();
        self.set_state(ClientState::Off);
    }

    /// Give the lease back to the server, if there is one.
    pub fn release<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        if let Some(lease) = self.state.lease().cloned() {
            info!(ipv4 = %lease.address, server = %lease.server_id, %now, "DHCPRelease");
            let msg = messages::release(self.hwaddr, self.rng.gen(), lease.address, lease.server_id);
            transport.send_dhcp(lease.server_id, &msg);
            self.events.push(DhcpEvent::LeaseLost);
        }
        self.last_address = None;
        self.stop();
    }

    pub fn on_frame<T: Transport>(
        &mut self,
        bytes: &[u8],
        now: Instant,
        transport: &mut T,
    ) -> Result<(), Discard> {
        let msg = v4::Message::from_bytes(bytes).map_err(|_| Discard::Malformed)?;
        match msg.opcode() {
            v4::Opcode::BootReply => {}
            _ => return Err(Discard::NotReply),
        }
        if self.state == ClientState::Off {
            return Err(Discard::UnexpectedInState);
        }
        if msg.xid() != self.xid {
            return Err(Discard::XidMismatch);
        }
        if msg.chaddr().get(..6) != Some(&self.hwaddr.to_array()[..]) {
            return Err(Discard::ChaddrMismatch);
        }
        let message_type = msg.message_type().cloned().ok_or(Discard::NoMessageType)?;

        match (self.state.clone(), message_type) {
            (ClientState::Selecting, v4::MessageType::Offer) => self.handle_offer(&msg, now, transport),
            (ClientState::Requesting { .. }, v4::MessageType::Ack) => self.handle_ack(&msg, now),
            (ClientState::Renewing { .. }, v4::MessageType::Ack) => self.handle_renew_ack(&msg, now),
            (
                ClientState::Requesting { .. }
                | ClientState::Checking { .. }
                | ClientState::Renewing { .. },
                v4::MessageType::Nak,
            ) => {
                self.handle_nak(now, transport);
                Ok(())
            }
            _ => Err(Discard::UnexpectedInState),
        }
    }

    pub fn tick<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        while let Some(entry) = self.timers.pop_expired(now) {
            self.on_timer(entry, transport);
        }
    }

    /// Conflict detection found nobody else on the acknowledged address.
    pub fn address_verified(&mut self, now: Instant) {
        let ClientState::Checking { lease } = &self.state else {
            debug!(status = ?self.status(), "address_verified outside of checking");
            return;
        };
        let lease = lease.clone();
        info!(ipv4 = %lease.address, %now, "lease bound");
        self.schedule_lease_timers(&lease);
        self.set_state(ClientState::Bound { lease });
    }

    /// Decline the acknowledged or held address and back off before
    /// discovering again.
    pub fn address_rejected<T: Transport>(&mut self, now: Instant, rejection: Rejection, transport: &mut T) {
        let Some(lease) = self.state.lease().cloned() else {
            debug!(status = ?self.status(), "address_rejected without a lease");
            return;
        };

        warn!(ipv4 = %lease.address, ?rejection, "DHCPDecline");
        let msg = messages::decline(self.hwaddr, self.xid, lease.address, lease.server_id);
        transport.send_dhcp(BROADCAST, &msg);

        let delay = match rejection {
            Rejection::Conflict => jitter(&mut self.rng, Duration::ZERO, PROBE_WAIT),
            Rejection::RateLimited => {
                RATE_LIMIT_INTERVAL + jitter(&mut self.rng, Duration::ZERO, PROBE_WAIT)
            }
        };
        self.last_address = None;
        self.timers.advance_epoch();
        self.timers.schedule(DhcpTimer::Backoff, now + delay, ());
        self.set_state(ClientState::BackingOff {
            cause: BackoffCause::Declined(rejection),
        });
    }

    fn set_state(&mut self, state: ClientState) {
        let before = self.state.status();
        self.state = state;
        let after = self.state.status();
        if before != after {
            debug!(?before, ?after, "DHCP status");
            self.events.push(DhcpEvent::Status(after));
        }
    }

    fn begin_discovery<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        self.xid = self.rng.gen();
        self.tries = 0;
        self.stall_reported = false;
        self.set_state(ClientState::Selecting);
        self.send_discover(now, transport);
    }

    fn retransmit_delay(&self) -> Duration {
        let secs = 1u64.checked_shl(self.tries).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(MAX_RETRANSMIT)
    }

    fn send_discover<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        self.tries += 1;
        let msg = messages::discover(self.hwaddr, self.xid, self.last_address);
        info!(xid = self.xid, tries = self.tries, "DHCPDiscover");
        transport.send_dhcp(BROADCAST, &msg);
        self.timers
            .schedule(DhcpTimer::Retransmit, now + self.retransmit_delay(), ());
    }

    fn send_request<T: Transport>(&mut self, offer: Offer, now: Instant, transport: &mut T) {
        if self.tries >= MAX_REQUESTS {
            warn!(ipv4 = %offer.address, "no answer to DHCPRequest, discovering again");
            self.begin_discovery(now, transport);
            return;
        }
        self.tries += 1;
        let msg = messages::request_selecting(
            self.hwaddr,
            self.xid,
            &self.hostname,
            offer.address,
            offer.server_id,
        );
        info!(xid = self.xid, ipv4 = %offer.address, tries = self.tries, "DHCPRequest");
        transport.send_dhcp(BROADCAST, &msg);
        self.timers
            .schedule(DhcpTimer::Retransmit, now + self.retransmit_delay(), ());
    }

    fn handle_offer<T: Transport>(
        &mut self,
        msg: &v4::Message,
        now: Instant,
        transport: &mut T,
    ) -> Result<(), Discard> {
        let address = msg.yiaddr();
        let server_id = msg.server_id().copied().ok_or(Discard::Incomplete)?;
        if address.is_unspecified() {
            return Err(Discard::Incomplete);
        }
        info!(ipv4 = %address, server = %server_id, "DHCPOffer");

        let offer = Offer { address, server_id };
        self.tries = 0;
        self.set_state(ClientState::Requesting { offer });
        self.send_request(offer, now, transport);
        Ok(())
    }

    fn handle_ack(&mut self, msg: &v4::Message, now: Instant) -> Result<(), Discard> {
        let lease = DhcpLease::from_ack(msg, now).ok_or(Discard::Incomplete)?;
        info!(ipv4 = %lease.address, lease = ?lease.lease_duration, "DHCPAck");
        self.timers.cancel(DhcpTimer::Retransmit);
        self.last_address = Some(lease.address);
        self.set_state(ClientState::Checking {
            lease: lease.clone(),
        });
        self.events.push(DhcpEvent::Acknowledged(lease));
        Ok(())
    }

    fn handle_renew_ack(&mut self, msg: &v4::Message, now: Instant) -> Result<(), Discard> {
        let lease = DhcpLease::from_ack(msg, now).ok_or(Discard::Incomplete)?;
        let held = self.state.lease().map(|l| l.address);
        self.timers.cancel(DhcpTimer::Renew);
        self.timers.cancel(DhcpTimer::Rebind);
        self.timers.cancel(DhcpTimer::Expire);

        if held == Some(lease.address) {
            info!(ipv4 = %lease.address, lease = ?lease.lease_duration, "lease renewed");
            self.schedule_lease_timers(&lease);
            self.set_state(ClientState::Bound {
                lease: lease.clone(),
            });
            self.events.push(DhcpEvent::Renewed(lease));
        } else {
            warn!(ipv4 = %lease.address, previous = ?held, "server moved us to a new address");
            self.events.push(DhcpEvent::LeaseLost);
            self.set_state(ClientState::BackingOff {
                cause: BackoffCause::AddressChanged,
            });
            self.last_address = Some(lease.address);
            self.set_state(ClientState::Checking {
                lease: lease.clone(),
            });
            self.events.push(DhcpEvent::Acknowledged(lease));
        }
        Ok(())
    }

    fn handle_nak<T: Transport>(&mut self, now: Instant, transport: &mut T) {
        warn!(xid = self.xid, status = ?self.status(), "DHCPNak");
        if self.state.lease().is_some() {
            self.events.push(DhcpEvent::LeaseLost);
        }
        self.last_address = None;
        self.timers.advance_epoch();
        self.set_state(ClientState::BackingOff {
            cause: BackoffCause::Nak,
        });
        self.begin_discovery(now, transport);
    }

    fn schedule_lease_timers(&mut self, lease: &DhcpLease) {
        if let Some(at) = lease.renew_at() {
            self.timers.schedule(DhcpTimer::Renew, at, ());
        }
        if let Some(at) = lease.rebind_at() {
            self.timers.schedule(DhcpTimer::Rebind, at, ());
        }
        if let Some(at) = lease.expires_at() {
            self.timers.schedule(DhcpTimer::Expire, at, ());
        }
    }

    fn on_timer<T: Transport>(&mut self, entry: TimerEntry<DhcpTimer>, transport: &mut T) {
        let fired = entry.deadline;
        match (entry.kind, self.state.clone()) {
            (DhcpTimer::Retransmit, ClientState::Selecting) => {
                if self.tries >= self.fallback_after_tries && !self.stall_reported {
                    warn!(tries = self.tries, "no DHCP server answering");
                    self.stall_reported = true;
                    self.events
                        .push(DhcpEvent::DiscoveryStalled { tries: self.tries });
                }
                self.send_discover(fired, transport);
            }
            (DhcpTimer::Retransmit, ClientState::Requesting { offer }) => {
                self.send_request(offer, fired, transport);
            }
            (DhcpTimer::Renew, ClientState::Bound { lease })
            | (DhcpTimer::Renew, ClientState::Renewing { lease, rebinding: false }) => {
                if self.state.status() == DhcpStatus::Bound {
                    self.xid = self.rng.gen();
                }
                let msg = messages::request_renewing(self.hwaddr, self.xid, &self.hostname, lease.address);
                info!(ipv4 = %lease.address, server = %lease.server_id, "renewing lease");
                transport.send_dhcp(lease.server_id, &msg);

                if let Some(t2) = lease.rebind_at() {
                    let retry = half_remaining(t2, fired).max(MIN_LEASE_RETRY);
                    self.timers.schedule(DhcpTimer::Renew, fired + retry, ());
                }
                self.set_state(ClientState::Renewing {
                    lease,
                    rebinding: false,
                });
            }
            (DhcpTimer::Rebind, ClientState::Bound { lease })
            | (DhcpTimer::Rebind, ClientState::Renewing { lease, .. }) => {
                if self.state.status() == DhcpStatus::Bound {
                    self.xid = self.rng.gen();
                }
                self.timers.cancel(DhcpTimer::Renew);
                let msg = messages::request_renewing(self.hwaddr, self.xid, &self.hostname, lease.address);
                info!(ipv4 = %lease.address, "rebinding lease");
                transport.send_dhcp(BROADCAST, &msg);

                if let Some(expiry) = lease.expires_at() {
                    let retry = half_remaining(expiry, fired).max(MIN_LEASE_RETRY);
                    self.timers.schedule(DhcpTimer::Rebind, fired + retry, ());
                }
                self.set_state(ClientState::Renewing {
                    lease,
                    rebinding: true,
                });
            }
            (DhcpTimer::Expire, ClientState::Bound { lease })
            | (DhcpTimer::Expire, ClientState::Renewing { lease, .. }) => {
                warn!(ipv4 = %lease.address, "lease expired");
                self.events.push(DhcpEvent::LeaseLost);
                self.last_address = None;
                self.timers.advance_epoch();
                self.set_state(ClientState::BackingOff {
                    cause: BackoffCause::LeaseExpired,
                });
                self.begin_discovery(fired, transport);
            }
            (DhcpTimer::Backoff, ClientState::BackingOff { cause }) => {
                info!(?cause, "backoff over, discovering again");
                self.begin_discovery(fired, transport);
            }
            (kind, state) => {
                debug!(?kind, status = ?state.status(), "ignoring DHCP timer");
            }
        }
    }
}

fn half_remaining(until: Instant, now: Instant) -> Duration {
    (until - now) / 2
}

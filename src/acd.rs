//! IPv4 Address Conflict Detection, RFC 5227 with the RFC 3927 link-local
//! timing constants.
//!
//! One [`AcdEngine`] owns at most one [`AcdSession`]. Active sessions probe a
//! candidate before claiming it. Passive sessions skip straight to
//! monitoring, which is what a statically configured address gets.

use std::time::Duration;

use advmac::MacAddr6;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::{
    arp::{ArpKind, ArpPacket},
    clock::Instant,
    error::AcdError,
    timer::{TimerEntry, TimerQueue},
    transport::Transport,
    CandidateAddress,
};

pub const PROBE_WAIT: Duration = Duration::from_secs(1);
pub const PROBE_MIN: Duration = Duration::from_secs(1);
pub const PROBE_MAX: Duration = Duration::from_secs(2);
pub const PROBE_NUM: u8 = 3;
pub const ANNOUNCE_WAIT: Duration = Duration::from_secs(2);
pub const ANNOUNCE_NUM: u8 = 2;
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);
pub const MAX_CONFLICTS: u32 = 10;
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFEND_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcdState {
    Off,
    ProbeWait,
    Probing,
    AnnounceWait,
    Announcing,
    Ongoing,
    PassiveOngoing,
    RateLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcdMode {
    /// Probe and announce before the address may be used.
    Active,
    /// Monitor and defend an address that is already considered ours.
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcdCallback {
    /// The candidate is verified and may be published.
    IpOk,
    /// Conflict before the address was claimed. The session is gone.
    RestartClient,
    /// Conflict budget exhausted. The address must be withdrawn.
    Decline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcdSession {
    pub state: AcdState,
    pub candidate: CandidateAddress,
    pub mode: AcdMode,
    pub probe_count: u8,
    pub announce_count: u8,
    pub last_action_time: Option<Instant>,
    pub conflict_count: u32,
    pub rate_limit_until: Option<Instant>,
    pub last_defend: Option<Instant>,
}

impl AcdSession {
    fn new(candidate: CandidateAddress, mode: AcdMode) -> Self {
        let state = match mode {
            AcdMode::Active => AcdState::ProbeWait,
            AcdMode::Passive => AcdState::PassiveOngoing,
        };
        Self {
            state,
            candidate,
            mode,
            probe_count: 0,
            announce_count: 0,
            last_action_time: None,
            conflict_count: 0,
            rate_limit_until: None,
            last_defend: None,
        }
    }

    /// Whether `packet` conflicts with this session, given its state.
    fn is_conflict(&self, packet: &ArpPacket) -> bool {
        let ip = self.candidate.ipv4;
        match self.state {
            AcdState::ProbeWait | AcdState::Probing | AcdState::AnnounceWait => {
                packet.sender_ip == ip
                    || (packet.kind() == ArpKind::Probe && packet.target_ip == ip)
            }
            AcdState::Announcing | AcdState::Ongoing | AcdState::PassiveOngoing => {
                packet.sender_ip == ip
            }
            AcdState::Off | AcdState::RateLimit => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcdTimer {
    /// Next probe, announcement, deferred IpOk or end of rate limiting,
    /// depending on the session state.
    Step,
    /// Conflicts further apart than this do not accumulate.
    ConflictWindow,
}

pub struct AcdEngine {
    hwaddr: MacAddr6,
    rng: StdRng,
    session: Option<AcdSession>,
    timers: TimerQueue<AcdTimer>,
}

impl AcdEngine {
    pub fn new(hwaddr: MacAddr6, seed: u64) -> Self {
        Self {
            hwaddr,
            rng: StdRng::seed_from_u64(seed),
            session: None,
            timers: TimerQueue::new(),
        }
    }

    pub fn state(&self) -> AcdState {
        self.session.as_ref().map_or(AcdState::Off, |s| s.state)
    }

    pub fn session(&self) -> Option<&AcdSession> {
        self.session.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn begin_session(
        &mut self,
        candidate: CandidateAddress,
        mode: AcdMode,
        now: Instant,
    ) -> Result<(), AcdError> {
        if let Some(session) = &self.session {
            return Err(AcdError::AlreadyActive {
                address: session.candidate.ipv4,
            });
        }

        info!(ip = %candidate.ipv4, origin = ?candidate.origin, ?mode, "starting ACD session");
        let deadline = match mode {
            AcdMode::Active => now + jitter(&mut self.rng, Duration::ZERO, PROBE_WAIT),
            AcdMode::Passive => now,
        };
        self.timers.schedule(AcdTimer::Step, deadline, ());
        self.session = Some(AcdSession::new(candidate, mode));
        Ok(())
    }

    /// Drop the session and every pending timer. Safe to call at any time.
    pub fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(ip = %session.candidate.ipv4, state = ?session.state, "ending ACD session");
        }
        self.timers.advance_epoch();
    }

    pub fn on_arp<T: Transport>(
        &mut self,
        packet: &ArpPacket,
        now: Instant,
        transport: &mut T,
    ) -> Option<AcdCallback> {
        if packet.sender_mac == self.hwaddr {
            return None;
        }
        let session = self.session.as_ref()?;
        if !session.is_conflict(packet) {
            return None;
        }

        let state = session.state;
        match state {
            AcdState::ProbeWait | AcdState::Probing | AcdState::AnnounceWait => {
                warn!(
                    ip = %session.candidate.ipv4,
                    peer = %packet.sender_mac,
                    ?state,
                    "address in use, giving up candidate"
                );
                self.end_session();
                Some(AcdCallback::RestartClient)
            }
            _ => self.on_claimed_conflict(packet, now, transport),
        }
    }

    /// Run expired timers. Returns at the first callback so the owner can act
    /// on it before anything later fires.
    pub fn tick<T: Transport>(&mut self, now: Instant, transport: &mut T) -> Option<AcdCallback> {
        while let Some(entry) = self.timers.pop_expired(now) {
            if let Some(callback) = self.on_timer(entry, transport) {
                return Some(callback);
            }
        }
        None
    }

    fn on_timer<T: Transport>(
        &mut self,
        entry: TimerEntry<AcdTimer>,
        transport: &mut T,
    ) -> Option<AcdCallback> {
        let fired = entry.deadline;
        let hwaddr = self.hwaddr;
        let session = self.session.as_mut()?;
        let ip = session.candidate.ipv4;

        if entry.kind == AcdTimer::ConflictWindow {
            trace!(%ip, conflicts = session.conflict_count, "conflict window closed");
            session.conflict_count = 0;
            return None;
        }

        match session.state {
            AcdState::ProbeWait | AcdState::Probing => {
                transport.send_arp(&ArpPacket::probe(hwaddr, ip));
                session.probe_count += 1;
                session.last_action_time = Some(fired);
                debug!(%ip, probe = session.probe_count, "sent ARP probe");

                if session.probe_count < PROBE_NUM {
                    session.state = AcdState::Probing;
                    let next = fired + jitter(&mut self.rng, PROBE_MIN, PROBE_MAX);
                    self.timers.schedule(AcdTimer::Step, next, ());
                } else {
                    session.state = AcdState::AnnounceWait;
                    self.timers.schedule(AcdTimer::Step, fired + ANNOUNCE_WAIT, ());
                }
                None
            }
            AcdState::AnnounceWait | AcdState::Announcing => {
                transport.send_arp(&ArpPacket::announcement(hwaddr, ip));
                session.announce_count += 1;
                session.last_action_time = Some(fired);
                debug!(%ip, announcement = session.announce_count, "sent ARP announcement");

                if session.announce_count < ANNOUNCE_NUM {
                    session.state = AcdState::Announcing;
                    self.timers
                        .schedule(AcdTimer::Step, fired + ANNOUNCE_INTERVAL, ());
                    None
                } else {
                    session.state = AcdState::Ongoing;
                    info!(%ip, "address claimed");
                    Some(AcdCallback::IpOk)
                }
            }
            AcdState::PassiveOngoing => {
                info!(%ip, "monitoring address");
                Some(AcdCallback::IpOk)
            }
            AcdState::RateLimit => {
                session.conflict_count = 0;
                session.rate_limit_until = None;
                self.timers.cancel(AcdTimer::ConflictWindow);
                match session.mode {
                    AcdMode::Active => {
                        info!(%ip, "rate limit over, probing again");
                        session.state = AcdState::ProbeWait;
                        session.probe_count = 0;
                        session.announce_count = 0;
                        session.last_defend = None;
                        let next = fired + jitter(&mut self.rng, Duration::ZERO, PROBE_WAIT);
                        self.timers.schedule(AcdTimer::Step, next, ());
                        None
                    }
                    AcdMode::Passive => {
                        info!(%ip, "rate limit over, monitoring again");
                        session.state = AcdState::PassiveOngoing;
                        Some(AcdCallback::IpOk)
                    }
                }
            }
            AcdState::Ongoing | AcdState::Off => None,
        }
    }

    fn on_claimed_conflict<T: Transport>(
        &mut self,
        packet: &ArpPacket,
        now: Instant,
        transport: &mut T,
    ) -> Option<AcdCallback> {
        let hwaddr = self.hwaddr;
        let session = self.session.as_mut()?;
        let ip = session.candidate.ipv4;

        session.conflict_count += 1;
        warn!(
            %ip,
            peer = %packet.sender_mac,
            conflicts = session.conflict_count,
            "conflicting ARP for claimed address"
        );

        if session.conflict_count >= MAX_CONFLICTS {
            let until = now + RATE_LIMIT_INTERVAL;
            session.state = AcdState::RateLimit;
            session.rate_limit_until = Some(until);
            self.timers.cancel(AcdTimer::ConflictWindow);
            self.timers.schedule(AcdTimer::Step, until, ());
            warn!(%ip, %until, "too many conflicts, rate limiting");
            return Some(AcdCallback::Decline);
        }

        self.timers
            .schedule(AcdTimer::ConflictWindow, now + RATE_LIMIT_INTERVAL, ());

        let may_defend = session
            .last_defend
            .map_or(true, |last| now - last >= DEFEND_INTERVAL);
        if may_defend {
            transport.send_arp(&ArpPacket::announcement(hwaddr, ip));
            session.last_defend = Some(now);
            session.last_action_time = Some(now);
            info!(%ip, "defended address");
        }
        None
    }
}

/// Uniform delay in `[min, max]` with millisecond granularity.
pub(crate) fn jitter(rng: &mut StdRng, min: Duration, max: Duration) -> Duration {
    let lo = u64::try_from(min.as_millis()).unwrap_or(u64::MAX);
    let hi = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rng.gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dhcproto::v4;

    use super::*;
    use crate::AddressOrigin;

    const OWN: MacAddr6 = MacAddr6::new([0x02, 0x4c, 0x49, 0x00, 0x00, 0x01]);
    const PEER: MacAddr6 = MacAddr6::new([0x02, 0x4c, 0x49, 0x00, 0x00, 0x99]);
    const CANDIDATE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    #[derive(Default)]
    struct Wire {
        arp: Vec<(Instant, ArpPacket)>,
        now: Instant,
    }

    impl Transport for Wire {
        fn send_arp(&mut self, packet: &ArpPacket) {
            self.arp.push((self.now, packet.clone()));
        }

        fn send_dhcp(&mut self, _destination: Ipv4Addr, _message: &v4::Message) {}
    }

    fn candidate() -> CandidateAddress {
        CandidateAddress {
            ipv4: CANDIDATE,
            origin: AddressOrigin::DhcpOffered,
        }
    }

    /// Tick in 10 ms steps until `until`, collecting callbacks with their time.
    fn run(
        engine: &mut AcdEngine,
        wire: &mut Wire,
        from: Instant,
        until: Instant,
    ) -> Vec<(Instant, AcdCallback)> {
        let mut out = Vec::new();
        let mut now = from;
        while now <= until {
            wire.now = now;
            while let Some(cb) = engine.tick(now, wire) {
                out.push((now, cb));
            }
            now = now + Duration::from_millis(10);
        }
        out
    }

    fn peer_reply(ip: Ipv4Addr) -> ArpPacket {
        ArpPacket {
            operation: crate::arp::Operation::Reply,
            sender_mac: PEER,
            sender_ip: ip,
            target_mac: OWN,
            target_ip: ip,
        }
    }

    fn claimed_engine(wire: &mut Wire) -> (AcdEngine, Instant) {
        let mut engine = AcdEngine::new(OWN, 7);
        engine
            .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
            .unwrap();
        let callbacks = run(&mut engine, wire, Instant::ZERO, Instant::from_secs(12));
        assert_eq!(callbacks.len(), 1);
        assert_eq!(engine.state(), AcdState::Ongoing);
        (engine, Instant::from_secs(12))
    }

    #[test]
    fn active_session_probes_then_announces() {
        for seed in 0..20 {
            let mut engine = AcdEngine::new(OWN, seed);
            let mut wire = Wire::default();
            engine
                .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
                .unwrap();
            assert_eq!(engine.state(), AcdState::ProbeWait);

            let callbacks = run(&mut engine, &mut wire, Instant::ZERO, Instant::from_secs(20));
            assert_eq!(callbacks.len(), 1);
            assert_eq!(callbacks[0].1, AcdCallback::IpOk);
            assert_eq!(engine.state(), AcdState::Ongoing);

            let kinds: Vec<ArpKind> = wire.arp.iter().map(|(_, p)| p.kind()).collect();
            assert_eq!(
                kinds,
                vec![
                    ArpKind::Probe,
                    ArpKind::Probe,
                    ArpKind::Probe,
                    ArpKind::Announcement,
                    ArpKind::Announcement
                ]
            );

            let first_probe = wire.arp[0].0;
            let last_probe = wire.arp[2].0;
            let first_announce = wire.arp[3].0;
            assert!(first_probe <= Instant::ZERO + PROBE_WAIT);
            assert!(last_probe >= Instant::ZERO + PROBE_WAIT + PROBE_MIN);
            assert!(last_probe <= Instant::ZERO + PROBE_WAIT + PROBE_MAX * 2);
            assert_eq!(first_announce - last_probe, ANNOUNCE_WAIT);
            assert_eq!(callbacks[0].0 - first_announce, ANNOUNCE_INTERVAL);
        }
    }

    #[test]
    fn probe_conflict_restarts_once() {
        let mut engine = AcdEngine::new(OWN, 1);
        let mut wire = Wire::default();
        engine
            .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
            .unwrap();
        run(&mut engine, &mut wire, Instant::ZERO, Instant::from_secs(1));
        assert_eq!(engine.state(), AcdState::Probing);

        let now = Instant::from_millis(1010);
        let cb = engine.on_arp(&peer_reply(CANDIDATE), now, &mut wire);
        assert_eq!(cb, Some(AcdCallback::RestartClient));
        assert!(engine.session().is_none());

        assert_eq!(engine.on_arp(&peer_reply(CANDIDATE), now, &mut wire), None);
        let sent = wire.arp.len();
        assert!(run(&mut engine, &mut wire, now, Instant::from_secs(30)).is_empty());
        assert_eq!(wire.arp.len(), sent);
    }

    #[test]
    fn simultaneous_probe_is_a_conflict() {
        let mut engine = AcdEngine::new(OWN, 3);
        let mut wire = Wire::default();
        engine
            .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
            .unwrap();

        let probe = ArpPacket::probe(PEER, CANDIDATE);
        assert_eq!(
            engine.on_arp(&probe, Instant::from_millis(5), &mut wire),
            Some(AcdCallback::RestartClient)
        );
    }

    #[test]
    fn own_packets_are_ignored() {
        let mut engine = AcdEngine::new(OWN, 3);
        let mut wire = Wire::default();
        engine
            .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
            .unwrap();
        let echo = ArpPacket::announcement(OWN, CANDIDATE);
        assert_eq!(engine.on_arp(&echo, Instant::from_millis(5), &mut wire), None);
        assert_eq!(engine.state(), AcdState::ProbeWait);
    }

    #[test]
    fn ongoing_conflict_defends_at_most_every_ten_seconds() {
        let mut wire = Wire::default();
        let (mut engine, t0) = claimed_engine(&mut wire);
        let before = wire.arp.len();

        assert_eq!(engine.on_arp(&peer_reply(CANDIDATE), t0, &mut wire), None);
        assert_eq!(engine.session().unwrap().conflict_count, 1);
        assert_eq!(wire.arp.len(), before + 1);
        assert_eq!(wire.arp[before].1.kind(), ArpKind::Announcement);

        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(engine.on_arp(&peer_reply(CANDIDATE), t1, &mut wire), None);
        assert_eq!(wire.arp.len(), before + 1);

        let t2 = t0 + DEFEND_INTERVAL;
        assert_eq!(engine.on_arp(&peer_reply(CANDIDATE), t2, &mut wire), None);
        assert_eq!(wire.arp.len(), before + 2);
        assert_eq!(engine.state(), AcdState::Ongoing);
    }

    #[test]
    fn conflict_count_resets_after_quiet_interval() {
        let mut wire = Wire::default();
        let (mut engine, t0) = claimed_engine(&mut wire);

        engine.on_arp(&peer_reply(CANDIDATE), t0, &mut wire);
        engine.on_arp(&peer_reply(CANDIDATE), t0 + Duration::from_secs(1), &mut wire);
        assert_eq!(engine.session().unwrap().conflict_count, 2);

        let quiet = t0 + Duration::from_secs(1) + RATE_LIMIT_INTERVAL;
        assert_eq!(engine.tick(quiet, &mut wire), None);
        assert_eq!(engine.session().unwrap().conflict_count, 0);
    }

    #[test]
    fn conflict_budget_exhaustion_rate_limits() {
        let mut wire = Wire::default();
        let (mut engine, t0) = claimed_engine(&mut wire);

        let mut now = t0;
        for _ in 0..MAX_CONFLICTS - 1 {
            assert_eq!(engine.on_arp(&peer_reply(CANDIDATE), now, &mut wire), None);
            assert_eq!(engine.state(), AcdState::Ongoing);
            now = now + Duration::from_secs(3);
        }
        assert_eq!(
            engine.on_arp(&peer_reply(CANDIDATE), now, &mut wire),
            Some(AcdCallback::Decline)
        );
        assert_eq!(engine.state(), AcdState::RateLimit);
        assert_eq!(
            engine.session().unwrap().rate_limit_until,
            Some(now + RATE_LIMIT_INTERVAL)
        );

        // silence, even when provoked
        let sent = wire.arp.len();
        assert_eq!(
            engine.on_arp(&peer_reply(CANDIDATE), now + Duration::from_secs(1), &mut wire),
            None
        );
        let until = now + (RATE_LIMIT_INTERVAL - Duration::from_millis(10));
        assert!(run(&mut engine, &mut wire, now, until).is_empty());
        assert_eq!(wire.arp.len(), sent);

        // then probing starts over
        assert_eq!(engine.tick(now + RATE_LIMIT_INTERVAL, &mut wire), None);
        let session = engine.session().unwrap();
        assert!(matches!(
            session.state,
            AcdState::ProbeWait | AcdState::Probing
        ));
        assert_eq!(session.conflict_count, 0);
        assert_eq!(session.rate_limit_until, None);
    }

    #[test]
    fn passive_session_reports_ok_on_first_tick() {
        let mut engine = AcdEngine::new(OWN, 9);
        let mut wire = Wire::default();
        let static_ip = CandidateAddress {
            ipv4: Ipv4Addr::new(2, 0, 0, 10),
            origin: AddressOrigin::Static,
        };
        engine
            .begin_session(static_ip, AcdMode::Passive, Instant::from_secs(3))
            .unwrap();
        assert_eq!(engine.state(), AcdState::PassiveOngoing);
        assert_eq!(
            engine.tick(Instant::from_secs(3), &mut wire),
            Some(AcdCallback::IpOk)
        );
        assert_eq!(engine.tick(Instant::from_secs(3), &mut wire), None);
        assert!(wire.arp.is_empty());

        // passive sessions defend too
        let now = Instant::from_secs(4);
        assert_eq!(engine.on_arp(&peer_reply(static_ip.ipv4), now, &mut wire), None);
        assert_eq!(wire.arp.len(), 1);
    }

    #[test]
    fn passive_rate_limit_ends_in_monitoring() {
        let mut engine = AcdEngine::new(OWN, 9);
        let mut wire = Wire::default();
        let static_ip = CandidateAddress {
            ipv4: Ipv4Addr::new(2, 0, 0, 10),
            origin: AddressOrigin::Static,
        };
        engine
            .begin_session(static_ip, AcdMode::Passive, Instant::ZERO)
            .unwrap();
        assert_eq!(engine.tick(Instant::ZERO, &mut wire), Some(AcdCallback::IpOk));

        let now = Instant::from_secs(1);
        for _ in 0..MAX_CONFLICTS - 1 {
            assert_eq!(engine.on_arp(&peer_reply(static_ip.ipv4), now, &mut wire), None);
        }
        assert_eq!(
            engine.on_arp(&peer_reply(static_ip.ipv4), now, &mut wire),
            Some(AcdCallback::Decline)
        );
        assert_eq!(engine.state(), AcdState::RateLimit);

        let sent = wire.arp.len();
        let until = now + (RATE_LIMIT_INTERVAL - Duration::from_millis(10));
        assert!(run(&mut engine, &mut wire, now, until).is_empty());

        // no probing for a passive session, straight back to monitoring
        assert_eq!(
            engine.tick(now + RATE_LIMIT_INTERVAL, &mut wire),
            Some(AcdCallback::IpOk)
        );
        assert_eq!(engine.state(), AcdState::PassiveOngoing);
        assert_eq!(engine.session().unwrap().conflict_count, 0);
        assert!(run(&mut engine, &mut wire, now + RATE_LIMIT_INTERVAL, now + Duration::from_secs(90)).is_empty());
        assert_eq!(wire.arp.len(), sent);
    }

    #[test]
    fn repeated_tick_at_same_instant_is_quiet() {
        let mut wire = Wire::default();
        let (mut engine, t0) = claimed_engine(&mut wire);
        let sent = wire.arp.len();
        for _ in 0..5 {
            assert_eq!(engine.tick(t0, &mut wire), None);
        }
        assert_eq!(wire.arp.len(), sent);
    }

    #[test]
    fn second_session_is_refused() {
        let mut engine = AcdEngine::new(OWN, 0);
        engine
            .begin_session(candidate(), AcdMode::Active, Instant::ZERO)
            .unwrap();
        let other = CandidateAddress {
            ipv4: Ipv4Addr::new(10, 0, 0, 6),
            origin: AddressOrigin::DhcpOffered,
        };
        assert_eq!(
            engine.begin_session(other, AcdMode::Active, Instant::ZERO),
            Err(AcdError::AlreadyActive { address: CANDIDATE })
        );

        engine.end_session();
        engine.end_session();
        assert_eq!(engine.state(), AcdState::Off);
        assert!(engine
            .begin_session(other, AcdMode::Active, Instant::ZERO)
            .is_ok());
    }
}

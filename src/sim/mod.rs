//! A simulated segment for running the coordinator without hardware.

pub mod network;
pub mod server;

pub use network::{Sent, SimHost, SimNetwork};
pub use server::{SimDhcpServer, V4Subnet};

use crate::{clock::Instant, event::NetworkEventSink, AddressCoordinator};

/// Hand everything the network produced since the last step to the
/// coordinator, then run its timers.
pub fn step<S: NetworkEventSink>(coordinator: &mut AddressCoordinator<SimNetwork, S>, now: Instant) {
    for frame in coordinator.transport_mut().take_inbound() {
        coordinator.on_frame_received(frame);
    }
    coordinator.tick(now);
}

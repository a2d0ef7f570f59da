use std::io::{BufWriter, Write};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
    acd::AcdCallback,
    clock::Instant,
    dhcp::DhcpStatus,
    event::{NetworkEvent, NetworkEventSink},
    Address,
};

#[derive(Serialize)]
struct JournalEntry {
    timestamp_ms: u64,
    #[serde(flatten)]
    event: NetworkEvent,
}

/// Writes every sink event as one JSON line, stamped with node time.
///
/// The owner moves the stamp forward with [`JournalSink::set_time`] before
/// driving the coordinator.
pub struct JournalSink<W: Write> {
    writer: BufWriter<W>,
    now: Instant,
    dropped: u64,
}

impl<W: Write> JournalSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            now: Instant::ZERO,
            dropped: 0,
        }
    }

    pub fn set_time(&mut self, now: Instant) {
        self.now = now;
    }

    /// Events that could not be written.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> std::io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }

    fn record(&mut self, event: NetworkEvent) {
        info!(event = event.as_str(), at = %self.now, "{:?}", event);
        let entry = JournalEntry {
            timestamp_ms: self.now.as_millis(),
            event,
        };
        let written = serde_json::to_writer(&mut self.writer, &entry)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));
        if let Err(e) = written {
            self.dropped += 1;
            warn!(%e, dropped = self.dropped, "failed to write journal entry");
        }
    }
}

impl<W: Write> NetworkEventSink for JournalSink<W> {
    fn acd_callback(&mut self, callback: AcdCallback) {
        self.record(NetworkEvent::AcdCallback(callback));
    }

    fn dhcp_status(&mut self, status: DhcpStatus) {
        self.record(NetworkEvent::DhcpStatus(status));
    }

    fn address_changed(&mut self, address: Option<Address>) {
        self.record(NetworkEvent::AddressChanged(address));
    }

    fn link_up(&mut self) {
        self.record(NetworkEvent::LinkUp);
    }

    fn link_down(&mut self) {
        self.record(NetworkEvent::LinkDown);
        // link loss is worth getting to disk right away
        if let Err(e) = self.writer.flush() {
            warn!(%e, "failed to flush journal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressOrigin;

    #[test]
    fn writes_one_json_line_per_event() {
        let mut sink = JournalSink::new(Vec::new());
        sink.set_time(Instant::from_millis(1500));
        sink.link_up();
        sink.dhcp_status(DhcpStatus::Bound);
        sink.set_time(Instant::from_millis(2000));
        sink.address_changed(Some(Address {
            network: "10.0.0.5/24".parse().unwrap(),
            gateway: Some("10.0.0.1".parse().unwrap()),
            origin: AddressOrigin::DhcpOffered,
        }));
        sink.address_changed(None);

        let bytes = sink.into_inner().unwrap();
        let lines: Vec<serde_json::Value> = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["event"], "link_up");
        assert_eq!(lines[0]["timestamp_ms"], 1500);
        assert_eq!(lines[1]["event"], "dhcp_status");
        assert_eq!(lines[1]["value"], "Bound");
        assert_eq!(lines[2]["timestamp_ms"], 2000);
        assert_eq!(lines[2]["value"]["network"], "10.0.0.5/24");
        assert_eq!(lines[2]["value"]["origin"], "dhcp_offered");
        assert!(lines[3]["value"].is_null());
    }
}

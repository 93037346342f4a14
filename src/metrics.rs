//! Protocol-wide counters.
//!
//! Observability only: nothing in the codec or the proxies reads these
//! values to make decisions. One [`ProtocolMetrics`] is shared through an
//! `Arc` by every decoder and pool of a connection.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ProtocolMetrics {
    commands_processed: AtomicU64,
    total_command_bytes: AtomicU64,
    max_command_size: AtomicU64,
    json_commands: AtomicU64,
    oversized_rejected: AtomicU64,
    streams_acquired: AtomicU64,
    streams_created: AtomicU64,
    frames_written: AtomicU64,
    events_dropped: AtomicU64,
}

/// Point-in-time copy of [`ProtocolMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub commands_processed: u64,
    pub total_command_bytes: u64,
    pub max_command_size: u64,
    pub json_commands: u64,
    pub oversized_rejected: u64,
    pub streams_acquired: u64,
    pub streams_created: u64,
    pub frames_written: u64,
    /// Incoming events discarded because the event channel was full.
    pub events_dropped: u64,
}

impl MetricsSnapshot {
    pub fn average_command_size(&self) -> f64 {
        if self.commands_processed == 0 {
            0.0
        } else {
            self.total_command_bytes as f64 / self.commands_processed as f64
        }
    }

    pub fn json_percentage(&self) -> f64 {
        if self.commands_processed == 0 {
            0.0
        } else {
            self.json_commands as f64 * 100.0 / self.commands_processed as f64
        }
    }

    /// Fraction of stream acquisitions that were served without allocating.
    pub fn stream_reuse_ratio(&self) -> f64 {
        if self.streams_acquired == 0 {
            0.0
        } else {
            1.0 - self.streams_created as f64 / self.streams_acquired as f64
        }
    }
}

impl ProtocolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decoded command of `size` content bytes.
    pub fn record_command(&self, size: usize) {
        let size = size as u64;
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        self.total_command_bytes.fetch_add(size, Ordering::Relaxed);
        self.max_command_size.fetch_max(size, Ordering::Relaxed);
    }

    pub fn record_json_command(&self) {
        self.json_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_acquired(&self, created: bool) {
        self.streams_acquired.fetch_add(1, Ordering::Relaxed);
        if created {
            self.streams_created.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_frames_written(&self, count: usize) {
        self.frames_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn oversized_rejected(&self) -> u64 {
        self.oversized_rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            total_command_bytes: self.total_command_bytes.load(Ordering::Relaxed),
            max_command_size: self.max_command_size.load(Ordering::Relaxed),
            json_commands: self.json_commands.load(Ordering::Relaxed),
            oversized_rejected: self.oversized_rejected.load(Ordering::Relaxed),
            streams_acquired: self.streams_acquired.load(Ordering::Relaxed),
            streams_created: self.streams_created.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "commands={} bytes={} avg={:.1} max={} json={:.1}% oversized={} streams={} reuse={:.1}% frames_written={} events_dropped={}",
            s.commands_processed,
            s.total_command_bytes,
            s.average_command_size(),
            s.max_command_size,
            s.json_percentage(),
            s.oversized_rejected,
            s.streams_acquired,
            s.stream_reuse_ratio() * 100.0,
            s.frames_written,
            s.events_dropped,
        )
    }

    pub fn reset(&self) {
        for counter in [
            &self.commands_processed,
            &self.total_command_bytes,
            &self.max_command_size,
            &self.json_commands,
            &self.oversized_rejected,
            &self.streams_acquired,
            &self.streams_created,
            &self.frames_written,
            &self.events_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_commands() {
        let metrics = ProtocolMetrics::new();
        metrics.record_command(10);
        metrics.record_command(30);
        metrics.record_json_command();

        let s = metrics.snapshot();
        assert_eq!(s.commands_processed, 2);
        assert_eq!(s.total_command_bytes, 40);
        assert_eq!(s.max_command_size, 30);
        assert_eq!(s.average_command_size(), 20.0);
        assert_eq!(s.json_percentage(), 50.0);
    }

    #[test]
    fn test_stream_reuse() {
        let metrics = ProtocolMetrics::new();
        metrics.record_stream_acquired(true);
        metrics.record_stream_acquired(false);
        metrics.record_stream_acquired(false);
        metrics.record_stream_acquired(false);
        assert_eq!(metrics.snapshot().stream_reuse_ratio(), 0.75);
    }

    #[test]
    fn test_summary_and_reset() {
        let metrics = ProtocolMetrics::new();
        metrics.record_oversized();
        assert!(metrics.summary().contains("oversized=1"));

        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}

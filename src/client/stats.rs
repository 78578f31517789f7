//! Client statistics tracking.
//!
//! Tracks frame traffic, delivered events, dropped envelopes and connect cycles.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe client statistics
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Frames written to the transport
    frames_sent: AtomicU64,
    /// Frames read from the transport
    frames_received: AtomicU64,
    /// Events handed to the event stream
    events_delivered: AtomicU64,
    /// Envelopes nobody was waiting for
    envelopes_dropped: AtomicU64,
    /// Connect requests issued
    connect_cycles: AtomicU64,
    /// Correlated waits that ran out of time
    timeouts: AtomicU64,
}

impl ClientStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_event(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle(&self) {
        self.connect_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            connect_cycles: self.connect_cycles.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of client statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Frames written to the transport
    pub frames_sent: u64,
    /// Frames read from the transport
    pub frames_received: u64,
    /// Events handed to the event stream
    pub events_delivered: u64,
    /// Envelopes nobody was waiting for
    pub envelopes_dropped: u64,
    /// Connect requests issued
    pub connect_cycles: u64,
    /// Correlated waits that ran out of time
    pub timeouts: u64,
}

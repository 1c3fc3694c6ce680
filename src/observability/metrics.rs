//! Connectivity metrics
//!
//! Atomic counters shared by the wireless and messaging managers through an
//! `Arc` handle created at the composition root. There is no global instance.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for link and session activity
#[derive(Debug, Default)]
pub struct ConnectivityMetrics {
    // Wireless link
    link_up: AtomicBool,
    link_connect_attempts: AtomicU64,
    link_connect_failures: AtomicU64,
    link_losses: AtomicU64,

    // Broker session
    broker_connected: AtomicBool,
    broker_connect_attempts: AtomicU64,
    broker_connect_failures: AtomicU64,
    secure_port_fallbacks: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    last_heartbeat: AtomicU64,

    // Offline buffer
    messages_buffered: AtomicU64,
    messages_dropped: AtomicU64,
    messages_replayed: AtomicU64,

    // Breakers
    circuit_trips: AtomicU64,
}

impl ConnectivityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Wireless link metrics
    pub fn link_connect_attempt(&self) {
        self.link_connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_connected(&self) {
        self.link_up.store(true, Ordering::Relaxed);
    }

    pub fn link_connect_failed(&self) {
        self.link_up.store(false, Ordering::Relaxed);
        self.link_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn link_lost(&self) {
        self.link_up.store(false, Ordering::Relaxed);
        self.link_losses.fetch_add(1, Ordering::Relaxed);
    }

    // Broker session metrics
    pub fn broker_connect_attempt(&self) {
        self.broker_connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_connected(&self) {
        self.broker_connected.store(true, Ordering::Relaxed);
    }

    pub fn broker_disconnected(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn broker_connect_failed(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
        self.broker_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn secure_port_fallback(&self) {
        self.secure_port_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Offline buffer metrics
    pub fn message_buffered(&self) {
        self.messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_replayed(&self, count: usize) {
        self.messages_replayed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn circuit_tripped(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            link: LinkMetrics {
                up: self.link_up.load(Ordering::Relaxed),
                connect_attempts: self.link_connect_attempts.load(Ordering::Relaxed),
                connect_failures: self.link_connect_failures.load(Ordering::Relaxed),
                losses: self.link_losses.load(Ordering::Relaxed),
            },
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connect_attempts: self.broker_connect_attempts.load(Ordering::Relaxed),
                connect_failures: self.broker_connect_failures.load(Ordering::Relaxed),
                secure_port_fallbacks: self.secure_port_fallbacks.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
            },
            buffer: BufferMetrics {
                buffered: self.messages_buffered.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
                replayed: self.messages_replayed.load(Ordering::Relaxed),
            },
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            timestamp: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub link: LinkMetrics,
    pub broker: BrokerMetrics,
    pub buffer: BufferMetrics,
    pub circuit_trips: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    pub up: bool,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub losses: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub secure_port_fallbacks: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub heartbeats_sent: u64,
    pub last_heartbeat: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferMetrics {
    pub buffered: u64,
    pub dropped: u64,
    pub replayed: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

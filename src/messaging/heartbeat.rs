//! Liveness signals: periodic heartbeat and broker-side last will
//!
//! The heartbeat is a positive "alive" signal published by the node while it
//! is connected. The last will is the negative signal: it is registered with
//! the broker when a session opens, and the broker publishes it if the session
//! ends without a clean disconnect.

use crate::wireless::SignalMonitor;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

const HEARTBEAT_SUFFIX: &str = "/heartbeat";
const WILL_SUFFIX: &str = "/will";

/// Identifiers carried by every heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub zone_id: Option<String>,
    pub master_zone_id: Option<String>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            zone_id: None,
            master_zone_id: None,
        }
    }

    pub fn with_zone(mut self, zone_id: impl Into<String>) -> Self {
        self.zone_id = Some(zone_id.into());
        self
    }

    pub fn with_master_zone(mut self, master_zone_id: impl Into<String>) -> Self {
        self.master_zone_id = Some(master_zone_id.into());
        self
    }
}

/// Health figures sampled at heartbeat time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceVitals {
    pub uptime_secs: u64,
    pub free_memory_bytes: u64,
    pub rssi: Option<i32>,
    pub active_sensors: u32,
    pub active_actuators: u32,
}

/// Collaborator that knows the node's health figures
pub trait HeartbeatSource: Send + Sync {
    fn vitals(&self) -> DeviceVitals;
}

/// Heartbeat payload, built fresh for every publish
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HeartbeatRecord {
    pub device_id: String,
    pub zone_id: Option<String>,
    pub master_zone_id: Option<String>,
    pub zone_assigned: bool,
    pub timestamp: i64,
    pub uptime_secs: u64,
    pub free_memory_bytes: u64,
    pub rssi: Option<i32>,
    pub active_sensors: u32,
    pub active_actuators: u32,
}

impl HeartbeatRecord {
    pub fn build(identity: &DeviceIdentity, vitals: DeviceVitals, timestamp: i64) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            zone_id: identity.zone_id.clone(),
            master_zone_id: identity.master_zone_id.clone(),
            zone_assigned: identity.zone_id.is_some(),
            timestamp,
            uptime_secs: vitals.uptime_secs,
            free_memory_bytes: vitals.free_memory_bytes,
            rssi: vitals.rssi,
            active_sensors: vitals.active_sensors,
            active_actuators: vitals.active_actuators,
        }
    }
}

#[derive(Serialize)]
struct WillPayload<'a> {
    status: &'static str,
    reason: &'a str,
    timestamp: i64,
}

/// Message the broker publishes for us after an ungraceful disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct LastWillDeclaration {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWillDeclaration {
    /// Will derived from the heartbeat topic, stamped with `timestamp`
    pub fn for_heartbeat_topic(
        heartbeat_topic: &str,
        reason: &str,
        timestamp: i64,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(&WillPayload {
            status: "offline",
            reason,
            timestamp,
        })?;
        Ok(Self {
            topic: derive_will_topic(heartbeat_topic),
            payload: Bytes::from(payload),
            qos: QoS::AtLeastOnce,
            retain: true,
        })
    }
}

/// `.../heartbeat` becomes `.../will`; any other topic gets `/will` appended
pub fn derive_will_topic(heartbeat_topic: &str) -> String {
    match heartbeat_topic.strip_suffix(HEARTBEAT_SUFFIX) {
        Some(base) => format!("{base}{WILL_SUFFIX}"),
        None => format!("{}{WILL_SUFFIX}", heartbeat_topic.trim_end_matches('/')),
    }
}

/// [`HeartbeatSource`] for a node running on a host OS
///
/// Uptime counts from construction. Free memory comes from `/proc/meminfo`
/// and the signal level from the wireless manager's [`SignalMonitor`].
/// Sensor and actuator counts are set by the application.
#[derive(Debug, Clone)]
pub struct HostVitals {
    started: Instant,
    signal: SignalMonitor,
    sensors: Arc<AtomicU32>,
    actuators: Arc<AtomicU32>,
}

impl HostVitals {
    pub fn new(signal: SignalMonitor) -> Self {
        Self {
            started: Instant::now(),
            signal,
            sensors: Arc::new(AtomicU32::new(0)),
            actuators: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_active_sensors(&self, count: u32) {
        self.sensors.store(count, Ordering::Relaxed);
    }

    pub fn set_active_actuators(&self, count: u32) {
        self.actuators.store(count, Ordering::Relaxed);
    }
}

impl HeartbeatSource for HostVitals {
    fn vitals(&self) -> DeviceVitals {
        let free_memory_bytes = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_mem_available(&content))
            .unwrap_or(0);

        DeviceVitals {
            uptime_secs: self.started.elapsed().as_secs(),
            free_memory_bytes,
            rssi: self.signal.rssi(),
            active_sensors: self.sensors.load(Ordering::Relaxed),
            active_actuators: self.actuators.load(Ordering::Relaxed),
        }
    }
}

/// `MemAvailable` from `/proc/meminfo`, in bytes
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemAvailable:")?;
        let kib = rest.split_whitespace().next()?.parse::<u64>().ok()?;
        Some(kib * 1024)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_derive_will_topic() {
        assert_eq!(
            derive_will_topic("devices/node-1/system/heartbeat"),
            "devices/node-1/system/will"
        );
        assert_eq!(derive_will_topic("devices/node-1/status"), "devices/node-1/status/will");
        assert_eq!(derive_will_topic("devices/node-1/"), "devices/node-1/will");
    }

    #[test]
    fn test_last_will_payload() {
        let will =
            LastWillDeclaration::for_heartbeat_topic("d/n/heartbeat", "connection_lost", 1_700_000_000)
                .unwrap();

        assert_eq!(will.topic, "d/n/will");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);

        let payload: Value = serde_json::from_slice(&will.payload).unwrap();
        assert_eq!(payload["status"], "offline");
        assert_eq!(payload["reason"], "connection_lost");
        assert_eq!(payload["timestamp"], 1_700_000_000);
    }

    #[test]
    fn test_heartbeat_record_zone_flag() {
        let vitals = DeviceVitals {
            uptime_secs: 42,
            free_memory_bytes: 1024,
            rssi: Some(-60),
            active_sensors: 3,
            active_actuators: 1,
        };

        let unassigned = HeartbeatRecord::build(&DeviceIdentity::new("n1"), vitals.clone(), 10);
        assert!(!unassigned.zone_assigned);

        let identity = DeviceIdentity::new("n1").with_zone("z1").with_master_zone("m1");
        let record = HeartbeatRecord::build(&identity, vitals, 10);
        assert!(record.zone_assigned);

        let json: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["device_id"], "n1");
        assert_eq!(json["zone_id"], "z1");
        assert_eq!(json["master_zone_id"], "m1");
        assert_eq!(json["uptime_secs"], 42);
        assert_eq!(json["rssi"], -60);
        assert_eq!(json["active_sensors"], 3);
    }

    #[test]
    fn test_parse_mem_available() {
        let meminfo = "MemTotal:        8000000 kB\nMemFree:          500000 kB\nMemAvailable:    2000000 kB\n";
        assert_eq!(parse_mem_available(meminfo), Some(2_000_000 * 1024));
        assert_eq!(parse_mem_available("MemTotal: 1 kB\n"), None);
    }

    #[test]
    fn test_host_vitals_reads_signal_and_counts() {
        let signal = SignalMonitor::new();
        let vitals = HostVitals::new(signal.clone());
        signal.update(Some(-48));
        vitals.set_active_sensors(4);
        vitals.set_active_actuators(2);

        let sample = vitals.vitals();
        assert_eq!(sample.rssi, Some(-48));
        assert_eq!(sample.active_sensors, 4);
        assert_eq!(sample.active_actuators, 2);
    }
}

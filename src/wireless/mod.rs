//! Wireless link management

pub mod driver;
pub mod manager;

pub use driver::{HostNetworkLink, LinkStatus, RadioDriver};
pub use manager::{LinkReport, SignalMonitor, WirelessConnectionManager, WirelessManagerOptions};

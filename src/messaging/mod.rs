//! Broker messaging
//!
//! - [`manager`] - session lifecycle, publish paths and subscriptions
//! - [`offline_buffer`] - bounded FIFO for messages held while offline
//! - [`heartbeat`] - device identity, heartbeat record and last will

pub mod heartbeat;
pub mod manager;
pub mod offline_buffer;

pub use heartbeat::{
    derive_will_topic, DeviceIdentity, DeviceVitals, HeartbeatRecord, HeartbeatSource, HostVitals,
    LastWillDeclaration,
};
pub use manager::{
    HeartbeatOutcome, MessageHandler, MessagingConnectionManager, MessagingManagerOptions,
    SessionMode, SessionReport,
};
pub use offline_buffer::{BufferFull, OfflineBuffer, OfflineMessage};

//! Root composition of the connectivity layer
//!
//! [`ConnectivityStack`] owns both managers and drives them in the order the
//! layers depend on each other: the wireless link first, time synchronization
//! once the link is associated, then the broker session. Its [`tick`] is the
//! single cooperative entry point the host loop calls.
//!
//! [`tick`]: ConnectivityStack::tick

use crate::config::{BrokerConfig, ConfigError, NodeConfig, WifiConfig};
use crate::context::NodeContext;
use crate::error::{MessagingError, WirelessError};
use crate::messaging::{
    HeartbeatSource, HostVitals, MessagingConnectionManager, MessagingManagerOptions, SessionReport,
};
use crate::observability::MetricsSnapshot;
use crate::transport::BrokerTransport;
use crate::wireless::{LinkReport, RadioDriver, WirelessConnectionManager, WirelessManagerOptions};
use crate::{link_span, mqtt_span};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn, Instrument};

#[derive(Debug, Error)]
pub enum StackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Wireless link unavailable: {0}")]
    Link(#[from] WirelessError),
    #[error("Broker session unavailable: {0}")]
    Broker(#[from] MessagingError),
}

/// Combined status of both layers
#[derive(Debug, Clone, Serialize)]
pub struct StackReport {
    pub link: LinkReport,
    pub session: SessionReport,
    pub metrics: MetricsSnapshot,
}

pub struct ConnectivityStack<R: RadioDriver, T: BrokerTransport> {
    wireless: WirelessConnectionManager<R>,
    messaging: MessagingConnectionManager<T>,
    wifi: WifiConfig,
    broker: BrokerConfig,
    ctx: NodeContext,
}

impl<R: RadioDriver, T: BrokerTransport> ConnectivityStack<R, T> {
    pub fn new(
        wireless: WirelessConnectionManager<R>,
        messaging: MessagingConnectionManager<T>,
        wifi: WifiConfig,
        broker: BrokerConfig,
        ctx: NodeContext,
    ) -> Self {
        Self {
            wireless,
            messaging,
            wifi,
            broker,
            ctx,
        }
    }

    /// Build both managers from a node configuration
    ///
    /// Credentials referenced through `*_env` keys are resolved here. The
    /// heartbeat reads host vitals and the link's signal level.
    pub fn from_config(
        config: &NodeConfig,
        radio: R,
        transport: T,
        ctx: NodeContext,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let wifi = config.wifi_config()?;
        let broker = config.broker_config()?;

        let wireless =
            WirelessConnectionManager::new(radio, WirelessManagerOptions::from_config(config), ctx.clone());
        let mut messaging = MessagingConnectionManager::new(
            transport,
            MessagingManagerOptions::from_config(config),
            ctx.clone(),
        );
        let vitals: Arc<dyn HeartbeatSource> = Arc::new(HostVitals::new(wireless.signal_monitor()));
        messaging.set_heartbeat_source(vitals);

        Ok(Self::new(wireless, messaging, wifi, broker, ctx))
    }

    /// Bring the link up, then the broker session
    ///
    /// A failure leaves the stack in a state `tick` recovers from: the
    /// managers keep their configuration and retry under their own gates.
    pub async fn boot(&mut self) -> Result<(), StackError> {
        let ssid = self.wifi.ssid.clone();
        self.wireless
            .connect(self.wifi.clone())
            .instrument(link_span!(ssid = %ssid))
            .await?;

        if !self.ctx.time.is_synced() {
            warn!("Booting broker session without synchronized time");
        }

        let host = self.broker.host.clone();
        let port = self.broker.port;
        self.messaging
            .connect(self.broker.clone())
            .instrument(mqtt_span!(host = %host, port = port))
            .await?;

        info!(
            ssid = %ssid,
            host = %host,
            "Connectivity stack booted"
        );
        Ok(())
    }

    /// Service both layers once; returns whether the broker session is open
    ///
    /// The session is only serviced while the link is up. When boot never
    /// reached the broker, the first tick with the link up opens the session.
    pub async fn tick(&mut self) -> bool {
        if !self.wireless.tick().await {
            return false;
        }

        if self.messaging.broker_config().is_none() {
            return match self.messaging.connect(self.broker.clone()).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Initial broker session failed");
                    false
                }
            };
        }

        self.messaging.tick().await
    }

    /// Close the session cleanly, then release the link
    pub async fn shutdown(&mut self) {
        info!("Shutting down connectivity stack");
        self.messaging.disconnect().await;
        self.wireless.disconnect();
    }

    pub fn status(&self) -> StackReport {
        StackReport {
            link: self.wireless.status(),
            session: self.messaging.status(),
            metrics: self.ctx.metrics.snapshot(),
        }
    }

    pub fn wireless(&self) -> &WirelessConnectionManager<R> {
        &self.wireless
    }

    pub fn wireless_mut(&mut self) -> &mut WirelessConnectionManager<R> {
        &mut self.wireless
    }

    pub fn messaging(&self) -> &MessagingConnectionManager<T> {
        &self.messaging
    }

    pub fn messaging_mut(&mut self) -> &mut MessagingConnectionManager<T> {
        &mut self.messaging
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }
}

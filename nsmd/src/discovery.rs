//! Discovery driver: bring endpoints from "enumerated" to "managed".
//!
//! Enumeration itself comes from an external source (MCTP control);
//! the daemon ships a config-table enumerator. For each endpoint the
//! driver pings it, queries its identity, reads its event source
//! masks, installs the configured subscription, and publishes the
//! route to the registry. Failures retry with exponential backoff. A
//! rediscovery event repeats the sequence for that endpoint alone.

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

use nsm_wire::capability::{self, EventGeneration, EventSourceMask};
use nsm_wire::msg::{CmdResponse, MessageType};

use crate::config::{Config, EndpointConfig};
use crate::metrics::Metrics;
use crate::registry::{EndpointRegistry, MediumClass};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub eid: u8,
    pub uuid: Uuid,
    pub medium: MediumClass,
}

#[async_trait]
pub trait EndpointEnumerator: Send + Sync {
    async fn enumerate(&self) -> anyhow::Result<Vec<EndpointDescriptor>>;
}

/// Enumerator backed by the `[[endpoints]]` config table.
pub struct StaticEnumerator {
    endpoints: Vec<EndpointDescriptor>,
}

impl StaticEnumerator {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self { endpoints }
    }

    pub fn from_config(entries: &[EndpointConfig]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|e| EndpointDescriptor {
                    eid: e.eid,
                    uuid: e.uuid,
                    medium: e.medium,
                })
                .collect(),
        )
    }
}

#[async_trait]
impl EndpointEnumerator for StaticEnumerator {
    async fn enumerate(&self) -> anyhow::Result<Vec<EndpointDescriptor>> {
        Ok(self.endpoints.clone())
    }
}

/// Emitted when an endpoint finished setup and entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryReady {
    pub uuid: Uuid,
    pub eid: u8,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub local_eid: u8,
    pub request_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
    pub event_generation: EventGeneration,
    pub event_sources: EventSourceMask,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let event_generation = match config.discovery.event_generation.as_str() {
            "disabled" => EventGeneration::Disabled,
            "poll" => EventGeneration::Poll,
            "push" => EventGeneration::Push,
            other => anyhow::bail!("unknown event_generation setting {other:?}"),
        };
        let mut event_sources = EventSourceMask::empty();
        for id in &config.discovery.event_sources {
            event_sources.set(*id, true);
        }
        Ok(Self {
            local_eid: config.transport.local_eid,
            request_timeout: config.polling.request_timeout(),
            backoff_initial: config.discovery.backoff_initial(),
            backoff_cap: config.discovery.backoff_cap(),
            event_generation,
            event_sources,
        })
    }
}

fn expect_ok<T>(resp: CmdResponse<T>, what: &str) -> anyhow::Result<T> {
    match resp {
        CmdResponse::Ok(value) => Ok(value),
        CmdResponse::Refused { completion, reason } => {
            anyhow::bail!("{what} refused: {completion:?} (reason {reason:#06x})")
        }
    }
}

pub struct DiscoveryDriver {
    transport: Arc<dyn Transport>,
    registry: Arc<EndpointRegistry>,
    metrics: Arc<Metrics>,
    settings: DiscoverySettings,
    ready_tx: mpsc::Sender<DiscoveryReady>,
}

impl DiscoveryDriver {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<EndpointRegistry>,
        metrics: Arc<Metrics>,
        settings: DiscoverySettings,
        ready_tx: mpsc::Sender<DiscoveryReady>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry,
            metrics,
            settings,
            ready_tx,
        })
    }

    /// Enumerate once, set every endpoint up concurrently, then serve
    /// rediscovery requests until the channel closes.
    pub async fn run(
        self: Arc<Self>,
        enumerator: Arc<dyn EndpointEnumerator>,
        mut rediscover_rx: mpsc::Receiver<u8>,
    ) {
        let descriptors = loop {
            match enumerator.enumerate().await {
                Ok(descriptors) => break descriptors,
                Err(e) => {
                    error!("[discovery] enumeration failed: {e:#}; retrying");
                    sleep(self.settings.backoff_initial).await;
                }
            }
        };
        info!("[discovery] {} endpoints enumerated", descriptors.len());
        for descriptor in &descriptors {
            tokio::spawn(Arc::clone(&self).setup_with_backoff(*descriptor));
        }

        while let Some(eid) = rediscover_rx.recv().await {
            let descriptor = self
                .registry
                .uuid_for_eid(eid)
                .and_then(|uuid| {
                    self.registry
                        .routes(&uuid)
                        .iter()
                        .find(|r| r.eid == eid)
                        .map(|r| EndpointDescriptor {
                            eid,
                            uuid,
                            medium: r.medium,
                        })
                })
                .or_else(|| descriptors.iter().find(|d| d.eid == eid).copied());
            match descriptor {
                Some(descriptor) => {
                    info!("[discovery] rediscovery for eid {eid}");
                    tokio::spawn(Arc::clone(&self).setup_with_backoff(descriptor));
                }
                None => warn!("[discovery] rediscovery event from unknown eid {eid}"),
            }
        }
        debug!("[discovery] rediscovery channel closed");
    }

    async fn setup_with_backoff(self: Arc<Self>, descriptor: EndpointDescriptor) {
        let mut backoff = self.settings.backoff_initial;
        loop {
            match self.setup(&descriptor).await {
                Ok(()) => {
                    self.registry
                        .upsert(descriptor.uuid, descriptor.eid, descriptor.medium);
                    self.metrics.record_online();
                    info!(
                        "[discovery] endpoint ready: eid={} uuid={}",
                        descriptor.eid, descriptor.uuid
                    );
                    let _ = self
                        .ready_tx
                        .send(DiscoveryReady {
                            uuid: descriptor.uuid,
                            eid: descriptor.eid,
                        })
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(
                        "[discovery] setup of eid {} failed: {e:#}; retrying in {:?}",
                        descriptor.eid, backoff
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.backoff_cap);
                }
            }
        }
    }

    async fn setup(&self, descriptor: &EndpointDescriptor) -> anyhow::Result<()> {
        let eid = descriptor.eid;
        let timeout = self.settings.request_timeout;

        let reply = self
            .transport
            .send_and_await(eid, capability::encode_ping_req()?, timeout)
            .await
            .context("ping")?;
        expect_ok(capability::decode_ping_resp(&reply.frame)?, "ping")?;

        let reply = self
            .transport
            .send_and_await(
                eid,
                capability::encode_query_device_identification_req()?,
                timeout,
            )
            .await
            .context("query device identification")?;
        let (kind, instance) = expect_ok(
            capability::decode_query_device_identification_resp(&reply.frame)?,
            "query device identification",
        )?;
        debug!("[discovery] eid {eid} identifies as {kind:?} instance {instance}");

        let reply = self
            .transport
            .send_and_await(
                eid,
                capability::encode_get_supported_event_sources_req(
                    MessageType::DeviceCapability,
                )?,
                timeout,
            )
            .await
            .context("get supported event sources")?;
        let supported = expect_ok(
            capability::decode_get_supported_event_sources_resp(&reply.frame)?,
            "get supported event sources",
        )?;
        for id in 0..=u8::MAX {
            if self.settings.event_sources.contains(id) && !supported.contains(id) {
                warn!("[discovery] eid {eid} does not support event id {id}");
            }
        }

        let reply = self
            .transport
            .send_and_await(
                eid,
                capability::encode_get_current_event_sources_req(MessageType::DeviceCapability)?,
                timeout,
            )
            .await
            .context("get current event sources")?;
        let current = expect_ok(
            capability::decode_get_current_event_sources_resp(&reply.frame)?,
            "get current event sources",
        )?;
        if current != self.settings.event_sources {
            let reply = self
                .transport
                .send_and_await(
                    eid,
                    capability::encode_set_current_event_sources_req(
                        MessageType::DeviceCapability,
                        &self.settings.event_sources,
                    )?,
                    timeout,
                )
                .await
                .context("set current event sources")?;
            expect_ok(
                capability::decode_set_current_event_sources_resp(&reply.frame)?,
                "set current event sources",
            )?;
        }

        let reply = self
            .transport
            .send_and_await(
                eid,
                capability::encode_set_event_subscription_req(
                    self.settings.event_generation,
                    self.settings.local_eid,
                )?,
                timeout,
            )
            .await
            .context("set event subscription")?;
        expect_ok(
            capability::decode_set_event_subscription_resp(&reply.frame)?,
            "set event subscription",
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockDevice, MockFault};

    fn settings() -> DiscoverySettings {
        DiscoverySettings {
            local_eid: 8,
            request_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            event_generation: EventGeneration::Push,
            event_sources: EventSourceMask::empty()
                .with(capability::REDISCOVERY_EVENT_ID)
                .with(capability::LONG_RUNNING_EVENT_ID),
        }
    }

    fn descriptor() -> EndpointDescriptor {
        EndpointDescriptor {
            eid: 30,
            uuid: Uuid::from_bytes([7; 16]),
            medium: MediumClass::Pcie,
        }
    }

    fn driver(
        device: &Arc<MockDevice>,
    ) -> (
        Arc<DiscoveryDriver>,
        Arc<EndpointRegistry>,
        mpsc::Receiver<DiscoveryReady>,
    ) {
        let registry = Arc::new(EndpointRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let (ready_tx, ready_rx) = mpsc::channel(8);
        let driver = DiscoveryDriver::new(
            Arc::clone(device) as Arc<dyn Transport>,
            Arc::clone(&registry),
            metrics,
            settings(),
            ready_tx,
        );
        (driver, registry, ready_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn setup_populates_registry_and_installs_subscription() {
        let device = Arc::new(MockDevice::new());
        let (driver, registry, mut ready_rx) = driver(&device);

        let enumerator = Arc::new(StaticEnumerator::new(vec![descriptor()]));
        let (_rediscover_tx, rediscover_rx) = mpsc::channel(4);
        tokio::spawn(driver.run(enumerator, rediscover_rx));

        let ready = ready_rx.recv().await.unwrap();
        assert_eq!(ready.eid, 30);
        assert_eq!(registry.preferred_eid(&descriptor().uuid), Some(30));
        assert_eq!(
            device.subscription(),
            Some((EventGeneration::Push, 8))
        );
        assert!(device.current_sources().contains(capability::REDISCOVERY_EVENT_ID));
        assert!(device.current_sources().contains(capability::LONG_RUNNING_EVENT_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn setup_retries_with_exponential_backoff() {
        let device = Arc::new(MockDevice::new());
        // First two attempts die on the ping.
        device.push_fault(MockFault::Timeout);
        device.push_fault(MockFault::Timeout);
        let (driver, registry, mut ready_rx) = driver(&device);

        let start = tokio::time::Instant::now();
        tokio::spawn(driver.setup_with_backoff(descriptor()));
        let ready = ready_rx.recv().await.unwrap();

        assert_eq!(ready.eid, 30);
        assert_eq!(registry.preferred_eid(&descriptor().uuid), Some(30));
        // Two failed pings (2 s each) plus backoffs of 1 s and 2 s.
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(device.requests_for(30, capability::PING) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rediscovery_reruns_setup_for_that_endpoint_only() {
        let device = Arc::new(MockDevice::new());
        let (driver, registry, mut ready_rx) = driver(&device);

        let enumerator = Arc::new(StaticEnumerator::new(vec![descriptor()]));
        let (rediscover_tx, rediscover_rx) = mpsc::channel(4);
        tokio::spawn(driver.run(enumerator, rediscover_rx));
        ready_rx.recv().await.unwrap();
        let subscriptions_before =
            device.requests_for(30, capability::SET_EVENT_SUBSCRIPTION);

        rediscover_tx.send(30).await.unwrap();
        ready_rx.recv().await.unwrap();

        assert_eq!(
            device.requests_for(30, capability::SET_EVENT_SUBSCRIPTION),
            subscriptions_before + 1
        );
        assert_eq!(registry.routes(&descriptor().uuid).len(), 1);
    }

    #[tokio::test]
    async fn settings_reject_unknown_generation_mode() {
        let mut config = Config::default();
        config.discovery.event_generation = "shout".into();
        assert!(DiscoverySettings::from_config(&config).is_err());
    }
}

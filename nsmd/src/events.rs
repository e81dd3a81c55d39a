//! Event dispatcher: unsolicited frames in, handlers and parked
//! coroutines out.
//!
//! Routing is by (NSM type, event id), per-endpoint map first, global
//! map second. Long-running completion events are not routed through
//! handlers at all - their correlation tuple (endpoint, type, command,
//! instance id) identifies exactly one registered waiter, which gets
//! the frame through its channel.

use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

use nsm_wire::capability::{self, LongRunningState};
use nsm_wire::msg::{self, EventFrame, MessageType};

use crate::metrics::Metrics;
use crate::transport::{InboundEvent, Transport};

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, eid: u8, event: &EventFrame);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LongRunningKey {
    pub eid: u8,
    pub message_type: MessageType,
    pub command: u8,
    pub instance_id: u8,
}

type HandlerMap = HashMap<(MessageType, u8), Arc<dyn EventHandler>>;

pub struct EventDispatcher {
    global: Mutex<HandlerMap>,
    per_endpoint: Mutex<HashMap<u8, HandlerMap>>,
    waiters: Mutex<HashMap<LongRunningKey, oneshot::Sender<EventFrame>>>,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl EventDispatcher {
    pub fn new(transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            global: Mutex::new(HashMap::new()),
            per_endpoint: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            transport,
            metrics,
        }
    }

    /// Register a fallback handler for every endpoint. Duplicate
    /// (type, id) registration is a configuration error.
    pub fn register_global(
        &self,
        message_type: MessageType,
        event_id: u8,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<()> {
        let mut global = self.global.lock().unwrap();
        if global.contains_key(&(message_type, event_id)) {
            anyhow::bail!("handler already registered for ({message_type:?}, {event_id})");
        }
        global.insert((message_type, event_id), handler);
        Ok(())
    }

    pub fn register_for_endpoint(
        &self,
        eid: u8,
        message_type: MessageType,
        event_id: u8,
        handler: Arc<dyn EventHandler>,
    ) -> anyhow::Result<()> {
        let mut per_endpoint = self.per_endpoint.lock().unwrap();
        let handlers = per_endpoint.entry(eid).or_default();
        if handlers.contains_key(&(message_type, event_id)) {
            anyhow::bail!(
                "handler already registered for eid {eid} ({message_type:?}, {event_id})"
            );
        }
        handlers.insert((message_type, event_id), handler);
        Ok(())
    }

    /// Park a long-running waiter. At most one waiter may exist per
    /// correlation tuple; the transport's instance-id allocation makes
    /// a collision a bug, so it is rejected loudly.
    pub fn register_long_running(
        &self,
        key: LongRunningKey,
    ) -> anyhow::Result<oneshot::Receiver<EventFrame>> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.contains_key(&key) {
            anyhow::bail!(
                "long-running waiter already registered for eid {} type {:?} command {:#04x} instance {}",
                key.eid,
                key.message_type,
                key.command,
                key.instance_id
            );
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(key, tx);
        Ok(rx)
    }

    /// Cancellation path: the engine gave up on the completion.
    pub fn cancel_long_running(&self, key: &LongRunningKey) {
        self.waiters.lock().unwrap().remove(key);
    }

    pub fn pending_long_running(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }

    /// Spawn the intake task draining the transport's event channel.
    /// Events are processed in arrival order per endpoint.
    pub fn spawn_intake(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<InboundEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((eid, frame)) = rx.recv().await {
                self.dispatch(eid, &frame).await;
            }
            debug!("[events] intake channel closed");
        })
    }

    pub async fn dispatch(&self, eid: u8, frame: &[u8]) {
        self.metrics.record_event();
        let event = match msg::decode_event(frame) {
            Ok(event) => event,
            Err(e) => {
                warn!("[events] undecodable event from eid {eid}: {e}");
                self.metrics.record_unhandled_event();
                return;
            }
        };

        if capability::is_long_running_event(&event) {
            self.complete_long_running(eid, &event);
        } else {
            let handler = self.lookup(eid, event.message_type, event.event_id);
            match handler {
                Some(handler) => handler.handle(eid, &event).await,
                None => {
                    warn!(
                        "[events] unhandled event eid={} type={:?} id={} len={}",
                        eid,
                        event.message_type,
                        event.event_id,
                        event.data.len()
                    );
                    self.metrics.record_unhandled_event();
                }
            }
        }

        if event.ack_request {
            // Forward the ack without blocking intake on it.
            let transport = Arc::clone(&self.transport);
            let metrics = Arc::clone(&self.metrics);
            let ack =
                msg::encode_event_ack(event.instance_id, event.message_type, event.event_id);
            tokio::spawn(async move {
                if let Err(e) = transport.send_datagram(eid, ack).await {
                    warn!("[events] ack to eid {eid} failed: {e}");
                } else {
                    metrics.record_event_ack();
                }
            });
        }
    }

    fn lookup(
        &self,
        eid: u8,
        message_type: MessageType,
        event_id: u8,
    ) -> Option<Arc<dyn EventHandler>> {
        if let Some(handler) = self
            .per_endpoint
            .lock()
            .unwrap()
            .get(&eid)
            .and_then(|handlers| handlers.get(&(message_type, event_id)))
        {
            return Some(Arc::clone(handler));
        }
        self.global
            .lock()
            .unwrap()
            .get(&(message_type, event_id))
            .cloned()
    }

    fn complete_long_running(&self, eid: u8, event: &EventFrame) {
        let state = match LongRunningState::unpack(event.state) {
            Ok(state) => state,
            Err(e) => {
                error!("[events] long-running event with bad state from eid {eid}: {e}");
                self.metrics.record_unhandled_event();
                return;
            }
        };
        let key = LongRunningKey {
            eid,
            message_type: state.message_type,
            command: state.command,
            instance_id: event.instance_id,
        };
        let waiter = self.waiters.lock().unwrap().remove(&key);
        match waiter {
            Some(tx) => {
                self.metrics.record_long_running_completion();
                if tx.send(event.clone()).is_err() {
                    // The engine raced us to the timeout; nothing to
                    // resume.
                    debug!(
                        "[events] completion for eid {} instance {} arrived after cancellation",
                        eid, event.instance_id
                    );
                }
            }
            None => {
                // A completion without a registered waiter is a
                // protocol error on the endpoint's side.
                error!(
                    "[events] no waiter for completion eid={} type={:?} command={:#04x} instance={}",
                    eid, state.message_type, state.command, event.instance_id
                );
                self.metrics.record_unhandled_event();
            }
        }
    }
}

/// Rediscovery events funnel into the discovery driver through a
/// channel; the driver re-queries that endpoint only.
pub struct RediscoveryHandler {
    tx: mpsc::Sender<u8>,
}

impl RediscoveryHandler {
    pub fn new(tx: mpsc::Sender<u8>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventHandler for RediscoveryHandler {
    fn name(&self) -> &'static str {
        "rediscovery"
    }

    async fn handle(&self, eid: u8, _event: &EventFrame) {
        if self.tx.send(eid).await.is_err() {
            warn!("[events] discovery driver gone; rediscovery for eid {eid} dropped");
        }
    }
}

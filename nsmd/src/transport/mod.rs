//! Transport client: pairs requests with responses by
//! (endpoint, instance id), signals timeouts, and demultiplexes event
//! frames to the dispatcher.
//!
//! The transport is opaque to command semantics and never retries;
//! retry policy lives in the sensor engine. It also does not provide
//! mutual exclusion on an endpoint - that is the endpoint gate's job.

pub mod mock;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::sync::{mpsc, oneshot};

use nsm_wire::msg::{self, MessageHeader, WireError, HDR_LEN, INSTANCE_ID_MASK, MAX_MESSAGE_LEN};

/// An inbound event frame: originating endpoint id plus raw bytes.
pub type InboundEvent = (u8, Vec<u8>);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("request rejected before transmit: {0}")]
    Encode(WireError),
    #[error("transport closed")]
    Closed,
    #[error("no free instance id for endpoint {0}")]
    InstanceIdsExhausted(u8),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// A paired response: the instance id the request went out with and
/// the raw response frame.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub instance_id: u8,
    pub frame: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Allocate an instance id, stamp it, transmit, and park until the
    /// matching response arrives or `timeout` elapses.
    async fn send_and_await(
        &self,
        eid: u8,
        request: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError>;

    /// Fire-and-forget datagram (event acknowledgements).
    async fn send_datagram(&self, eid: u8, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Register the channel every inbound datagram-request frame is
    /// forwarded to.
    fn subscribe_events(&self, tx: mpsc::Sender<InboundEvent>);
}

/// Per-endpoint 5-bit cycling instance id allocator. Ids still in
/// flight are skipped, so no two concurrent requests to one endpoint
/// can share an id.
pub struct InstanceIdAllocator {
    next: Mutex<HashMap<u8, u8>>,
}

impl Default for InstanceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceIdAllocator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(HashMap::new()),
        }
    }

    pub fn alloc(&self, eid: u8, busy: impl Fn(u8) -> bool) -> Result<u8, TransportError> {
        let mut map = self.next.lock().unwrap();
        let next = map.entry(eid).or_insert(0);
        for _ in 0..=INSTANCE_ID_MASK {
            let candidate = *next & INSTANCE_ID_MASK;
            *next = (candidate + 1) & INSTANCE_ID_MASK;
            if !busy(candidate) {
                return Ok(candidate);
            }
        }
        Err(TransportError::InstanceIdsExhausted(eid))
    }
}

/// Transport over a unix datagram socket to an MCTP demux daemon.
/// Frames are `eid` followed by the NSM message, both directions.
pub struct SockTransport {
    inner: Arc<SockInner>,
}

struct SockInner {
    sock: UnixDatagram,
    pending: DashMap<(u8, u8), oneshot::Sender<Vec<u8>>>,
    iids: InstanceIdAllocator,
    events: Mutex<Option<mpsc::Sender<InboundEvent>>>,
}

impl SockTransport {
    /// Bind `local_path`, connect to the demux socket, and start the
    /// reader task.
    pub fn connect(socket_path: &str, local_path: &str) -> std::io::Result<Self> {
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(local_path);
        let sock = UnixDatagram::bind(local_path)?;
        sock.connect(socket_path)?;
        let inner = Arc::new(SockInner {
            sock,
            pending: DashMap::new(),
            iids: InstanceIdAllocator::new(),
            events: Mutex::new(None),
        });
        tokio::spawn(Arc::clone(&inner).read_loop());
        Ok(Self { inner })
    }
}

impl SockInner {
    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_MESSAGE_LEN + 1];
        loop {
            let n = match self.sock.recv(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    error!("[transport] socket receive failed: {e}");
                    // Fail everything parked on us; the daemon decides
                    // whether to reconnect.
                    self.pending.clear();
                    return;
                }
            };
            if n < 1 + HDR_LEN {
                warn!("[transport] runt frame ({n} bytes) dropped");
                continue;
            }
            let eid = buf[0];
            let frame = buf[1..n].to_vec();
            let header = match MessageHeader::decode(&frame) {
                Ok((header, _)) => header,
                Err(e) => {
                    warn!("[transport] undecodable frame from eid {eid}: {e}");
                    continue;
                }
            };
            if header.is_event() {
                let tx = self.events.lock().unwrap().clone();
                match tx {
                    Some(tx) => {
                        if tx.send((eid, frame)).await.is_err() {
                            warn!("[transport] event channel closed; dropping event");
                        }
                    }
                    None => warn!("[transport] event from eid {eid} before subscription"),
                }
            } else if !header.request {
                match self.pending.remove(&(eid, header.instance_id)) {
                    Some((_, tx)) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(
                        "[transport] unmatched response eid={} instance={}",
                        eid, header.instance_id
                    ),
                }
            } else {
                // A plain request from an endpoint is not ours to
                // answer.
                debug!("[transport] ignoring request frame from eid {eid}");
            }
        }
    }
}

#[async_trait]
impl Transport for SockTransport {
    async fn send_and_await(
        &self,
        eid: u8,
        mut request: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError> {
        if request.len() < HDR_LEN || request.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Encode(WireError::InvalidLength));
        }
        let instance_id = self
            .inner
            .iids
            .alloc(eid, |candidate| self.inner.pending.contains_key(&(eid, candidate)))?;
        msg::stamp_instance_id(&mut request, instance_id);

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert((eid, instance_id), tx);

        let mut wire = Vec::with_capacity(1 + request.len());
        wire.push(eid);
        wire.extend_from_slice(&request);
        if let Err(e) = self.inner.sock.send(&wire).await {
            self.inner.pending.remove(&(eid, instance_id));
            return Err(TransportError::Io(e));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(TransportReply { instance_id, frame }),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                // Deadline elapsed: free the instance id slot.
                self.inner.pending.remove(&(eid, instance_id));
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_datagram(&self, eid: u8, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Encode(WireError::InvalidLength));
        }
        let mut wire = Vec::with_capacity(1 + frame.len());
        wire.push(eid);
        wire.extend_from_slice(&frame);
        self.inner.sock.send(&wire).await?;
        Ok(())
    }

    fn subscribe_events(&self, tx: mpsc::Sender<InboundEvent>) {
        *self.inner.events.lock().unwrap() = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_wire::capability;

    #[test]
    fn allocator_cycles_through_all_five_bits() {
        let alloc = InstanceIdAllocator::new();
        let mut seen = Vec::new();
        for _ in 0..=INSTANCE_ID_MASK {
            seen.push(alloc.alloc(30, |_| false).unwrap());
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 32);
        // Wraps back to the start.
        assert_eq!(alloc.alloc(30, |_| false).unwrap(), seen[0]);
    }

    #[test]
    fn allocator_skips_busy_ids() {
        let alloc = InstanceIdAllocator::new();
        let busy = [0u8, 1, 2];
        assert_eq!(alloc.alloc(30, |id| busy.contains(&id)).unwrap(), 3);
    }

    #[test]
    fn allocator_reports_exhaustion() {
        let alloc = InstanceIdAllocator::new();
        assert!(matches!(
            alloc.alloc(30, |_| true),
            Err(TransportError::InstanceIdsExhausted(30))
        ));
    }

    #[test]
    fn allocator_tracks_endpoints_independently() {
        let alloc = InstanceIdAllocator::new();
        assert_eq!(alloc.alloc(30, |_| false).unwrap(), 0);
        assert_eq!(alloc.alloc(30, |_| false).unwrap(), 1);
        assert_eq!(alloc.alloc(31, |_| false).unwrap(), 0);
    }

    #[tokio::test]
    async fn sock_transport_round_trip_and_event_demux() {
        let dir = tempfile::tempdir().unwrap();
        let demux_path = dir.path().join("demux.sock");
        let local_path = dir.path().join("nsmd.sock");
        let demux = UnixDatagram::bind(&demux_path).unwrap();

        let transport =
            SockTransport::connect(demux_path.to_str().unwrap(), local_path.to_str().unwrap())
                .unwrap();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        transport.subscribe_events(event_tx);

        // Fake demux: answer one ping and push one event.
        let peer = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (n, from) = demux.recv_from(&mut buf).await.unwrap();
            let eid = buf[0];
            let frame = &buf[1..n];
            capability::decode_ping_req(frame).unwrap();
            let iid = msg::peek_instance_id(frame).unwrap();

            let resp = capability::encode_ping_resp(iid).unwrap();
            let mut wire = vec![eid];
            wire.extend_from_slice(&resp);
            demux.send_to(&wire, from.as_pathname().unwrap()).await.unwrap();

            let event = capability::encode_rediscovery_event(0, false).unwrap();
            let mut wire = vec![eid];
            wire.extend_from_slice(&event);
            demux.send_to(&wire, from.as_pathname().unwrap()).await.unwrap();
        });

        let reply = transport
            .send_and_await(
                30,
                capability::encode_ping_req().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(matches!(
            capability::decode_ping_resp(&reply.frame).unwrap(),
            nsm_wire::CmdResponse::Ok(())
        ));

        let (eid, frame) = event_rx.recv().await.unwrap();
        assert_eq!(eid, 30);
        let event = msg::decode_event(&frame).unwrap();
        assert!(capability::is_rediscovery_event(&event));

        peer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sock_transport_times_out_and_frees_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let demux_path = dir.path().join("demux.sock");
        let local_path = dir.path().join("nsmd.sock");
        // Bound but never answering.
        let _demux = UnixDatagram::bind(&demux_path).unwrap();

        let transport =
            SockTransport::connect(demux_path.to_str().unwrap(), local_path.to_str().unwrap())
                .unwrap();
        let err = transport
            .send_and_await(
                30,
                capability::encode_ping_req().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.inner.pending.is_empty());
    }
}

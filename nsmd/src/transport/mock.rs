//! An in-process NSM endpoint for tests. Answers requests with the
//! same `nsm-wire` encoders the daemon decodes with, injects event
//! frames, and can be scripted with faults (timeouts, refusals,
//! garbage) per request.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use nsm_wire::aggregate;
use nsm_wire::capability::{
    self, DeviceKind, EventGeneration, EventSourceMask, LongRunningState,
};
use nsm_wire::msg::{self, CompletionCode, MessageType, WireError, MAX_MESSAGE_LEN};
use nsm_wire::telemetry;

use super::{
    InboundEvent, InstanceIdAllocator, Transport, TransportError, TransportReply,
};

/// One scripted fault, consumed per request in FIFO order.
#[derive(Debug, Clone)]
pub enum MockFault {
    /// Never answer; the caller's deadline elapses.
    Timeout,
    /// Answer with a refusal.
    Refuse(CompletionCode, u16),
    /// Answer with bytes that do not decode.
    Garbage,
    /// Answer with a truncated success response.
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedRequest {
    pub eid: u8,
    pub message_type: MessageType,
    pub command: u8,
    pub instance_id: u8,
    pub at: tokio::time::Instant,
}

/// Mutable device model the responses are generated from.
pub struct DeviceState {
    pub temperature_c: f64,
    pub power_w: f64,
    pub energy_j: f64,
    pub presence: bool,
    pub power_status: u8,
    pub port_gbps: f64,
    pub inventory: HashMap<u8, Vec<u8>>,
    /// Samples returned for the aggregate form of get-power-draw.
    pub aggregate_samples: Vec<(u8, bool, Vec<u8>)>,
    pub device_kind: DeviceKind,
    pub device_instance: u8,
    pub supported_sources: EventSourceMask,
    pub current_sources: EventSourceMask,
    pub subscription: Option<(EventGeneration, u8)>,
    pub ack_mask: EventSourceMask,
    pub power_limit_w: f64,
    /// When set, an admitted set-power-limit completes itself with an
    /// event after this delay.
    pub long_running_delay: Option<Duration>,
    pub faults: VecDeque<MockFault>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            temperature_c: 42.25,
            power_w: 215.0,
            energy_j: 1000.0,
            presence: true,
            power_status: 0x01,
            port_gbps: 25.0,
            inventory: HashMap::new(),
            aggregate_samples: Vec::new(),
            device_kind: DeviceKind::Gpu,
            device_instance: 0,
            supported_sources: EventSourceMask::empty()
                .with(capability::REDISCOVERY_EVENT_ID)
                .with(capability::LONG_RUNNING_EVENT_ID),
            current_sources: EventSourceMask::empty(),
            subscription: None,
            ack_mask: EventSourceMask::empty(),
            power_limit_w: 500.0,
            long_running_delay: None,
            faults: VecDeque::new(),
        }
    }
}

pub struct MockDevice {
    state: Mutex<DeviceState>,
    iids: InstanceIdAllocator,
    in_flight_ids: Mutex<HashSet<(u8, u8)>>,
    in_flight: Mutex<HashMap<u8, usize>>,
    max_in_flight: Mutex<HashMap<u8, usize>>,
    requests: Mutex<Vec<RecordedRequest>>,
    datagrams: Mutex<Vec<(u8, Vec<u8>)>>,
    events: Mutex<Option<mpsc::Sender<InboundEvent>>>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::default()),
            iids: InstanceIdAllocator::new(),
            in_flight_ids: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            datagrams: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    pub fn with_state(&self, f: impl FnOnce(&mut DeviceState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn push_fault(&self, fault: MockFault) {
        self.state.lock().unwrap().faults.push_back(fault);
    }

    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, eid: u8, command: u8) -> usize {
        self.request_times(eid, command).len()
    }

    pub fn request_times(&self, eid: u8, command: u8) -> Vec<tokio::time::Instant> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.eid == eid && r.command == command)
            .map(|r| r.at)
            .collect()
    }

    /// Largest number of overlapping send_and_await calls observed on
    /// one endpoint. The mutual-exclusion property says this never
    /// exceeds 1 when the engine is driving.
    pub fn max_in_flight(&self, eid: u8) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(&eid)
            .copied()
            .unwrap_or(0)
    }

    pub fn sent_datagrams(&self) -> Vec<(u8, Vec<u8>)> {
        self.datagrams.lock().unwrap().clone()
    }

    pub fn subscription(&self) -> Option<(EventGeneration, u8)> {
        self.state.lock().unwrap().subscription
    }

    pub fn current_sources(&self) -> EventSourceMask {
        self.state.lock().unwrap().current_sources
    }

    async fn emit(&self, eid: u8, frame: Vec<u8>) {
        let tx = self.events.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send((eid, frame)).await;
        }
    }

    pub async fn emit_event(&self, eid: u8, frame: Vec<u8>) {
        self.emit(eid, frame).await;
    }

    pub async fn emit_rediscovery(&self, eid: u8, ack_request: bool) {
        let frame = capability::encode_rediscovery_event(0, ack_request).unwrap();
        self.emit(eid, frame).await;
    }

    /// Manually complete an admitted long-running command.
    pub async fn emit_long_running_completion(
        &self,
        eid: u8,
        instance_id: u8,
        command: u8,
        data: &[u8],
    ) {
        let frame = capability::encode_long_running_event(
            instance_id,
            false,
            LongRunningState {
                message_type: MessageType::Telemetry,
                command,
            },
            data,
        )
        .unwrap();
        self.emit(eid, frame).await;
    }

    fn track_enter(&self, eid: u8) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(eid).or_insert(0);
        *count += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let peak = max.entry(eid).or_insert(0);
        if *count > *peak {
            *peak = *count;
        }
    }

    fn track_exit(&self, eid: u8) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(&eid) {
            *count -= 1;
        }
    }

    fn respond(
        &self,
        eid: u8,
        instance_id: u8,
        message_type: MessageType,
        command: u8,
        request: &[u8],
    ) -> Result<Vec<u8>, WireError> {
        let mut state = self.state.lock().unwrap();
        let frame = match (message_type, command) {
            (MessageType::DeviceCapability, capability::PING) => {
                capability::decode_ping_req(request)?;
                capability::encode_ping_resp(instance_id)?
            }
            (MessageType::DeviceCapability, capability::QUERY_DEVICE_IDENTIFICATION) => {
                capability::decode_query_device_identification_req(request)?;
                capability::encode_query_device_identification_resp(
                    instance_id,
                    state.device_kind,
                    state.device_instance,
                )?
            }
            (MessageType::DeviceCapability, capability::GET_SUPPORTED_EVENT_SOURCES) => {
                capability::decode_get_supported_event_sources_req(request)?;
                capability::encode_get_supported_event_sources_resp(
                    instance_id,
                    &state.supported_sources,
                )?
            }
            (MessageType::DeviceCapability, capability::GET_CURRENT_EVENT_SOURCES) => {
                capability::decode_get_current_event_sources_req(request)?;
                capability::encode_get_current_event_sources_resp(
                    instance_id,
                    &state.current_sources,
                )?
            }
            (MessageType::DeviceCapability, capability::SET_CURRENT_EVENT_SOURCES) => {
                let (_, mask) = capability::decode_set_current_event_sources_req(request)?;
                state.current_sources = mask;
                capability::encode_set_current_event_sources_resp(instance_id)?
            }
            (MessageType::DeviceCapability, capability::SET_EVENT_SUBSCRIPTION) => {
                let (setting, receiver) = capability::decode_set_event_subscription_req(request)?;
                state.subscription = Some((setting, receiver));
                capability::encode_set_event_subscription_resp(instance_id)?
            }
            (MessageType::DeviceCapability, capability::CONFIGURE_EVENT_ACKNOWLEDGEMENT) => {
                let (_, mask) =
                    capability::decode_configure_event_acknowledgement_req(request)?;
                state.ack_mask = mask;
                capability::encode_configure_event_acknowledgement_resp(instance_id, &mask)?
            }
            (MessageType::Telemetry, telemetry::GET_TEMPERATURE_READING) => {
                telemetry::decode_temperature_req(request)?;
                telemetry::encode_temperature_resp(instance_id, state.temperature_c)?
            }
            (MessageType::Telemetry, telemetry::GET_CURRENT_POWER_DRAW) => {
                let (sensor_id, _avg) = telemetry::decode_power_draw_req(request)?;
                if sensor_id == telemetry::AGGREGATE_SENSOR_ID {
                    let samples: Vec<(u8, bool, &[u8])> = state
                        .aggregate_samples
                        .iter()
                        .map(|(tag, valid, data)| (*tag, *valid, data.as_slice()))
                        .collect();
                    aggregate::encode_aggregate_response(
                        instance_id,
                        MessageType::Telemetry,
                        command,
                        &samples,
                    )?
                } else {
                    telemetry::encode_power_draw_resp(instance_id, state.power_w)?
                }
            }
            (MessageType::Telemetry, telemetry::GET_CURRENT_ENERGY_COUNT) => {
                telemetry::decode_energy_count_req(request)?;
                telemetry::encode_energy_count_resp(instance_id, state.energy_j)?
            }
            (MessageType::Telemetry, telemetry::GET_INVENTORY_INFORMATION) => {
                let property = telemetry::decode_inventory_req(request)?;
                match state.inventory.get(&property.to_wire()) {
                    Some(value) => telemetry::encode_inventory_resp(instance_id, value)?,
                    None => msg::encode_refusal(
                        instance_id,
                        message_type,
                        command,
                        CompletionCode::Unavailable,
                        0,
                    ),
                }
            }
            (MessageType::Telemetry, telemetry::SET_POWER_LIMIT) => {
                let watts = telemetry::decode_set_power_limit_req(request)?;
                state.power_limit_w = watts;
                if let Some(delay) = state.long_running_delay {
                    let events = self.events.lock().unwrap().clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let data = telemetry::encode_power_limit_event_data(watts);
                        let frame = capability::encode_long_running_event(
                            instance_id,
                            false,
                            LongRunningState {
                                message_type: MessageType::Telemetry,
                                command: telemetry::SET_POWER_LIMIT,
                            },
                            &data,
                        )
                        .unwrap();
                        if let Some(tx) = events {
                            let _ = tx.send((eid, frame)).await;
                        }
                    });
                }
                msg::encode_refusal(
                    instance_id,
                    message_type,
                    command,
                    CompletionCode::Accepted,
                    0,
                )
            }
            (MessageType::Telemetry, telemetry::GET_GPU_PRESENCE) => {
                telemetry::decode_gpu_presence_req(request)?;
                telemetry::encode_gpu_presence_resp(instance_id, state.presence)?
            }
            (MessageType::Telemetry, telemetry::GET_POWER_SUPPLY_STATUS) => {
                telemetry::decode_power_supply_status_req(request)?;
                telemetry::encode_power_supply_status_resp(instance_id, state.power_status)?
            }
            (MessageType::NetworkPort, telemetry::GET_PORT_BANDWIDTH) => {
                telemetry::decode_port_bandwidth_req(request)?;
                telemetry::encode_port_bandwidth_resp(instance_id, state.port_gbps)?
            }
            _ => msg::encode_refusal(
                instance_id,
                message_type,
                command,
                CompletionCode::UnsupportedCommand,
                0,
            ),
        };
        Ok(frame)
    }
}

#[async_trait]
impl Transport for MockDevice {
    async fn send_and_await(
        &self,
        eid: u8,
        mut request: Vec<u8>,
        timeout: Duration,
    ) -> Result<TransportReply, TransportError> {
        if request.len() > MAX_MESSAGE_LEN {
            return Err(TransportError::Encode(WireError::InvalidLength));
        }
        let instance_id = self.iids.alloc(eid, |candidate| {
            self.in_flight_ids.lock().unwrap().contains(&(eid, candidate))
        })?;
        msg::stamp_instance_id(&mut request, instance_id);
        self.in_flight_ids.lock().unwrap().insert((eid, instance_id));
        self.track_enter(eid);

        let result = async {
            let (header, command, _) =
                msg::decode_request(&request).map_err(TransportError::Encode)?;
            self.requests.lock().unwrap().push(RecordedRequest {
                eid,
                message_type: header.message_type,
                command,
                instance_id,
                at: tokio::time::Instant::now(),
            });

            let fault = self.state.lock().unwrap().faults.pop_front();
            match fault {
                Some(MockFault::Timeout) => {
                    tokio::time::sleep(timeout).await;
                    Err(TransportError::Timeout)
                }
                Some(MockFault::Refuse(completion, reason)) => Ok(TransportReply {
                    instance_id,
                    frame: msg::encode_refusal(
                        instance_id,
                        header.message_type,
                        command,
                        completion,
                        reason,
                    ),
                }),
                Some(MockFault::Garbage) => Ok(TransportReply {
                    instance_id,
                    frame: vec![0xFF; 7],
                }),
                Some(MockFault::Truncated) => {
                    let mut frame = self
                        .respond(eid, instance_id, header.message_type, command, &request)
                        .map_err(TransportError::Encode)?;
                    frame.truncate(frame.len().saturating_sub(2));
                    Ok(TransportReply { instance_id, frame })
                }
                None => {
                    let frame = self
                        .respond(eid, instance_id, header.message_type, command, &request)
                        .map_err(TransportError::Encode)?;
                    Ok(TransportReply { instance_id, frame })
                }
            }
        }
        .await;

        self.track_exit(eid);
        // A long-running admission keeps its id reserved until the
        // completion event or the engine's deregistration; everything
        // else frees the slot here. The engine's gate already prevents
        // reuse races, so the mock frees unconditionally.
        self.in_flight_ids.lock().unwrap().remove(&(eid, instance_id));
        result
    }

    async fn send_datagram(&self, eid: u8, frame: Vec<u8>) -> Result<(), TransportError> {
        self.datagrams.lock().unwrap().push((eid, frame));
        Ok(())
    }

    fn subscribe_events(&self, tx: mpsc::Sender<InboundEvent>) {
        *self.events.lock().unwrap() = Some(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_wire::CmdResponse;
    use std::sync::Arc;

    #[tokio::test]
    async fn answers_temperature_with_device_state() {
        let device = MockDevice::new();
        device.with_state(|s| s.temperature_c = -5.25);
        let reply = device
            .send_and_await(
                30,
                telemetry::encode_temperature_req(2).unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(
            telemetry::decode_temperature_resp(&reply.frame).unwrap(),
            CmdResponse::Ok(-5.25)
        );
    }

    #[tokio::test]
    async fn instance_ids_advance_per_request() {
        let device = MockDevice::new();
        let a = device
            .send_and_await(
                30,
                capability::encode_ping_req().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let b = device
            .send_and_await(
                30,
                capability::encode_ping_req().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_ne!(a.instance_id, b.instance_id);
        let requests = device.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].instance_id, a.instance_id);
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_timeout_consumes_the_deadline() {
        let device = MockDevice::new();
        device.push_fault(MockFault::Timeout);
        let start = tokio::time::Instant::now();
        let err = device
            .send_and_await(
                30,
                capability::encode_ping_req().unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_completes_itself_via_event() {
        let device = Arc::new(MockDevice::new());
        device.with_state(|s| s.long_running_delay = Some(Duration::from_millis(500)));
        let (tx, mut rx) = mpsc::channel(4);
        device.subscribe_events(tx);

        let reply = device
            .send_and_await(
                30,
                telemetry::encode_set_power_limit_req(450.0).unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let resp = msg::decode_response(&reply.frame).unwrap();
        assert_eq!(resp.completion, CompletionCode::Accepted);

        let (eid, frame) = rx.recv().await.unwrap();
        assert_eq!(eid, 30);
        let event = msg::decode_event(&frame).unwrap();
        assert!(capability::is_long_running_event(&event));
        assert_eq!(event.instance_id, reply.instance_id);
        assert_eq!(
            telemetry::decode_power_limit_event_data(&event.data).unwrap(),
            450.0
        );
    }

    #[tokio::test]
    async fn aggregate_request_returns_sample_list() {
        let device = MockDevice::new();
        device.with_state(|s| {
            s.aggregate_samples = vec![
                (0, true, 10_000u32.to_le_bytes().to_vec()),
                (1, true, 20_000u32.to_le_bytes().to_vec()),
            ];
        });
        let reply = device
            .send_and_await(
                30,
                telemetry::encode_power_draw_req(telemetry::AGGREGATE_SENSOR_ID, 0).unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let resp = aggregate::decode_aggregate_response(&reply.frame).unwrap();
        assert_eq!(resp.sample_count, 2);
    }

    #[tokio::test]
    async fn unknown_command_is_refused() {
        let device = MockDevice::new();
        let reply = device
            .send_and_await(
                30,
                msg::encode_request(MessageType::Telemetry, 0x7E, &[]).unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        let resp = msg::decode_response(&reply.frame).unwrap();
        assert_eq!(resp.completion, CompletionCode::UnsupportedCommand);
    }
}

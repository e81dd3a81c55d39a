//! The sensor engine: one scheduling loop per endpoint.
//!
//! Each loop pulls the next due sensor from its priority FIFO (scanned
//! without rotating ineligible entries) or the head of its round-robin
//! FIFO, acquires the endpoint gate, runs the request/response cycle,
//! and classifies failures per the error taxonomy: busy gets one
//! immediate retry, a timeout gets one retry and then counts toward
//! the offline threshold, two decode errors inside a ten second window
//! take the endpoint offline, unsupported-command disables the sensor
//! for good. Offline endpoints are pinged at a fixed cadence until one
//! answers.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::time::{sleep, sleep_until, Instant};

use nsm_wire::capability;
use nsm_wire::msg::{CmdResponse, CompletionCode};

use crate::config::PollingConfig;
use crate::events::{EventDispatcher, LongRunningKey};
use crate::gate::GateError;
use crate::metrics::Metrics;
use crate::registry::EndpointRegistry;
use crate::sensor::{Sensor, SensorAction, SensorError};
use crate::sinks::SinkList;
use crate::store::{EndpointId, EndpointStore, SensorId, SensorStore};
use crate::transport::{Transport, TransportError};

/// Error kinds as the rate-limited ledger sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Encode,
    Decode,
    Timeout,
    LongRunningTimeout,
    Busy,
    InvalidArgument,
    UnsupportedCommand,
    Unavailable,
    Refused,
    NotResponding,
    /// Transport-level failure that is neither a timeout nor an i/o
    /// error: closed response channel, instance id pool exhausted.
    Transport,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            Self::Encode => "encode",
            Self::Decode => "decode",
            Self::Timeout => "timeout",
            Self::LongRunningTimeout => "long_running_timeout",
            Self::Busy => "busy",
            Self::InvalidArgument => "invalid_argument",
            Self::UnsupportedCommand => "unsupported_command",
            Self::Unavailable => "unavailable",
            Self::Refused => "refused",
            Self::NotResponding => "not_responding",
            Self::Transport => "transport",
        }
    }
}

/// Rate-limited error log: the first occurrence per (sensor, kind) is
/// verbose, repeats are swallowed until the sensor succeeds once,
/// which emits a cleared record naming what was suppressed.
#[derive(Default)]
struct ErrorLedger {
    counts: HashMap<(SensorId, ErrorKind), u64>,
}

impl ErrorLedger {
    fn record(&mut self, eid: u8, sid: SensorId, name: &str, kind: ErrorKind, detail: &str) {
        let count = self.counts.entry((sid, kind)).or_insert(0);
        *count += 1;
        if *count == 1 {
            warn!(
                "[engine] eid={eid} sensor={name} error kind={}: {detail}",
                kind.label()
            );
        } else {
            debug!(
                "[engine] eid={eid} sensor={name} error kind={} repeated ({} suppressed)",
                kind.label(),
                *count - 1
            );
        }
    }

    fn clear(&mut self, eid: u8, sid: SensorId, name: &str) {
        let cleared: Vec<(ErrorKind, u64)> = self
            .counts
            .iter()
            .filter(|((id, _), _)| *id == sid)
            .map(|((_, kind), count)| (*kind, count.saturating_sub(1)))
            .collect();
        if cleared.is_empty() {
            return;
        }
        let summary = cleared
            .iter()
            .map(|(kind, suppressed)| format!("{}(+{suppressed})", kind.label()))
            .collect::<Vec<_>>()
            .join(",");
        info!("[engine] eid={eid} sensor={name} recovered; cleared errors: {summary}");
        self.counts.retain(|(id, _), _| *id != sid);
    }
}

/// What one sensor run means for the endpoint's health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Success,
    /// Sensor errored for this cycle; no endpoint-level consequence.
    Errored,
    /// Deadline elapsed twice (initial send plus the retry).
    Timeout,
    DecodeError,
    /// Transport-level failure: the endpoint is not responding.
    NotResponding,
    /// Unsupported command: drop the sensor from the queues for good.
    Disable,
    /// The gate broke underneath us (offline transition elsewhere).
    GateBroken,
}

/// Runtime schedule changes accepted while the loops are running.
pub enum ScheduleCmd {
    Add(SensorId),
    /// Round-robin sensor later marked priority.
    Promote(SensorId),
}

struct Schedule {
    priority: VecDeque<SensorId>,
    round_robin: VecDeque<SensorId>,
    last_run: HashMap<SensorId, Instant>,
    disabled: HashSet<SensorId>,
}

enum Pick {
    Run { sid: SensorId, priority: bool },
    Sleep(Instant),
    Idle,
}

impl Schedule {
    fn new() -> Self {
        Self {
            priority: VecDeque::new(),
            round_robin: VecDeque::new(),
            last_run: HashMap::new(),
            disabled: HashSet::new(),
        }
    }

    fn add(&mut self, sid: SensorId, priority: bool) {
        if self.priority.contains(&sid) || self.round_robin.contains(&sid) {
            return;
        }
        if priority {
            self.priority.push_back(sid);
        } else {
            self.round_robin.push_back(sid);
        }
    }

    fn promote(&mut self, sid: SensorId) {
        if let Some(pos) = self.round_robin.iter().position(|s| *s == sid) {
            self.round_robin.remove(pos);
            self.priority.push_back(sid);
        }
    }

    fn disable(&mut self, sid: SensorId) {
        self.disabled.insert(sid);
    }

    fn is_due(&self, sid: SensorId, store: &SensorStore, now: Instant) -> bool {
        match self.last_run.get(&sid) {
            None => true,
            Some(last) => *last + store.get(sid).meta.interval <= now,
        }
    }

    fn next(&mut self, store: &SensorStore, now: Instant) -> Pick {
        // Priority queue: first due entry anywhere; sensors inside
        // their interval are skipped in place, not rotated.
        if let Some(pos) = self
            .priority
            .iter()
            .position(|sid| !self.disabled.contains(sid) && self.is_due(*sid, store, now))
        {
            let sid = self.priority.remove(pos).unwrap();
            return Pick::Run {
                sid,
                priority: true,
            };
        }

        // Round-robin: head only.
        while let Some(&head) = self.round_robin.front() {
            if self.disabled.contains(&head) {
                self.round_robin.pop_front();
            } else {
                break;
            }
        }
        if let Some(&head) = self.round_robin.front() {
            if self.is_due(head, store, now) {
                self.round_robin.pop_front();
                return Pick::Run {
                    sid: head,
                    priority: false,
                };
            }
        }

        let earliest = self
            .priority
            .iter()
            .chain(self.round_robin.iter())
            .filter(|sid| !self.disabled.contains(sid))
            .filter_map(|sid| {
                self.last_run
                    .get(sid)
                    .map(|last| *last + store.get(*sid).meta.interval)
            })
            .min();
        match earliest {
            Some(deadline) => Pick::Sleep(deadline),
            None => Pick::Idle,
        }
    }

    fn requeue(&mut self, sid: SensorId, priority: bool) {
        if self.disabled.contains(&sid) {
            return;
        }
        if priority {
            self.priority.push_back(sid);
        } else {
            self.round_robin.push_back(sid);
        }
    }
}

pub struct SensorEngine {
    cfg: PollingConfig,
    endpoints: Arc<EndpointStore>,
    sensors: Arc<SensorStore>,
    registry: Arc<EndpointRegistry>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<EventDispatcher>,
    sinks: Arc<SinkList>,
    metrics: Arc<Metrics>,
    pending: StdMutex<HashMap<EndpointId, Vec<ScheduleCmd>>>,
}

impl SensorEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PollingConfig,
        endpoints: Arc<EndpointStore>,
        sensors: Arc<SensorStore>,
        registry: Arc<EndpointRegistry>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<EventDispatcher>,
        sinks: Arc<SinkList>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            endpoints,
            sensors,
            registry,
            transport,
            dispatcher,
            sinks,
            metrics,
            pending: StdMutex::new(HashMap::new()),
        })
    }

    /// Spawn one scheduling loop per endpoint.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        self.endpoints
            .ids()
            .map(|endpoint| {
                let engine = Arc::clone(self);
                tokio::spawn(async move { engine.run_endpoint(endpoint).await })
            })
            .collect()
    }

    /// Queue a schedule change for an endpoint's loop; it is applied
    /// between sensor operations.
    pub fn enqueue(&self, endpoint: EndpointId, cmd: ScheduleCmd) {
        self.pending.lock().unwrap().entry(endpoint).or_default().push(cmd);
    }

    fn drain_pending(&self, endpoint: EndpointId, sched: &mut Schedule) {
        let cmds = self.pending.lock().unwrap().remove(&endpoint);
        for cmd in cmds.into_iter().flatten() {
            match cmd {
                ScheduleCmd::Add(sid) => {
                    let priority = self.sensors.get(sid).meta.priority;
                    sched.add(sid, priority);
                }
                ScheduleCmd::Promote(sid) => sched.promote(sid),
            }
        }
    }

    async fn run_endpoint(self: Arc<Self>, endpoint: EndpointId) {
        let entry = self.endpoints.get(endpoint);
        let uuid = entry.uuid;
        let mut sched = Schedule::new();
        for sid in self.sensors.ids_for_endpoint(endpoint) {
            sched.add(sid, self.sensors.get(sid).meta.priority);
        }
        info!(
            "[engine] loop for {uuid}: {} priority, {} round-robin sensors",
            sched.priority.len(),
            sched.round_robin.len()
        );

        let mut offline = false;
        let mut consecutive_timeouts = 0u32;
        let mut decode_errors: VecDeque<Instant> = VecDeque::new();
        let mut ledger = ErrorLedger::default();

        loop {
            self.drain_pending(endpoint, &mut sched);

            let Some(eid) = self.registry.preferred_eid(&uuid) else {
                debug!("[engine] {uuid} has no route yet");
                sleep(self.cfg.offline_ping()).await;
                continue;
            };

            if offline {
                sleep(self.cfg.offline_ping()).await;
                if self.ping(eid).await {
                    offline = false;
                    consecutive_timeouts = 0;
                    decode_errors.clear();
                    entry.gate.reopen();
                    self.registry.restore_eid(uuid, eid);
                    self.metrics.record_online();
                    info!("[engine] eid={eid} answered ping, back online");
                }
                continue;
            }

            let now = Instant::now();
            match sched.next(&self.sensors, now) {
                Pick::Run { sid, priority } => {
                    let outcome = self.run_sensor(eid, sid, &mut ledger).await;
                    if outcome == RunOutcome::Disable {
                        sched.disable(sid);
                        warn!(
                            "[engine] eid={eid} sensor={} disabled (unsupported command)",
                            self.sensors.get(sid).meta.name
                        );
                    }
                    sched.requeue(sid, priority);
                    sched.last_run.insert(sid, Instant::now());

                    match outcome {
                        RunOutcome::Success => {
                            consecutive_timeouts = 0;
                        }
                        RunOutcome::Timeout => {
                            consecutive_timeouts += 1;
                            if consecutive_timeouts >= 2 {
                                self.go_offline(eid, entry, &mut offline);
                            }
                        }
                        RunOutcome::DecodeError => {
                            let now = Instant::now();
                            decode_errors.push_back(now);
                            let window = self.cfg.decode_error_window();
                            while decode_errors
                                .front()
                                .is_some_and(|t| now.duration_since(*t) > window)
                            {
                                decode_errors.pop_front();
                            }
                            if decode_errors.len() >= 2 {
                                self.go_offline(eid, entry, &mut offline);
                            }
                        }
                        RunOutcome::NotResponding => {
                            self.go_offline(eid, entry, &mut offline);
                        }
                        RunOutcome::Errored
                        | RunOutcome::Disable
                        | RunOutcome::GateBroken => {}
                    }
                }
                Pick::Sleep(deadline) => {
                    let floor = now + self.cfg.tick_min();
                    sleep_until(deadline.max(floor)).await;
                }
                Pick::Idle => {
                    sleep(self.cfg.default_interval()).await;
                }
            }
        }
    }

    fn go_offline(&self, eid: u8, entry: &crate::store::EndpointEntry, offline: &mut bool) {
        if *offline {
            return;
        }
        *offline = true;
        warn!("[engine] eid={eid} marked offline");
        self.metrics.record_offline();
        // Pending awaiters resolve with an error; the eid index entry
        // goes away while the UUID and its routes stay.
        entry.gate.break_waiters();
        self.registry.clear_eid(eid);
    }

    async fn ping(&self, eid: u8) -> bool {
        let Ok(request) = capability::encode_ping_req() else {
            return false;
        };
        match self
            .transport
            .send_and_await(eid, request, self.cfg.request_timeout())
            .await
        {
            Ok(reply) => matches!(
                capability::decode_ping_resp(&reply.frame),
                Ok(CmdResponse::Ok(()))
            ),
            Err(_) => false,
        }
    }

    async fn run_sensor(&self, eid: u8, sid: SensorId, ledger: &mut ErrorLedger) -> RunOutcome {
        let slot = self.sensors.get(sid);
        let name = slot.meta.name.clone();
        let endpoint = self.endpoints.get(slot.meta.endpoint);

        // The permit is held for the sensor's whole run, including a
        // long-running completion wait; dropping it on any return path
        // releases the gate.
        let _permit = match endpoint.gate.acquire().await {
            Ok(permit) => permit,
            Err(GateError::Offline) => return RunOutcome::GateBroken,
        };
        let mut body = slot.body.lock().await;

        let request = match body.make_request() {
            Ok(request) => request,
            Err(e) => {
                // A codec rejection of our own inputs is a programming
                // error; surface it and do not retry.
                ledger.record(eid, sid, &name, ErrorKind::Encode, &e.to_string());
                return RunOutcome::Errored;
            }
        };

        let mut retried_timeout = false;
        let mut retried_busy = false;
        loop {
            self.metrics.record_request();
            let reply = self
                .transport
                .send_and_await(eid, request.clone(), slot.meta.timeout)
                .await;
            let reply = match reply {
                Ok(reply) => reply,
                Err(TransportError::Timeout) => {
                    self.metrics.record_timeout();
                    if !retried_timeout {
                        retried_timeout = true;
                        debug!("[engine] eid={eid} sensor={name} timed out, retrying once");
                        continue;
                    }
                    ledger.record(eid, sid, &name, ErrorKind::Timeout, "request timed out twice");
                    return RunOutcome::Timeout;
                }
                Err(TransportError::Io(e)) => {
                    ledger.record(eid, sid, &name, ErrorKind::NotResponding, &e.to_string());
                    return RunOutcome::NotResponding;
                }
                // The codec rejected our own request bytes; a
                // programming error, never retried.
                Err(TransportError::Encode(e)) => {
                    ledger.record(eid, sid, &name, ErrorKind::Encode, &e.to_string());
                    return RunOutcome::Errored;
                }
                Err(TransportError::Closed) => {
                    ledger.record(eid, sid, &name, ErrorKind::Transport, "response channel closed");
                    return RunOutcome::Errored;
                }
                Err(e @ TransportError::InstanceIdsExhausted(_)) => {
                    ledger.record(eid, sid, &name, ErrorKind::Transport, &e.to_string());
                    return RunOutcome::Errored;
                }
            };
            self.metrics.record_response();

            return match body.handle_response(&reply.frame, &self.sinks).await {
                Ok(SensorAction::Done) => {
                    ledger.clear(eid, sid, &name);
                    RunOutcome::Success
                }
                Ok(SensorAction::AwaitCompletion) => {
                    let outcome = self
                        .await_completion(eid, sid, &name, &mut body, reply.instance_id, ledger)
                        .await;
                    if outcome == RunOutcome::Success {
                        ledger.clear(eid, sid, &name);
                    }
                    outcome
                }
                Err(SensorError::Refused { completion, reason }) => {
                    self.metrics.record_refusal();
                    match completion {
                        CompletionCode::Busy if !retried_busy => {
                            retried_busy = true;
                            debug!("[engine] eid={eid} sensor={name} busy, retrying once");
                            continue;
                        }
                        CompletionCode::Busy => {
                            ledger.record(eid, sid, &name, ErrorKind::Busy, "busy after retry");
                            RunOutcome::Errored
                        }
                        CompletionCode::UnsupportedCommand => {
                            ledger.record(
                                eid,
                                sid,
                                &name,
                                ErrorKind::UnsupportedCommand,
                                &format!("reason {reason:#06x}"),
                            );
                            RunOutcome::Disable
                        }
                        CompletionCode::InvalidArgument => {
                            ledger.record(
                                eid,
                                sid,
                                &name,
                                ErrorKind::InvalidArgument,
                                &format!("reason {reason:#06x}"),
                            );
                            RunOutcome::Errored
                        }
                        CompletionCode::Unavailable => {
                            ledger.record(
                                eid,
                                sid,
                                &name,
                                ErrorKind::Unavailable,
                                &format!("reason {reason:#06x}"),
                            );
                            RunOutcome::Errored
                        }
                        other => {
                            ledger.record(
                                eid,
                                sid,
                                &name,
                                ErrorKind::Refused,
                                &format!("cc {:#04x} reason {reason:#06x}", other.to_wire()),
                            );
                            RunOutcome::Errored
                        }
                    }
                }
                Err(SensorError::Decode(e)) => {
                    self.metrics.record_decode_error();
                    ledger.record(eid, sid, &name, ErrorKind::Decode, &e.to_string());
                    RunOutcome::DecodeError
                }
                Err(e) => {
                    ledger.record(eid, sid, &name, ErrorKind::Refused, &e.to_string());
                    RunOutcome::Errored
                }
            };
        }
    }

    /// Long-running second half: the admission response arrived, so
    /// park on the dispatcher until the completion event with our
    /// correlation tuple shows up - still holding the endpoint gate.
    async fn await_completion(
        &self,
        eid: u8,
        sid: SensorId,
        name: &str,
        body: &mut crate::sensor::SensorKind,
        instance_id: u8,
        ledger: &mut ErrorLedger,
    ) -> RunOutcome {
        let (message_type, command) = body.correlation();
        let key = LongRunningKey {
            eid,
            message_type,
            command,
            instance_id,
        };
        let rx = match self.dispatcher.register_long_running(key) {
            Ok(rx) => rx,
            Err(e) => {
                error!("[engine] eid={eid} sensor={name} waiter registration failed: {e}");
                return RunOutcome::Errored;
            }
        };
        match tokio::time::timeout(self.cfg.long_running_timeout(), rx).await {
            Ok(Ok(event)) => match body.on_completion_event(&event, &self.sinks).await {
                Ok(()) => RunOutcome::Success,
                Err(e) => {
                    self.metrics.record_decode_error();
                    ledger.record(eid, sid, name, ErrorKind::Decode, &e.to_string());
                    RunOutcome::DecodeError
                }
            },
            Ok(Err(_)) => {
                error!("[engine] eid={eid} sensor={name} completion channel dropped");
                RunOutcome::Errored
            }
            Err(_) => {
                self.dispatcher.cancel_long_running(&key);
                self.metrics.record_long_running_timeout();
                ledger.record(
                    eid,
                    sid,
                    name,
                    ErrorKind::LongRunningTimeout,
                    "no completion event before deadline",
                );
                RunOutcome::Errored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{
        NumericReading, PowerCapSensor, PowerDrawSensor, SensorKind, TemperatureSensor,
    };
    use crate::store::SensorMeta;
    use crate::transport::mock::{MockDevice, MockFault};
    use nsm_wire::telemetry;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const EID: u8 = 30;

    struct Harness {
        engine: Arc<SensorEngine>,
        device: Arc<MockDevice>,
        registry: Arc<EndpointRegistry>,
        metrics: Arc<Metrics>,
        handles: Vec<tokio::task::JoinHandle<()>>,
        _intake: tokio::task::JoinHandle<()>,
        endpoint: EndpointId,
    }

    impl Harness {
        fn stop(&self) {
            for handle in &self.handles {
                handle.abort();
            }
        }
    }

    fn meta(
        endpoint: EndpointId,
        name: &str,
        priority: bool,
        interval: Duration,
        long_running: bool,
    ) -> SensorMeta {
        SensorMeta {
            name: name.to_string(),
            endpoint,
            priority,
            interval,
            timeout: Duration::from_secs(2),
            long_running,
        }
    }

    fn build(sensors: Vec<(SensorMeta, SensorKind)>) -> Harness {
        let device = Arc::new(MockDevice::new());
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(EndpointRegistry::new());
        let uuid = Uuid::from_bytes([1; 16]);
        registry.upsert(uuid, EID, crate::registry::MediumClass::Pcie);

        let mut endpoints = EndpointStore::new();
        let endpoint = endpoints.insert(uuid, EID);
        let mut store = SensorStore::new();
        for (meta, body) in sensors {
            store.insert(meta, body);
        }

        let transport: Arc<dyn Transport> = device.clone();
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&transport),
            Arc::clone(&metrics),
        ));
        let (event_tx, event_rx) = mpsc::channel(64);
        device.subscribe_events(event_tx);
        let intake = Arc::clone(&dispatcher).spawn_intake(event_rx);

        let engine = SensorEngine::new(
            PollingConfig::default(),
            Arc::new(endpoints),
            Arc::new(store),
            Arc::clone(&registry),
            transport,
            dispatcher,
            Arc::new(SinkList::new()),
            Arc::clone(&metrics),
        );
        let handles = engine.start();
        Harness {
            engine,
            device,
            registry,
            metrics,
            handles,
            _intake: intake,
            endpoint,
        }
    }

    fn temperature(endpoint: EndpointId, name: &str, priority: bool, interval_ms: u64)
        -> (SensorMeta, SensorKind) {
        (
            meta(endpoint, name, priority, Duration::from_millis(interval_ms), false),
            SensorKind::Temperature(TemperatureSensor {
                sensor_id: 2,
                reading: NumericReading::new(format!("/sensors/{name}"), "Value"),
            }),
        )
    }

    fn power(endpoint: EndpointId, name: &str, interval_ms: u64) -> (SensorMeta, SensorKind) {
        (
            meta(endpoint, name, false, Duration::from_millis(interval_ms), false),
            SensorKind::PowerDraw(PowerDrawSensor {
                sensor_id: 0,
                averaging_interval: 0,
                reading: NumericReading::new(format!("/sensors/{name}"), "Value"),
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn requests_on_one_endpoint_never_overlap() {
        let endpoint = EndpointId(0);
        let harness = build(vec![
            temperature(endpoint, "temp0", false, 100),
            power(endpoint, "power0", 100),
        ]);
        sleep(Duration::from_millis(1050)).await;
        harness.stop();

        assert_eq!(harness.device.max_in_flight(EID), 1);
        assert!(harness.device.requests_for(EID, telemetry::GET_TEMPERATURE_READING) >= 5);
        assert!(harness.device.requests_for(EID, telemetry::GET_CURRENT_POWER_DRAW) >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_respect_the_refresh_interval() {
        let endpoint = EndpointId(0);
        let harness = build(vec![temperature(endpoint, "temp0", false, 500)]);
        sleep(Duration::from_millis(2250)).await;
        harness.stop();

        let times = harness
            .device
            .request_times(EID, telemetry::GET_TEMPERATURE_READING);
        assert!(times.len() >= 4, "expected several polls, got {}", times.len());
        for pair in times.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(500),
                "polls closer than the refresh interval"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn priority_sensors_run_before_round_robin() {
        let endpoint = EndpointId(0);
        let harness = build(vec![
            power(endpoint, "rr", 100),
            temperature(endpoint, "prio", true, 100),
        ]);
        sleep(Duration::from_millis(550)).await;
        harness.stop();

        let requests = harness.device.recorded_requests();
        assert!(!requests.is_empty());
        // The priority sensor goes first every cycle.
        assert_eq!(requests[0].command, telemetry::GET_TEMPERATURE_READING);
        let prio = harness.device.requests_for(EID, telemetry::GET_TEMPERATURE_READING);
        let rr = harness.device.requests_for(EID, telemetry::GET_CURRENT_POWER_DRAW);
        assert!(prio >= rr);
    }

    #[tokio::test(start_paused = true)]
    async fn two_timed_out_polls_take_the_endpoint_offline_and_ping_recovers_it() {
        let endpoint = EndpointId(0);
        let harness = build(vec![temperature(endpoint, "temp0", false, 500)]);
        // Each poll burns the initial send plus one retry.
        for _ in 0..4 {
            harness.device.push_fault(MockFault::Timeout);
        }
        sleep(Duration::from_millis(12_000)).await;
        harness.stop();

        assert_eq!(harness.metrics.offline_transitions(), 1);
        assert!(harness.device.requests_for(EID, capability::PING) >= 1);
        // Recovered: polling resumed after the first successful ping.
        let times = harness
            .device
            .request_times(EID, telemetry::GET_TEMPERATURE_READING);
        let pings = harness.device.request_times(EID, capability::PING);
        let first_ping = pings[0];
        assert!(
            times.iter().any(|t| *t > first_ping),
            "no temperature poll after recovery"
        );
        // While offline, no sensor polls happened between the last
        // pre-ping poll and the first ping.
        let offline_window: Vec<_> = times
            .iter()
            .filter(|t| **t > first_ping - Duration::from_millis(900) && **t < first_ping)
            .collect();
        assert!(offline_window.is_empty());
        assert_eq!(harness.registry.uuid_for_eid(EID), Some(Uuid::from_bytes([1; 16])));
    }

    #[tokio::test(start_paused = true)]
    async fn two_decode_errors_in_window_take_the_endpoint_offline() {
        let endpoint = EndpointId(0);
        let harness = build(vec![temperature(endpoint, "temp0", false, 100)]);
        harness.device.push_fault(MockFault::Garbage);
        harness.device.push_fault(MockFault::Garbage);
        sleep(Duration::from_millis(400)).await;
        harness.stop();

        assert_eq!(harness.metrics.offline_transitions(), 1);
        assert!(harness.metrics.decode_errors_total() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_gets_exactly_one_immediate_retry() {
        let endpoint = EndpointId(0);
        let harness = build(vec![temperature(endpoint, "temp0", false, 60_000)]);
        harness
            .device
            .push_fault(MockFault::Refuse(CompletionCode::Busy, 0));
        sleep(Duration::from_millis(500)).await;
        harness.stop();

        // One poll: busy answer plus the immediate retry.
        assert_eq!(
            harness.device.requests_for(EID, telemetry::GET_TEMPERATURE_READING),
            2
        );
        assert_eq!(harness.metrics.offline_transitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_command_disables_the_sensor_permanently() {
        let endpoint = EndpointId(0);
        let harness = build(vec![temperature(endpoint, "temp0", false, 100)]);
        harness
            .device
            .push_fault(MockFault::Refuse(CompletionCode::UnsupportedCommand, 0));
        sleep(Duration::from_millis(2000)).await;
        harness.stop();

        assert_eq!(
            harness.device.requests_for(EID, telemetry::GET_TEMPERATURE_READING),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn long_running_holds_the_gate_until_completion() {
        let endpoint = EndpointId(0);
        let cap = (
            meta(endpoint, "cap", true, Duration::from_secs(3600), true),
            SensorKind::PowerCap(PowerCapSensor {
                limit_watts: 450.0,
                reading: NumericReading::new("/control/gpu0/cap", "Value"),
            }),
        );
        let harness = build(vec![cap, temperature(endpoint, "temp0", false, 100)]);
        harness
            .device
            .with_state(|s| s.long_running_delay = Some(Duration::from_millis(500)));
        sleep(Duration::from_millis(2000)).await;
        harness.stop();

        // Gate held across the whole completion window: nothing
        // overlapped, and the temperature sensor still got through
        // afterwards.
        assert_eq!(harness.device.max_in_flight(EID), 1);
        assert_eq!(harness.metrics.offline_transitions(), 0);
        let cap_times = harness.device.request_times(EID, telemetry::SET_POWER_LIMIT);
        assert_eq!(cap_times.len(), 1);
        let temp_times = harness
            .device
            .request_times(EID, telemetry::GET_TEMPERATURE_READING);
        assert!(!temp_times.is_empty());
        // No temperature request landed inside the completion window.
        let window_end = cap_times[0] + Duration::from_millis(500);
        assert!(temp_times.iter().all(|t| *t >= window_end));
        assert_eq!(harness.engine.dispatcher.pending_long_running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn promote_moves_a_sensor_to_the_priority_queue() {
        let endpoint = EndpointId(0);
        let harness = build(vec![
            power(endpoint, "rr0", 100),
            power(endpoint, "rr1", 100),
        ]);
        sleep(Duration::from_millis(150)).await;
        harness
            .engine
            .enqueue(harness.endpoint, ScheduleCmd::Promote(SensorId(1)));
        sleep(Duration::from_millis(500)).await;
        harness.stop();
        // Both still polled; the promoted one did not starve.
        assert!(harness.device.requests_for(EID, telemetry::GET_CURRENT_POWER_DRAW) >= 6);
    }
}

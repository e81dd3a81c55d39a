//! Sensors: configured units that each own one NSM command and route
//! its decoded result to the sinks.
//!
//! The capability set is three operations - produce request bytes,
//! consume the response, consume a long-running completion event -
//! behind a small trait, with the concrete kinds enumerated in
//! `SensorKind` rather than an inheritance lattice.

pub mod aggregate;
pub mod factory;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;

use nsm_wire::msg::{CmdResponse, CompletionCode, EventFrame, MessageType, WireError};
use nsm_wire::telemetry::{self, InventoryProperty};

use crate::sinks::{now_timestamp_ms, Reading, SinkList, SinkValue};

pub use aggregate::AggregateSensor;

pub const SENSOR_VALUE_INTERFACE: &str = "xyz.openbmc_project.Sensor.Value";
pub const STATE_DECORATOR_INTERFACE: &str = "xyz.openbmc_project.State.Decorator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("request encode failed: {0}")]
    Encode(WireError),
    #[error("response decode failed: {0}")]
    Decode(WireError),
    #[error("endpoint refused: {completion:?} (reason {reason:#06x})")]
    Refused { completion: CompletionCode, reason: u16 },
    #[error("completion event did not match a pending command")]
    UnexpectedEvent,
}

/// What the engine should do after a response was consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAction {
    Done,
    /// The response was an admission; hold the endpoint gate and wait
    /// for the completion event.
    AwaitCompletion,
}

#[async_trait]
pub trait Sensor: Send {
    /// (message type, command) - the correlation half that is known
    /// statically; the transport adds endpoint and instance id.
    fn correlation(&self) -> (MessageType, u8);

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError>;

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError>;

    async fn on_completion_event(
        &mut self,
        event: &EventFrame,
        sinks: &SinkList,
    ) -> Result<(), SensorError> {
        let _ = (event, sinks);
        Err(SensorError::UnexpectedEvent)
    }
}

/// Output binding of one scalar: object path, interface and property
/// the sinks receive it under. Publishing a value also marks the
/// object available and functional.
#[derive(Debug, Clone)]
pub struct NumericReading {
    pub object_path: String,
    pub interface: String,
    pub property: String,
}

impl NumericReading {
    pub fn new(object_path: impl Into<String>, property: impl Into<String>) -> Self {
        Self {
            object_path: object_path.into(),
            interface: SENSOR_VALUE_INTERFACE.to_string(),
            property: property.into(),
        }
    }

    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = interface.to_string();
        self
    }

    pub async fn update(&self, sinks: &SinkList, value: SinkValue, timestamp_ms: Option<u64>) {
        sinks
            .publish(&Reading {
                object_path: self.object_path.clone(),
                interface: self.interface.clone(),
                property: self.property.clone(),
                value,
                timestamp_ms: timestamp_ms.unwrap_or_else(now_timestamp_ms),
            })
            .await;
        sinks.publish_status(&self.object_path, true, true).await;
    }

    pub async fn mark_not_working(&self, sinks: &SinkList) {
        sinks.publish_status(&self.object_path, false, false).await;
    }
}

fn refusal_err<T>(resp: CmdResponse<T>) -> Result<T, SensorError> {
    match resp {
        CmdResponse::Ok(value) => Ok(value),
        CmdResponse::Refused { completion, reason } => {
            Err(SensorError::Refused { completion, reason })
        }
    }
}

// --- concrete kinds ---

pub struct TemperatureSensor {
    pub sensor_id: u8,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for TemperatureSensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, telemetry::GET_TEMPERATURE_READING)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_temperature_req(self.sensor_id).map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = telemetry::decode_temperature_resp(frame).map_err(SensorError::Decode)?;
        match refusal_err(resp) {
            Ok(celsius) => {
                self.reading.update(sinks, SinkValue::Number(celsius), None).await;
                Ok(SensorAction::Done)
            }
            Err(err) => {
                self.reading.mark_not_working(sinks).await;
                Err(err)
            }
        }
    }
}

pub struct PowerDrawSensor {
    pub sensor_id: u8,
    pub averaging_interval: u8,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for PowerDrawSensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, telemetry::GET_CURRENT_POWER_DRAW)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_power_draw_req(self.sensor_id, self.averaging_interval)
            .map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = telemetry::decode_power_draw_resp(frame).map_err(SensorError::Decode)?;
        match refusal_err(resp) {
            Ok(watts) => {
                self.reading.update(sinks, SinkValue::Number(watts), None).await;
                Ok(SensorAction::Done)
            }
            Err(err) => {
                self.reading.mark_not_working(sinks).await;
                Err(err)
            }
        }
    }
}

pub struct EnergySensor {
    pub sensor_id: u8,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for EnergySensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, telemetry::GET_CURRENT_ENERGY_COUNT)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_energy_count_req(self.sensor_id).map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = telemetry::decode_energy_count_resp(frame).map_err(SensorError::Decode)?;
        match refusal_err(resp) {
            Ok(joules) => {
                self.reading.update(sinks, SinkValue::Number(joules), None).await;
                Ok(SensorAction::Done)
            }
            Err(err) => {
                self.reading.mark_not_working(sinks).await;
                Err(err)
            }
        }
    }
}

pub struct PortBandwidthSensor {
    pub port_id: u8,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for PortBandwidthSensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::NetworkPort, telemetry::GET_PORT_BANDWIDTH)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_port_bandwidth_req(self.port_id).map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = telemetry::decode_port_bandwidth_resp(frame).map_err(SensorError::Decode)?;
        match refusal_err(resp) {
            Ok(gbps) => {
                self.reading.update(sinks, SinkValue::Number(gbps), None).await;
                Ok(SensorAction::Done)
            }
            Err(err) => {
                self.reading.mark_not_working(sinks).await;
                Err(err)
            }
        }
    }
}

/// Whether an inventory property publishes as text or as an integer.
fn property_is_textual(property: InventoryProperty) -> bool {
    !matches!(
        property,
        InventoryProperty::ProductLength
            | InventoryProperty::ProductWidth
            | InventoryProperty::ProductHeight
            | InventoryProperty::MinimumDevicePowerLimit
            | InventoryProperty::MaximumDevicePowerLimit
            | InventoryProperty::RatedModulePowerLimit
    )
}

pub struct InventorySensor {
    pub property: InventoryProperty,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for InventorySensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, telemetry::GET_INVENTORY_INFORMATION)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_inventory_req(self.property).map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = telemetry::decode_inventory_resp(frame).map_err(SensorError::Decode)?;
        match refusal_err(resp) {
            Ok(value) => {
                let published = if property_is_textual(self.property) {
                    match value.as_string() {
                        Some(text) => SinkValue::Text(text),
                        None => return Err(SensorError::Decode(WireError::InvalidData)),
                    }
                } else {
                    match value.as_u64() {
                        Some(raw) => SinkValue::Number(raw as f64),
                        None => return Err(SensorError::Decode(WireError::InvalidData)),
                    }
                };
                self.reading.update(sinks, published, None).await;
                Ok(SensorAction::Done)
            }
            Err(err) => {
                self.reading.mark_not_working(sinks).await;
                Err(err)
            }
        }
    }
}

/// Long-running power cap. The immediate response is only an
/// admission; the applied limit arrives later as a completion event
/// while this sensor still holds the endpoint gate.
pub struct PowerCapSensor {
    pub limit_watts: f64,
    pub reading: NumericReading,
}

#[async_trait]
impl Sensor for PowerCapSensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, telemetry::SET_POWER_LIMIT)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        telemetry::encode_set_power_limit_req(self.limit_watts).map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = nsm_wire::msg::decode_response(frame).map_err(SensorError::Decode)?;
        match resp.completion {
            CompletionCode::Accepted => Ok(SensorAction::AwaitCompletion),
            // Some firmware applies small moves synchronously.
            CompletionCode::Success => {
                self.reading
                    .update(sinks, SinkValue::Number(self.limit_watts), None)
                    .await;
                Ok(SensorAction::Done)
            }
            completion => {
                self.reading.mark_not_working(sinks).await;
                Err(SensorError::Refused {
                    completion,
                    reason: resp.reason,
                })
            }
        }
    }

    async fn on_completion_event(
        &mut self,
        event: &EventFrame,
        sinks: &SinkList,
    ) -> Result<(), SensorError> {
        let applied = telemetry::decode_power_limit_event_data(&event.data)
            .map_err(SensorError::Decode)?;
        if (applied - self.limit_watts).abs() > f64::EPSILON {
            warn!(
                "[sensor] power cap clamped by device: asked {} W, applied {} W",
                self.limit_watts, applied
            );
        }
        self.reading.update(sinks, SinkValue::Number(applied), None).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceStage {
    Presence,
    Power,
}

/// One configured object covering two state fields. Each poll performs
/// one step - presence, then power status - gated by the internal
/// stage field.
pub struct PresencePowerSensor {
    stage: PresenceStage,
    pub presence: NumericReading,
    pub power_state: NumericReading,
}

impl PresencePowerSensor {
    pub fn new(object_path: &str) -> Self {
        Self {
            stage: PresenceStage::Presence,
            presence: NumericReading::new(object_path, "Present")
                .with_interface(STATE_DECORATOR_INTERFACE),
            power_state: NumericReading::new(object_path, "PowerState")
                .with_interface(STATE_DECORATOR_INTERFACE),
        }
    }
}

#[async_trait]
impl Sensor for PresencePowerSensor {
    fn correlation(&self) -> (MessageType, u8) {
        match self.stage {
            PresenceStage::Presence => (MessageType::Telemetry, telemetry::GET_GPU_PRESENCE),
            PresenceStage::Power => (MessageType::Telemetry, telemetry::GET_POWER_SUPPLY_STATUS),
        }
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        match self.stage {
            PresenceStage::Presence => {
                telemetry::encode_gpu_presence_req().map_err(SensorError::Encode)
            }
            PresenceStage::Power => {
                telemetry::encode_power_supply_status_req().map_err(SensorError::Encode)
            }
        }
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        match self.stage {
            PresenceStage::Presence => {
                let resp =
                    telemetry::decode_gpu_presence_resp(frame).map_err(SensorError::Decode)?;
                let present = refusal_err(resp)?;
                self.presence.update(sinks, SinkValue::Bool(present), None).await;
                self.stage = PresenceStage::Power;
            }
            PresenceStage::Power => {
                let resp = telemetry::decode_power_supply_status_resp(frame)
                    .map_err(SensorError::Decode)?;
                let status = refusal_err(resp)?;
                self.power_state
                    .update(sinks, SinkValue::Number(status as f64), None)
                    .await;
                self.stage = PresenceStage::Presence;
            }
        }
        Ok(SensorAction::Done)
    }
}

/// The tagged variant the engine schedules. Dispatch is a plain match;
/// adding a kind means adding an arm, which the compiler enforces.
pub enum SensorKind {
    Temperature(TemperatureSensor),
    PowerDraw(PowerDrawSensor),
    Energy(EnergySensor),
    PortBandwidth(PortBandwidthSensor),
    Inventory(InventorySensor),
    PowerCap(PowerCapSensor),
    PresencePower(PresencePowerSensor),
    Aggregate(AggregateSensor),
}

impl SensorKind {
    fn as_sensor(&mut self) -> &mut dyn Sensor {
        match self {
            Self::Temperature(s) => s,
            Self::PowerDraw(s) => s,
            Self::Energy(s) => s,
            Self::PortBandwidth(s) => s,
            Self::Inventory(s) => s,
            Self::PowerCap(s) => s,
            Self::PresencePower(s) => s,
            Self::Aggregate(s) => s,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Temperature(_) => "temperature",
            Self::PowerDraw(_) => "power",
            Self::Energy(_) => "energy",
            Self::PortBandwidth(_) => "port_bandwidth",
            Self::Inventory(_) => "inventory",
            Self::PowerCap(_) => "power_cap",
            Self::PresencePower(_) => "presence_power",
            Self::Aggregate(_) => "aggregate",
        }
    }
}

#[async_trait]
impl Sensor for SensorKind {
    fn correlation(&self) -> (MessageType, u8) {
        match self {
            Self::Temperature(s) => s.correlation(),
            Self::PowerDraw(s) => s.correlation(),
            Self::Energy(s) => s.correlation(),
            Self::PortBandwidth(s) => s.correlation(),
            Self::Inventory(s) => s.correlation(),
            Self::PowerCap(s) => s.correlation(),
            Self::PresencePower(s) => s.correlation(),
            Self::Aggregate(s) => s.correlation(),
        }
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        self.as_sensor().make_request()
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        self.as_sensor().handle_response(frame, sinks).await
    }

    async fn on_completion_event(
        &mut self,
        event: &EventFrame,
        sinks: &SinkList,
    ) -> Result<(), SensorError> {
        self.as_sensor().on_completion_event(event, sinks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsm_wire::msg;

    fn sink_list() -> SinkList {
        SinkList::new()
    }

    #[tokio::test]
    async fn temperature_sensor_round_trip() {
        let mut sensor = TemperatureSensor {
            sensor_id: 2,
            reading: NumericReading::new("/inventory/gpu0/temp", "Value"),
        };
        let request = sensor.make_request().unwrap();
        assert_eq!(telemetry::decode_temperature_req(&request).unwrap(), 2);

        let frame = telemetry::encode_temperature_resp(0, 30.5).unwrap();
        let action = sensor.handle_response(&frame, &sink_list()).await.unwrap();
        assert_eq!(action, SensorAction::Done);
    }

    #[tokio::test]
    async fn refusal_surfaces_the_completion_code() {
        let mut sensor = PowerDrawSensor {
            sensor_id: 0,
            averaging_interval: 0,
            reading: NumericReading::new("/inventory/gpu0/power", "Value"),
        };
        let frame = msg::encode_refusal(
            0,
            MessageType::Telemetry,
            telemetry::GET_CURRENT_POWER_DRAW,
            CompletionCode::Busy,
            7,
        );
        let err = sensor
            .handle_response(&frame, &sink_list())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SensorError::Refused {
                completion: CompletionCode::Busy,
                reason: 7
            }
        );
    }

    #[tokio::test]
    async fn power_cap_waits_for_completion() {
        let mut sensor = PowerCapSensor {
            limit_watts: 450.0,
            reading: NumericReading::new("/control/gpu0/power_cap", "Value"),
        };
        let frame = msg::encode_refusal(
            0,
            MessageType::Telemetry,
            telemetry::SET_POWER_LIMIT,
            CompletionCode::Accepted,
            0,
        );
        let action = sensor.handle_response(&frame, &sink_list()).await.unwrap();
        assert_eq!(action, SensorAction::AwaitCompletion);

        let data = telemetry::encode_power_limit_event_data(437.5);
        let event_frame = nsm_wire::capability::encode_long_running_event(
            3,
            false,
            nsm_wire::capability::LongRunningState {
                message_type: MessageType::Telemetry,
                command: telemetry::SET_POWER_LIMIT,
            },
            &data,
        )
        .unwrap();
        let event = msg::decode_event(&event_frame).unwrap();
        sensor.on_completion_event(&event, &sink_list()).await.unwrap();
    }

    #[tokio::test]
    async fn presence_power_alternates_stages() {
        let mut sensor = PresencePowerSensor::new("/inventory/gpu0");
        assert_eq!(
            sensor.correlation(),
            (MessageType::Telemetry, telemetry::GET_GPU_PRESENCE)
        );
        let request = sensor.make_request().unwrap();
        telemetry::decode_gpu_presence_req(&request).unwrap();

        let frame = telemetry::encode_gpu_presence_resp(0, true).unwrap();
        sensor.handle_response(&frame, &sink_list()).await.unwrap();
        assert_eq!(
            sensor.correlation(),
            (MessageType::Telemetry, telemetry::GET_POWER_SUPPLY_STATUS)
        );

        let frame = telemetry::encode_power_supply_status_resp(0, 1).unwrap();
        sensor.handle_response(&frame, &sink_list()).await.unwrap();
        assert_eq!(
            sensor.correlation(),
            (MessageType::Telemetry, telemetry::GET_GPU_PRESENCE)
        );
    }

    #[tokio::test]
    async fn non_long_running_sensor_rejects_completion_events() {
        let mut sensor = TemperatureSensor {
            sensor_id: 1,
            reading: NumericReading::new("/p", "Value"),
        };
        let frame = nsm_wire::capability::encode_long_running_event(
            0,
            false,
            nsm_wire::capability::LongRunningState {
                message_type: MessageType::Telemetry,
                command: telemetry::GET_TEMPERATURE_READING,
            },
            &[],
        )
        .unwrap();
        let event = msg::decode_event(&frame).unwrap();
        assert_eq!(
            sensor
                .on_completion_event(&event, &sink_list())
                .await
                .unwrap_err(),
            SensorError::UnexpectedEvent
        );
    }
}

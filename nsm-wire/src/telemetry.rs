//! Platform telemetry commands (NSM type 3) and the network port
//! family (type 4).
//!
//! Unit scaling lives here and only here: sensors and aggregators both
//! call the same conversion, so a reading takes the identical path
//! whether it arrived as a scalar response or as an aggregate sample.

use crate::msg::{self, CmdResponse, MessageType, Response, WireError};

pub const GET_TEMPERATURE_READING: u8 = 0x00;
pub const GET_CURRENT_POWER_DRAW: u8 = 0x01;
pub const GET_CURRENT_ENERGY_COUNT: u8 = 0x02;
pub const GET_INVENTORY_INFORMATION: u8 = 0x05;
pub const SET_POWER_LIMIT: u8 = 0x06;
pub const GET_GPU_PRESENCE: u8 = 0x07;
pub const GET_POWER_SUPPLY_STATUS: u8 = 0x08;

/// Network port family (type 4).
pub const GET_PORT_BANDWIDTH: u8 = 0x01;

/// Sensor id selecting the aggregate response form.
pub const AGGREGATE_SENSOR_ID: u8 = 0xFF;

pub mod units {
    //! Numeric conversions between wire units and published units.

    /// Power arrives in milliwatts, publishes in watts.
    pub fn watts_from_milliwatts(raw: u32) -> f64 {
        raw as f64 / 1000.0
    }

    pub fn milliwatts_from_watts(watts: f64) -> u32 {
        (watts * 1000.0).round() as u32
    }

    /// Energy arrives in millijoules, publishes in joules.
    pub fn joules_from_millijoules(raw: u64) -> f64 {
        raw as f64 / 1000.0
    }

    pub fn millijoules_from_joules(joules: f64) -> u64 {
        (joules * 1000.0).round() as u64
    }

    /// Temperatures are signed 24.8 fixed point degrees Celsius.
    pub fn celsius_from_q24_8(raw: i32) -> f64 {
        raw as f64 / 256.0
    }

    pub fn q24_8_from_celsius(celsius: f64) -> i32 {
        (celsius * 256.0).round() as i32
    }

    /// Bandwidth arrives in bytes per second, publishes in Gb/s.
    pub fn gbps_from_bytes_per_sec(raw: u64) -> f64 {
        raw as f64 / (1024.0 * 1024.0 * 128.0)
    }

    pub fn bytes_per_sec_from_gbps(gbps: f64) -> u64 {
        (gbps * 1024.0 * 1024.0 * 128.0).round() as u64
    }
}

fn refused<T>(resp: &Response) -> Option<CmdResponse<T>> {
    if resp.completion.is_success() {
        None
    } else {
        Some(CmdResponse::Refused {
            completion: resp.completion,
            reason: resp.reason,
        })
    }
}

fn fixed_payload<const N: usize>(data: &[u8]) -> Result<[u8; N], WireError> {
    data.try_into().map_err(|_| WireError::InvalidLength)
}

// --- temperature ---

pub fn encode_temperature_req(sensor_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::Telemetry, GET_TEMPERATURE_READING, &[sensor_id])
}

pub fn decode_temperature_req(frame: &[u8]) -> Result<u8, WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_TEMPERATURE_READING {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    Ok(payload[0])
}

pub fn encode_temperature_resp(instance_id: u8, celsius: f64) -> Result<Vec<u8>, WireError> {
    let raw = units::q24_8_from_celsius(celsius);
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_TEMPERATURE_READING,
        &raw.to_le_bytes(),
    )
}

pub fn decode_temperature_resp(frame: &[u8]) -> Result<CmdResponse<f64>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    Ok(CmdResponse::Ok(temperature_from_sample(&resp.data)?))
}

/// Shared with the aggregate path: 4 byte signed q24.8.
pub fn temperature_from_sample(data: &[u8]) -> Result<f64, WireError> {
    let raw = i32::from_le_bytes(fixed_payload(data)?);
    Ok(units::celsius_from_q24_8(raw))
}

// --- power draw ---

pub fn encode_power_draw_req(sensor_id: u8, averaging_interval: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_request(
        MessageType::Telemetry,
        GET_CURRENT_POWER_DRAW,
        &[sensor_id, averaging_interval],
    )
}

pub fn decode_power_draw_req(frame: &[u8]) -> Result<(u8, u8), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_CURRENT_POWER_DRAW {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 2 {
        return Err(WireError::InvalidLength);
    }
    Ok((payload[0], payload[1]))
}

pub fn encode_power_draw_resp(instance_id: u8, watts: f64) -> Result<Vec<u8>, WireError> {
    let raw = units::milliwatts_from_watts(watts);
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_CURRENT_POWER_DRAW,
        &raw.to_le_bytes(),
    )
}

pub fn decode_power_draw_resp(frame: &[u8]) -> Result<CmdResponse<f64>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    Ok(CmdResponse::Ok(power_from_sample(&resp.data)?))
}

/// Shared with the aggregate path: 4 byte unsigned milliwatts.
pub fn power_from_sample(data: &[u8]) -> Result<f64, WireError> {
    let raw = u32::from_le_bytes(fixed_payload(data)?);
    Ok(units::watts_from_milliwatts(raw))
}

// --- energy counter ---

pub fn encode_energy_count_req(sensor_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::Telemetry, GET_CURRENT_ENERGY_COUNT, &[sensor_id])
}

pub fn decode_energy_count_req(frame: &[u8]) -> Result<u8, WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_CURRENT_ENERGY_COUNT {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    Ok(payload[0])
}

pub fn encode_energy_count_resp(instance_id: u8, joules: f64) -> Result<Vec<u8>, WireError> {
    let raw = units::millijoules_from_joules(joules);
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_CURRENT_ENERGY_COUNT,
        &raw.to_le_bytes(),
    )
}

pub fn decode_energy_count_resp(frame: &[u8]) -> Result<CmdResponse<f64>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    Ok(CmdResponse::Ok(energy_from_sample(&resp.data)?))
}

/// Shared with the aggregate path: 8 byte unsigned millijoules.
pub fn energy_from_sample(data: &[u8]) -> Result<f64, WireError> {
    let raw = u64::from_le_bytes(fixed_payload(data)?);
    Ok(units::joules_from_millijoules(raw))
}

// --- inventory information ---

/// Well-known inventory property identifiers. Unrecognised ids pass
/// through as `Other`; the catalogue only names what the daemon
/// publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InventoryProperty {
    BoardPartNumber,
    SerialNumber,
    MarketingName,
    DevicePartNumber,
    FruDeviceDescription,
    ProductLength,
    ProductWidth,
    ProductHeight,
    MinimumDevicePowerLimit,
    MaximumDevicePowerLimit,
    RatedModulePowerLimit,
    MemoryVendor,
    MemoryPartNumber,
    BuildDate,
    FirmwareVersion,
    DeviceGuid,
    Other(u8),
}

impl InventoryProperty {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => Self::BoardPartNumber,
            1 => Self::SerialNumber,
            2 => Self::MarketingName,
            3 => Self::DevicePartNumber,
            4 => Self::FruDeviceDescription,
            5 => Self::ProductLength,
            6 => Self::ProductWidth,
            7 => Self::ProductHeight,
            8 => Self::MinimumDevicePowerLimit,
            9 => Self::MaximumDevicePowerLimit,
            10 => Self::RatedModulePowerLimit,
            11 => Self::MemoryVendor,
            12 => Self::MemoryPartNumber,
            13 => Self::BuildDate,
            14 => Self::FirmwareVersion,
            15 => Self::DeviceGuid,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::BoardPartNumber => 0,
            Self::SerialNumber => 1,
            Self::MarketingName => 2,
            Self::DevicePartNumber => 3,
            Self::FruDeviceDescription => 4,
            Self::ProductLength => 5,
            Self::ProductWidth => 6,
            Self::ProductHeight => 7,
            Self::MinimumDevicePowerLimit => 8,
            Self::MaximumDevicePowerLimit => 9,
            Self::RatedModulePowerLimit => 10,
            Self::MemoryVendor => 11,
            Self::MemoryPartNumber => 12,
            Self::BuildDate => 13,
            Self::FirmwareVersion => 14,
            Self::DeviceGuid => 15,
            Self::Other(raw) => raw,
        }
    }
}

/// An inventory reading: either a byte string or a little-endian
/// integer of declared size. Both readings are exposed; the caller
/// knows which one the property means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryValue(pub Vec<u8>);

impl InventoryValue {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_string(&self) -> Option<String> {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(self.0.len());
        std::str::from_utf8(&self.0[..end]).ok().map(str::to_owned)
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.0.len() {
            1 => Some(self.0[0] as u32),
            2 => Some(u16::from_le_bytes([self.0[0], self.0[1]]) as u32),
            4 => Some(u32::from_le_bytes([
                self.0[0], self.0[1], self.0[2], self.0[3],
            ])),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        if self.0.len() == 8 {
            let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
            Some(u64::from_le_bytes(bytes))
        } else {
            self.as_u32().map(u64::from)
        }
    }
}

pub fn encode_inventory_req(property: InventoryProperty) -> Result<Vec<u8>, WireError> {
    msg::encode_request(
        MessageType::Telemetry,
        GET_INVENTORY_INFORMATION,
        &[property.to_wire()],
    )
}

pub fn decode_inventory_req(frame: &[u8]) -> Result<InventoryProperty, WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_INVENTORY_INFORMATION {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    Ok(InventoryProperty::from_wire(payload[0]))
}

pub fn encode_inventory_resp(instance_id: u8, value: &[u8]) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_INVENTORY_INFORMATION,
        value,
    )
}

pub fn decode_inventory_resp(frame: &[u8]) -> Result<CmdResponse<InventoryValue>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    Ok(CmdResponse::Ok(InventoryValue(resp.data)))
}

// --- power limit (long-running) ---

pub fn encode_set_power_limit_req(watts: f64) -> Result<Vec<u8>, WireError> {
    let raw = units::milliwatts_from_watts(watts);
    msg::encode_request(MessageType::Telemetry, SET_POWER_LIMIT, &raw.to_le_bytes())
}

pub fn decode_set_power_limit_req(frame: &[u8]) -> Result<f64, WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != SET_POWER_LIMIT {
        return Err(WireError::InvalidData);
    }
    let raw = u32::from_le_bytes(fixed_payload(payload)?);
    Ok(units::watts_from_milliwatts(raw))
}

/// Deferred result delivered by the completion event: the limit the
/// device actually applied, milliwatts on the wire.
pub fn encode_power_limit_event_data(applied_watts: f64) -> Vec<u8> {
    units::milliwatts_from_watts(applied_watts)
        .to_le_bytes()
        .to_vec()
}

pub fn decode_power_limit_event_data(data: &[u8]) -> Result<f64, WireError> {
    let raw = u32::from_le_bytes(fixed_payload(data)?);
    Ok(units::watts_from_milliwatts(raw))
}

// --- presence and power status (two-step sensor) ---

pub fn encode_gpu_presence_req() -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::Telemetry, GET_GPU_PRESENCE, &[])
}

pub fn decode_gpu_presence_req(frame: &[u8]) -> Result<(), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_GPU_PRESENCE || !payload.is_empty() {
        return Err(WireError::InvalidData);
    }
    Ok(())
}

pub fn encode_gpu_presence_resp(instance_id: u8, present: bool) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_GPU_PRESENCE,
        &[present as u8],
    )
}

pub fn decode_gpu_presence_resp(frame: &[u8]) -> Result<CmdResponse<bool>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    let [raw] = fixed_payload::<1>(&resp.data)?;
    match raw {
        0 => Ok(CmdResponse::Ok(false)),
        1 => Ok(CmdResponse::Ok(true)),
        _ => Err(WireError::InvalidData),
    }
}

pub fn encode_power_supply_status_req() -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::Telemetry, GET_POWER_SUPPLY_STATUS, &[])
}

pub fn decode_power_supply_status_req(frame: &[u8]) -> Result<(), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_POWER_SUPPLY_STATUS || !payload.is_empty() {
        return Err(WireError::InvalidData);
    }
    Ok(())
}

pub fn encode_power_supply_status_resp(instance_id: u8, status: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::Telemetry,
        GET_POWER_SUPPLY_STATUS,
        &[status],
    )
}

pub fn decode_power_supply_status_resp(frame: &[u8]) -> Result<CmdResponse<u8>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    let [status] = fixed_payload::<1>(&resp.data)?;
    Ok(CmdResponse::Ok(status))
}

// --- port bandwidth (type 4) ---

pub fn encode_port_bandwidth_req(port_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::NetworkPort, GET_PORT_BANDWIDTH, &[port_id])
}

pub fn decode_port_bandwidth_req(frame: &[u8]) -> Result<u8, WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != GET_PORT_BANDWIDTH {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    Ok(payload[0])
}

pub fn encode_port_bandwidth_resp(instance_id: u8, gbps: f64) -> Result<Vec<u8>, WireError> {
    let raw = units::bytes_per_sec_from_gbps(gbps);
    msg::encode_response(
        instance_id,
        MessageType::NetworkPort,
        GET_PORT_BANDWIDTH,
        &raw.to_le_bytes(),
    )
}

pub fn decode_port_bandwidth_resp(frame: &[u8]) -> Result<CmdResponse<f64>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    Ok(CmdResponse::Ok(bandwidth_from_sample(&resp.data)?))
}

/// Shared with the aggregate path: 8 byte unsigned bytes/second.
pub fn bandwidth_from_sample(data: &[u8]) -> Result<f64, WireError> {
    let raw = u64::from_le_bytes(fixed_payload(data)?);
    Ok(units::gbps_from_bytes_per_sec(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::CompletionCode;

    #[test]
    fn temperature_scenario_bytes() {
        // Request: 10 DE, request=1 instance=0, 89, 03, command 00,
        // one byte payload, sensor id 2.
        let req = encode_temperature_req(2).unwrap();
        assert_eq!(req, [0x10, 0xDE, 0x80, 0x89, 0x03, 0x00, 0x01, 0x02]);

        // Response: cleared request bit, cc 00, reserved 00, size
        // 04 00, q24.8 reading.
        let resp = encode_temperature_resp(0, 42.25).unwrap();
        assert_eq!(
            &resp[..10],
            &[0x10, 0xDE, 0x00, 0x89, 0x03, 0x00, 0x00, 0x00, 0x04, 0x00]
        );
        let raw = i32::from_le_bytes([resp[10], resp[11], resp[12], resp[13]]);
        assert_eq!(raw, 42 * 256 + 64);
        assert_eq!(
            decode_temperature_resp(&resp).unwrap(),
            CmdResponse::Ok(42.25)
        );
    }

    #[test]
    fn temperature_negative_round_trip() {
        let resp = encode_temperature_resp(0, -10.5).unwrap();
        assert_eq!(
            decode_temperature_resp(&resp).unwrap(),
            CmdResponse::Ok(-10.5)
        );
    }

    #[test]
    fn temperature_short_payload_is_invalid_length() {
        let frame =
            msg::encode_response(0, MessageType::Telemetry, GET_TEMPERATURE_READING, &[1, 2])
                .unwrap();
        assert_eq!(
            decode_temperature_resp(&frame).unwrap_err(),
            WireError::InvalidLength
        );
    }

    #[test]
    fn power_draw_round_trip() {
        let req = encode_power_draw_req(3, 10).unwrap();
        assert_eq!(decode_power_draw_req(&req).unwrap(), (3, 10));

        let resp = encode_power_draw_resp(1, 215.0).unwrap();
        assert_eq!(decode_power_draw_resp(&resp).unwrap(), CmdResponse::Ok(215.0));
    }

    #[test]
    fn power_sample_is_milliwatts() {
        let raw = 12_500u32.to_le_bytes();
        assert_eq!(power_from_sample(&raw).unwrap(), 12.5);
    }

    #[test]
    fn energy_round_trip() {
        let req = encode_energy_count_req(0).unwrap();
        assert_eq!(decode_energy_count_req(&req).unwrap(), 0);
        let resp = encode_energy_count_resp(0, 1024.25).unwrap();
        assert_eq!(
            decode_energy_count_resp(&resp).unwrap(),
            CmdResponse::Ok(1024.25)
        );
    }

    #[test]
    fn inventory_string_property() {
        let req = encode_inventory_req(InventoryProperty::MarketingName).unwrap();
        assert_eq!(
            decode_inventory_req(&req).unwrap(),
            InventoryProperty::MarketingName
        );

        let resp = encode_inventory_resp(0, b"NVIDIA H100\0").unwrap();
        let value = decode_inventory_resp(&resp).unwrap().ok().unwrap();
        assert_eq!(value.as_string().as_deref(), Some("NVIDIA H100"));
        assert_eq!(value.as_u32(), None);
    }

    #[test]
    fn inventory_integer_property() {
        let resp = encode_inventory_resp(0, &350u32.to_le_bytes()).unwrap();
        let value = decode_inventory_resp(&resp).unwrap().ok().unwrap();
        assert_eq!(value.as_u32(), Some(350));
        assert_eq!(value.as_u64(), Some(350));
        assert_eq!(value.as_bytes().len(), 4);
    }

    #[test]
    fn inventory_property_ids_round_trip() {
        for raw in 0..=0x40u8 {
            assert_eq!(InventoryProperty::from_wire(raw).to_wire(), raw);
        }
    }

    #[test]
    fn power_limit_round_trip() {
        let req = encode_set_power_limit_req(450.0).unwrap();
        assert_eq!(decode_set_power_limit_req(&req).unwrap(), 450.0);

        let data = encode_power_limit_event_data(437.5);
        assert_eq!(decode_power_limit_event_data(&data).unwrap(), 437.5);
    }

    #[test]
    fn presence_round_trip() {
        let req = encode_gpu_presence_req().unwrap();
        decode_gpu_presence_req(&req).unwrap();
        for present in [false, true] {
            let resp = encode_gpu_presence_resp(0, present).unwrap();
            assert_eq!(
                decode_gpu_presence_resp(&resp).unwrap(),
                CmdResponse::Ok(present)
            );
        }
    }

    #[test]
    fn presence_flag_out_of_range_is_invalid_data() {
        let frame =
            msg::encode_response(0, MessageType::Telemetry, GET_GPU_PRESENCE, &[2]).unwrap();
        assert_eq!(
            decode_gpu_presence_resp(&frame).unwrap_err(),
            WireError::InvalidData
        );
    }

    #[test]
    fn power_supply_status_round_trip() {
        let resp = encode_power_supply_status_resp(0, 0b0000_0101).unwrap();
        assert_eq!(
            decode_power_supply_status_resp(&resp).unwrap(),
            CmdResponse::Ok(0b0000_0101)
        );
    }

    #[test]
    fn port_bandwidth_conversion() {
        // 128 MiB/s is exactly 1 Gb/s in this protocol's convention.
        let raw = (128u64 * 1024 * 1024).to_le_bytes();
        assert_eq!(bandwidth_from_sample(&raw).unwrap(), 1.0);

        let resp = encode_port_bandwidth_resp(0, 25.0).unwrap();
        assert_eq!(
            decode_port_bandwidth_resp(&resp).unwrap(),
            CmdResponse::Ok(25.0)
        );
    }

    #[test]
    fn refusal_reaches_the_caller() {
        let frame = msg::encode_refusal(
            0,
            MessageType::Telemetry,
            GET_CURRENT_POWER_DRAW,
            CompletionCode::Unavailable,
            0x55AA,
        );
        assert_eq!(
            decode_power_draw_resp(&frame).unwrap(),
            CmdResponse::Refused {
                completion: CompletionCode::Unavailable,
                reason: 0x55AA
            }
        );
    }
}

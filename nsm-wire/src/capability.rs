//! Device capability discovery commands (NSM type 0): liveness ping,
//! device identification, event source masks, event subscription and
//! the events the family defines (rediscovery, long-running
//! completion).

use crate::msg::{
    self, CmdResponse, EventFrame, MessageType, Response, WireError,
};

pub const PING: u8 = 0x00;
pub const GET_SUPPORTED_EVENT_SOURCES: u8 = 0x01;
pub const GET_CURRENT_EVENT_SOURCES: u8 = 0x02;
pub const SET_CURRENT_EVENT_SOURCES: u8 = 0x03;
pub const SET_EVENT_SUBSCRIPTION: u8 = 0x04;
pub const CONFIGURE_EVENT_ACKNOWLEDGEMENT: u8 = 0x05;
pub const QUERY_DEVICE_IDENTIFICATION: u8 = 0x09;

/// Event id of the rediscovery event on the capability type.
pub const REDISCOVERY_EVENT_ID: u8 = 1;

/// Event id of the long-running command completion event. The state
/// field packs the originating message type and command.
pub const LONG_RUNNING_EVENT_ID: u8 = 3;

pub const EVENT_CLASS_GENERAL: u8 = 0;

pub const EVENT_SOURCES_LEN: usize = 8;

/// Eight byte event-source bitfield, addressed `(id / 8, id % 8)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSourceMask(pub [u8; EVENT_SOURCES_LEN]);

impl EventSourceMask {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, event_id: u8) -> Self {
        self.set(event_id, true);
        self
    }

    pub fn set(&mut self, event_id: u8, enabled: bool) {
        let byte = (event_id / 8) as usize;
        let bit = event_id % 8;
        if enabled {
            self.0[byte] |= 1 << bit;
        } else {
            self.0[byte] &= !(1 << bit);
        }
    }

    pub fn contains(&self, event_id: u8) -> bool {
        self.0[(event_id / 8) as usize] & (1 << (event_id % 8)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// Global event generation setting carried by set-event-subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventGeneration {
    Disabled = 0,
    Poll = 1,
    Push = 2,
}

impl EventGeneration {
    pub fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Poll),
            2 => Ok(Self::Push),
            _ => Err(WireError::InvalidData),
        }
    }
}

/// Device class reported by query-device-identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Gpu,
    NvSwitch,
    PcieBridge,
    Baseboard,
    Other(u8),
}

impl DeviceKind {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0 => Self::Gpu,
            1 => Self::NvSwitch,
            2 => Self::PcieBridge,
            3 => Self::Baseboard,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Gpu => 0,
            Self::NvSwitch => 1,
            Self::PcieBridge => 2,
            Self::Baseboard => 3,
            Self::Other(raw) => raw,
        }
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

// --- ping ---

pub fn encode_ping_req() -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::DeviceCapability, PING, &[])
}

pub fn decode_ping_req(frame: &[u8]) -> Result<(), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != PING || !payload.is_empty() {
        return Err(WireError::InvalidData);
    }
    Ok(())
}

pub fn encode_ping_resp(instance_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_response(instance_id, MessageType::DeviceCapability, PING, &[])
}

pub fn decode_ping_resp(frame: &[u8]) -> Result<CmdResponse<()>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    if !resp.data.is_empty() {
        return Err(WireError::InvalidLength);
    }
    Ok(CmdResponse::Ok(()))
}

// --- query device identification ---

pub fn encode_query_device_identification_req() -> Result<Vec<u8>, WireError> {
    msg::encode_request(MessageType::DeviceCapability, QUERY_DEVICE_IDENTIFICATION, &[])
}

pub fn decode_query_device_identification_req(frame: &[u8]) -> Result<(), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != QUERY_DEVICE_IDENTIFICATION || !payload.is_empty() {
        return Err(WireError::InvalidData);
    }
    Ok(())
}

pub fn encode_query_device_identification_resp(
    instance_id: u8,
    kind: DeviceKind,
    device_instance: u8,
) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        QUERY_DEVICE_IDENTIFICATION,
        &[kind.to_wire(), device_instance],
    )
}

pub fn decode_query_device_identification_resp(
    frame: &[u8],
) -> Result<CmdResponse<(DeviceKind, u8)>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    if resp.data.len() != 2 {
        return Err(WireError::InvalidLength);
    }
    Ok(CmdResponse::Ok((
        DeviceKind::from_wire(resp.data[0]),
        resp.data[1],
    )))
}

// --- event source masks ---

fn encode_mask_query_req(command: u8, message_type: MessageType) -> Result<Vec<u8>, WireError> {
    msg::encode_request(
        MessageType::DeviceCapability,
        command,
        &[message_type as u8],
    )
}

fn decode_mask_query_req(frame: &[u8], command: u8) -> Result<MessageType, WireError> {
    let (_, got, payload) = msg::decode_request(frame)?;
    if got != command {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    MessageType::from_wire(payload[0])
}

fn decode_mask_resp(frame: &[u8]) -> Result<CmdResponse<EventSourceMask>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    let bytes: [u8; EVENT_SOURCES_LEN] = resp
        .data
        .as_slice()
        .try_into()
        .map_err(|_| WireError::InvalidLength)?;
    Ok(CmdResponse::Ok(EventSourceMask(bytes)))
}

pub fn encode_get_supported_event_sources_req(
    message_type: MessageType,
) -> Result<Vec<u8>, WireError> {
    encode_mask_query_req(GET_SUPPORTED_EVENT_SOURCES, message_type)
}

pub fn decode_get_supported_event_sources_req(frame: &[u8]) -> Result<MessageType, WireError> {
    decode_mask_query_req(frame, GET_SUPPORTED_EVENT_SOURCES)
}

pub fn encode_get_supported_event_sources_resp(
    instance_id: u8,
    mask: &EventSourceMask,
) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        GET_SUPPORTED_EVENT_SOURCES,
        &mask.0,
    )
}

pub fn decode_get_supported_event_sources_resp(
    frame: &[u8],
) -> Result<CmdResponse<EventSourceMask>, WireError> {
    decode_mask_resp(frame)
}

pub fn encode_get_current_event_sources_req(
    message_type: MessageType,
) -> Result<Vec<u8>, WireError> {
    encode_mask_query_req(GET_CURRENT_EVENT_SOURCES, message_type)
}

pub fn decode_get_current_event_sources_req(frame: &[u8]) -> Result<MessageType, WireError> {
    decode_mask_query_req(frame, GET_CURRENT_EVENT_SOURCES)
}

pub fn encode_get_current_event_sources_resp(
    instance_id: u8,
    mask: &EventSourceMask,
) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        GET_CURRENT_EVENT_SOURCES,
        &mask.0,
    )
}

pub fn decode_get_current_event_sources_resp(
    frame: &[u8],
) -> Result<CmdResponse<EventSourceMask>, WireError> {
    decode_mask_resp(frame)
}

pub fn encode_set_current_event_sources_req(
    message_type: MessageType,
    mask: &EventSourceMask,
) -> Result<Vec<u8>, WireError> {
    let mut payload = [0u8; 1 + EVENT_SOURCES_LEN];
    payload[0] = message_type as u8;
    payload[1..].copy_from_slice(&mask.0);
    msg::encode_request(
        MessageType::DeviceCapability,
        SET_CURRENT_EVENT_SOURCES,
        &payload,
    )
}

pub fn decode_set_current_event_sources_req(
    frame: &[u8],
) -> Result<(MessageType, EventSourceMask), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != SET_CURRENT_EVENT_SOURCES {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 + EVENT_SOURCES_LEN {
        return Err(WireError::InvalidLength);
    }
    let message_type = MessageType::from_wire(payload[0])?;
    let mut mask = [0u8; EVENT_SOURCES_LEN];
    mask.copy_from_slice(&payload[1..]);
    Ok((message_type, EventSourceMask(mask)))
}

pub fn encode_set_current_event_sources_resp(instance_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        SET_CURRENT_EVENT_SOURCES,
        &[],
    )
}

pub fn decode_set_current_event_sources_resp(
    frame: &[u8],
) -> Result<CmdResponse<()>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    if !resp.data.is_empty() {
        return Err(WireError::InvalidLength);
    }
    Ok(CmdResponse::Ok(()))
}

// --- event subscription ---

pub fn encode_set_event_subscription_req(
    setting: EventGeneration,
    receiver_eid: u8,
) -> Result<Vec<u8>, WireError> {
    msg::encode_request(
        MessageType::DeviceCapability,
        SET_EVENT_SUBSCRIPTION,
        &[setting as u8, receiver_eid],
    )
}

pub fn decode_set_event_subscription_req(
    frame: &[u8],
) -> Result<(EventGeneration, u8), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != SET_EVENT_SUBSCRIPTION {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 2 {
        return Err(WireError::InvalidLength);
    }
    Ok((EventGeneration::from_wire(payload[0])?, payload[1]))
}

pub fn encode_set_event_subscription_resp(instance_id: u8) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        SET_EVENT_SUBSCRIPTION,
        &[],
    )
}

pub fn decode_set_event_subscription_resp(frame: &[u8]) -> Result<CmdResponse<()>, WireError> {
    let resp = msg::decode_response(frame)?;
    if let Some(refusal) = refused(&resp) {
        return Ok(refusal);
    }
    if !resp.data.is_empty() {
        return Err(WireError::InvalidLength);
    }
    Ok(CmdResponse::Ok(()))
}

// --- event acknowledgement configuration ---

pub fn encode_configure_event_acknowledgement_req(
    message_type: MessageType,
    mask: &EventSourceMask,
) -> Result<Vec<u8>, WireError> {
    let mut payload = [0u8; 1 + EVENT_SOURCES_LEN];
    payload[0] = message_type as u8;
    payload[1..].copy_from_slice(&mask.0);
    msg::encode_request(
        MessageType::DeviceCapability,
        CONFIGURE_EVENT_ACKNOWLEDGEMENT,
        &payload,
    )
}

pub fn decode_configure_event_acknowledgement_req(
    frame: &[u8],
) -> Result<(MessageType, EventSourceMask), WireError> {
    let (_, command, payload) = msg::decode_request(frame)?;
    if command != CONFIGURE_EVENT_ACKNOWLEDGEMENT {
        return Err(WireError::InvalidData);
    }
    if payload.len() != 1 + EVENT_SOURCES_LEN {
        return Err(WireError::InvalidLength);
    }
    let message_type = MessageType::from_wire(payload[0])?;
    let mut mask = [0u8; EVENT_SOURCES_LEN];
    mask.copy_from_slice(&payload[1..]);
    Ok((message_type, EventSourceMask(mask)))
}

pub fn encode_configure_event_acknowledgement_resp(
    instance_id: u8,
    new_mask: &EventSourceMask,
) -> Result<Vec<u8>, WireError> {
    msg::encode_response(
        instance_id,
        MessageType::DeviceCapability,
        CONFIGURE_EVENT_ACKNOWLEDGEMENT,
        &new_mask.0,
    )
}

pub fn decode_configure_event_acknowledgement_resp(
    frame: &[u8],
) -> Result<CmdResponse<EventSourceMask>, WireError> {
    decode_mask_resp(frame)
}

// --- events ---

pub fn encode_rediscovery_event(instance_id: u8, ack_request: bool) -> Result<Vec<u8>, WireError> {
    msg::encode_event(
        instance_id,
        MessageType::DeviceCapability,
        ack_request,
        REDISCOVERY_EVENT_ID,
        EVENT_CLASS_GENERAL,
        0,
        &[],
    )
}

pub fn is_rediscovery_event(event: &EventFrame) -> bool {
    event.message_type == MessageType::DeviceCapability
        && event.event_id == REDISCOVERY_EVENT_ID
}

/// State field of the long-running completion event: originating
/// message type in the low byte, command in the high byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongRunningState {
    pub message_type: MessageType,
    pub command: u8,
}

impl LongRunningState {
    pub fn pack(&self) -> u16 {
        u16::from_le_bytes([self.message_type as u8, self.command])
    }

    pub fn unpack(state: u16) -> Result<Self, WireError> {
        let [message_type, command] = state.to_le_bytes();
        Ok(Self {
            message_type: MessageType::from_wire(message_type)?,
            command,
        })
    }
}

/// Encode a long-running completion event. `data` is the deferred
/// result, shaped per command (see the telemetry module).
pub fn encode_long_running_event(
    instance_id: u8,
    ack_request: bool,
    state: LongRunningState,
    data: &[u8],
) -> Result<Vec<u8>, WireError> {
    msg::encode_event(
        instance_id,
        state.message_type,
        ack_request,
        LONG_RUNNING_EVENT_ID,
        EVENT_CLASS_GENERAL,
        state.pack(),
        data,
    )
}

pub fn is_long_running_event(event: &EventFrame) -> bool {
    event.event_id == LONG_RUNNING_EVENT_ID
}

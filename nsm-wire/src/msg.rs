//! Message framing: header, request/response/event envelopes,
//! completion codes.

use bytes::BufMut;
use thiserror::Error;

/// PCI vendor id of the protocol owner. Transmitted `10 DE` on the
/// wire (network order), like every other MCTP vendor-defined message.
pub const PCI_VENDOR_ID: u16 = 0x10DE;

/// OCP type (8) in the high nibble, OCP version (9) in the low nibble.
pub const OCP_HEADER_BYTE: u8 = 0x89;

/// Header length on the wire: vendor (2), flags (1), OCP (1), message
/// type (1).
pub const HDR_LEN: usize = 5;

/// Instance ids are a 5 bit cycling counter.
pub const INSTANCE_ID_MASK: u8 = 0x1F;

/// Hard cap on any NSM message, requests included.
pub const MAX_MESSAGE_LEN: usize = 4096;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_DATAGRAM: u8 = 0x40;

/// Decode failure taxonomy. Every decoder checks lengths before it
/// touches a field, so `InvalidLength` always means a truncated or
/// oversized buffer, never a bad read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("message truncated or length field inconsistent")]
    InvalidLength,
    #[error("malformed field value")]
    InvalidData,
}

/// NSM message families carried in the last header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DeviceCapability = 0,
    Telemetry = 3,
    NetworkPort = 4,
}

impl MessageType {
    pub fn from_wire(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Self::DeviceCapability),
            3 => Ok(Self::Telemetry),
            4 => Ok(Self::NetworkPort),
            _ => Err(WireError::InvalidData),
        }
    }
}

/// First payload byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Success,
    Error,
    InvalidArgument,
    UnsupportedCommand,
    Unavailable,
    Busy,
    /// Long-running command admitted; the result arrives later as an
    /// event.
    Accepted,
    Other(u8),
}

impl CompletionCode {
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            0x00 => Self::Success,
            0x01 => Self::Error,
            0x02 => Self::InvalidArgument,
            0x03 => Self::UnsupportedCommand,
            0x04 => Self::Unavailable,
            0x05 => Self::Busy,
            0x06 => Self::Accepted,
            other => Self::Other(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::Error => 0x01,
            Self::InvalidArgument => 0x02,
            Self::UnsupportedCommand => 0x03,
            Self::Unavailable => 0x04,
            Self::Busy => 0x05,
            Self::Accepted => 0x06,
            Self::Other(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// The five byte NSM header. Requests set the request bit, responses
/// clear it, events set both request and datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub request: bool,
    pub datagram: bool,
    pub instance_id: u8,
    pub message_type: MessageType,
}

impl MessageHeader {
    pub fn request(message_type: MessageType) -> Self {
        Self {
            request: true,
            datagram: false,
            instance_id: 0,
            message_type,
        }
    }

    pub fn response(instance_id: u8, message_type: MessageType) -> Self {
        Self {
            request: false,
            datagram: false,
            instance_id: instance_id & INSTANCE_ID_MASK,
            message_type,
        }
    }

    pub fn event(instance_id: u8, message_type: MessageType) -> Self {
        Self {
            request: true,
            datagram: true,
            instance_id: instance_id & INSTANCE_ID_MASK,
            message_type,
        }
    }

    /// Events are datagram-style requests from the endpoint.
    pub fn is_event(&self) -> bool {
        self.request && self.datagram
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.put_u16(PCI_VENDOR_ID);
        let mut flags = self.instance_id & INSTANCE_ID_MASK;
        if self.request {
            flags |= FLAG_REQUEST;
        }
        if self.datagram {
            flags |= FLAG_DATAGRAM;
        }
        buf.put_u8(flags);
        buf.put_u8(OCP_HEADER_BYTE);
        buf.put_u8(self.message_type as u8);
    }

    /// Decode the header and hand back the body slice.
    pub fn decode(frame: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if frame.len() < HDR_LEN {
            return Err(WireError::InvalidLength);
        }
        if frame.len() > MAX_MESSAGE_LEN {
            return Err(WireError::InvalidLength);
        }
        let vendor = u16::from_be_bytes([frame[0], frame[1]]);
        if vendor != PCI_VENDOR_ID {
            return Err(WireError::InvalidData);
        }
        if frame[3] != OCP_HEADER_BYTE {
            return Err(WireError::InvalidData);
        }
        let flags = frame[2];
        let header = Self {
            request: flags & FLAG_REQUEST != 0,
            datagram: flags & FLAG_DATAGRAM != 0,
            instance_id: flags & INSTANCE_ID_MASK,
            message_type: MessageType::from_wire(frame[4])?,
        };
        Ok((header, &frame[HDR_LEN..]))
    }
}

/// Overwrite the instance id bits of an already encoded frame. The
/// transport owns instance id allocation, so encoders always emit 0
/// and the transport stamps the real id just before transmit.
pub fn stamp_instance_id(frame: &mut [u8], instance_id: u8) {
    if frame.len() >= HDR_LEN {
        frame[2] = (frame[2] & !INSTANCE_ID_MASK) | (instance_id & INSTANCE_ID_MASK);
    }
}

/// Read the instance id bits without a full decode.
pub fn peek_instance_id(frame: &[u8]) -> Option<u8> {
    frame.get(2).map(|flags| flags & INSTANCE_ID_MASK)
}

/// Encode a request: header, command, one byte data size, payload.
pub fn encode_request(
    message_type: MessageType,
    command: u8,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > u8::MAX as usize || HDR_LEN + 2 + payload.len() > MAX_MESSAGE_LEN {
        return Err(WireError::InvalidLength);
    }
    let mut buf = Vec::with_capacity(HDR_LEN + 2 + payload.len());
    MessageHeader::request(message_type).encode_into(&mut buf);
    buf.put_u8(command);
    buf.put_u8(payload.len() as u8);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode a request frame into (header, command, payload). Used by the
/// mock device and by request round-trip tests.
pub fn decode_request(frame: &[u8]) -> Result<(MessageHeader, u8, &[u8]), WireError> {
    let (header, body) = MessageHeader::decode(frame)?;
    if !header.request || header.datagram {
        return Err(WireError::InvalidData);
    }
    if body.len() < 2 {
        return Err(WireError::InvalidLength);
    }
    let command = body[0];
    let data_size = body[1] as usize;
    let payload = &body[2..];
    if payload.len() != data_size {
        return Err(WireError::InvalidLength);
    }
    Ok((header, command, payload))
}

/// A decoded response envelope. `reason` is zero on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: MessageHeader,
    pub command: u8,
    pub completion: CompletionCode,
    pub reason: u16,
    pub data: Vec<u8>,
}

impl Response {
    pub fn instance_id(&self) -> u8 {
        self.header.instance_id
    }
}

/// Per-command decode result: either the decoded value or the refusal
/// the endpoint sent instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmdResponse<T> {
    Ok(T),
    Refused { completion: CompletionCode, reason: u16 },
}

impl<T> CmdResponse<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Refused { .. } => None,
        }
    }
}

/// Encode a success response: command, cc, reserved byte, two byte
/// data size, payload.
pub fn encode_response(
    instance_id: u8,
    message_type: MessageType,
    command: u8,
    payload: &[u8],
) -> Result<Vec<u8>, WireError> {
    if payload.len() > u16::MAX as usize || HDR_LEN + 5 + payload.len() > MAX_MESSAGE_LEN {
        return Err(WireError::InvalidLength);
    }
    let mut buf = Vec::with_capacity(HDR_LEN + 5 + payload.len());
    MessageHeader::response(instance_id, message_type).encode_into(&mut buf);
    buf.put_u8(command);
    buf.put_u8(CompletionCode::Success.to_wire());
    buf.put_u8(0); // reserved
    buf.put_u16_le(payload.len() as u16);
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode a non-success response: command, cc, two byte reason code
/// and nothing else.
pub fn encode_refusal(
    instance_id: u8,
    message_type: MessageType,
    command: u8,
    completion: CompletionCode,
    reason: u16,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HDR_LEN + 4);
    MessageHeader::response(instance_id, message_type).encode_into(&mut buf);
    buf.put_u8(command);
    buf.put_u8(completion.to_wire());
    buf.put_u16_le(reason);
    buf
}

/// Decode a response frame. Success responses carry a reserved byte, a
/// two byte data size and the payload; anything else carries exactly a
/// two byte reason code.
pub fn decode_response(frame: &[u8]) -> Result<Response, WireError> {
    let (header, body) = MessageHeader::decode(frame)?;
    if header.request || header.datagram {
        return Err(WireError::InvalidData);
    }
    if body.len() < 2 {
        return Err(WireError::InvalidLength);
    }
    let command = body[0];
    let completion = CompletionCode::from_wire(body[1]);
    if completion.is_success() {
        if body.len() < 5 {
            return Err(WireError::InvalidLength);
        }
        let data_size = u16::from_le_bytes([body[3], body[4]]) as usize;
        let data = &body[5..];
        if data.len() != data_size {
            return Err(WireError::InvalidLength);
        }
        Ok(Response {
            header,
            command,
            completion,
            reason: 0,
            data: data.to_vec(),
        })
    } else {
        if body.len() != 4 {
            return Err(WireError::InvalidLength);
        }
        let reason = u16::from_le_bytes([body[2], body[3]]);
        Ok(Response {
            header,
            command,
            completion,
            reason,
            data: Vec::new(),
        })
    }
}

/// A decoded asynchronous event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame {
    pub instance_id: u8,
    pub message_type: MessageType,
    pub version: u8,
    /// The endpoint asked for an explicit acknowledgement.
    pub ack_request: bool,
    pub event_id: u8,
    pub event_class: u8,
    pub state: u16,
    pub data: Vec<u8>,
}

/// Encode an event: datagram request with
/// `version|ackr, event id, event class, state, data size, data`.
pub fn encode_event(
    instance_id: u8,
    message_type: MessageType,
    ack_request: bool,
    event_id: u8,
    event_class: u8,
    state: u16,
    data: &[u8],
) -> Result<Vec<u8>, WireError> {
    if data.len() > u8::MAX as usize {
        return Err(WireError::InvalidLength);
    }
    let mut buf = Vec::with_capacity(HDR_LEN + 6 + data.len());
    MessageHeader::event(instance_id, message_type).encode_into(&mut buf);
    buf.put_u8(if ack_request { 0x10 } else { 0x00 });
    buf.put_u8(event_id);
    buf.put_u8(event_class);
    buf.put_u16_le(state);
    buf.put_u8(data.len() as u8);
    buf.extend_from_slice(data);
    Ok(buf)
}

pub fn decode_event(frame: &[u8]) -> Result<EventFrame, WireError> {
    let (header, body) = MessageHeader::decode(frame)?;
    if !header.is_event() {
        return Err(WireError::InvalidData);
    }
    if body.len() < 6 {
        return Err(WireError::InvalidLength);
    }
    let data_size = body[5] as usize;
    let data = &body[6..];
    if data.len() != data_size {
        return Err(WireError::InvalidLength);
    }
    Ok(EventFrame {
        instance_id: header.instance_id,
        message_type: header.message_type,
        version: body[0] & 0x0F,
        ack_request: body[0] & 0x10 != 0,
        event_id: body[1],
        event_class: body[2],
        state: u16::from_le_bytes([body[3], body[4]]),
        data: data.to_vec(),
    })
}

/// Encode an event acknowledgement: a datagram response echoing the
/// event id.
pub fn encode_event_ack(instance_id: u8, message_type: MessageType, event_id: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HDR_LEN + 1);
    let mut header = MessageHeader::response(instance_id, message_type);
    header.datagram = true;
    header.encode_into(&mut buf);
    buf.put_u8(event_id);
    buf
}

pub fn decode_event_ack(frame: &[u8]) -> Result<(MessageHeader, u8), WireError> {
    let (header, body) = MessageHeader::decode(frame)?;
    if header.request || !header.datagram {
        return Err(WireError::InvalidData);
    }
    if body.len() != 1 {
        return Err(WireError::InvalidLength);
    }
    Ok((header, body[0]))
}

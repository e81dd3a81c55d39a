//! The self-describing aggregate response: one round-trip returning
//! many tagged scalar samples.
//!
//! Shape on the wire, after the header: command, completion code, two
//! byte sample count, then `sample count` samples of
//! `tag | flags | length | data`. The flags byte carries the valid bit
//! (bit 0) and a three bit length encoding (bits 1..3) where the data
//! length is `1 << encoding`; the explicit length byte must agree or
//! the sample is malformed.

use bytes::BufMut;

use crate::msg::{
    CompletionCode, MessageHeader, MessageType, WireError, HDR_LEN, MAX_MESSAGE_LEN,
};

/// Reserved tag carrying the reporting device's 16 byte UUID.
pub const TAG_UUID: u8 = 0xFE;

/// Reserved tag carrying an 8 byte timestamp.
pub const TAG_TIMESTAMP: u8 = 0xFF;

/// Largest tag assignable to a child sensor.
pub const TAG_MAX_CHILD: u8 = 0xFD;

/// One decoded sample. `data` borrows from the response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample<'a> {
    pub tag: u8,
    pub valid: bool,
    pub data: &'a [u8],
}

/// A decoded aggregate response envelope. Iterate `samples()` to walk
/// the sample list; each step re-validates the next sample header.
#[derive(Debug, Clone)]
pub struct AggregateResponse<'a> {
    pub command: u8,
    pub completion: CompletionCode,
    pub reason: u16,
    pub sample_count: u16,
    body: &'a [u8],
}

impl<'a> AggregateResponse<'a> {
    pub fn samples(&self) -> SampleIter<'a> {
        SampleIter {
            remaining: if self.completion.is_success() {
                self.sample_count
            } else {
                0
            },
            buf: self.body,
        }
    }
}

pub struct SampleIter<'a> {
    remaining: u16,
    buf: &'a [u8],
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = Result<Sample<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match split_sample(self.buf) {
            Ok((sample, rest)) => {
                self.buf = rest;
                Some(Ok(sample))
            }
            Err(err) => {
                // A malformed sample header poisons the rest of the
                // walk; the cursor cannot advance past it.
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}

fn split_sample(buf: &[u8]) -> Result<(Sample<'_>, &[u8]), WireError> {
    if buf.len() < 3 {
        return Err(WireError::InvalidLength);
    }
    let tag = buf[0];
    let flags = buf[1];
    let declared = buf[2] as usize;
    let encoding = (flags >> 1) & 0x07;
    if encoding > 4 {
        return Err(WireError::InvalidData);
    }
    if declared != 1usize << encoding {
        return Err(WireError::InvalidData);
    }
    if buf.len() < 3 + declared {
        return Err(WireError::InvalidLength);
    }
    let sample = Sample {
        tag,
        valid: flags & 0x01 != 0,
        data: &buf[3..3 + declared],
    };
    Ok((sample, &buf[3 + declared..]))
}

fn length_encoding(len: usize) -> Result<u8, WireError> {
    match len {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(2),
        8 => Ok(3),
        16 => Ok(4),
        _ => Err(WireError::InvalidData),
    }
}

/// Append one sample to an aggregate response body.
pub fn encode_sample(
    buf: &mut Vec<u8>,
    tag: u8,
    valid: bool,
    data: &[u8],
) -> Result<(), WireError> {
    let encoding = length_encoding(data.len())?;
    buf.put_u8(tag);
    buf.put_u8((encoding << 1) | valid as u8);
    buf.put_u8(data.len() as u8);
    buf.extend_from_slice(data);
    Ok(())
}

/// Encode a complete aggregate response frame.
pub fn encode_aggregate_response(
    instance_id: u8,
    message_type: MessageType,
    command: u8,
    samples: &[(u8, bool, &[u8])],
) -> Result<Vec<u8>, WireError> {
    if samples.len() > u16::MAX as usize {
        return Err(WireError::InvalidLength);
    }
    let mut buf = Vec::with_capacity(HDR_LEN + 4);
    MessageHeader::response(instance_id, message_type).encode_into(&mut buf);
    buf.put_u8(command);
    buf.put_u8(CompletionCode::Success.to_wire());
    buf.put_u16_le(samples.len() as u16);
    for (tag, valid, data) in samples {
        encode_sample(&mut buf, *tag, *valid, data)?;
    }
    if buf.len() > MAX_MESSAGE_LEN {
        return Err(WireError::InvalidLength);
    }
    Ok(buf)
}

/// Decode the envelope of an aggregate response. Samples are validated
/// lazily while iterating.
pub fn decode_aggregate_response(frame: &[u8]) -> Result<AggregateResponse<'_>, WireError> {
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
        if body.len() < 4 {
            return Err(WireError::InvalidLength);
        }
        Ok(AggregateResponse {
            command,
            completion,
            reason: 0,
            sample_count: u16::from_le_bytes([body[2], body[3]]),
            body: &body[4..],
        })
    } else {
        if body.len() != 4 {
            return Err(WireError::InvalidLength);
        }
        Ok(AggregateResponse {
            command,
            completion,
            reason: u16::from_le_bytes([body[2], body[3]]),
            sample_count: 0,
            body: &[],
        })
    }
}

/// Reserved-tag payload: 8 byte little-endian timestamp.
pub fn timestamp_from_sample(data: &[u8]) -> Result<u64, WireError> {
    let bytes: [u8; 8] = data.try_into().map_err(|_| WireError::InvalidLength)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Reserved-tag payload: 16 byte UUID.
pub fn uuid_from_sample(data: &[u8]) -> Result<[u8; 16], WireError> {
    data.try_into().map_err(|_| WireError::InvalidLength)
}

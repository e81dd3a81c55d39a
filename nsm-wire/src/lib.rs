//! Wire codec for the NSM binary protocol.
//!
//! NSM is a request/response/event protocol carried over MCTP. Every
//! message starts with a five byte header (PCI vendor id, flag byte,
//! OCP type/version byte, NSM message type) followed by a command byte
//! and command specific payload. Commands are grouped into message
//! types: device capability discovery, platform telemetry, network
//! ports.
//!
//! Everything in this crate is a pure function over byte slices. The
//! daemon, the mock device and the tests all go through the same
//! encoders and decoders, so a round-trip mismatch shows up on both
//! sides of the socket at once.

pub mod aggregate;
pub mod capability;
pub mod msg;
pub mod telemetry;

pub use msg::{
    CmdResponse, CompletionCode, EventFrame, MessageHeader, MessageType, Response, WireError,
    HDR_LEN, INSTANCE_ID_MASK, MAX_MESSAGE_LEN, OCP_HEADER_BYTE, PCI_VENDOR_ID,
};

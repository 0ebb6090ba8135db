//! Common types, enums, and error definitions for the Garmin device interface

use std::fmt;
use thiserror::Error;

/// Result type alias for Garmin operations
pub type Result<T> = std::result::Result<T, GarminError>;

/// Error types for Garmin communication
#[derive(Error, Debug)]
pub enum GarminError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport timed out")]
    Timeout,

    #[error("Link failure: {0}")]
    LinkFailure(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: u16, got: u16 },

    #[error("Unknown device: product ID {0} has no catalog entry")]
    UnknownDevice(u16),

    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(&'static str),

    #[error("Payload too short: need {needed} bytes, have {available}")]
    ShortPayload { needed: usize, available: usize },

    #[error("Field {field} out of range: {value}")]
    FieldRange { field: &'static str, value: u32 },

    #[error("Transfer aborted: {0}")]
    TransferAborted(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GarminError {
    /// Whether this error is a read/write timeout rather than a hard failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GarminError::Timeout)
    }
}

/// A link-layer packet: an id and a payload.
///
/// On the serial link the id is 8-bit on the wire; on USB it is 16-bit.
/// Framing bytes, checksums, and the USB packet header are outside the
/// logical packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u16,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: u16, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn empty(id: u16) -> Self {
        Self { id, data: Vec::new() }
    }

    /// Packet whose payload is a little-endian u16, the form used by
    /// command packets and ACK/NAK.
    pub fn with_u16(id: u16, value: u16) -> Self {
        Self {
            id,
            data: value.to_le_bytes().to_vec(),
        }
    }

    /// Decode a payload holding a little-endian integer of 1, 2 or 4 bytes.
    pub fn data_as_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        let n = self.data.len().min(4);
        bytes[..n].copy_from_slice(&self.data[..n]);
        u32::from_le_bytes(bytes)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "packet {:3} ({} bytes)", self.id, self.data.len())
    }
}

/// Format bytes as a hex string for debug logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_u16_payload() {
        let packet = Packet::with_u16(10, 450);
        assert_eq!(packet.data, vec![0xc2, 0x01]);
        assert_eq!(packet.data_as_u32(), 450);
    }

    #[test]
    fn test_data_as_u32_short_payload() {
        // Devices answer ACKs with 1- or 2-byte payloads
        let packet = Packet::new(6, vec![254]);
        assert_eq!(packet.data_as_u32(), 254);
        let packet = Packet::empty(6);
        assert_eq!(packet.data_as_u32(), 0);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x10, 0xfe, 0x00]), "10 fe 00");
    }
}

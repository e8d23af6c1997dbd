// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! nrflink wire format: command frames, ack/nak frames and chunk trailers.
//!
//! Everything on the wire is big-endian.
//!
//! ```text
//! command / ack / nak frame   [kind:1][value:4]
//! chunk                       [payload:0..30][seq:2]
//! ```

use serde::{Deserialize, Serialize};
use crate::error::LinkError;

/// Length of every command, ack and nak frame
pub const FRAME_LEN: usize = 5;

/// Length of the sequence trailer appended to each chunk
pub const TRAILER_LEN: usize = 2;

/// Largest packet the radio carries in one write
pub const MAX_PACKET_LEN: usize = 32;

/// Token the downstream consumer writes back once it is awake
pub const WAKE_TOKEN: &str = "awake";

// ============================================================================
// Command Kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Kind {
    /// Negative acknowledgement, value echoes the sequence or count
    Nak = 0x00,
    /// Value is the total byte count
    TransmitBytes = 0x01,
    /// Value is the total byte count; the receiver wakes its host first
    TransmitBytesWithWake = 0x02,
    /// Value is the string length in bytes
    TransmitString = 0x03,
    /// Value is height:u16, width:u16; two pixels per byte
    Transmit3BitPackedImage = 0x04,
    /// Value is height:u16, width:u16; one byte per pixel
    TransmitImageRows = 0x05,
    /// Positive acknowledgement, value echoes the sequence or count
    Ack = 0xFF,
}

impl Kind {
    /// Ack and Nak only ever answer something; they never start a transfer.
    pub fn is_control(self) -> bool {
        matches!(self, Kind::Ack | Kind::Nak)
    }

    pub fn has_dimensions(self) -> bool {
        matches!(self, Kind::Transmit3BitPackedImage | Kind::TransmitImageRows)
    }
}

impl TryFrom<u8> for Kind {
    type Error = LinkError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x00 => Ok(Kind::Nak),
            0x01 => Ok(Kind::TransmitBytes),
            0x02 => Ok(Kind::TransmitBytesWithWake),
            0x03 => Ok(Kind::TransmitString),
            0x04 => Ok(Kind::Transmit3BitPackedImage),
            0x05 => Ok(Kind::TransmitImageRows),
            0xFF => Ok(Kind::Ack),
            other => Err(LinkError::Format(format!("unknown command kind 0x{:02X}", other))),
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub value: u32,
}

impl Frame {
    pub fn new(kind: Kind, value: u32) -> Self {
        Frame { kind, value }
    }

    pub fn ack(value: u32) -> Self {
        Frame::new(Kind::Ack, value)
    }

    pub fn nak(value: u32) -> Self {
        Frame::new(Kind::Nak, value)
    }

    /// Image frames pack height into the high half and width into the low half.
    #[cfg(test)]
    pub fn image(kind: Kind, height: u16, width: u16) -> Self {
        Frame::new(kind, ((height as u32) << 16) | width as u32)
    }

    pub fn dimensions(&self) -> (u16, u16) {
        ((self.value >> 16) as u16, (self.value & 0xFFFF) as u16)
    }

    /// Number of payload bytes that follow this frame, or `None` for control frames.
    pub fn payload_len(&self) -> Option<u32> {
        match self.kind {
            Kind::Ack | Kind::Nak => None,
            Kind::TransmitBytes | Kind::TransmitBytesWithWake | Kind::TransmitString => {
                Some(self.value)
            }
            Kind::TransmitImageRows => {
                let (height, width) = self.dimensions();
                Some(height as u32 * width as u32)
            }
            Kind::Transmit3BitPackedImage => {
                let (height, width) = self.dimensions();
                Some(height as u32 * width as u32 / 2)
            }
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        encode_frame(self.kind, self.value)
    }
}

pub fn encode_frame(kind: Kind, value: u32) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[0] = kind as u8;
    out[1..].copy_from_slice(&value.to_be_bytes());
    out
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, LinkError> {
    if bytes.len() != FRAME_LEN {
        return Err(LinkError::Format(format!(
            "frame must be {} bytes, got {}",
            FRAME_LEN,
            bytes.len()
        )));
    }

    let kind = Kind::try_from(bytes[0])?;
    let value = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Ok(Frame { kind, value })
}

/// Out-of-band status message for the host: a `TransmitString` frame
/// carrying the message length, followed by the UTF-8 message itself.
pub fn status_message(message: &str) -> Vec<u8> {
    let bytes = message.as_bytes();
    let mut out = Vec::with_capacity(FRAME_LEN + bytes.len());
    out.extend_from_slice(&encode_frame(Kind::TransmitString, bytes.len() as u32));
    out.extend_from_slice(bytes);
    out
}

// ============================================================================
// Chunk Trailer
// ============================================================================

pub fn encode_chunk_trailer(seq: u16) -> [u8; TRAILER_LEN] {
    seq.to_be_bytes()
}

pub fn decode_chunk_trailer(bytes: &[u8]) -> Result<u16, LinkError> {
    match bytes {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(LinkError::Format(format!(
            "chunk trailer must be {} bytes, got {}",
            TRAILER_LEN,
            bytes.len()
        ))),
    }
}

pub fn build_chunk(payload: &[u8], seq: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + TRAILER_LEN);
    packet.extend_from_slice(payload);
    packet.extend_from_slice(&encode_chunk_trailer(seq));
    packet
}

/// Splits a received chunk packet into its payload and sequence number.
pub fn split_chunk(packet: &[u8]) -> Result<(&[u8], u16), LinkError> {
    if packet.len() < TRAILER_LEN || packet.len() > MAX_PACKET_LEN {
        return Err(LinkError::Format(format!("bad chunk length {}", packet.len())));
    }
    let (payload, trailer) = packet.split_at(packet.len() - TRAILER_LEN);
    Ok((payload, decode_chunk_trailer(trailer)?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip_edges() {
        for value in [0u32, 1, 30, 65, 0x0102_0304, u32::MAX] {
            let bytes = encode_frame(Kind::TransmitBytes, value);
            let frame = decode_frame(&bytes).expect("valid frame");
            assert_eq!(frame, Frame::new(Kind::TransmitBytes, value));
        }
    }

    #[test]
    fn test_frame_is_big_endian() {
        assert_eq!(encode_frame(Kind::TransmitBytes, 65), [0x01, 0x00, 0x00, 0x00, 0x41]);
        assert_eq!(Frame::ack(0x0A0B0C0D).encode(), [0xFF, 0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(Frame::nak(2).encode(), [0x00, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn test_decode_rejects_bad_length_and_kind() {
        assert!(matches!(decode_frame(&[0x01, 0, 0, 0]), Err(LinkError::Format(_))));
        assert!(matches!(decode_frame(&[0x01, 0, 0, 0, 0, 0]), Err(LinkError::Format(_))));
        assert!(matches!(decode_frame(&[0x7E, 0, 0, 0, 1]), Err(LinkError::Format(_))));
    }

    #[test]
    fn test_image_dimensions_and_payload_len() {
        let rows = Frame::image(Kind::TransmitImageRows, 600, 800);
        assert_eq!(rows.encode(), [0x05, 0x02, 0x58, 0x03, 0x20]);
        assert_eq!(rows.dimensions(), (600, 800));
        assert_eq!(rows.payload_len(), Some(480_000));

        let packed = Frame::image(Kind::Transmit3BitPackedImage, 600, 800);
        assert_eq!(packed.payload_len(), Some(240_000));

        assert_eq!(Frame::ack(7).payload_len(), None);
        assert_eq!(Frame::new(Kind::TransmitString, 12).payload_len(), Some(12));
    }

    #[test]
    fn test_chunk_trailer() {
        assert_eq!(encode_chunk_trailer(0x0102), [0x01, 0x02]);
        assert_eq!(decode_chunk_trailer(&[0xFF, 0xFE]).unwrap(), 0xFFFE);
        assert!(decode_chunk_trailer(&[0x01]).is_err());

        let packet = build_chunk(b"hello", 3);
        assert_eq!(packet, b"hello\x00\x03");
        let (payload, seq) = split_chunk(&packet).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(seq, 3);
    }

    #[test]
    fn test_split_chunk_rejects_malformed() {
        assert!(split_chunk(&[0x00]).is_err());
        assert!(split_chunk(&[0u8; MAX_PACKET_LEN + 1]).is_err());
        let (payload, seq) = split_chunk(&[0x00, 0x09]).unwrap();
        assert!(payload.is_empty());
        assert_eq!(seq, 9);
    }

    #[test]
    fn test_status_message() {
        let msg = status_message("no frame ack");
        assert_eq!(&msg[..FRAME_LEN], &encode_frame(Kind::TransmitString, 12));
        assert_eq!(&msg[FRAME_LEN..], b"no frame ack");
    }
}

//! Protocol codec
//!
//! Encoding and decoding functions for the peer wire protocol.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │ CRC (4)  │      Payload (bincode)      │
//! └──────────┴──────────┴──────────┴─────────────────────────────┘
//! ```

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RepoError, Result};
use super::{PeerRequest, PeerResponse};

/// Header size: 1 byte kind + 4 bytes length + 4 bytes CRC
pub const HEADER_SIZE: usize = 9;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Kind byte of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0x01,
    Response = 0x02,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(FrameKind::Request),
            0x02 => Ok(FrameKind::Response),
            _ => Err(RepoError::Protocol(format!("Unknown frame kind: 0x{:02x}", byte))),
        }
    }
}

// =============================================================================
// Frame Encoding/Decoding
// =============================================================================

fn encode_frame<M: Serialize>(kind: FrameKind, message: &M) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(RepoError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.push(kind as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a header; returns (kind, payload length, crc)
fn parse_header(header: &[u8]) -> Result<(FrameKind, usize, u32)> {
    if header.len() < HEADER_SIZE {
        return Err(RepoError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            header.len()
        )));
    }

    let kind = FrameKind::from_byte(header[0])?;
    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let crc = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(RepoError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok((kind, payload_len as usize, crc))
}

fn decode_payload<M: DeserializeOwned>(expected: FrameKind, kind: FrameKind, crc: u32, payload: &[u8]) -> Result<M> {
    if kind != expected {
        return Err(RepoError::Protocol(format!(
            "Unexpected frame kind: expected {:?}, got {:?}",
            expected, kind
        )));
    }
    if crc32fast::hash(payload) != crc {
        return Err(RepoError::Protocol("Frame checksum mismatch".to_string()));
    }
    Ok(bincode::deserialize(payload)?)
}

fn decode_frame<M: DeserializeOwned>(expected: FrameKind, bytes: &[u8]) -> Result<M> {
    let (kind, payload_len, crc) = parse_header(bytes)?;

    let total_len = HEADER_SIZE + payload_len;
    if bytes.len() < total_len {
        return Err(RepoError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }

    decode_payload(expected, kind, crc, &bytes[HEADER_SIZE..total_len])
}

/// Encode a request frame
pub fn encode_request(request: &PeerRequest) -> Result<Vec<u8>> {
    encode_frame(FrameKind::Request, request)
}

/// Decode a request frame
pub fn decode_request(bytes: &[u8]) -> Result<PeerRequest> {
    decode_frame(FrameKind::Request, bytes)
}

/// Encode a response frame
pub fn encode_response(response: &PeerResponse) -> Result<Vec<u8>> {
    encode_frame(FrameKind::Response, response)
}

/// Decode a response frame
pub fn decode_response(bytes: &[u8]) -> Result<PeerResponse> {
    decode_frame(FrameKind::Response, bytes)
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read one frame, blocking until it is complete
fn read_frame<R: Read, M: DeserializeOwned>(reader: &mut R, expected: FrameKind) -> Result<M> {
    // Read header first
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let (kind, payload_len, crc) = parse_header(&header)?;

    // Read payload
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }

    decode_payload(expected, kind, crc, &payload)
}

/// Read a complete request from a stream
pub fn read_request<R: Read>(reader: &mut R) -> Result<PeerRequest> {
    read_frame(reader, FrameKind::Request)
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<PeerResponse> {
    read_frame(reader, FrameKind::Response)
}

/// Write a request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &PeerRequest) -> Result<()> {
    let bytes = encode_request(request)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &PeerResponse) -> Result<()> {
    let bytes = encode_response(response)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

//! Protocol Module
//!
//! Defines the wire protocol spoken between peers.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │ CRC (4)  │      Payload (bincode)      │
//! └──────────┴──────────┴──────────┴─────────────────────────────┘
//! ```
//! Length and CRC are big-endian; the CRC covers the payload only.
//!
//! ### Frame Kinds
//! - 0x01: REQUEST  - Payload: `PeerRequest`
//! - 0x02: RESPONSE - Payload: `PeerResponse`
//!
//! ### Requests
//! - Prepare { txn_id, ops } -> Ack(accepted)
//! - Commit { txn_id }       -> Ack(true)
//! - Abort { txn_id }        -> Ack(true)
//! - Query { type, query }   -> QueryResult
//! - Ping                    -> Pong

mod messages;
mod codec;

pub use messages::{PeerRequest, PeerResponse};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};

//! Codec Tests
//!
//! Tests for peer request and response framing.

use std::io::Cursor;

use uuid::Uuid;

use atlasrepo::protocol::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, PeerRequest, PeerResponse, HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
use atlasrepo::{DataOp, EntityRecord, KeyBytes, Query, QueryResult, RepoError};

fn sample_record() -> EntityRecord {
    EntityRecord {
        type_name: "Account".to_string(),
        key: KeyBytes::encode(&42u64).unwrap(),
        version: 7,
        payload: bytes::Bytes::from_static(b"opaque"),
    }
}

// =============================================================================
// Request Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_prepare() {
    let txn_id = Uuid::new_v4();
    let request = PeerRequest::Prepare {
        txn_id,
        ops: vec![DataOp::insert(sample_record()), DataOp::delete(sample_record())],
    };

    let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
    match decoded {
        PeerRequest::Prepare { txn_id: id, ops } => {
            assert_eq!(id, txn_id);
            assert_eq!(ops.len(), 2);
            assert_eq!(ops[0].record, sample_record());
        }
        other => panic!("Expected PREPARE, got {:?}", other),
    }
}

#[test]
fn test_encode_decode_query() {
    let request = PeerRequest::Query {
        entity_type: "Account".to_string(),
        query: Query::partition(1, 3, 2),
    };
    let decoded = decode_request(&encode_request(&request).unwrap()).unwrap();
    assert_eq!(decoded, request);
    assert_eq!(decoded.kind(), "query");
}

#[test]
fn test_frame_header_layout() {
    let encoded = encode_request(&PeerRequest::Ping).unwrap();
    let len = u32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]) as usize;

    assert_eq!(encoded[0], 0x01);
    assert_eq!(encoded.len(), HEADER_SIZE + len);
}

// =============================================================================
// Response Encoding/Decoding Tests
// =============================================================================

#[test]
fn test_encode_decode_responses() {
    let responses = vec![
        PeerResponse::Ack(true),
        PeerResponse::Ack(false),
        PeerResponse::Pong,
        PeerResponse::error("boom"),
        PeerResponse::QueryResult(QueryResult::new(true, vec![sample_record()])),
    ];

    for response in responses {
        let decoded = decode_response(&encode_response(&response).unwrap()).unwrap();
        assert_eq!(decoded, response);
    }
}

// =============================================================================
// Error Cases
// =============================================================================

#[test]
fn test_checksum_mismatch() {
    let mut encoded = encode_response(&PeerResponse::error("payload")).unwrap();
    let last = encoded.len() - 1;
    encoded[last] ^= 0xFF;

    assert!(matches!(decode_response(&encoded), Err(RepoError::Protocol(_))));
}

#[test]
fn test_wrong_frame_kind() {
    let encoded = encode_request(&PeerRequest::Ping).unwrap();
    assert!(matches!(decode_response(&encoded), Err(RepoError::Protocol(_))));

    let mut unknown = encoded.clone();
    unknown[0] = 0x7F;
    assert!(matches!(decode_request(&unknown), Err(RepoError::Protocol(_))));
}

#[test]
fn test_incomplete_frames() {
    let encoded = encode_request(&PeerRequest::Commit { txn_id: Uuid::new_v4() }).unwrap();

    assert!(decode_request(&encoded[..HEADER_SIZE - 1]).is_err());
    assert!(decode_request(&encoded[..encoded.len() - 1]).is_err());
}

#[test]
fn test_oversized_length_rejected() {
    let mut frame = vec![0x01];
    frame.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());

    assert!(matches!(decode_request(&frame), Err(RepoError::Protocol(_))));
}

// =============================================================================
// Stream I/O Tests
// =============================================================================

#[test]
fn test_stream_request_response() {
    let txn_id = Uuid::new_v4();
    let mut buffer = Vec::new();
    write_request(&mut buffer, &PeerRequest::Abort { txn_id }).unwrap();
    write_request(&mut buffer, &PeerRequest::Ping).unwrap();

    let mut cursor = Cursor::new(buffer);
    assert_eq!(read_request(&mut cursor).unwrap(), PeerRequest::Abort { txn_id });
    assert_eq!(read_request(&mut cursor).unwrap(), PeerRequest::Ping);
    assert!(matches!(read_request(&mut cursor), Err(RepoError::Io(_))));

    let mut buffer = Vec::new();
    write_response(&mut buffer, &PeerResponse::Ack(true)).unwrap();
    let mut cursor = Cursor::new(buffer);
    assert_eq!(read_response(&mut cursor).unwrap(), PeerResponse::Ack(true));
}

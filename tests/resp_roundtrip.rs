//! Pure protocol-layer properties: no socket involved.

use bytes::BytesMut;
use valkey_client_core::resp::{decode, encode_command, RespToken};
use valkey_client_core::hash_slot;

#[test]
fn encoded_command_decodes_back_to_an_equivalent_array() {
    let frame = encode_command("GET", &[b"foo"]);
    let mut buf = BytesMut::from(&frame[..]);

    let token = decode(&mut buf).unwrap().expect("a full frame was written");
    let RespToken::Array(agg) = token else { panic!("expected an array token") };
    let elements = agg.elements().unwrap();

    assert_eq!(elements.len(), 2);
    assert_eq!(elements[0].as_bytes().unwrap().as_ref(), b"GET");
    assert_eq!(elements[1].as_bytes().unwrap().as_ref(), b"foo");
    assert!(buf.is_empty(), "decode must consume exactly one frame");
}

#[test]
fn decode_reports_incomplete_frames_without_consuming_them() {
    let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$3\r\nfo"[..]);
    assert!(decode(&mut buf).unwrap().is_none());
    assert!(!buf.is_empty());
}

#[test]
fn map_elements_are_flattened_key_value_pairs() {
    let mut buf = BytesMut::from(&b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n"[..]);
    let token = decode(&mut buf).unwrap().unwrap();
    let RespToken::Map(agg) = token else { panic!("expected a map token") };
    assert_eq!(agg.len(), 2);
    assert_eq!(agg.elements().unwrap().len(), 4);
}

#[test]
fn known_slot_vectors_match_the_reference_hash() {
    assert_eq!(hash_slot(b"foo"), 12182);
    assert_eq!(hash_slot(b"{foo}bar"), hash_slot(b"foo"));
}

#![allow(dead_code)]

use std::sync::Once;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

static START: Once = Once::new();

/// Setup function that is only run once, even if called multiple times.
pub fn setup() {
    START.call_once(|| {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(Level::DEBUG)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

pub const BEGIN_REQUEST: u8 = 1;
pub const ABORT_REQUEST: u8 = 2;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const STDERR: u8 = 7;
pub const GET_VALUES: u8 = 9;
pub const GET_VALUES_RESULT: u8 = 10;
pub const UNKNOWN_TYPE: u8 = 11;

/// Encodes one record with zero padding.
pub fn record(r#type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + content.len());
    buf.push(1);
    buf.push(r#type);
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(&(content.len() as u16).to_be_bytes());
    buf.push(0);
    buf.push(0);
    buf.extend_from_slice(content);
    buf
}

/// Encodes a `BeginRequest` record for the responder role.
pub fn begin_request(request_id: u16, keep_connection: bool) -> Vec<u8> {
    record(
        BEGIN_REQUEST,
        request_id,
        &[0, 1, keep_connection as u8, 0, 0, 0, 0, 0],
    )
}

/// Encodes name-value pairs in the FastCGI form.
pub fn nv_pairs(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (name, value) in pairs {
        for len in [name.len(), value.len()] {
            if len < 128 {
                buf.push(len as u8);
            } else {
                buf.extend_from_slice(&(len as u32 | 1 << 31).to_be_bytes());
            }
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf
}

/// Encodes a non-empty `Params` record followed by the empty terminator.
pub fn params(request_id: u16, pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = record(PARAMS, request_id, &nv_pairs(pairs));
    buf.extend_from_slice(&record(PARAMS, request_id, &[]));
    buf
}

/// One record as read back from the wire.
#[derive(Debug)]
pub struct WireRecord {
    pub r#type: u8,
    pub request_id: u16,
    pub content: Vec<u8>,
}

/// Splits a byte stream into records, skipping padding.
///
/// Panics on truncated streams, tests always capture whole records.
pub fn parse_records(mut buf: &[u8]) -> Vec<WireRecord> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        assert!(buf.len() >= 8, "truncated record header");
        assert_eq!(buf[0], 1, "unexpected protocol version");
        let content_length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let padding_length = buf[6] as usize;
        assert!(buf.len() >= 8 + content_length + padding_length, "truncated record");
        records.push(WireRecord {
            r#type: buf[1],
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content: buf[8..8 + content_length].to_vec(),
        });
        buf = &buf[8 + content_length + padding_length..];
    }
    records
}

/// Concatenates the `Stdout` payloads of one request.
pub fn stdout_of(records: &[WireRecord], request_id: u16) -> Vec<u8> {
    records
        .iter()
        .filter(|r| r.r#type == STDOUT && r.request_id == request_id)
        .flat_map(|r| r.content.iter().copied())
        .collect()
}

/// Finds the `EndRequest` record of one request.
pub fn end_request_of(records: &[WireRecord], request_id: u16) -> Option<&WireRecord> {
    records
        .iter()
        .find(|r| r.r#type == END_REQUEST && r.request_id == request_id)
}

/// Decodes name-value pairs from a record payload.
pub fn decode_nv_pairs(mut buf: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    while !buf.is_empty() {
        let mut lens = [0usize; 2];
        for len in &mut lens {
            if buf[0] >> 7 == 0 {
                *len = buf[0] as usize;
                buf = &buf[1..];
            } else {
                *len = (u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]])) as usize;
                buf = &buf[4..];
            }
        }
        let (name, rest) = buf.split_at(lens[0]);
        let (value, rest) = rest.split_at(lens[1]);
        pairs.push((
            String::from_utf8(name.to_vec()).unwrap(),
            String::from_utf8(value.to_vec()).unwrap(),
        ));
        buf = rest;
    }
    pairs
}

// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Internal FastCGI protocol metadata structures and parsing.
//!
//! This module contains the internal structures and constants used
//! for parsing and generating FastCGI protocol messages.

use crate::error::{ServerError, ServerResult};
use bytes::Bytes;
use encoding_rs::Encoding;
use std::fmt::{self, Display};

/// FastCGI protocol version 1
pub(crate) const VERSION_1: u8 = 1;
/// Maximum length for FastCGI content
pub(crate) const MAX_LENGTH: usize = 0xffff;
/// Length of FastCGI header in bytes
pub(crate) const HEADER_LEN: usize = 8;

/// Well-known management variable names answered in `GetValuesResult`.
pub(crate) const FCGI_MAX_CONNS: &str = "FCGI_MAX_CONNS";
pub(crate) const FCGI_MAX_REQS: &str = "FCGI_MAX_REQS";
pub(crate) const FCGI_MPXS_CONNS: &str = "FCGI_MPXS_CONNS";

/// FastCGI record types as defined in the protocol specification.
///
/// Type codes outside the known 1..=11 range are preserved in `Other`, so
/// the original byte can be echoed back in the `UnknownType` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Begin request record type
    BeginRequest,
    /// Abort request record type
    AbortRequest,
    /// End request record type
    EndRequest,
    /// Parameters record type
    Params,
    /// Stdin record type
    Stdin,
    /// Stdout record type
    Stdout,
    /// Stderr record type
    Stderr,
    /// Data record type
    Data,
    /// Get values record type
    GetValues,
    /// Get values result record type
    GetValuesResult,
    /// Unknown type record type
    UnknownType,
    /// Any type code not defined by the protocol
    Other(u8),
}

impl RecordType {
    /// Converts a u8 value to RecordType.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    pub(crate) fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            u => RecordType::Other(u),
        }
    }

    /// Converts the RecordType to its protocol type code.
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(u) => u,
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(&self.to_u8(), f)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Header {
    /// FastCGI protocol version
    pub(crate) version: u8,
    /// Type of the FastCGI record
    pub(crate) r#type: RecordType,
    /// Request ID for this record
    pub(crate) request_id: u16,
    /// Length of the content data
    pub(crate) content_length: u16,
    /// Length of padding data
    pub(crate) padding_length: u8,
    /// Reserved byte
    pub(crate) reserved: u8,
}

impl Header {
    /// Creates a new header with given parameters.
    ///
    /// Outgoing records carry no padding.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `content_length` - Length of the content data
    pub(crate) fn new(r#type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length,
            padding_length: 0,
            reserved: 0,
        }
    }

    /// Packs the header into its 8 byte wire form.
    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let request_id = self.request_id.to_be_bytes();
        let content_length = self.content_length.to_be_bytes();
        [
            self.version,
            self.r#type.to_u8(),
            request_id[0],
            request_id[1],
            content_length[0],
            content_length[1],
            self.padding_length,
            self.reserved,
        ]
    }

    /// Creates a new header from its 8 byte wire form.
    ///
    /// Fails when the version byte is not 1, the framing of the stream can
    /// not be trusted beyond that point.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer containing header data
    pub(crate) fn decode(buf: &[u8; HEADER_LEN]) -> ServerResult<Self> {
        if buf[0] != VERSION_1 {
            return Err(ServerError::UnsupportedVersion { version: buf[0] });
        }
        Ok(Self {
            version: buf[0],
            r#type: RecordType::from_u8(buf[1]),
            request_id: be_buf_to_u16(&buf[2..4]),
            content_length: be_buf_to_u16(&buf[4..6]),
            padding_length: buf[6],
            reserved: buf[7],
        })
    }
}

/// One complete record, header plus content with padding already stripped.
#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub(crate) header: Header,
    pub(crate) content: Bytes,
}

impl Record {
    pub(crate) fn request_id(&self) -> u16 {
        self.header.request_id
    }

    pub(crate) fn r#type(&self) -> RecordType {
        self.header.r#type
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Role {
    /// Responder role - handles requests and returns responses
    Responder = 1,
    /// Authorizer role - performs authorization checks
    Authorizer = 2,
    /// Filter role - filters data between web server and application
    Filter = 3,
}

impl Role {
    /// Converts a u16 value to Role, `None` for role codes not defined by
    /// the protocol.
    ///
    /// # Arguments
    ///
    /// * `u` - The numeric value to convert
    fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Keep connection flag, first bit of the `BeginRequest` flags byte.
const FLAG_KEEP_CONN: u8 = 1;

/// Begin request record body data.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequestBody {
    /// The role requested by the web server, `None` when unknown
    pub(crate) role: Option<Role>,
    /// Whether the connection survives the request
    pub(crate) keep_connection: bool,
}

impl BeginRequestBody {
    /// Decodes a `BeginRequest` record content, `None` when the content is
    /// shorter than role and flags.
    ///
    /// # Arguments
    ///
    /// * `content` - The record content to decode
    pub(crate) fn decode(content: &[u8]) -> Option<Self> {
        if content.len() < 3 {
            return None;
        }
        Some(Self {
            role: Role::from_u16(be_buf_to_u16(&content[0..2])),
            keep_connection: content[2] & FLAG_KEEP_CONN != 0,
        })
    }
}

/// FastCGI protocol status codes.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// Request completed successfully
    RequestComplete = 0,
    /// This app can't multiplex connections
    CantMpxConn = 1,
    /// New request rejected; too busy
    Overloaded = 2,
    /// Role value not known
    UnknownRole = 3,
}

/// Encodes an `EndRequest` record content.
///
/// # Arguments
///
/// * `app_status` - The application status code
/// * `protocol_status` - The protocol status
pub(crate) fn end_request_content(app_status: u32, protocol_status: ProtocolStatus) -> [u8; 8] {
    let status = app_status.to_be_bytes();
    [
        status[0],
        status[1],
        status[2],
        status[3],
        protocol_status as u8,
        0,
        0,
        0,
    ]
}

/// Encodes an `UnknownType` record content, echoing the original type code.
///
/// # Arguments
///
/// * `type_code` - The type byte of the record being answered
pub(crate) fn unknown_type_content(type_code: u8) -> [u8; 8] {
    [type_code, 0, 0, 0, 0, 0, 0, 0]
}

/// Parameter length encoding for FastCGI name-value pairs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ParamLength {
    /// Short length (0-127 bytes)
    Short(u8),
    /// Long length (128+ bytes)
    Long(u32),
}

impl ParamLength {
    /// Creates a new parameter length encoding.
    ///
    /// # Arguments
    ///
    /// * `length` - The length to encode
    pub(crate) fn new(length: usize) -> Self {
        if length < 128 {
            ParamLength::Short(length as u8)
        } else {
            let mut length = length;
            length |= 1 << 31;
            ParamLength::Long(length as u32)
        }
    }

    /// Appends the wire form of the length to a buffer.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer to append to
    pub(crate) fn append_to(self, buf: &mut Vec<u8>) {
        match self {
            ParamLength::Short(l) => buf.push(l),
            ParamLength::Long(l) => buf.extend_from_slice(&l.to_be_bytes()),
        }
    }

    /// Decodes one length field at `pos`, advancing the cursor.
    ///
    /// `None` when the buffer ends inside the field.
    ///
    /// # Arguments
    ///
    /// * `buf` - The buffer containing the length field
    /// * `pos` - The cursor to read at and advance
    fn decode(buf: &[u8], pos: &mut usize) -> Option<usize> {
        let first = *buf.get(*pos)?;
        if first >> 7 == 0 {
            *pos += 1;
            Some(first as usize)
        } else {
            if *pos + 4 > buf.len() {
                return None;
            }
            let len = u32::from_be_bytes([buf[*pos] & 0x7f, buf[*pos + 1], buf[*pos + 2], buf[*pos + 3]]);
            *pos += 4;
            Some(len as usize)
        }
    }
}

/// Decodes as many well-formed name-value pairs as the buffer yields.
///
/// A truncated trailing entry is silently dropped: upstream servers may
/// concatenate `Params` payloads that split mid-pair, the real terminator is
/// the zero-length `Params` record.
///
/// # Arguments
///
/// * `buf` - The buffer containing the encoded pairs
/// * `encoding` - The text encoding of names and values
pub(crate) fn decode_nv_pairs(buf: &[u8], encoding: &'static Encoding) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut pos = 0;

    loop {
        let mut cursor = pos;
        let Some(name_len) = ParamLength::decode(buf, &mut cursor) else {
            break;
        };
        let Some(value_len) = ParamLength::decode(buf, &mut cursor) else {
            break;
        };
        let Some(end) = cursor.checked_add(name_len).and_then(|n| n.checked_add(value_len)) else {
            break;
        };
        if end > buf.len() {
            break;
        }

        let name = encoding.decode(&buf[cursor..cursor + name_len]).0.into_owned();
        let value = encoding.decode(&buf[cursor + name_len..end]).0.into_owned();
        pairs.push((name, value));
        pos = end;
    }

    pairs
}

/// Encodes a sequence of name-value pairs, symmetric with the decoder.
///
/// The 1 byte length form is used for lengths below 128, the 4 byte form
/// with the high bit set otherwise.
///
/// # Arguments
///
/// * `pairs` - The name-value pairs to encode
/// * `encoding` - The text encoding of names and values
pub(crate) fn encode_nv_pairs<'a, I>(pairs: I, encoding: &'static Encoding) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut buf = Vec::new();
    for (name, value) in pairs {
        let name = encoding.encode(name).0;
        let value = encoding.encode(value).0;
        ParamLength::new(name.len()).append_to(&mut buf);
        ParamLength::new(value.len()).append_to(&mut buf);
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&value);
    }
    buf
}

/// Converts big-endian bytes to u16.
///
/// # Arguments
///
/// * `buf` - The buffer containing the bytes
fn be_buf_to_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes(<[u8; 2]>::try_from(buf).unwrap())
}

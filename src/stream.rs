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

//! Framed record stream over an abstract asynchronous byte stream.
//!
//! This module converts a byte stream into a lazy sequence of complete
//! records, handling partial reads and padding, and provides the serialized
//! record write path shared by a connection.

use crate::{
    error::ServerResult,
    meta::{self, Header, ProtocolStatus, Record, RecordType, HEADER_LEN, MAX_LENGTH},
};
use std::{io::ErrorKind, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};

/// An abstract bidirectional byte stream a connection runs over, such as
/// `tokio::net::TcpStream` or `tokio::net::UnixStream`.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub(crate) type BoxedStream = Box<dyn Stream>;

/// Splits a connection stream into its framed read and write halves.
///
/// # Arguments
///
/// * `stream` - The connection stream to split
pub(crate) fn split(stream: BoxedStream) -> (RecordReader, RecordWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (RecordReader { reader }, RecordWriter { writer })
}

/// Outcome of waiting for the next record on a connection.
pub(crate) enum RecordInput {
    /// One complete record.
    Record(Record),
    /// The peer closed the stream before a complete record arrived.
    NoData,
}

/// Reading half of a connection, yielding complete records.
pub(crate) struct RecordReader {
    reader: ReadHalf<BoxedStream>,
}

impl RecordReader {
    /// Waits for the next complete record.
    ///
    /// Reads exactly 8 header bytes, then exactly the content and padding
    /// lengths the header announces. A stream that ends anywhere short of
    /// that yields [`RecordInput::NoData`]; a version byte other than 1
    /// fails with [`ServerError::UnsupportedVersion`].
    ///
    /// [`ServerError::UnsupportedVersion`]: crate::ServerError::UnsupportedVersion
    pub(crate) async fn recv_record(&mut self) -> ServerResult<RecordInput> {
        let mut buf = [0; HEADER_LEN];
        match self.reader.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(RecordInput::NoData),
            Err(e) => return Err(e.into()),
        }
        let header = Header::decode(&buf)?;

        let mut content = vec![0; header.content_length as usize];
        match self.reader.read_exact(&mut content).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(RecordInput::NoData),
            Err(e) => return Err(e.into()),
        }

        let mut padding = vec![0; header.padding_length as usize];
        match self.reader.read_exact(&mut padding).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(RecordInput::NoData),
            Err(e) => return Err(e.into()),
        }

        Ok(RecordInput::Record(Record {
            header,
            content: content.into(),
        }))
    }
}

/// Writing half of a connection.
///
/// The caller guarantees no two concurrent sends on the same connection,
/// every writer lives behind a [`SharedWriter`] mutex.
pub(crate) struct RecordWriter {
    writer: WriteHalf<BoxedStream>,
}

impl RecordWriter {
    /// Writes one record, header then content, with zero padding.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `content` - The content to write
    pub(crate) async fn send_record(
        &mut self, r#type: RecordType, request_id: u16, content: &[u8],
    ) -> ServerResult<()> {
        debug_assert!(content.len() <= MAX_LENGTH);

        let header = Header::new(r#type, request_id, content.len() as u16);
        let mut buf = Vec::with_capacity(HEADER_LEN + content.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(content);
        self.writer.write_all(&buf).await?;
        Ok(())
    }

    /// Fragments a payload into records of up to 65535 bytes each,
    /// preserving byte order. Zero-length input produces no records, the
    /// end-of-stream marker is an explicit empty record.
    ///
    /// # Arguments
    ///
    /// * `r#type` - The type of FastCGI record
    /// * `request_id` - The request ID
    /// * `buf` - The payload to fragment
    pub(crate) async fn send_stream(
        &mut self, r#type: RecordType, request_id: u16, buf: &[u8],
    ) -> ServerResult<()> {
        for chunk in buf.chunks(MAX_LENGTH) {
            self.send_record(r#type, request_id, chunk).await?;
        }
        Ok(())
    }

    /// Streams response body bytes as `Stdout` records.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `buf` - The body bytes to write
    pub(crate) async fn send_buffer(&mut self, request_id: u16, buf: &[u8]) -> ServerResult<()> {
        self.send_stream(RecordType::Stdout, request_id, buf).await
    }

    /// Writes an `EndRequest` record for the given request.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `app_status` - The application status code
    /// * `protocol_status` - The protocol status
    pub(crate) async fn send_end_request(
        &mut self, request_id: u16, app_status: u32, protocol_status: ProtocolStatus,
    ) -> ServerResult<()> {
        let content = meta::end_request_content(app_status, protocol_status);
        self.send_record(RecordType::EndRequest, request_id, &content).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flushes buffered bytes and shuts the stream down for sending.
    ///
    /// Outstanding reads on the peer side return end-of-stream afterwards.
    pub(crate) async fn shutdown(&mut self) -> ServerResult<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Write path of a connection, shared between the dispatcher and every
/// in-flight response. The mutex serializes record writes.
pub(crate) type SharedWriter = Arc<Mutex<RecordWriter>>;

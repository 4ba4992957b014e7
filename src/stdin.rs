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

//! Request input buffer.
//!
//! A lazy byte source backed by `Stdin` records pulled on demand, either
//! straight from the connection (sequential dispatch) or from the request
//! agent's inbox (multiplexed dispatch). Reads interleave with record
//! arrival, the buffer never holds more than what the handler left unread.

use crate::{
    error::{ServerError, ServerResult},
    meta::{Record, RecordType},
    stream::{RecordInput, RecordReader},
};
use bytes::{Bytes, BytesMut};
use std::{
    cmp::min,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Where the buffer pulls `Stdin` records from.
pub(crate) enum StdinSource {
    /// Shared access to the connection's framed reader (sequential mode).
    Reader(Arc<Mutex<RecordReader>>),
    /// The request agent's inbox (multiplexed mode).
    Inbox(mpsc::Receiver<Record>),
}

/// Pull style byte source for the request body.
pub struct InputBuffer {
    request_id: u16,
    source: StdinSource,
    buffer: BytesMut,
    all_read: Arc<AtomicBool>,
    response_closed: Arc<AtomicBool>,
}

impl InputBuffer {
    /// Creates an input buffer for one request.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `source` - Where `Stdin` records are pulled from
    /// * `all_read` - The shared end-of-input flag
    /// * `response_closed` - The paired response's closed flag
    pub(crate) fn new(
        request_id: u16, source: StdinSource, all_read: Arc<AtomicBool>,
        response_closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            request_id,
            source,
            buffer: BytesMut::new(),
            all_read,
            response_closed,
        }
    }

    /// Whether the end-of-input marker has arrived. Once true, no further
    /// `Stdin` records will be appended.
    pub fn all_read(&self) -> bool {
        self.all_read.load(Ordering::Relaxed)
    }

    /// Bytes currently buffered and unread.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Returns up to `n` bytes, never more.
    ///
    /// Pulls additional `Stdin` records until the buffer holds `n` bytes or
    /// the end-of-input marker arrives, whichever first. Fewer than `n`
    /// bytes in the result implies end-of-input.
    ///
    /// # Arguments
    ///
    /// * `n` - The maximum number of bytes to return
    pub async fn get(&mut self, n: usize) -> ServerResult<Bytes> {
        self.ensure_open()?;
        while self.buffer.len() < n && !self.all_read() {
            self.pull().await?;
        }
        let take = min(n, self.buffer.len());
        Ok(self.buffer.split_to(take).freeze())
    }

    /// Pulls records until the end-of-input marker, then returns the
    /// concatenation of all unread bytes.
    pub async fn get_all(&mut self) -> ServerResult<Bytes> {
        self.ensure_open()?;
        while !self.all_read() {
            self.pull().await?;
        }
        Ok(self.buffer.split().freeze())
    }

    /// Closing the response discards pending input, request and response
    /// lifetimes are tied.
    fn ensure_open(&self) -> ServerResult<()> {
        if self.response_closed.load(Ordering::Relaxed) {
            return Err(ServerError::OutputAlreadyClosed);
        }
        Ok(())
    }

    /// Pulls one record from the source and folds it into the buffer.
    async fn pull(&mut self) -> ServerResult<()> {
        let record = match &mut self.source {
            StdinSource::Reader(reader) => {
                match reader.lock().await.recv_record().await? {
                    RecordInput::Record(record) => record,
                    RecordInput::NoData => return Err(ServerError::BufferIsClosed),
                }
            }
            StdinSource::Inbox(inbox) => {
                inbox.recv().await.ok_or(ServerError::BufferIsClosed)?
            }
        };

        match record.r#type() {
            RecordType::Stdin if record.request_id() == self.request_id => {
                if record.content.is_empty() {
                    self.all_read.store(true, Ordering::Relaxed);
                } else {
                    self.buffer.extend_from_slice(&record.content);
                }
            }
            r#type => {
                // The dispatcher should not deliver such records here.
                warn!(
                    request_id = record.request_id(),
                    %r#type,
                    "Skipped non-stdin record in input buffer.",
                );
            }
        }
        Ok(())
    }
}

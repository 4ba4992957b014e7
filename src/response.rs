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

//! Response object.
//!
//! Maintains the response status, header table, cookie table and the
//! headers-sent / output-closed state. Operations are partially ordered:
//! headers must be committed before body bytes, closing the output ends the
//! request on the wire and discards pending input.

use crate::{
    cookie::Cookie,
    error::{ServerError, ServerResult},
    meta::{ProtocolStatus, RecordType},
    stream::SharedWriter,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::debug;

const SET_COOKIE: &str = "Set-Cookie";

/// The mutable part of a response, guarded so the dispatcher can flush
/// whatever the handler left unfinished.
struct State {
    status: u16,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, Cookie>,
    headers_sent: bool,
    stderr_used: bool,
}

/// Handle to the response of one in-flight request.
///
/// The handle is cheap to clone; all clones address the same response
/// state. It must not be shared across tasks.
#[derive(Clone)]
pub struct Response {
    request_id: u16,
    writer: SharedWriter,
    state: Arc<Mutex<State>>,
    closed: Arc<AtomicBool>,
    trace_headers: bool,
}

impl Response {
    /// Creates the response of one request.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `writer` - The connection's shared write path
    /// * `closed` - The shared closed flag, also read by the input buffer
    /// * `trace_headers` - Whether to log the serialized header block
    pub(crate) fn new(
        request_id: u16, writer: SharedWriter, closed: Arc<AtomicBool>, trace_headers: bool,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_owned(), "text/html; charset=utf-8".to_owned());
        Self {
            request_id,
            writer,
            state: Arc::new(Mutex::new(State {
                status: 200,
                headers,
                cookies: BTreeMap::new(),
                headers_sent: false,
                stderr_used: false,
            })),
            closed,
            trace_headers,
        }
    }

    /// The id of the request this response belongs to.
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Whether the header block has been committed to the wire.
    pub fn headers_sent(&self) -> bool {
        self.state.lock().unwrap().headers_sent
    }

    /// Whether the output has been closed.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Sets the HTTP status code, default 200.
    ///
    /// # Arguments
    ///
    /// * `status` - The status code to report
    pub fn set_status(&self, status: u16) -> ServerResult<()> {
        let mut state = self.mutable_state()?;
        state.status = status;
        Ok(())
    }

    /// Sets or overwrites a response header.
    ///
    /// # Arguments
    ///
    /// * `name` - The header name
    /// * `value` - The header value
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) -> ServerResult<()> {
        let mut state = self.mutable_state()?;
        state.headers.insert(name.into(), value.into());
        Ok(())
    }

    /// Removes a response header.
    ///
    /// # Arguments
    ///
    /// * `name` - The header name
    pub fn unset_header(&self, name: &str) -> ServerResult<()> {
        let mut state = self.mutable_state()?;
        state.headers.remove(name);
        Ok(())
    }

    /// Inserts or replaces a cookie, keyed by its name.
    ///
    /// # Arguments
    ///
    /// * `cookie` - The cookie to set
    pub fn set_cookie(&self, cookie: Cookie) -> ServerResult<()> {
        let mut state = self.mutable_state()?;
        state.cookies.insert(cookie.name.clone(), cookie);
        Ok(())
    }

    /// Asks the user agent to drop a cookie: inserts one with an empty
    /// value and an expiry one day in the past.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cookie to drop
    pub fn unset_cookie(&self, name: &str) -> ServerResult<()> {
        self.set_cookie(Cookie::expired(name))
    }

    /// Serializes the header block and emits it as `Stdout`. Idempotent.
    pub async fn send_headers(&self) -> ServerResult<()> {
        if self.closed() {
            return Err(ServerError::OutputAlreadyClosed);
        }
        let Some(block) = self.take_header_block() else {
            return Ok(());
        };
        self.writer
            .lock()
            .await
            .send_buffer(self.request_id, &block)
            .await
    }

    /// Emits response body bytes, committing the header block first if it
    /// has not been sent yet.
    ///
    /// # Arguments
    ///
    /// * `buf` - The body bytes to emit
    pub async fn put(&self, buf: &[u8]) -> ServerResult<()> {
        if self.closed() {
            return Err(ServerError::OutputAlreadyClosed);
        }
        self.send_headers().await?;
        self.writer
            .lock()
            .await
            .send_buffer(self.request_id, buf)
            .await
    }

    /// Emits a string as response body bytes.
    ///
    /// # Arguments
    ///
    /// * `s` - The text to emit
    pub async fn put_str(&self, s: &str) -> ServerResult<()> {
        self.put(s.as_bytes()).await
    }

    /// Routes text to the web server's error log via `Stderr` records.
    ///
    /// # Arguments
    ///
    /// * `s` - The text to log
    pub async fn put_stderr(&self, s: &str) -> ServerResult<()> {
        if self.closed() {
            return Err(ServerError::OutputAlreadyClosed);
        }
        self.state.lock().unwrap().stderr_used = true;
        self.writer
            .lock()
            .await
            .send_stream(RecordType::Stderr, self.request_id, s.as_bytes())
            .await
    }

    /// Closes the output: commits headers if unsent, terminates the output
    /// streams and emits `EndRequest`. Every later send operation fails
    /// with [`ServerError::OutputAlreadyClosed`].
    pub async fn close(&self) -> ServerResult<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Err(ServerError::OutputAlreadyClosed);
        }
        let block = self.take_header_block();
        let stderr_used = self.state.lock().unwrap().stderr_used;

        let mut writer = self.writer.lock().await;
        if let Some(block) = block {
            writer.send_buffer(self.request_id, &block).await?;
        }
        writer.send_record(RecordType::Stdout, self.request_id, &[]).await?;
        if stderr_used {
            writer.send_record(RecordType::Stderr, self.request_id, &[]).await?;
        }
        writer
            .send_end_request(self.request_id, 0, ProtocolStatus::RequestComplete)
            .await
    }

    /// Post-handler cleanup used by the dispatcher: flush headers if
    /// unsent, close the output if still open.
    pub(crate) async fn finish(&self) -> ServerResult<()> {
        if self.closed() {
            return Ok(());
        }
        self.close().await
    }

    fn mutable_state(&self) -> ServerResult<std::sync::MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap();
        if state.headers_sent {
            return Err(ServerError::HeadersAlreadySent);
        }
        Ok(state)
    }

    /// Marks the headers sent and returns the serialized block, `None` when
    /// they were already committed.
    fn take_header_block(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        if state.headers_sent {
            return None;
        }
        state.headers_sent = true;

        let mut block = String::new();
        block.push_str(&format!("Status: {}\r\n", state.status));
        for (name, value) in &state.headers {
            block.push_str(&format!("{name}: {value}\r\n"));
        }
        // An explicitly set Set-Cookie header overrides the cookie table.
        if !state.cookies.is_empty() && !state.headers.contains_key(SET_COOKIE) {
            let joined = state
                .cookies
                .values()
                .map(Cookie::format)
                .collect::<Vec<_>>()
                .join(", ");
            block.push_str(&format!("{SET_COOKIE}: {joined}\r\n"));
        }
        block.push_str("\r\n");

        if self.trace_headers {
            debug!(id = self.request_id, headers = %block.trim_end(), "Response headers.");
        }
        Some(block.into_bytes())
    }
}

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

//! Connection dispatcher.
//!
//! A connection owns the framed stream and drives one of two per-connection
//! state machines over it: sequential dispatch handles one request at a
//! time, multiplexed dispatch routes records to per-request agents so
//! several requests share the connection. Both share the record write path
//! and the management record handling.

use crate::{
    error::ServerResult,
    meta::{self, BeginRequestBody, ProtocolStatus, Record, RecordType, Role},
    params::Params,
    request::Request,
    response::Response,
    server::ServerConfig,
    stdin::{InputBuffer, StdinSource},
    stream::{self, RecordInput, RecordReader, SharedWriter, Stream},
};
use bytes::{Bytes, BytesMut};
use futures_util::{future::join_all, FutureExt};
use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

/// Inbox depth of a multiplexed request agent. The dispatcher awaits
/// capacity instead of dropping records for a known id.
const AGENT_INBOX_CAPACITY: usize = 32;

/// Trait defining the behavior of the two dispatch modes.
pub trait Mode: Send + Sync + 'static {
    /// Whether requests may interleave on the connection.
    fn is_multiplexed() -> bool;
}

/// Sequential dispatch mode.
///
/// One request is in flight at a time; the input buffer pulls `Stdin`
/// records straight from the connection while the handler runs.
pub struct Sequential;

impl Mode for Sequential {
    fn is_multiplexed() -> bool {
        false
    }
}

/// Multiplexed dispatch mode.
///
/// Every request runs as its own task with a bounded record inbox; the
/// dispatcher is the sole producer, the agent the sole consumer.
pub struct Multiplexed;

impl Mode for Multiplexed {
    fn is_multiplexed() -> bool {
        true
    }
}

/// Dispatcher for one live connection.
pub struct Connection<F, Fut, M> {
    reader: Arc<Mutex<RecordReader>>,
    writer: SharedWriter,
    config: Arc<ServerConfig>,
    handler: Arc<F>,
    closed: Arc<AtomicBool>,
    _mode: PhantomData<fn() -> (Fut, M)>,
}

/// The sequential dispatcher's bookkeeping for the request being received.
struct PendingRequest {
    id: u16,
    keep_connection: bool,
    params: BytesMut,
}

impl<F, Fut, M> Connection<F, Fut, M>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
    M: Mode,
{
    /// Creates a dispatcher over a freshly accepted stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted connection stream
    /// * `config` - The server configuration
    /// * `handler` - The user supplied handler
    fn new(stream: impl Stream + 'static, config: Arc<ServerConfig>, handler: Arc<F>) -> Self {
        let (reader, writer) = stream::split(Box::new(stream));
        Self {
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            config,
            handler,
            closed: Arc::new(AtomicBool::new(false)),
            _mode: PhantomData,
        }
    }

    /// Waits for the next record, turning stream end and framing violations
    /// into the dispatcher's exit conditions.
    async fn next_record(&self) -> ServerResult<Option<Record>> {
        match self.reader.lock().await.recv_record().await {
            Ok(RecordInput::Record(record)) => {
                debug!(
                    id = record.request_id(),
                    r#type = %record.r#type(),
                    content_length = record.content.len(),
                    "Received record.",
                );
                Ok(Some(record))
            }
            Ok(RecordInput::NoData) => {
                if !self.closed.load(Ordering::Relaxed) {
                    warn!("Peer closed the connection.");
                }
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Connection terminated.");
                Err(e)
            }
        }
    }

    /// Answers a `GetValues` management record with the requested
    /// well-known keys; unknown keys are omitted.
    ///
    /// # Arguments
    ///
    /// * `content` - The `GetValues` record content naming the queried keys
    async fn reply_get_values(&self, content: &[u8]) -> ServerResult<()> {
        let queried = meta::decode_nv_pairs(content, encoding_rs::UTF_8);
        let mut values = Vec::new();
        for (name, _) in &queried {
            match name.as_str() {
                meta::FCGI_MAX_CONNS => values.push((meta::FCGI_MAX_CONNS, self.config.max_conns.as_str())),
                meta::FCGI_MAX_REQS => values.push((meta::FCGI_MAX_REQS, self.config.max_reqs.as_str())),
                meta::FCGI_MPXS_CONNS => values.push((meta::FCGI_MPXS_CONNS, self.config.mpxs_conns.as_str())),
                name => debug!(name, "Unknown management variable queried."),
            }
        }
        let content = meta::encode_nv_pairs(values.iter().copied(), encoding_rs::UTF_8);
        self.writer
            .lock()
            .await
            .send_record(RecordType::GetValuesResult, 0, &content)
            .await
    }

    /// Answers a record of an unknown type, echoing the type code.
    ///
    /// # Arguments
    ///
    /// * `type_code` - The type byte of the record being answered
    async fn reply_unknown_type(&self, type_code: u8) -> ServerResult<()> {
        self.writer
            .lock()
            .await
            .send_record(RecordType::UnknownType, 0, &meta::unknown_type_content(type_code))
            .await
    }

    /// Ends a request on the wire with an `EndRequest` carrying the given
    /// protocol status.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request ID
    /// * `status` - The protocol status to report
    async fn end_request(&self, request_id: u16, status: ProtocolStatus) -> ServerResult<()> {
        self.writer
            .lock()
            .await
            .send_end_request(request_id, 0, status)
            .await
    }

    /// Validates a `BeginRequest` record, refusing roles this library does
    /// not assume. Returns the body when the request should proceed.
    ///
    /// # Arguments
    ///
    /// * `record` - The `BeginRequest` record to validate
    async fn accept_begin_request(&self, record: &Record) -> ServerResult<Option<BeginRequestBody>> {
        let Some(body) = BeginRequestBody::decode(&record.content) else {
            warn!(id = record.request_id(), "Malformed BeginRequest record, dropped.");
            return Ok(None);
        };
        if body.role != Some(Role::Responder) {
            warn!(id = record.request_id(), role = ?body.role, "Refused non-responder role.");
            self.end_request(record.request_id(), ProtocolStatus::UnknownRole).await?;
            return Ok(None);
        }
        Ok(Some(body))
    }

    /// Marks the connection closed and shuts the stream down for sending.
    async fn close_connection(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(error = %e, "Shutdown failed.");
        }
    }
}

impl<F, Fut> Connection<F, Fut, Sequential>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    /// Serves one connection sequentially until the peer closes it, a
    /// request without the keep-connection flag completes, or an error
    /// terminates it.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted connection stream
    /// * `config` - The server configuration
    /// * `handler` - The user supplied handler
    pub async fn serve(
        stream: impl Stream + 'static, config: Arc<ServerConfig>, handler: Arc<F>,
    ) -> ServerResult<()> {
        Self::new(stream, config, handler).run().await
    }

    async fn run(self) -> ServerResult<()> {
        let mut pending: Option<PendingRequest> = None;

        loop {
            let record = match self.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.close_connection().await;
                    return Err(e);
                }
            };

            match record.r#type() {
                RecordType::GetValues => self.reply_get_values(&record.content).await?,
                RecordType::Other(code) => self.reply_unknown_type(code).await?,
                RecordType::BeginRequest => {
                    if let Some(ref pending) = pending {
                        warn!(
                            id = record.request_id(),
                            active = pending.id,
                            "Multiplexing not offered on this connection, request refused.",
                        );
                        self.end_request(record.request_id(), ProtocolStatus::CantMpxConn).await?;
                        continue;
                    }
                    if let Some(body) = self.accept_begin_request(&record).await? {
                        pending = Some(PendingRequest {
                            id: record.request_id(),
                            keep_connection: body.keep_connection,
                            params: BytesMut::new(),
                        });
                    }
                }
                RecordType::Params => {
                    let Some(ref mut current) = pending else {
                        warn!(id = record.request_id(), "Params record without a request, dropped.");
                        continue;
                    };
                    if current.id != record.request_id() {
                        warn!(id = record.request_id(), "Params record for unknown request id, dropped.");
                        continue;
                    }
                    if !record.content.is_empty() {
                        current.params.extend_from_slice(&record.content);
                        continue;
                    }

                    // The empty Params record: all variables delivered,
                    // hand over to the handler.
                    let current = pending.take().unwrap();
                    let source = StdinSource::Reader(Arc::clone(&self.reader));
                    let all_read = match execute_request(
                        &self.config,
                        &self.writer,
                        &*self.handler,
                        current.id,
                        current.params.freeze(),
                        source,
                    )
                    .await
                    {
                        Ok(all_read) => all_read,
                        Err(e) => {
                            self.close_connection().await;
                            return Err(e);
                        }
                    };

                    if !current.keep_connection {
                        self.close_connection().await;
                        return Ok(());
                    }
                    if !all_read.load(Ordering::Relaxed) {
                        // The handler left body bytes unread; skip them so
                        // the next request starts at a record boundary.
                        if !self.drain_stdin(current.id).await? {
                            return Ok(());
                        }
                    }
                }
                RecordType::AbortRequest => {
                    let Some(ref current) = pending else {
                        warn!(id = record.request_id(), "AbortRequest without a request, dropped.");
                        continue;
                    };
                    if current.id != record.request_id() {
                        warn!(id = record.request_id(), "AbortRequest for unknown request id, dropped.");
                        continue;
                    }
                    debug!(id = current.id, "Request aborted by the web server.");
                    self.end_request(current.id, ProtocolStatus::RequestComplete).await?;
                    let keep = current.keep_connection;
                    pending = None;
                    if !keep {
                        self.close_connection().await;
                        return Ok(());
                    }
                }
                RecordType::Stdin => {
                    warn!(id = record.request_id(), "Stdin record outside an active request, dropped.");
                }
                RecordType::Data => {
                    warn!(id = record.request_id(), "Data record ignored in responder role.");
                }
                r#type => {
                    warn!(id = record.request_id(), %r#type, "Unexpected server-bound record, dropped.");
                }
            }
        }
    }

    /// Discards `Stdin` records up to the end-of-input marker. Returns
    /// false when the peer closed the stream instead.
    ///
    /// # Arguments
    ///
    /// * `id` - The request ID whose unread body is being skipped
    async fn drain_stdin(&self, id: u16) -> ServerResult<bool> {
        loop {
            let record = match self.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => return Ok(false),
                Err(e) => {
                    self.close_connection().await;
                    return Err(e);
                }
            };
            match record.r#type() {
                RecordType::Stdin if record.request_id() == id => {
                    if record.content.is_empty() {
                        return Ok(true);
                    }
                }
                RecordType::GetValues => self.reply_get_values(&record.content).await?,
                RecordType::Other(code) => self.reply_unknown_type(code).await?,
                r#type => {
                    warn!(id = record.request_id(), %r#type, "Unexpected record while skipping unread stdin, dropped.");
                }
            }
        }
    }
}

impl<F, Fut> Connection<F, Fut, Multiplexed>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    /// Serves one connection with request multiplexing until the peer
    /// closes it or an error terminates it, then waits for every in-flight
    /// request to finish.
    ///
    /// # Arguments
    ///
    /// * `stream` - The accepted connection stream
    /// * `config` - The server configuration
    /// * `handler` - The user supplied handler
    pub async fn serve(
        stream: impl Stream + 'static, config: Arc<ServerConfig>, handler: Arc<F>,
    ) -> ServerResult<()> {
        Self::new(stream, config, handler).run().await
    }

    async fn run(self) -> ServerResult<()> {
        let mut agents: HashMap<u16, mpsc::Sender<Record>> = HashMap::new();
        let mut tasks = Vec::new();

        let result = loop {
            let record = match self.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match record.r#type() {
                RecordType::GetValues => {
                    if let Err(e) = self.reply_get_values(&record.content).await {
                        break Err(e);
                    }
                }
                RecordType::Other(code) => {
                    if let Err(e) = self.reply_unknown_type(code).await {
                        break Err(e);
                    }
                }
                RecordType::BeginRequest => {
                    let id = record.request_id();
                    if agents.contains_key(&id) {
                        warn!(id, "BeginRequest for an id already in flight, dropped.");
                        continue;
                    }
                    let body = match self.accept_begin_request(&record).await {
                        Ok(Some(body)) => body,
                        Ok(None) => continue,
                        Err(e) => break Err(e),
                    };
                    let (tx, rx) = mpsc::channel(AGENT_INBOX_CAPACITY);
                    tasks.push(tokio::spawn(agent_task(
                        Arc::clone(&self.config),
                        Arc::clone(&self.writer),
                        Arc::clone(&self.handler),
                        id,
                        body.keep_connection,
                        rx,
                        Arc::clone(&self.closed),
                    )));
                    agents.insert(id, tx);
                }
                RecordType::Params | RecordType::Stdin | RecordType::AbortRequest => {
                    let id = record.request_id();
                    let Some(tx) = agents.get(&id) else {
                        warn!(id, r#type = %record.r#type(), "Record for unknown request id, dropped.");
                        continue;
                    };
                    if tx.send(record).await.is_err() {
                        debug!(id, "Request agent finished, record dropped.");
                        agents.remove(&id);
                    }
                }
                RecordType::Data => {
                    warn!(id = record.request_id(), "Data record ignored in responder role.");
                }
                r#type => {
                    warn!(id = record.request_id(), %r#type, "Unexpected server-bound record, dropped.");
                }
            }
        };

        // Stop routing and wait for every in-flight request to finish
        // before giving the connection up.
        drop(agents);
        join_all(tasks).await;
        self.close_connection().await;
        result
    }
}

/// One multiplexed request agent: accumulates `Params`, then runs the
/// handler with the inbox as the stdin source.
///
/// # Arguments
///
/// * `config` - The server configuration
/// * `writer` - The connection's shared write path
/// * `handler` - The user supplied handler
/// * `id` - The request ID this agent owns
/// * `keep_connection` - Whether the connection survives the request
/// * `inbox` - The agent's record inbox, fed by the dispatcher
/// * `conn_closed` - The connection's closed flag
async fn agent_task<F, Fut>(
    config: Arc<ServerConfig>, writer: SharedWriter, handler: Arc<F>, id: u16,
    keep_connection: bool, mut inbox: mpsc::Receiver<Record>, conn_closed: Arc<AtomicBool>,
) where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    let mut params = BytesMut::new();
    loop {
        let Some(record) = inbox.recv().await else {
            debug!(id, "Dispatcher gone before the request completed.");
            return;
        };
        match record.r#type() {
            RecordType::Params if record.content.is_empty() => break,
            RecordType::Params => params.extend_from_slice(&record.content),
            RecordType::AbortRequest => {
                debug!(id, "Request aborted by the web server.");
                let result = writer
                    .lock()
                    .await
                    .send_end_request(id, 0, ProtocolStatus::RequestComplete)
                    .await;
                if let Err(e) = result {
                    error!(id, error = %e, "Failed to end aborted request.");
                }
                return;
            }
            r#type => warn!(id, %r#type, "Unexpected record before variables completed, dropped."),
        }
    }

    let result = execute_request(
        &config,
        &writer,
        &*handler,
        id,
        params.freeze(),
        StdinSource::Inbox(inbox),
    )
    .await;
    if let Err(e) = result {
        error!(id, error = %e, "Request failed.");
    }

    if !keep_connection {
        conn_closed.store(true, Ordering::Relaxed);
        if let Err(e) = writer.lock().await.shutdown().await {
            debug!(id, error = %e, "Shutdown failed.");
        }
    }
}

/// Runs the handler for one fully received request and settles the
/// response afterwards.
///
/// Returns the shared end-of-input flag so the sequential dispatcher can
/// decide whether unread `Stdin` records remain on the stream.
///
/// # Arguments
///
/// * `config` - The server configuration
/// * `writer` - The connection's shared write path
/// * `handler` - The user supplied handler
/// * `id` - The request ID
/// * `params_buf` - The concatenated `Params` record payload
/// * `source` - Where the input buffer pulls `Stdin` records from
async fn execute_request<F, Fut>(
    config: &ServerConfig, writer: &SharedWriter, handler: &F, id: u16, params_buf: Bytes,
    source: StdinSource,
) -> ServerResult<Arc<AtomicBool>>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    let response_closed = Arc::new(AtomicBool::new(false));
    let all_read = Arc::new(AtomicBool::new(false));

    let params = Params::decode(&params_buf, config.variable_encoding);
    let stdin = InputBuffer::new(id, source, Arc::clone(&all_read), Arc::clone(&response_closed));
    let request = Request::new(id, params, stdin, Arc::clone(&response_closed));
    if config.trace_request_headers {
        debug!(id, headers = ?request.headers(), "Request headers.");
    }

    let response = Response::new(
        id,
        Arc::clone(writer),
        response_closed,
        config.trace_response_headers,
    );
    let finisher = response.clone();

    if config.catch_handler_errors {
        match AssertUnwindSafe(handler(request, response)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(id, error = %e, "Handler returned an error."),
            Err(_) => error!(id, "Handler panicked."),
        }
        finisher.finish().await?;
    } else {
        let result = handler(request, response).await;
        finisher.finish().await?;
        result?;
    }

    debug!(id, "Request completed.");
    Ok(all_read)
}

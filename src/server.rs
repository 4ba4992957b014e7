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

//! Server configuration and the accept loop.
//!
//! The server accepts connections from the web server, filters peer
//! addresses against the optional `FCGI_WEB_SERVER_ADDRS` allow-list and
//! spawns a connection dispatcher per accepted socket.

use crate::{
    conn::{Connection, Multiplexed, Sequential},
    error::ServerResult,
    request::Request,
    response::Response,
    stream::BoxedStream,
};
use encoding_rs::Encoding;
use std::{
    env,
    future::Future,
    io,
    marker::PhantomData,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::net::{TcpListener, TcpSocket};
use tracing::{error, warn};

/// Environment variable holding the comma-separated list of permitted peer
/// addresses.
pub const WEB_SERVER_ADDRS_ENV: &str = "FCGI_WEB_SERVER_ADDRS";

/// How the server obtains its listening socket.
#[derive(Debug, Clone)]
pub enum Bind {
    /// Create and bind a TCP socket on the given endpoint.
    CreateSocket(SocketAddr),
    /// Adopt the listening socket the web server passed as standard input.
    ///
    /// Used under web servers that spawn the responder themselves and hand
    /// the listener over as fd 0.
    #[cfg(unix)]
    UseStdinSocket,
}

/// Configuration of a FastCGI server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How to obtain the listening socket.
    pub bind: Bind,
    /// Listen backlog for `Bind::CreateSocket`.
    pub listen_backlog: u32,
    /// Serve connections concurrently in their own tasks, or one at a time.
    pub concurrent_connections: bool,
    /// Offer request multiplexing on each connection.
    pub multiplexing: bool,
    /// Log handler failures and keep the connection alive instead of
    /// propagating them.
    pub catch_handler_errors: bool,
    /// Log the derived request headers of every request.
    pub trace_request_headers: bool,
    /// Log the serialized header block of every response.
    pub trace_response_headers: bool,
    /// Value reported for `FCGI_MAX_CONNS`.
    pub max_conns: String,
    /// Value reported for `FCGI_MAX_REQS`.
    pub max_reqs: String,
    /// Value reported for `FCGI_MPXS_CONNS`.
    pub mpxs_conns: String,
    /// Text encoding of the FastCGI variables, UTF-8 unless the web server
    /// is configured otherwise.
    pub variable_encoding: &'static Encoding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Bind::CreateSocket(SocketAddr::from(([127, 0, 0, 1], 9000))),
            listen_backlog: 1000,
            concurrent_connections: true,
            multiplexing: false,
            catch_handler_errors: true,
            trace_request_headers: false,
            trace_response_headers: false,
            max_conns: "1000".to_owned(),
            max_reqs: "1000".to_owned(),
            mpxs_conns: "0".to_owned(),
            variable_encoding: encoding_rs::UTF_8,
        }
    }
}

/// The listening socket, TCP or the inherited unix listener.
enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    /// Obtains the listening socket the configuration asks for.
    ///
    /// # Arguments
    ///
    /// * `config` - The server configuration
    fn bind(config: &ServerConfig) -> ServerResult<Self> {
        match config.bind {
            Bind::CreateSocket(addr) => {
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                Ok(Listener::Tcp(socket.listen(config.listen_backlog)?))
            }
            #[cfg(unix)]
            Bind::UseStdinSocket => Ok(Listener::Unix(stdin_listener()?)),
        }
    }

    /// Accepts one connection, returning the stream and the peer address
    /// when the transport has one.
    async fn accept(&self) -> io::Result<(BoxedStream, Option<IpAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Box::new(stream), Some(peer.ip())))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), None))
            }
        }
    }
}

/// Duplicates fd 0 into a tokio unix listener.
#[cfg(unix)]
fn stdin_listener() -> io::Result<tokio::net::UnixListener> {
    use std::os::fd::AsFd;

    let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
    let listener = std::os::unix::net::UnixListener::from(fd);
    listener.set_nonblocking(true)?;
    tokio::net::UnixListener::from_std(listener)
}

/// Parses the `FCGI_WEB_SERVER_ADDRS` allow-list from the environment.
///
/// `None` means every peer is permitted. Malformed entries are skipped with
/// a warning rather than rejecting the whole list.
fn allowed_peers() -> Option<Vec<IpAddr>> {
    let raw = env::var(WEB_SERVER_ADDRS_ENV).ok()?;
    let mut addrs = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse() {
            Ok(addr) => addrs.push(addr),
            Err(_) => warn!(entry, "Skipped malformed address in {WEB_SERVER_ADDRS_ENV}."),
        }
    }
    Some(addrs)
}

/// FastCGI responder server.
///
/// Owns the configuration and the user supplied handler, accepts
/// connections and dispatches them.
pub struct Server<F, Fut> {
    config: Arc<ServerConfig>,
    handler: Arc<F>,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> Server<F, Fut>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    /// Creates a server from a configuration and a handler.
    ///
    /// The handler is invoked exactly once per fully received request. On
    /// return, headers are flushed if unsent and the output is closed if
    /// still open.
    ///
    /// # Arguments
    ///
    /// * `config` - The server configuration
    /// * `handler` - The function invoked for every request
    pub fn new(config: ServerConfig, handler: F) -> Self {
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            _marker: PhantomData,
        }
    }

    /// Binds the listening socket and serves connections until the task is
    /// dropped. Accept failures are logged, the loop never terminates on
    /// them.
    pub async fn run(&self) -> ServerResult<()> {
        let allowed = allowed_peers();
        let listener = Listener::bind(&self.config)?;

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed.");
                    continue;
                }
            };

            // A null peer is accepted to support local pipes.
            if let (Some(allowed), Some(peer)) = (&allowed, peer) {
                if !allowed.contains(&peer) {
                    warn!(%peer, "Connection from unlisted peer refused.");
                    continue;
                }
            }

            let config = Arc::clone(&self.config);
            let handler = Arc::clone(&self.handler);
            if self.config.concurrent_connections {
                tokio::spawn(async move {
                    if let Err(e) = dispatch(stream, config, handler).await {
                        error!(error = %e, "Connection terminated with error.");
                    }
                });
            } else if let Err(e) = dispatch(stream, config, handler).await {
                error!(error = %e, "Connection terminated with error.");
            }
        }
    }
}

/// Hands an accepted stream to the configured dispatcher.
///
/// # Arguments
///
/// * `stream` - The accepted connection stream
/// * `config` - The server configuration
/// * `handler` - The user supplied handler
async fn dispatch<F, Fut>(
    stream: BoxedStream, config: Arc<ServerConfig>, handler: Arc<F>,
) -> ServerResult<()>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ServerResult<()>> + Send + 'static,
{
    if config.multiplexing {
        Connection::<F, Fut, Multiplexed>::serve(stream, config, handler).await
    } else {
        Connection::<F, Fut, Sequential>::serve(stream, config, handler).await
    }
}

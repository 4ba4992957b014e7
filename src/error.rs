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

//! Error types and result type aliases for FastCGI responder operations.
//!
//! This module defines the error types that can occur while serving FastCGI
//! requests and provides convenient type aliases for results.

use std::error::Error;

/// Result type alias for FastCGI responder operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error types that can occur while serving FastCGI requests.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// The response headers were already committed to the wire, header and
    /// cookie mutation is no longer possible.
    #[error("Response headers have already been sent")]
    HeadersAlreadySent,

    /// The response output was already closed, no further send operation is
    /// possible and pending request input is discarded.
    #[error("Response output has already been closed")]
    OutputAlreadyClosed,

    /// The request input buffer lost its record source before the
    /// end-of-input marker arrived.
    #[error("Request input buffer is closed")]
    BufferIsClosed,

    /// A record with a protocol version other than 1 arrived, the framing of
    /// the connection can not be trusted any more.
    #[error("Unsupported FastCGI protocol version `{version}`")]
    UnsupportedVersion {
        /// The version byte found in the record header
        version: u8,
    },

    /// Failure raised by the user supplied handler.
    #[error("Handler failed: {0}")]
    Handler(#[from] Box<dyn Error + Send + Sync>),
}

impl ServerError {
    /// Wraps an arbitrary error as a handler failure.
    pub fn handler<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ServerError::Handler(Box::new(err))
    }
}

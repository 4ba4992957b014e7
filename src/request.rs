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

//! FastCGI request structure.
//!
//! A request is constructed when the terminating empty `Params` record
//! arrives. It carries the decoded variables, the derived header and
//! cookie tables and the pull style input buffer for the request body.

use crate::{
    cookie::{self, Cookie},
    headers::RequestHeader,
    params::Params,
    stdin::InputBuffer,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// One fully received FastCGI request.
pub struct Request {
    id: u16,
    params: Params,
    headers: HashMap<RequestHeader, String>,
    cookies: HashMap<String, Cookie>,
    stdin: InputBuffer,
    response_closed: Arc<AtomicBool>,
}

impl Request {
    /// Creates a request from the decoded variables, deriving the header
    /// and cookie tables.
    ///
    /// # Arguments
    ///
    /// * `id` - The request ID
    /// * `params` - The decoded CGI-style variables
    /// * `stdin` - The request body input buffer
    /// * `response_closed` - The paired response's closed flag
    pub(crate) fn new(
        id: u16, params: Params, stdin: InputBuffer, response_closed: Arc<AtomicBool>,
    ) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in params.iter() {
            if let Some(suffix) = name.strip_prefix("HTTP_") {
                headers.insert(RequestHeader::from_cgi_name(suffix), value.to_owned());
            }
        }

        let mut cookies = HashMap::new();
        if let Some(value) = headers.get(&RequestHeader::Cookie) {
            for cookie in cookie::parse(value) {
                cookies.insert(cookie.name.clone(), cookie);
            }
        }

        Self {
            id,
            params,
            headers,
            cookies,
            stdin,
            response_closed,
        }
    }

    /// The request id assigned by the web server.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The decoded CGI-style variables.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The derived HTTP request headers.
    pub fn headers(&self) -> &HashMap<RequestHeader, String> {
        &self.headers
    }

    /// Looks up one request header.
    ///
    /// # Arguments
    ///
    /// * `header` - The header name to look up
    pub fn header(&self, header: &RequestHeader) -> Option<&str> {
        self.headers.get(header).map(String::as_str)
    }

    /// The cookies sent by the user agent, keyed by name.
    pub fn cookies(&self) -> &HashMap<String, Cookie> {
        &self.cookies
    }

    /// Looks up one cookie by name.
    ///
    /// # Arguments
    ///
    /// * `name` - The cookie name
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    /// The request body input buffer.
    pub fn stdin(&self) -> &InputBuffer {
        &self.stdin
    }

    /// Mutable access to the request body input buffer.
    pub fn stdin_mut(&mut self) -> &mut InputBuffer {
        &mut self.stdin
    }

    /// Whether the paired response has been closed.
    pub fn completed(&self) -> bool {
        self.response_closed.load(Ordering::Relaxed)
    }
}

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

//! Decoded FastCGI variables.
//!
//! The accumulated `Params` payload decodes into a name to value table,
//! with typed accessors for the standard CGI variables. Malformed numeric
//! or address values read as absent rather than failing.

use crate::meta;
use encoding_rs::Encoding;
use std::{collections::HashMap, net::IpAddr};

/// The CGI-style variables of one request.
#[derive(Debug, Clone, Default)]
pub struct Params {
    vars: HashMap<String, String>,
}

impl Params {
    /// Decodes the concatenated `Params` record payload.
    ///
    /// Keys are unique, the last write wins on duplicates.
    ///
    /// # Arguments
    ///
    /// * `buf` - The accumulated `Params` payload
    /// * `encoding` - The text encoding of names and values
    pub(crate) fn decode(buf: &[u8], encoding: &'static Encoding) -> Self {
        let mut vars = HashMap::new();
        for (name, value) in meta::decode_nv_pairs(buf, encoding) {
            vars.insert(name, value);
        }
        Self { vars }
    }

    /// Looks up a variable by its CGI name.
    ///
    /// # Arguments
    ///
    /// * `name` - The CGI variable name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterates over all variables.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether no variables were delivered.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `REQUEST_METHOD`
    pub fn request_method(&self) -> Option<&str> {
        self.get("REQUEST_METHOD")
    }

    /// `QUERY_STRING`
    pub fn query_string(&self) -> Option<&str> {
        self.get("QUERY_STRING")
    }

    /// `SCRIPT_NAME`
    pub fn script_name(&self) -> Option<&str> {
        self.get("SCRIPT_NAME")
    }

    /// `PATH_INFO`
    pub fn path_info(&self) -> Option<&str> {
        self.get("PATH_INFO")
    }

    /// `REQUEST_URI`
    pub fn request_uri(&self) -> Option<&str> {
        self.get("REQUEST_URI")
    }

    /// `DOCUMENT_ROOT`
    pub fn document_root(&self) -> Option<&str> {
        self.get("DOCUMENT_ROOT")
    }

    /// `SERVER_NAME`
    pub fn server_name(&self) -> Option<&str> {
        self.get("SERVER_NAME")
    }

    /// `SERVER_PROTOCOL`
    pub fn server_protocol(&self) -> Option<&str> {
        self.get("SERVER_PROTOCOL")
    }

    /// `CONTENT_TYPE`
    pub fn content_type(&self) -> Option<&str> {
        self.get("CONTENT_TYPE")
    }

    /// `CONTENT_LENGTH`, absent when missing or malformed.
    pub fn content_length(&self) -> Option<u64> {
        self.get("CONTENT_LENGTH")?.parse().ok()
    }

    /// `SERVER_PORT`, absent when missing or malformed.
    pub fn server_port(&self) -> Option<u16> {
        self.get("SERVER_PORT")?.parse().ok()
    }

    /// `REMOTE_PORT`, absent when missing or malformed.
    pub fn remote_port(&self) -> Option<u16> {
        self.get("REMOTE_PORT")?.parse().ok()
    }

    /// `REMOTE_ADDR`, absent when missing or malformed.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.get("REMOTE_ADDR")?.parse().ok()
    }

    /// `SERVER_ADDR`, absent when missing or malformed.
    pub fn server_addr(&self) -> Option<IpAddr> {
        self.get("SERVER_ADDR")?.parse().ok()
    }
}

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

//! Request header names.
//!
//! FastCGI delivers HTTP request headers as `HTTP_*` variables. Known names
//! map to a closed enum, anything else is carried as an extension header
//! with the canonicalized name.

use std::fmt::{self, Display};

/// An HTTP request header name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestHeader {
    Accept,
    AcceptCharset,
    AcceptEncoding,
    AcceptLanguage,
    Allow,
    Authorization,
    CacheControl,
    Connection,
    ContentEncoding,
    ContentLanguage,
    ContentLength,
    ContentLocation,
    ContentMd5,
    ContentRange,
    ContentType,
    Cookie,
    Date,
    Expect,
    Expires,
    From,
    Host,
    IfMatch,
    IfModifiedSince,
    IfNoneMatch,
    IfRange,
    IfUnmodifiedSince,
    KeepAlive,
    LastModified,
    MaxForwards,
    Pragma,
    ProxyAuthorization,
    Range,
    Referer,
    Te,
    Trailer,
    TransferEncoding,
    Translate,
    Upgrade,
    UserAgent,
    Via,
    Warning,
    /// A header outside the known set, carrying its canonicalized name.
    Extension(String),
}

impl RequestHeader {
    /// Maps the part of a CGI variable name after `HTTP_` to a header.
    ///
    /// # Arguments
    ///
    /// * `name` - The variable name suffix, uppercase with underscores
    pub(crate) fn from_cgi_name(name: &str) -> Self {
        match name {
            "ACCEPT" => RequestHeader::Accept,
            "ACCEPT_CHARSET" => RequestHeader::AcceptCharset,
            "ACCEPT_ENCODING" => RequestHeader::AcceptEncoding,
            "ACCEPT_LANGUAGE" => RequestHeader::AcceptLanguage,
            "ALLOW" => RequestHeader::Allow,
            "AUTHORIZATION" => RequestHeader::Authorization,
            "CACHE_CONTROL" => RequestHeader::CacheControl,
            "CONNECTION" => RequestHeader::Connection,
            "CONTENT_ENCODING" => RequestHeader::ContentEncoding,
            "CONTENT_LANGUAGE" => RequestHeader::ContentLanguage,
            "CONTENT_LENGTH" => RequestHeader::ContentLength,
            "CONTENT_LOCATION" => RequestHeader::ContentLocation,
            "CONTENT_MD5" => RequestHeader::ContentMd5,
            "CONTENT_RANGE" => RequestHeader::ContentRange,
            "CONTENT_TYPE" => RequestHeader::ContentType,
            "COOKIE" => RequestHeader::Cookie,
            "DATE" => RequestHeader::Date,
            "EXPECT" => RequestHeader::Expect,
            "EXPIRES" => RequestHeader::Expires,
            "FROM" => RequestHeader::From,
            "HOST" => RequestHeader::Host,
            "IF_MATCH" => RequestHeader::IfMatch,
            "IF_MODIFIED_SINCE" => RequestHeader::IfModifiedSince,
            "IF_NONE_MATCH" => RequestHeader::IfNoneMatch,
            "IF_RANGE" => RequestHeader::IfRange,
            "IF_UNMODIFIED_SINCE" => RequestHeader::IfUnmodifiedSince,
            "KEEP_ALIVE" => RequestHeader::KeepAlive,
            "LAST_MODIFIED" => RequestHeader::LastModified,
            "MAX_FORWARDS" => RequestHeader::MaxForwards,
            "PRAGMA" => RequestHeader::Pragma,
            "PROXY_AUTHORIZATION" => RequestHeader::ProxyAuthorization,
            "RANGE" => RequestHeader::Range,
            "REFERER" => RequestHeader::Referer,
            "TE" => RequestHeader::Te,
            "TRAILER" => RequestHeader::Trailer,
            "TRANSFER_ENCODING" => RequestHeader::TransferEncoding,
            "TRANSLATE" => RequestHeader::Translate,
            "UPGRADE" => RequestHeader::Upgrade,
            "USER_AGENT" => RequestHeader::UserAgent,
            "VIA" => RequestHeader::Via,
            "WARNING" => RequestHeader::Warning,
            name => RequestHeader::Extension(canonicalize(name)),
        }
    }

    /// The canonical wire name of the header.
    pub fn name(&self) -> &str {
        match self {
            RequestHeader::Accept => "Accept",
            RequestHeader::AcceptCharset => "Accept-Charset",
            RequestHeader::AcceptEncoding => "Accept-Encoding",
            RequestHeader::AcceptLanguage => "Accept-Language",
            RequestHeader::Allow => "Allow",
            RequestHeader::Authorization => "Authorization",
            RequestHeader::CacheControl => "Cache-Control",
            RequestHeader::Connection => "Connection",
            RequestHeader::ContentEncoding => "Content-Encoding",
            RequestHeader::ContentLanguage => "Content-Language",
            RequestHeader::ContentLength => "Content-Length",
            RequestHeader::ContentLocation => "Content-Location",
            RequestHeader::ContentMd5 => "Content-MD5",
            RequestHeader::ContentRange => "Content-Range",
            RequestHeader::ContentType => "Content-Type",
            RequestHeader::Cookie => "Cookie",
            RequestHeader::Date => "Date",
            RequestHeader::Expect => "Expect",
            RequestHeader::Expires => "Expires",
            RequestHeader::From => "From",
            RequestHeader::Host => "Host",
            RequestHeader::IfMatch => "If-Match",
            RequestHeader::IfModifiedSince => "If-Modified-Since",
            RequestHeader::IfNoneMatch => "If-None-Match",
            RequestHeader::IfRange => "If-Range",
            RequestHeader::IfUnmodifiedSince => "If-Unmodified-Since",
            RequestHeader::KeepAlive => "Keep-Alive",
            RequestHeader::LastModified => "Last-Modified",
            RequestHeader::MaxForwards => "Max-Forwards",
            RequestHeader::Pragma => "Pragma",
            RequestHeader::ProxyAuthorization => "Proxy-Authorization",
            RequestHeader::Range => "Range",
            RequestHeader::Referer => "Referer",
            RequestHeader::Te => "TE",
            RequestHeader::Trailer => "Trailer",
            RequestHeader::TransferEncoding => "Transfer-Encoding",
            RequestHeader::Translate => "Translate",
            RequestHeader::Upgrade => "Upgrade",
            RequestHeader::UserAgent => "User-Agent",
            RequestHeader::Via => "Via",
            RequestHeader::Warning => "Warning",
            RequestHeader::Extension(name) => name,
        }
    }
}

impl Display for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        Display::fmt(self.name(), f)
    }
}

/// Turns an `HTTP_*` suffix into a canonical header name: `_`-split tokens
/// are title-cased and rejoined with `-`.
///
/// # Arguments
///
/// * `name` - The variable name suffix to canonicalize
fn canonicalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, token) in name.split('_').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = token.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            for c in chars {
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_map_to_the_closed_set() {
        assert_eq!(RequestHeader::from_cgi_name("USER_AGENT"), RequestHeader::UserAgent);
        assert_eq!(RequestHeader::from_cgi_name("COOKIE"), RequestHeader::Cookie);
        assert_eq!(RequestHeader::from_cgi_name("TE"), RequestHeader::Te);
        assert_eq!(RequestHeader::UserAgent.name(), "User-Agent");
    }

    #[test]
    fn unknown_names_canonicalize() {
        assert_eq!(
            RequestHeader::from_cgi_name("X_CUSTOM_HEADER"),
            RequestHeader::Extension("X-Custom-Header".to_owned())
        );
        assert_eq!(
            RequestHeader::from_cgi_name("X_CUSTOM_HEADER").name(),
            "X-Custom-Header"
        );
        assert_eq!(
            RequestHeader::from_cgi_name("DNT"),
            RequestHeader::Extension("Dnt".to_owned())
        );
    }
}

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

//! Cookie parsing and formatting.
//!
//! The parser accepts `Cookie:` header values in RFC 2109 syntax, the
//! formatter produces the `Set-Cookie` attribute lists the response object
//! emits. Both `;` and `,` are accepted as item separators, user agents
//! disagree on which one to send.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Write;

/// One HTTP cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name
    pub name: String,
    /// Cookie value
    pub value: String,
    /// `Path` attribute
    pub path: Option<String>,
    /// `Domain` attribute
    pub domain: Option<String>,
    /// `Expires` attribute, UTC
    pub expires: Option<DateTime<Utc>>,
    /// `Secure` flag
    pub secure: bool,
    /// RFC 2109 `Version`
    pub version: Option<u32>,
}

impl Cookie {
    /// Creates a cookie with only name and value set.
    ///
    /// # Arguments
    ///
    /// * `name` - The cookie name
    /// * `value` - The cookie value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            expires: None,
            secure: false,
            version: None,
        }
    }

    /// Creates a deletion marker: empty value, expiry one day in the past.
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cookie to delete
    pub(crate) fn expired(name: impl Into<String>) -> Self {
        let mut cookie = Self::new(name, "");
        cookie.expires = Some(Utc::now() - TimeDelta::days(1));
        cookie
    }

    /// Formats the cookie as a `Set-Cookie` attribute list.
    ///
    /// The primary name-value is quoted, `Version` is unquoted, `Secure` is
    /// a valueless flag. The expiry uses the culture-neutral
    /// `ddd, dd-MMM-yy hh:mm:ss GMT` form.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}=\"{}\"", self.name, self.value);
        if let Some(version) = self.version {
            let _ = write!(out, "; Version={version}");
        }
        if let Some(ref path) = self.path {
            let _ = write!(out, "; Path=\"{path}\"");
        }
        if let Some(ref domain) = self.domain {
            let _ = write!(out, "; Domain=\"{domain}\"");
        }
        if let Some(expires) = self.expires {
            let _ = write!(out, "; Expires=\"{}\"", expires.format("%a, %d-%b-%y %H:%M:%S GMT"));
        }
        if self.secure {
            out.push_str("; Secure");
        }
        out
    }
}

/// Parses a `Cookie:` header value into an ordered sequence of cookies.
///
/// Fail-soft: malformed syntax yields no cookies rather than an error, a
/// strict parser would drop entire requests from unusual user agents.
///
/// # Arguments
///
/// * `input` - The `Cookie:` header value
pub(crate) fn parse(input: &str) -> Vec<Cookie> {
    Parser::new(input).run().unwrap_or_default()
}

/// The tspecials of RFC 2109, token characters are printable non-controls
/// excluding these.
fn is_tspecial(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
    )
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_graphic() && !is_tspecial(b)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    /// `None` means malformed input, the whole parse is abandoned.
    fn run(mut self) -> Option<Vec<Cookie>> {
        let mut cookies: Vec<Cookie> = Vec::new();
        let mut version: Option<u32> = None;

        loop {
            let name = self.token()?;
            self.expect(b'=')?;
            let value = self.value()?;

            match name {
                "$Version" => {
                    // Parse errors keep the previous version.
                    if let Ok(v) = value.parse() {
                        version = Some(v);
                    }
                }
                "$Path" => {
                    if let Some(last) = cookies.last_mut() {
                        last.path = Some(value);
                    }
                }
                "$Domain" => {
                    if let Some(last) = cookies.last_mut() {
                        last.domain = Some(value);
                    }
                }
                _ => {
                    let mut cookie = Cookie::new(name, value);
                    cookie.version = version;
                    cookies.push(cookie);
                }
            }

            if self.pos == self.bytes.len() {
                return Some(cookies);
            }
            self.separator()?;
        }
    }

    /// A run of token characters, at least one.
    fn token(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while self.pos < self.bytes.len() && is_token_char(self.bytes[self.pos]) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()
    }

    /// A token run (possibly empty) or a double-quoted string with the
    /// quotes stripped, no escape processing.
    fn value(&mut self) -> Option<String> {
        if self.bytes.get(self.pos) == Some(&b'"') {
            self.pos += 1;
            let start = self.pos;
            while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
                self.pos += 1;
            }
            if self.pos == self.bytes.len() {
                // Unterminated quote.
                return None;
            }
            let value = std::str::from_utf8(&self.bytes[start..self.pos]).ok()?;
            self.pos += 1;
            Some(value.to_owned())
        } else {
            let start = self.pos;
            while self.pos < self.bytes.len() && is_token_char(self.bytes[self.pos]) {
                self.pos += 1;
            }
            let value = std::str::from_utf8(&self.bytes[start..self.pos]).ok()?;
            Some(value.to_owned())
        }
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        if self.bytes.get(self.pos) == Some(&b) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    /// `;` or `,`, with an optional single space after.
    fn separator(&mut self) -> Option<()> {
        match self.bytes.get(self.pos) {
            Some(b';') | Some(b',') => self.pos += 1,
            _ => return None,
        }
        if self.bytes.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_plain_pairs() {
        let cookies = parse("foo=bar; baz=qux");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "foo");
        assert_eq!(cookies[0].value, "bar");
        assert_eq!(cookies[1].name, "baz");
        assert_eq!(cookies[1].value, "qux");
    }

    #[test]
    fn parses_version_path_and_quotes() {
        let cookies = parse("$Version=1; foo=\"bar\"; $Path=/; baz=qux");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0].name, "foo");
        assert_eq!(cookies[0].value, "bar");
        assert_eq!(cookies[0].path.as_deref(), Some("/"));
        assert_eq!(cookies[0].version, Some(1));
        assert_eq!(cookies[1].value, "qux");
        assert_eq!(cookies[1].version, Some(1));
    }

    #[test]
    fn comma_separator_accepted() {
        let cookies = parse("a=1, b=2,c=3");
        assert_eq!(cookies.len(), 3);
        assert_eq!(cookies[2].value, "3");
    }

    #[test]
    fn bad_version_keeps_previous() {
        let cookies = parse("$Version=one; a=1");
        assert_eq!(cookies[0].version, None);
    }

    #[test]
    fn malformed_yields_nothing() {
        assert!(parse("foo").is_empty());
        assert!(parse("foo=\"bar").is_empty());
        assert!(parse("=bar").is_empty());
        assert!(parse("foo=bar;; baz=qux").is_empty());
    }

    #[test]
    fn empty_bare_value_accepted() {
        let cookies = parse("foo=; bar=1");
        assert_eq!(cookies[0].value, "");
        assert_eq!(cookies[1].value, "1");
    }

    #[test]
    fn format_full_attribute_list() {
        let mut cookie = Cookie::new("session", "abc");
        cookie.version = Some(1);
        cookie.path = Some("/app".to_owned());
        cookie.domain = Some("example.com".to_owned());
        cookie.expires = Some(Utc.with_ymd_and_hms(2026, 3, 9, 8, 15, 0).unwrap());
        cookie.secure = true;

        assert_eq!(
            cookie.format(),
            "session=\"abc\"; Version=1; Path=\"/app\"; Domain=\"example.com\"; \
             Expires=\"Mon, 09-Mar-26 08:15:00 GMT\"; Secure"
        );
    }

    #[test]
    fn expired_marker_lies_in_the_past() {
        let cookie = Cookie::expired("gone");
        assert_eq!(cookie.value, "");
        assert!(cookie.expires.unwrap() < Utc::now());
    }
}

//! Parsing of `Cookie` request headers and rendering of `Set-Cookie` response headers.
//!
//! The rendered format is byte-exact: `name=value[; expires=...][; path=...][; domain=...][; secure][; httponly]`,
//! with dates formatted as `Dow, DD-Mon-YYYY HH:MM:SS GMT`.

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;

/// The name of the response header carrying a cookie.
pub const SET_COOKIE: &str = "Set-Cookie";

/// Deleted cookies expire one year and one second in the past.
const DELETION_AGE_SECONDS: i64 = 31_536_001;

const EXPIRES_FORMAT: &str = "%a, %d-%b-%Y %H:%M:%S GMT";

const FORBIDDEN_IN_NAME: &[char] = &['=', ',', ';', ' ', '\t', '\r', '\n', '\x0B', '\x0C'];
const FORBIDDEN_IN_RAW_VALUE: &[char] = &[',', ';', ' ', '\t', '\r', '\n', '\x0B', '\x0C'];

/// Everything but alphanumerics and `-_.` is escaped in encoded cookie values,
/// and spaces are written as `+`.
const COOKIE_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Parse a raw `Cookie` header into a mapping from cookie names to percent-decoded values.
///
/// Pairs are separated by `"; "` and split at their first `=`.
/// Pairs without `=` are skipped, and if a name occurs twice, the later value wins.
/// This never fails: a malformed header yields whatever pairs could be recovered.
///
/// ```rust
/// use locked_session::parse_cookie_header;
///
/// let cookies = parse_cookie_header("SESSID=abc-1; theme=dark%20blue");
/// assert_eq!(cookies["SESSID"], "abc-1");
/// assert_eq!(cookies["theme"], "dark blue");
/// assert!(parse_cookie_header("").is_empty());
/// ```
pub fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    raw.split("; ")
        .filter_map(|pair| pair.split_once('='))
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.to_owned(), decode_value(value)))
        .collect()
}

fn decode_value(value: &str) -> String {
    let value = value.replace('+', " ");
    percent_decode_str(&value).decode_utf8_lossy().into_owned()
}

/// Returns an error if `name` cannot be used as a cookie name.
pub fn validate_cookie_name(name: &str) -> Result {
    if name.contains(FORBIDDEN_IN_NAME) {
        Err(Error::InvalidName(name.to_owned()))
    } else {
        Ok(())
    }
}

/// The parts of a `Set-Cookie` header.
///
/// An empty `value` renders a deletion cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCookie<'a> {
    /// The cookie name. Must not contain any of `=,; \t\r\n\x0B\x0C`.
    pub name: &'a str,
    /// The cookie value.
    pub value: &'a str,
    /// Unix timestamp at which the cookie expires. Values `<= 0` make it a session cookie.
    pub expires: i64,
    /// The `path` attribute.
    pub path: Option<&'a str>,
    /// The `domain` attribute.
    pub domain: Option<&'a str>,
    /// Whether to set the `secure` flag.
    pub secure: bool,
    /// Whether to set the `httponly` flag.
    pub http_only: bool,
    /// If true, the value is emitted verbatim instead of being percent-encoded.
    pub raw: bool,
}

impl<'a> SetCookie<'a> {
    /// A cookie with the given name and value, no expiry, attributes or flags.
    pub fn new(name: &'a str, value: &'a str) -> Self {
        Self {
            name,
            value,
            expires: 0,
            path: None,
            domain: None,
            secure: false,
            http_only: false,
            raw: false,
        }
    }

    /// A cookie that tells the client to delete the cookie `name`.
    pub fn deletion(name: &'a str) -> Self {
        Self::new(name, "")
    }

    /// Render the value of the `Set-Cookie` header.
    ///
    /// `now` is only used for deletion cookies, which expire one year in the past.
    ///
    /// ```rust
    /// use chrono::{TimeZone, Utc};
    /// use locked_session::SetCookie;
    ///
    /// let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    /// let cookie = SetCookie {
    ///     expires: 1_700_000_000,
    ///     path: Some("/"),
    ///     http_only: true,
    ///     ..SetCookie::new("SESSID", "abc")
    /// };
    /// assert_eq!(
    ///     cookie.render(now).unwrap(),
    ///     "SESSID=abc; expires=Tue, 14-Nov-2023 22:13:20 GMT; path=/; httponly"
    /// );
    /// ```
    pub fn render(&self, now: DateTime<Utc>) -> Result<String> {
        validate_cookie_name(self.name)?;
        if self.raw && self.value.contains(FORBIDDEN_IN_RAW_VALUE) {
            return Err(Error::InvalidValue(self.value.to_owned()));
        }

        let mut header = format!("{}=", self.name);

        if self.value.is_empty() {
            let expires = format_expires(now.timestamp() - DELETION_AGE_SECONDS)?;
            header.push_str("deleted; expires=");
            header.push_str(&expires);
        } else {
            if self.raw {
                header.push_str(self.value);
            } else {
                let encoded = utf8_percent_encode(self.value, COOKIE_VALUE).to_string();
                // Form encoding: spaces become `+`, a literal `+` is escaped as `%2B`.
                header.push_str(&encoded.replace("%20", "+"));
            }

            if self.expires > 0 {
                header.push_str("; expires=");
                header.push_str(&format_expires(self.expires)?);
            }
        }

        if let Some(path) = self.path {
            header.push_str("; path=");
            header.push_str(path);
        }
        if let Some(domain) = self.domain {
            header.push_str("; domain=");
            header.push_str(domain);
        }
        if self.secure {
            header.push_str("; secure");
        }
        if self.http_only {
            header.push_str("; httponly");
        }

        Ok(header)
    }
}

fn format_expires(timestamp: i64) -> Result<String> {
    let expires = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or(Error::ExpiryOutOfRange(timestamp))?;
    Ok(expires.format(EXPIRES_FORMAT).to_string())
}

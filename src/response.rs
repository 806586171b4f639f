//! Response building and wire serialization.
//!
//! Handlers construct a `Response` value; the serializer turns it into
//! wire bytes and is the single authority on framing-critical headers.
//! In particular Content-Length is always recomputed from the actual
//! body, because a disagreeing caller-supplied value is a truncation or
//! smuggling bug waiting to happen.

use std::time::SystemTime;

use log::error;
use serde::Serialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::headers::is_content_length;

/// IMF-fixdate per RFC 7231, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const IMF_FIXDATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] \
     [hour]:[minute]:[second] GMT"
);

pub fn http_date(now: SystemTime) -> String {
    OffsetDateTime::from(now)
        .format(&IMF_FIXDATE)
        .unwrap_or_else(|_| "Thu, 01 Jan 1970 00:00:00 GMT".to_string())
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// A response as the business layer sees it: status, headers, body.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn ok() -> Response {
        Response::new(200)
    }

    pub fn not_found() -> Response {
        Response::with_error(404, "Not Found")
    }

    /// An error response with a small JSON body, the shape every
    /// synthesized error in this server uses.
    pub fn with_error(status: u16, message: &str) -> Response {
        Response::new(status).json(&serde_json::json!({ "error": message }))
    }

    /// Set a header, replacing any existing value under the same name
    /// (case-insensitive).
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    /// Set a header only if it is not present yet.
    pub fn set_header_if_absent(&mut self, name: &str, value: &str) {
        if self.header_value(name).is_none() {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| &v[..])
    }

    pub fn header(mut self, name: &str, value: &str) -> Response {
        self.set_header(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Response {
        self.body = body.into();
        self
    }

    pub fn text(self, text: &str) -> Response {
        self.header("Content-Type", "text/plain; charset=utf-8")
            .body(text.as_bytes().to_vec())
    }

    pub fn html(self, html: &str) -> Response {
        self.header("Content-Type", "text/html; charset=utf-8")
            .body(html.as_bytes().to_vec())
    }

    pub fn json<T: Serialize>(self, value: &T) -> Response {
        match serde_json::to_vec(value) {
            Ok(encoded) => self
                .header("Content-Type", "application/json")
                .body(encoded),
            Err(err) => {
                error!("response body serialization failed: {}", err);
                Response::new(500)
                    .header("Content-Type", "text/plain; charset=utf-8")
                    .body(&b"body serialization failed"[..])
            }
        }
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Serialize into wire bytes.
    ///
    /// Content-Length is computed from the actual body length and
    /// overrides whatever the caller set. Date and Server are filled in
    /// when absent. Everything is joined with CRLF.
    pub fn to_bytes(&self, server_name: &str, now: SystemTime) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 256);
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        let mut have_date = false;
        let mut have_server = false;
        for (name, value) in &self.headers {
            if is_content_length(name) {
                continue;
            }
            if name.eq_ignore_ascii_case("date") {
                have_date = true;
            }
            if name.eq_ignore_ascii_case("server") {
                have_server = true;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if !have_date {
            out.extend_from_slice(format!("Date: {}\r\n", http_date(now)).as_bytes());
        }
        if !have_server {
            out.extend_from_slice(format!("Server: {}\r\n", server_name).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, SystemTime};

    use super::{http_date, reason_phrase, Response};

    const SERVER: &str = "stoker-http/0.1";

    fn epoch() -> SystemTime {
        SystemTime::UNIX_EPOCH
    }

    fn as_text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_http_date_format() {
        assert_eq!(http_date(epoch()), "Thu, 01 Jan 1970 00:00:00 GMT");
        let later = epoch() + Duration::from_secs(784_111_777);
        assert_eq!(http_date(later), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_reason_phrases() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(503), "Service Unavailable");
        assert_eq!(reason_phrase(599), "Unknown");
    }

    #[test]
    fn test_simple_serialization() {
        let wire = as_text(Response::ok().text("hi").to_bytes(SERVER, epoch()));
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(wire.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(wire.contains("Content-Length: 2\r\n"));
        assert!(wire.contains("Date: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(wire.contains(&format!("Server: {}\r\n", SERVER)));
        assert!(wire.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn test_content_length_authority() {
        // a lying Content-Length never reaches the wire
        let resp = Response::ok()
            .header("Content-Length", "9999")
            .body(&b"hello"[..]);
        let wire = as_text(resp.to_bytes(SERVER, epoch()));
        assert!(wire.contains("Content-Length: 5\r\n"));
        assert!(!wire.contains("9999"));
    }

    #[test]
    fn test_caller_date_and_server_kept() {
        let resp = Response::ok()
            .header("Date", "Sun, 06 Nov 1994 08:49:37 GMT")
            .header("Server", "custom/2.0");
        let wire = as_text(resp.to_bytes(SERVER, epoch()));
        assert!(wire.contains("Date: Sun, 06 Nov 1994 08:49:37 GMT\r\n"));
        assert!(wire.contains("Server: custom/2.0\r\n"));
        assert!(!wire.contains(SERVER));
    }

    #[test]
    fn test_set_header_replaces() {
        let mut resp = Response::ok();
        resp.set_header("Connection", "keep-alive");
        resp.set_header("connection", "close");
        assert_eq!(resp.header_value("Connection"), Some("close"));
        resp.set_header_if_absent("Connection", "keep-alive");
        assert_eq!(resp.header_value("Connection"), Some("close"));
    }

    #[test]
    fn test_error_body_is_json() {
        let resp = Response::with_error(503, "server overloaded");
        assert_eq!(resp.status, 503);
        assert_eq!(resp.header_value("Content-Type"), Some("application/json"));
        let parsed: serde_json::Value = serde_json::from_slice(resp.body_bytes()).unwrap();
        assert_eq!(parsed["error"], "server overloaded");
    }
}

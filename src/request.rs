//! Request parsing: a framed message in, a validated `Request` out.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::str::from_utf8;

use percent_encoding::percent_decode_str;

use crate::error::RequestError;
use crate::headers;
use crate::message::FramedMessage;
use crate::version::Version;

/// Note httparse requires we preallocate array of this size so be wise
pub const MAX_HEADERS_NUM: usize = 256;

/// The request methods this server is willing to dispatch.
///
/// Anything outside this RFC 7231 set is rejected with 405 before the
/// request ever reaches a handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
}

impl Method {
    pub fn from_token(token: &str) -> Option<Method> {
        use self::Method::*;
        match token {
            "GET" => Some(Get),
            "HEAD" => Some(Head),
            "POST" => Some(Post),
            "PUT" => Some(Put),
            "DELETE" => Some(Delete),
            "PATCH" => Some(Patch),
            "OPTIONS" => Some(Options),
            "TRACE" => Some(Trace),
            "CONNECT" => Some(Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use self::Method::*;
        match *self {
            Get => "GET",
            Head => "HEAD",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Patch => "PATCH",
            Options => "OPTIONS",
            Trace => "TRACE",
            Connect => "CONNECT",
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed HTTP request.
///
/// Header names are lowercased at parse time, repeated headers are
/// joined with `", "`. The value is read-only after parsing except for
/// `path_params`, which the router fills in during dispatch.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Request path, percent-decoded, without the query string.
    pub path: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    /// Query parameters; repeated keys are legal so values are ordered
    /// lists.
    pub query: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
    pub path_params: HashMap<String, String>,
    pub peer: SocketAddr,
}

impl Request {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| &v[..])
    }

    /// First value of a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .get(name)
            .and_then(|values| values.first())
            .map(|v| &v[..])
    }

    /// All values of a query parameter, empty if absent.
    pub fn query_all(&self, name: &str) -> &[String] {
        self.query.get(name).map_or(&[][..], |values| &values[..])
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Media type from Content-Type with any parameters stripped.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or("").trim())
            .filter(|ct| !ct.is_empty())
    }

    pub fn is_json(&self) -> bool {
        self.content_type() == Some("application/json")
    }

    /// Parse the body as JSON.
    ///
    /// This is an explicit accessor rather than a lazily cached field:
    /// callers that need the value more than once keep it themselves.
    pub fn json(&self) -> Result<serde_json::Value, RequestError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn set_path_param(&mut self, name: &str, value: &str) {
        self.path_params.insert(name.to_string(), value.to_string());
    }

    /// Whether the client is eligible for connection reuse.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is
    /// present; HTTP/1.0 defaults to close unless `Connection:
    /// keep-alive` is present.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(value) if self.version == Version::Http11 => {
                !headers::is_close(value.as_bytes())
            }
            Some(value) => headers::is_keep_alive(value.as_bytes()),
            None => self.version == Version::Http11,
        }
    }
}

// httparse rejects obsolete line folding in requests, so continuation
// lines (CRLF followed by SP or HT) are unfolded into a single space
// before the section is handed over.
fn unfold(head: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len());
    let mut idx = 0;
    while idx < head.len() {
        if head[idx] == b'\r'
            && head.get(idx + 1) == Some(&b'\n')
            && matches!(head.get(idx + 2), Some(&b' ') | Some(&b'\t'))
        {
            out.push(b' ');
            idx += 2;
            while matches!(head.get(idx), Some(&b' ') | Some(&b'\t')) {
                idx += 1;
            }
        } else {
            out.push(head[idx]);
            idx += 1;
        }
    }
    out
}

fn split_target(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(idx) => (&target[..idx], &target[idx + 1..]),
        None => (target, ""),
    }
}

/// Parse one framed message into a `Request`.
///
/// The framer already guaranteed the body is exactly `Content-Length`
/// bytes, so no length handling happens here.
pub fn parse(msg: FramedMessage, peer: SocketAddr) -> Result<Request, RequestError> {
    let mut data = unfold(&msg.head);
    data.extend_from_slice(b"\r\n\r\n");

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS_NUM];
    let mut raw = httparse::Request::new(&mut raw_headers);
    match raw.parse(&data) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(RequestError::MalformedRequestLine),
        Err(httparse::Error::Version) => return Err(RequestError::UnsupportedVersion),
        Err(err) => return Err(RequestError::BadHeaders(err)),
    }

    let version = match raw.version {
        Some(0) => Version::Http10,
        Some(1) => Version::Http11,
        _ => return Err(RequestError::UnsupportedVersion),
    };
    let method_token = raw.method.ok_or(RequestError::MalformedRequestLine)?;
    let method = Method::from_token(method_token)
        .ok_or_else(|| RequestError::UnsupportedMethod(method_token.to_string()))?;
    let target = raw.path.ok_or(RequestError::MalformedRequestLine)?;

    let (raw_path, raw_query) = split_target(target);
    let path = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(RequestError::BadUtf8)?
        .into_owned();
    let path = if path.is_empty() { "/".to_string() } else { path };
    // security boundary: never let a traversal segment through, no
    // matter how the surrounding characters were encoded
    if path.contains("..") {
        return Err(RequestError::InvalidPath(path));
    }

    let mut query: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in form_urlencoded::parse(raw_query.as_bytes()) {
        query
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    let mut headers: HashMap<String, String> = HashMap::new();
    for header in raw.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = from_utf8(header.value)
            .map_err(RequestError::BadUtf8)?
            .trim()
            .to_string();
        match headers.get_mut(&name) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                headers.insert(name, value);
            }
        }
    }

    Ok(Request {
        method,
        path,
        version,
        headers,
        query,
        body: msg.body,
        path_params: HashMap::new(),
        peer,
    })
}

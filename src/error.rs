use std::str::Utf8Error;

use quick_error::quick_error;

quick_error! {
    /// Error type which is produced by framing and request parsing
    ///
    /// Note, you should not make an exhaustive match over the enum.
    /// More errors will be added at will.
    ///
    /// Use the HttpError trait to turn one into a wire status.
    #[derive(Debug)]
    pub enum RequestError {
        RequestTooLarge(limit: usize) {
            display("request is larger than the {} byte limit", limit)
        }
        MalformedRequestLine {
            display("malformed request line")
        }
        InvalidPath(path: String) {
            display("path contains a traversal segment: {:?}", path)
        }
        UnsupportedMethod(method: String) {
            display("unsupported method: {:?}", method)
        }
        UnsupportedVersion {
            display("unsupported HTTP version")
        }
        BadHeaders(err: httparse::Error) {
            from()
            display("error parsing headers: {}", err)
        }
        BadUtf8(err: Utf8Error) {
            from()
            display("bad utf8 in request head: {}", err)
        }
        BadJson(err: serde_json::Error) {
            from()
            display("invalid json body: {}", err)
        }
        HeadersTimeout {
            display("timeout reading request headers")
        }
    }
}

/// A trait which represents an error which can be formatted as an HTTP
/// error response
pub trait HttpError {
    /// Return HTTP status code and status text
    ///
    /// The status text and code are also rendered into the error body.
    fn http_status(&self) -> (u16, &'static str);
}

impl HttpError for RequestError {
    fn http_status(&self) -> (u16, &'static str) {
        use self::RequestError::*;
        match *self {
            RequestTooLarge(_) => (413, "Payload Too Large"),
            MalformedRequestLine => (400, "Bad Request"),
            InvalidPath(_) => (400, "Bad Request"),
            UnsupportedMethod(_) => (405, "Method Not Allowed"),
            UnsupportedVersion => (505, "HTTP Version Not Supported"),
            BadHeaders(_) => (400, "Bad Request"),
            BadUtf8(_) => (400, "Bad Request"),
            BadJson(_) => (400, "Bad Request"),
            HeadersTimeout => (408, "Request Timeout"),
        }
    }
}

//! Byte-stream framing for HTTP/1.x messages.
//!
//! TCP gives us an undifferentiated byte stream, so we buffer whatever
//! the socket hands over and cut it into discrete messages on the
//! CRLF-CRLF delimiter plus a declared `Content-Length`. Framing happens
//! before any real parsing so oversized input is rejected before we
//! spend memory or time on it.

use std::str::from_utf8;

use crate::error::RequestError;

/// Exactly one HTTP message's raw bytes.
///
/// `head` is the header section up to (not including) the `\r\n\r\n`
/// delimiter, `body` is exactly `Content-Length` bytes. The value is
/// ephemeral: it lives for one serve iteration and is consumed by the
/// request parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub head: Vec<u8>,
    pub body: Vec<u8>,
}

/// Outcome of a framing pass.
///
/// `NeedMoreData` is an expected, frequent outcome, not an error: the
/// caller must read more bytes from the socket and try again.
#[derive(Debug)]
pub enum Framing {
    Framed(FramedMessage),
    NeedMoreData,
}

/// Accumulates socket reads and extracts one message at a time.
///
/// Bytes past the end of an extracted message are kept for the next
/// framing pass, so pipelined requests are never lost.
#[derive(Debug)]
pub struct MessageBuf {
    buf: Vec<u8>,
    max_message_size: usize,
}

fn find_substr(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// The Content-Length scan runs before header parsing proper, so it is
// deliberately lenient: a missing or unparsable header counts as zero.
fn content_length(head: &[u8]) -> usize {
    for line in head.split(|&ch| ch == b'\n') {
        let line = if line.last() == Some(&b'\r') {
            &line[..line.len() - 1]
        } else {
            line
        };
        let colon = match line.iter().position(|&ch| ch == b':') {
            Some(idx) => idx,
            None => continue,
        };
        let name = match from_utf8(&line[..colon]) {
            Ok(name) => name.trim(),
            Err(_) => continue,
        };
        if !crate::headers::is_content_length(name) {
            continue;
        }
        return from_utf8(&line[colon + 1..])
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
    }
    0
}

impl MessageBuf {
    pub fn new(max_message_size: usize) -> MessageBuf {
        MessageBuf {
            buf: Vec::new(),
            max_message_size,
        }
    }

    /// Append freshly read bytes to the accumulator.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once the CRLF-CRLF delimiter has arrived, i.e. anything
    /// still missing is body bytes rather than headers.
    pub fn has_header_section(&self) -> bool {
        find_substr(&self.buf, b"\r\n\r\n").is_some()
    }

    /// Try to cut one complete message off the front of the buffer.
    ///
    /// Returns `NeedMoreData` until both the header delimiter and the
    /// declared body length have arrived. Fails with `RequestTooLarge`
    /// when the buffer outgrows the configured maximum without yielding
    /// a complete message, which bounds memory against malicious or
    /// buggy clients.
    pub fn try_frame(&mut self) -> Result<Framing, RequestError> {
        let head_end = match find_substr(&self.buf, b"\r\n\r\n") {
            Some(idx) => idx,
            None => {
                if self.buf.len() > self.max_message_size {
                    return Err(RequestError::RequestTooLarge(self.max_message_size));
                }
                return Ok(Framing::NeedMoreData);
            }
        };
        let body_start = head_end + 4;
        let body_len = content_length(&self.buf[..head_end]);
        // checked: a declared length near usize::MAX must reject, not
        // wrap past the size limit
        let total = match body_start.checked_add(body_len) {
            Some(total) if total <= self.max_message_size => total,
            _ => return Err(RequestError::RequestTooLarge(self.max_message_size)),
        };
        if self.buf.len() < total {
            return Ok(Framing::NeedMoreData);
        }
        let head = self.buf[..head_end].to_vec();
        let body = self.buf[body_start..total].to_vec();
        // surplus bytes are a pipelined next request, keep them
        self.buf.drain(..total);
        Ok(Framing::Framed(FramedMessage { head, body }))
    }
}

#[cfg(test)]
mod test {
    use matches::assert_matches;

    use super::{content_length, find_substr, Framing, MessageBuf};
    use crate::error::RequestError;

    const MAX: usize = 16384;

    fn frame_all(buf: &mut MessageBuf) -> Vec<super::FramedMessage> {
        let mut out = Vec::new();
        while let Ok(Framing::Framed(msg)) = buf.try_frame() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_find_substr() {
        assert_eq!(find_substr(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
        assert_eq!(find_substr(b"abc", b"\r\n\r\n"), None);
        assert_eq!(find_substr(b"", b"\r\n\r\n"), None);
    }

    #[test]
    fn test_content_length_lenient() {
        assert_eq!(content_length(b"GET / HTTP/1.1\r\nContent-Length: 5"), 5);
        assert_eq!(content_length(b"GET / HTTP/1.1\r\nCONTENT-LENGTH:42"), 42);
        assert_eq!(content_length(b"GET / HTTP/1.1\r\nHost: x"), 0);
        assert_eq!(content_length(b"GET / HTTP/1.1\r\nContent-Length: pony"), 0);
    }

    #[test]
    fn test_whole_message() {
        let mut buf = MessageBuf::new(MAX);
        buf.feed(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        match buf.try_frame().unwrap() {
            Framing::Framed(msg) => {
                assert_eq!(&msg.head[..], b"POST /x HTTP/1.1\r\nContent-Length: 5");
                assert_eq!(&msg.body[..], b"hello");
            }
            Framing::NeedMoreData => panic!("expected a framed message"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fragmented_feed_is_identical() {
        let raw: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let mut whole = MessageBuf::new(MAX);
        whole.feed(raw);
        let expected = frame_all(&mut whole);

        // one byte at a time
        let mut buf = MessageBuf::new(MAX);
        let mut got = Vec::new();
        for &byte in raw {
            buf.feed(&[byte]);
            if let Ok(Framing::Framed(msg)) = buf.try_frame() {
                got.push(msg);
            }
        }
        assert_eq!(got, expected);

        // delimiter straddling a chunk boundary
        let mut buf = MessageBuf::new(MAX);
        let (a, b) = raw.split_at(raw.len() - 20);
        buf.feed(a);
        assert_matches!(buf.try_frame(), Ok(Framing::NeedMoreData));
        buf.feed(b);
        assert_eq!(frame_all(&mut buf), expected);
    }

    #[test]
    fn test_pipelined_messages_preserved() {
        let mut buf = MessageBuf::new(MAX);
        buf.feed(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\n");
        buf.feed(b"POST /b HTTP/1.1\r\nContent-Length: 2\r\n\r\nok");
        let messages = frame_all(&mut buf);
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0].head[..], b"GET /a HTTP/1.1\r\nHost: h");
        assert_eq!(&messages[0].body[..], b"");
        assert_eq!(&messages[1].body[..], b"ok");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_never_truncated() {
        let mut buf = MessageBuf::new(MAX);
        buf.feed(b"POST /x HTTP/1.1\r\nContent-Length: 10\r\n\r\nhell");
        assert_matches!(buf.try_frame(), Ok(Framing::NeedMoreData));
        buf.feed(b"o worldEXTRA");
        match buf.try_frame().unwrap() {
            Framing::Framed(msg) => assert_eq!(&msg.body[..], b"hello worl"),
            Framing::NeedMoreData => panic!("body was complete"),
        }
        // the surplus stays buffered for the next message
        assert_eq!(buf.len(), "dEXTRA".len());
    }

    #[test]
    fn test_headers_too_large() {
        let mut buf = MessageBuf::new(64);
        buf.feed(&[b'x'; 65]);
        assert_matches!(buf.try_frame(), Err(RequestError::RequestTooLarge(64)));
    }

    #[test]
    fn test_absurd_content_length_rejected() {
        // a length near usize::MAX must not wrap the total past the limit
        let mut buf = MessageBuf::new(1024);
        buf.feed(b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n");
        assert_matches!(buf.try_frame(), Err(RequestError::RequestTooLarge(1024)));
    }

    #[test]
    fn test_declared_body_too_large() {
        let mut buf = MessageBuf::new(64);
        buf.feed(b"POST / HTTP/1.1\r\nContent-Length: 100000\r\n\r\n");
        assert_matches!(buf.try_frame(), Err(RequestError::RequestTooLarge(64)));
    }
}

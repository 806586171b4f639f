use std::fmt::{self, Display};

/// HTTP protocol version as it appears on the wire.
///
/// Only the 1.x line is supported. Requests that look like HTTP/0.9
/// are almost always malformed HTTP/1.0 in practice, and HTTP/2 is a
/// binary protocol outside the scope of this server; both are rejected
/// at parse time.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Version {
    /// HTTP/1.0 protocol version.
    Http10,
    /// HTTP/1.1 protocol version as described in RFC7230 and others.
    Http11,
}

impl Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Version::*;
        f.write_str(match *self {
            Http10 => "HTTP/1.0",
            Http11 => "HTTP/1.1",
        })
    }
}

#[cfg(test)]
mod test {
    use super::Version;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Version::Http10), "HTTP/1.0");
        assert_eq!(format!("{}", Version::Http11), "HTTP/1.1");
    }

    #[test]
    fn test_ordering() {
        assert!(Version::Http10 < Version::Http11);
    }
}

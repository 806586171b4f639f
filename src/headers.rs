#[inline(always)]
pub fn is_content_length(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
}

// header value is a byte sequence, we need case insensitive comparison
// with the surrounding whitespace stripped out
fn value_eq(val: &[u8], token: &[u8]) -> bool {
    let mut start = 0;
    let mut end = val.len();
    while start < end && matches!(val[start], b'\r' | b'\n' | b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(val[end - 1], b'\r' | b'\n' | b' ' | b'\t') {
        end -= 1;
    }
    val[start..end].eq_ignore_ascii_case(token)
}

#[inline(always)]
pub fn is_close(val: &[u8]) -> bool {
    value_eq(val, b"close")
}

#[inline(always)]
pub fn is_keep_alive(val: &[u8]) -> bool {
    value_eq(val, b"keep-alive")
}

#[cfg(test)]
mod test {
    use super::{is_close, is_content_length, is_keep_alive};

    #[test]
    fn test_content_len() {
        assert!(is_content_length("Content-Length"));
        assert!(is_content_length("content-length"));
        assert!(is_content_length("CONTENT-length"));
        assert!(is_content_length("CONTENT-LENGTH"));
        assert!(!is_content_length("Content-Type"));
    }

    #[test]
    fn test_close() {
        assert!(is_close(b"close"));
        assert!(is_close(b"Close"));
        assert!(is_close(b"clOSE"));
        assert!(is_close(b"CLOSE"));
        assert!(is_close(b" CLOSE"));
        assert!(is_close(b"   close   "));
        assert!(is_close(b"Close   "));
        assert!(!is_close(b"closedown"));
        assert!(!is_close(b"keep-alive"));
    }

    #[test]
    fn test_keep_alive() {
        assert!(is_keep_alive(b"keep-alive"));
        assert!(is_keep_alive(b"Keep-Alive"));
        assert!(is_keep_alive(b"  KEEP-ALIVE  "));
        assert!(!is_keep_alive(b"close"));
    }
}

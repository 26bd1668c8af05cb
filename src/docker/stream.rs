//! Helpers for multiplexed container output streams

/// Frames advertising more than this are treated as corruption and dropped.
pub(crate) const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Last non-empty line of a frame, for progress reporting.
pub(crate) fn last_nonempty_line(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    text.lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
}

/// First 12 characters of a container or image id.
pub(crate) fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_nonempty_line() {
        assert_eq!(
            last_nonempty_line(b"first\nsecond\n\n").as_deref(),
            Some("second")
        );
        assert_eq!(last_nonempty_line(b"only").as_deref(), Some("only"));
        assert_eq!(last_nonempty_line(b"\n  \n"), None);
        assert_eq!(last_nonempty_line(b""), None);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(
            short_id("sha256:0123456789abcdef0123456789abcdef"),
            "0123456789ab"
        );
        assert_eq!(short_id("abc"), "abc");
    }
}

//! Error types for the capture engine.
//!
//! Mirrors the error-kind taxonomy of the original C implementation
//! (configuration, state, resource, I/O, timeout) but propagates through
//! ordinary `Result`s instead of a caller-supplied character buffer.

use thiserror::Error;

/// Maximum length of the compatibility error buffer, matching the
/// original implementation's `RXTX_ERRBUF_SIZE`.
pub const ERRBUF_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum RxtxError {
    /// Invalid or mutually exclusive configuration, out-of-range values,
    /// or a ring selection with no in-range members. Never fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A mutator or accessor was invoked in a lifecycle state that
    /// forbids it. The descriptor is left unmodified.
    #[error("state error: {0}")]
    State(String),

    /// socket/bind/setsockopt/mutex/allocation/file-open failure. Fatal.
    #[error("resource error: {0}")]
    Resource(String),

    /// pcap write or flush failure. Fatal from within a worker.
    #[error("io error: {0}")]
    Io(String),

    /// Internal non-fatal signal a worker uses to yield and recheck its
    /// shutdown conditions. Never surfaced to a caller of a public API.
    #[error("timeout")]
    Timeout,
}

impl RxtxError {
    pub fn resource(context: &str, source: std::io::Error) -> Self {
        RxtxError::Resource(format!("{context}: {source}"))
    }

    /// Render this error into a fixed caller-provided buffer, truncating
    /// with a trailing `...` when the message doesn't fit. Exists only
    /// for collaborators that still want the original errbuf convention.
    pub fn fill_errbuf(&self, buf: &mut [u8; ERRBUF_SIZE]) {
        let msg = self.to_string();
        let bytes = msg.as_bytes();
        if bytes.len() < ERRBUF_SIZE {
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
        } else {
            buf[..ERRBUF_SIZE - 1].copy_from_slice(&bytes[..ERRBUF_SIZE - 1]);
            buf[ERRBUF_SIZE - 4] = b'.';
            buf[ERRBUF_SIZE - 3] = b'.';
            buf[ERRBUF_SIZE - 2] = b'.';
            buf[ERRBUF_SIZE - 1] = 0;
        }
    }
}

impl From<std::io::Error> for RxtxError {
    fn from(e: std::io::Error) -> Self {
        RxtxError::Resource(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RxtxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_errbuf_short_message_is_nul_terminated_in_place() {
        let err = RxtxError::State("bad transition".to_string());
        let msg = err.to_string();
        assert!(msg.len() < ERRBUF_SIZE);

        let mut buf = [0xffu8; ERRBUF_SIZE];
        err.fill_errbuf(&mut buf);

        assert_eq!(&buf[..msg.len()], msg.as_bytes());
        assert_eq!(buf[msg.len()], 0);
    }

    #[test]
    fn fill_errbuf_long_message_is_truncated_with_ellipsis() {
        let err = RxtxError::Configuration("x".repeat(600));
        let msg = err.to_string();
        assert!(msg.len() >= ERRBUF_SIZE);

        let mut buf = [0xffu8; ERRBUF_SIZE];
        err.fill_errbuf(&mut buf);

        assert_eq!(&buf[..ERRBUF_SIZE - 4], &msg.as_bytes()[..ERRBUF_SIZE - 4]);
        assert_eq!(&buf[ERRBUF_SIZE - 4..ERRBUF_SIZE - 1], b"...");
        assert_eq!(buf[ERRBUF_SIZE - 1], 0);
    }
}

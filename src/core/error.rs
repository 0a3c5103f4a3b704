//! Error types for plastinet.

use std::io;

use thiserror::Error;

/// Errors surfaced by layer and network operations.
///
/// Nothing is retried internally; every failure leaves the parameter state as it was
/// before the call.
#[derive(Error, Debug)]
pub enum NetError {
    /// A vector length did not match the width it feeds.
    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },

    /// Layer widths that cannot form a network.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// The stream ended before every expected field was read.
    #[error("serialized stream ended early")]
    SerializationTruncated,

    /// The stream was complete but its contents are inconsistent.
    #[error("invalid serialized data: {0}")]
    InvalidData(String),

    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for NetError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => NetError::SerializationTruncated,
            io::ErrorKind::InvalidData => NetError::InvalidData(e.to_string()),
            _ => NetError::Io(e),
        }
    }
}

impl NetError {
    pub(crate) fn mismatch(context: &'static str, expected: usize, got: usize) -> Self {
        NetError::DimensionMismatch {
            context,
            expected,
            got,
        }
    }
}

/// Result type alias for plastinet operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_maps_to_truncated() {
        let e: NetError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(e, NetError::SerializationTruncated));

        let e: NetError = io::Error::new(io::ErrorKind::InvalidData, "bad length").into();
        assert!(matches!(e, NetError::InvalidData(ref m) if m == "bad length"));

        let e: NetError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(e, NetError::Io(_)));
    }

    #[test]
    fn mismatch_message_names_context() {
        let e = NetError::mismatch("predict input", 3, 2);
        assert_eq!(
            e.to_string(),
            "dimension mismatch in predict input: expected 3, got 2"
        );
    }
}

//! INDI error types
//!
//! Two layers: `IndiError` for conditions that end a connect attempt or a
//! connection, and `DispatchError` for per-message conditions the listener
//! logs and survives.

use std::time::Duration;

/// Errors surfaced through the public client API. Transport-fatal variants
/// (`MalformedXml`, `ConnectionClosed`) are handled inside the listener loop
/// and reported through the disconnect reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndiError {
    /// Address resolution, socket creation, or connect failure
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// TCP connect did not complete within the configured timeout
    #[error("connection timeout: {host}:{port} did not answer after {duration:?}")]
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// The server sent markup the decoder cannot frame. Fatal: the
    /// connection is aborted.
    #[error("malformed XML from server: {0}")]
    MalformedXml(String),
    /// The peer closed the connection or a hard read error occurred
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// An operation requiring a live connection was called while disconnected
    #[error("not connected to INDI server")]
    NotConnected,
    /// Write error on an outbound command. The connection stays up, but the
    /// target property's Busy state is unconfirmed.
    #[error("send failed: {0}")]
    SendFailure(String),
}

/// Result type for INDI client operations
pub type IndiResult<T> = Result<T, IndiError>;

/// Per-message errors returned by the dispatcher to the listener loop.
/// None of these end the connection: `PropertyDuplicated` is swallowed
/// silently, everything else is logged with the offending tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("property '{device}.{property}' not found")]
    PropertyNotFound { device: String, property: String },
    #[error("property '{device}.{property}' is already defined")]
    PropertyDuplicated { device: String, property: String },
    #[error("tag '{tag}' does not match the type of '{device}.{property}'")]
    TypeMismatch {
        device: String,
        property: String,
        tag: String,
    },
    #[error("unrecognized element '{0}'")]
    UnknownTag(String),
    #[error("element '{tag}' is missing required attribute '{attr}'")]
    MissingAttribute { tag: String, attr: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = IndiError::ConnectionFailed("connection refused".to_string());
        assert_eq!(err.to_string(), "connection failed: connection refused");

        let err = DispatchError::PropertyNotFound {
            device: "CCD Simulator".to_string(),
            property: "CCD_EXPOSURE".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "property 'CCD Simulator.CCD_EXPOSURE' not found"
        );

        let err = DispatchError::TypeMismatch {
            device: "Telescope".to_string(),
            property: "CONNECTION".to_string(),
            tag: "setNumberVector".to_string(),
        };
        assert!(err.to_string().contains("setNumberVector"));
        assert!(err.to_string().contains("Telescope.CONNECTION"));
    }

    #[test]
    fn connection_timeout_display() {
        let err = IndiError::ConnectionTimeout {
            host: "192.168.1.100".to_string(),
            port: 7624,
            duration: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("192.168.1.100"));
        assert!(msg.contains("7624"));
        assert!(msg.contains("30"));
    }
}

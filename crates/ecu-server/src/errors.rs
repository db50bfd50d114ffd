//! Server error types.

/// Failures starting or running the southbound server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address requested.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The bound address could not be read back.
    #[error("failed to read local address: {0}")]
    LocalAddr(std::io::Error),

    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Reasons a device handshake is refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// First frame is not a JSON object.
    #[error("handshake must be a JSON object")]
    NotAnObject,

    /// `ecu_id` is missing, empty or invalid.
    #[error("invalid ecu_id: {0}")]
    InvalidEcuId(String),

    /// `port` is present but not a valid port number.
    #[error("invalid port in handshake")]
    InvalidPort,

    /// The first frame was binary or a control frame.
    #[error("handshake must be a text frame")]
    NotText,

    /// No handshake before the deadline.
    #[error("handshake timed out")]
    TimedOut,

    /// The socket closed before a handshake arrived.
    #[error("connection closed during handshake")]
    Closed,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ServerError>;

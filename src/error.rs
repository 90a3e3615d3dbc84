use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The call's cancellation token fired before a reply arrived.
    ///
    /// Local only; nothing is sent over the bus on cancellation.
    #[error("call cancelled")]
    Cancelled,

    /// The remote request handler reported a failure.
    ///
    /// Carries the textual description transported back in an
    /// `error = true` envelope.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// Envelope or typed-body decoding failed on this side.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Message bus or connection fault.
    #[error("transport error: {0}")]
    Transport(String),

    /// Call exceeded its deadline.
    #[error("request timed out")]
    Timeout,
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

use objipc_wire::WireError;

/// Errors raised while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The wire data ended before a complete message header or body.
    #[error("message truncated")]
    Truncated,

    /// Malformed wire data. Fatal for the connection that produced it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A typed argument failed validation (null where non-nullable, kind or
    /// interface mismatch).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The encoded message does not fit the 16-bit wire size field.
    #[error("message exceeds maximum encodable size")]
    OutOfRange,

    /// Transport failure surfaced through the codec.
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub type Result<T> = std::result::Result<T, CodecError>;

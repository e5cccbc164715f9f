/// Errors that can occur on the wire layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The socket has no data (or no room) right now; retry after readiness.
    #[error("operation would block")]
    WouldBlock,

    /// A ring buffer ran out of room ({requested} bytes requested,
    /// {available} available).
    #[error("buffer overflow ({requested} bytes requested, {available} available)")]
    Overflow { requested: usize, available: usize },

    /// The peer shut down its end of the socket.
    #[error("connection closed by peer")]
    Closed,

    /// A socket-level I/O failure. Fatal for the connection.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;

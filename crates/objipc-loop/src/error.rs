/// Errors that can occur while driving the event loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// An I/O failure from epoll, timerfd, or signalfd.
    #[error("event loop I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The timeout does not fit the platform's epoll wait argument.
    #[error("invalid timeout {0} ms")]
    InvalidTimeout(i32),

    /// The operation applies to a different source kind.
    #[error("operation requires a {expected} source")]
    WrongKind { expected: &'static str },
}

impl From<nix::errno::Errno> for LoopError {
    fn from(e: nix::errno::Errno) -> Self {
        LoopError::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;

use std::path::PathBuf;

use objipc_codec::CodecError;
use objipc_wire::WireError;

/// Errors surfaced by the proxy runtime.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Another read is already prepared, or the queue has pending events the
    /// caller must dispatch first. Retry after dispatching.
    #[error("read already prepared or events pending")]
    Busy,

    /// The runtime hit an unrecoverable error earlier; every call returns
    /// the latched cause until the runtime is torn down.
    #[error("runtime in failed state: {0}")]
    Fatal(String),

    /// The peer reported a protocol error on an object.
    #[error("remote protocol error {code} on {interface}@{object_id}")]
    Protocol {
        code: u32,
        object_id: u32,
        interface: String,
    },

    /// The proxy already has a listener installed.
    #[error("proxy already has a listener")]
    ListenerExists,

    /// The operation is not valid for a wrapper proxy (or only valid for one).
    #[error("invalid operation on wrapper proxy")]
    Wrapper,

    /// A request argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket discovery failed: no runtime directory in the environment and
    /// the socket name is not absolute.
    #[error("runtime directory not set in the environment")]
    NoRuntimeDir,

    /// The assembled socket path exceeds the platform `sun_path` limit.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Failed to connect to the socket path.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Wire-level failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Codec-level failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

//! Client-side object-proxy runtime.
//!
//! Applications hold [`Proxy`] handles for remote protocol objects, issue
//! requests through them, and receive events via per-proxy listeners
//! dispatched from per-thread [`QueueToken`] queues. One [`Runtime`] owns
//! the connection, the id table, and the read/dispatch coordination that
//! lets any number of threads block for events without duplicate socket
//! reads.
//!
//! The socket is found through the environment (`OBJIPC_SOCKET`,
//! `XDG_RUNTIME_DIR`, or an inherited `OBJIPC_FD`), and `OBJIPC_DEBUG`
//! turns on per-message tracing to standard error.

pub mod control;
pub mod error;
mod map;
pub mod proxy;
pub mod queue;
pub mod runtime;

pub use control::{CALLBACK_INTERFACE, RUNTIME_INTERFACE};
pub use error::{ClientError, Result};
pub use map::SERVER_ID_START;
pub use proxy::{DispatchFn, Proxy};
pub use queue::QueueToken;
pub use runtime::{
    ProtocolErrorInfo, Runtime, DEBUG_ENV, DEFAULT_SOCKET_NAME, FD_ENV, RUNTIME_DIR_ENV,
    SOCKET_ENV,
};

// Re-export the codec vocabulary requests and listeners are written in.
pub use objipc_codec::{Argument, Fixed, Interface, MessageDesc, ObjectId};

//! Object-proxy IPC over Unix domain sockets.
//!
//! objipc is a client-side runtime for Wayland-style object protocols: a
//! word-oriented wire format with signature-driven typed marshaling, file
//! descriptor passing over `SCM_RIGHTS`, an id-indexed proxy object table
//! with destroy/zombie/delete-id lifetime tracking, a multi-threaded
//! read/dispatch coordination protocol, and a standalone epoll event loop
//! with a timer min-heap.
//!
//! The layers, bottom up:
//! - [`wire`] — ring-buffered socket I/O and ancillary fd transport
//! - [`codec`] — typed arguments, interfaces, closure encode/decode
//! - [`client`] — proxy objects, dispatch queues, the runtime
//! - [`event_loop`] — readiness multiplexing for everything else

pub use objipc_client as client;
pub use objipc_codec as codec;
pub use objipc_loop as event_loop;
pub use objipc_wire as wire;

pub use objipc_client::{
    Argument, ClientError, Fixed, Interface, MessageDesc, ObjectId, Proxy, QueueToken, Runtime,
};
pub use objipc_loop::{EventLoop, Readiness, Source};

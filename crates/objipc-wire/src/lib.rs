//! Ring-buffered Unix socket transport with file descriptor passing.
//!
//! This is the lowest layer of objipc. A [`Connection`] wraps an
//! already-connected `SOCK_STREAM` Unix socket and provides non-blocking,
//! vectored I/O through fixed-capacity ring buffers — one pair for payload
//! bytes, one pair for file descriptors carried as `SCM_RIGHTS` ancillary
//! data. Everything above this layer (message framing, typed arguments,
//! proxy objects) builds on the byte and fd streams provided here.

pub mod connection;
pub mod error;
pub mod ring;

pub use connection::{Connection, MAX_FDS_PER_FLUSH};
pub use error::{Result, WireError};
pub use ring::{FdRing, RingBuffer, BUFFER_SIZE, FD_RING_CAPACITY};

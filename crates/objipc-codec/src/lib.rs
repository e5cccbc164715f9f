//! Signature-driven typed message marshaling.
//!
//! Every message is described by a compact signature string whose characters
//! denote argument kinds (`i` int32, `u` uint32, `f` fixed-point, `s`
//! string, `o` object reference, `n` new-object id, `a` byte array, `h` file
//! descriptor). The signature is the single source of truth: both the
//! encoder and the decoder walk it, so there is no separate schema to drift
//! out of sync.
//!
//! Wire format: host-endian 32-bit words. The two-word header is
//! `[sender id][size << 16 | opcode]`; strings and arrays are
//! length-prefixed and padded to word alignment; file descriptors never
//! appear inline — they travel as ancillary data on the connection that
//! carries the message.

pub mod argument;
pub mod closure;
pub mod error;
pub mod interface;
pub mod signature;

pub use argument::{Argument, Fixed, ObjectId};
pub use closure::{Closure, HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use error::{CodecError, Result};
pub use interface::{Interface, MessageDesc};
pub use signature::{arg_count, iter_args, since_version, ArgKind, ArgSpec};

//! The built-in control vocabulary.
//!
//! Object id 1 on every connection is the runtime object. Its three messages
//! are the minimum the lifecycle machinery needs: `sync` for the roundtrip
//! primitive, `error` for remote failure reports, and `delete_id` for id
//! recycling acknowledgments.

use objipc_codec::{Interface, MessageDesc};

/// Opcode of the `sync` request on the runtime object.
pub const REQ_SYNC: u16 = 0;

/// Opcode of the `error` event on the runtime object.
pub const EVT_ERROR: u16 = 0;

/// Opcode of the `delete_id` event on the runtime object.
pub const EVT_DELETE_ID: u16 = 1;

/// Opcode of the `done` event on a callback object.
pub const EVT_DONE: u16 = 0;

static RUNTIME_REQUESTS: [MessageDesc; 1] = [MessageDesc {
    name: "sync",
    signature: "n",
    arg_interfaces: &[Some(&CALLBACK_INTERFACE)],
}];

static RUNTIME_EVENTS: [MessageDesc; 2] = [
    MessageDesc {
        name: "error",
        signature: "?ous",
        arg_interfaces: &[None, None, None],
    },
    MessageDesc {
        name: "delete_id",
        signature: "u",
        arg_interfaces: &[None],
    },
];

static CALLBACK_EVENTS: [MessageDesc; 1] = [MessageDesc {
    name: "done",
    signature: "u",
    arg_interfaces: &[None],
}];

/// The per-connection runtime object (always id 1).
pub static RUNTIME_INTERFACE: Interface = Interface {
    name: "objipc_runtime",
    version: 1,
    requests: &RUNTIME_REQUESTS,
    events: &RUNTIME_EVENTS,
};

/// One-shot acknowledgment object created by `sync`.
pub static CALLBACK_INTERFACE: Interface = Interface {
    name: "objipc_callback",
    version: 1,
    requests: &[],
    events: &CALLBACK_EVENTS,
};

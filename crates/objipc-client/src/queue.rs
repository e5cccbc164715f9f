use std::sync::Arc;

use objipc_codec::{Argument, MessageDesc};

use crate::proxy::Proxy;

/// Internal queue identifier. Queue 0 is the default queue; queue 1 is the
/// runtime's own queue, drained before any other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct QueueId(pub(crate) u32);

pub(crate) const DEFAULT_QUEUE: QueueId = QueueId(0);
pub(crate) const RUNTIME_QUEUE: QueueId = QueueId(1);

/// Handle to one dispatch queue of a runtime.
///
/// Events for a proxy land on the queue the proxy is bound to; a thread
/// drains a queue with `Runtime::dispatch_queue*`. FIFO within a queue;
/// ordering across queues is unspecified except that the runtime queue
/// drains first.
#[derive(Clone, Debug)]
pub struct QueueToken {
    pub(crate) id: QueueId,
}

/// One event waiting for dispatch: resolved target, opcode, and resolved
/// arguments. Dropping it undispatched closes any fds it still owns.
pub(crate) struct QueuedEvent {
    pub(crate) target: Arc<Proxy>,
    pub(crate) opcode: u16,
    pub(crate) desc: &'static MessageDesc,
    pub(crate) args: Vec<Argument<Arc<Proxy>>>,
}

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use objipc_codec::{Argument, Interface, MessageDesc, ObjectId};

use crate::error::{ClientError, Result};
use crate::queue::{QueueId, QueueToken};
use crate::runtime::Runtime;

const FLAG_ID_DELETED: u32 = 1 << 0;
const FLAG_DESTROYED: u32 = 1 << 1;
const FLAG_WRAPPER: u32 = 1 << 2;

/// Listener callback invoked for each event dispatched to a proxy. Receives
/// the target proxy, the event opcode and descriptor, and the resolved
/// arguments (mutable so fd arguments can be taken).
pub type DispatchFn =
    dyn Fn(&Proxy, u16, &'static MessageDesc, &mut Vec<Argument<Arc<Proxy>>>) + Send + Sync;

/// Client-side handle for one remote protocol object.
///
/// The id, interface, and version are fixed at creation. Mutable state is a
/// flag word (destroyed / id-deleted / wrapper), the queue binding, and a
/// set-once listener; shared ownership is plain `Arc`, so an in-flight event
/// keeps its target alive across a racing destroy.
pub struct Proxy {
    id: ObjectId,
    interface: &'static Interface,
    version: u32,
    runtime: Weak<Runtime>,
    flags: AtomicU32,
    queue: AtomicU32,
    dispatcher: OnceLock<Arc<DispatchFn>>,
    tag: OnceLock<&'static str>,
}

impl Proxy {
    pub(crate) fn new(
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        runtime: Weak<Runtime>,
        queue: QueueId,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            interface,
            version,
            runtime,
            flags: AtomicU32::new(0),
            queue: AtomicU32::new(queue.0),
            dispatcher: OnceLock::new(),
            tag: OnceLock::new(),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn interface(&self) -> &'static Interface {
        self.interface
    }

    /// The interface name, for diagnostics.
    pub fn class(&self) -> &'static str {
        self.interface.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The owning runtime, while it is still alive.
    pub fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .upgrade()
            .ok_or_else(|| ClientError::Fatal("runtime torn down".into()))
    }

    /// Install the event listener. May be called once per proxy.
    pub fn set_dispatcher(
        &self,
        dispatcher: impl Fn(&Proxy, u16, &'static MessageDesc, &mut Vec<Argument<Arc<Proxy>>>)
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        if self.is_wrapper() {
            return Err(ClientError::Wrapper);
        }
        self.dispatcher
            .set(Arc::new(dispatcher))
            .map_err(|_| ClientError::ListenerExists)
    }

    pub(crate) fn dispatcher(&self) -> Option<Arc<DispatchFn>> {
        self.dispatcher.get().cloned()
    }

    /// Bind this proxy's events to a queue. Takes effect for events queued
    /// after the call; combine with [`create_wrapper`](Self::create_wrapper)
    /// when the binding must cover a constructor request racing with another
    /// thread's dispatch.
    pub fn set_queue(&self, queue: &QueueToken) {
        self.queue.store(queue.id.0, Ordering::Release);
    }

    pub(crate) fn queue_id(&self) -> QueueId {
        QueueId(self.queue.load(Ordering::Acquire))
    }

    /// Attach an application tag for later identification.
    pub fn set_tag(&self, tag: &'static str) {
        let _ = self.tag.set(tag);
    }

    pub fn tag(&self) -> Option<&'static str> {
        self.tag.get().copied()
    }

    /// A wrapper shares the wrapped proxy's id and interface but carries its
    /// own queue binding and takes no listener. Requests sent through it are
    /// attributed to the wrapped object; drop it when done.
    pub fn create_wrapper(&self) -> Arc<Proxy> {
        let wrapper = Proxy::new(
            self.id,
            self.interface,
            self.version,
            self.runtime.clone(),
            self.queue_id(),
        );
        wrapper.flags.fetch_or(FLAG_WRAPPER, Ordering::AcqRel);
        wrapper
    }

    /// Request destruction of the remote object. The id stays reserved until
    /// the peer's delete-id acknowledgment; events already in flight toward
    /// this object are discarded, not delivered.
    pub fn destroy(&self) -> Result<()> {
        if self.is_wrapper() {
            return Err(ClientError::Wrapper);
        }
        self.runtime()?.destroy_proxy(self)
    }

    /// Send a request carrying no new-object argument.
    pub fn send_request(&self, opcode: u16, args: Vec<Argument<ObjectId>>) -> Result<()> {
        self.runtime()?.send_request(self, opcode, args)
    }

    /// Send a request whose `n` argument creates a new object, returned as a
    /// fresh proxy inheriting this proxy's version and queue.
    pub fn send_constructor(
        &self,
        opcode: u16,
        args: Vec<Argument<ObjectId>>,
        interface: &'static Interface,
    ) -> Result<Arc<Proxy>> {
        self.runtime()?
            .send_constructor_versioned(self, opcode, args, interface, self.version)
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_DESTROYED != 0
    }

    pub(crate) fn is_id_deleted(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_ID_DELETED != 0
    }

    pub fn is_wrapper(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_WRAPPER != 0
    }

    pub(crate) fn mark_destroyed(&self) {
        self.flags.fetch_or(FLAG_DESTROYED, Ordering::AcqRel);
    }

    pub(crate) fn mark_id_deleted(&self) {
        self.flags.fetch_or(FLAG_ID_DELETED, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
    ) -> Arc<Self> {
        Proxy::new(id, interface, version, Weak::new(), crate::queue::DEFAULT_QUEUE)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("interface", &self.interface.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RUNTIME_INTERFACE;

    #[test]
    fn listener_can_only_be_set_once() {
        let proxy = Proxy::detached_for_tests(ObjectId::new(7), &RUNTIME_INTERFACE, 1);
        proxy.set_dispatcher(|_, _, _, _| {}).unwrap();
        let err = proxy.set_dispatcher(|_, _, _, _| {}).unwrap_err();
        assert!(matches!(err, ClientError::ListenerExists));
    }

    #[test]
    fn wrapper_shares_identity_but_not_listener() {
        let proxy = Proxy::detached_for_tests(ObjectId::new(7), &RUNTIME_INTERFACE, 3);
        let wrapper = proxy.create_wrapper();

        assert_eq!(wrapper.id(), proxy.id());
        assert_eq!(wrapper.version(), 3);
        assert!(wrapper.is_wrapper());
        assert!(matches!(
            wrapper.set_dispatcher(|_, _, _, _| {}),
            Err(ClientError::Wrapper)
        ));
        assert!(matches!(wrapper.destroy(), Err(ClientError::Wrapper)));
    }

    #[test]
    fn tag_roundtrip() {
        let proxy = Proxy::detached_for_tests(ObjectId::new(2), &RUNTIME_INTERFACE, 1);
        assert!(proxy.tag().is_none());
        proxy.set_tag("cursor-surface");
        assert_eq!(proxy.tag(), Some("cursor-surface"));
    }
}

//! The connection-owning proxy runtime.
//!
//! One `Runtime` owns the socket, the id table, and the dispatch queues,
//! all guarded by a single runtime-wide mutex — a small, auditable
//! correctness surface in exchange for throughput a client library does not
//! need. The only other synchronization is the reader condvar below.
//!
//! ## Reader coordination
//!
//! Any number of threads may block waiting for events without issuing
//! redundant syscalls. The protocol is a small state machine over
//! `(reader_count, read_serial)`:
//!
//! - **Idle**: `reader_count == 0`. `prepare_read` moves a thread in
//!   (failing `Busy` if its queue already has events to dispatch).
//! - **Preparing**: `reader_count > 0`, nobody inside `read_events` yet.
//!   More threads may prepare.
//! - **Reading**: the *last* prepared thread to enter `read_events`
//!   (`reader_count` reaching 0) performs the one socket read and queues the
//!   decoded events.
//! - **Waiting**: every other thread entering `read_events` blocks on the
//!   condvar until `read_serial` changes — bumped exactly once per completed
//!   read, successful or fatal — then re-checks its own queue.
//!
//! `cancel_read` backs a thread out; the last cancellation wakes all
//! waiters so progress is never lost.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use nix::poll::{PollFd, PollFlags, PollTimeout};
use objipc_codec::{Argument, Closure, CodecError, Interface, MessageDesc, ObjectId, HEADER_SIZE};
use objipc_wire::{Connection, WireError};
use tracing::{debug, warn};

use crate::control::{
    CALLBACK_INTERFACE, EVT_DELETE_ID, EVT_DONE, EVT_ERROR, REQ_SYNC, RUNTIME_INTERFACE,
};
use crate::error::{ClientError, Result};
use crate::map::{Entry, ObjectMap, Zombie};
use crate::proxy::Proxy;
use crate::queue::{QueueId, QueueToken, QueuedEvent, DEFAULT_QUEUE, RUNTIME_QUEUE};

/// Enables per-message tracing to standard error when set (and not `"0"`).
pub const DEBUG_ENV: &str = "OBJIPC_DEBUG";

/// Socket name or absolute socket path.
pub const SOCKET_ENV: &str = "OBJIPC_SOCKET";

/// Pre-connected descriptor inherited from a parent process; consumed (and
/// unset) when the runtime adopts it.
pub const FD_ENV: &str = "OBJIPC_FD";

/// Directory that relative socket names resolve against.
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

/// Socket name used when neither an explicit name nor the environment says
/// otherwise.
pub const DEFAULT_SOCKET_NAME: &str = "objipc-0";

/// Unix `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "macos")]
const MAX_PATH_LEN: usize = 104;
#[cfg(not(target_os = "macos"))]
const MAX_PATH_LEN: usize = 108;

const RUNTIME_OBJECT_ID: ObjectId = ObjectId::new(1);

/// Details of a protocol error the peer reported.
#[derive(Clone, Debug)]
pub struct ProtocolErrorInfo {
    pub code: u32,
    pub object_id: u32,
    pub interface: String,
}

struct Inner {
    conn: Connection,
    map: ObjectMap,
    queues: HashMap<QueueId, VecDeque<QueuedEvent>>,
    next_queue: u32,
    /// First fatal error, latched for every subsequent call.
    last_error: Option<String>,
    protocol_error: Option<ProtocolErrorInfo>,
    reader_count: usize,
    read_serial: u64,
}

/// A connected proxy runtime. Cheap to share (`Arc`); all methods are
/// callable from any thread.
pub struct Runtime {
    inner: Mutex<Inner>,
    reader_cond: Condvar,
    debug: bool,
    socket_fd: RawFd,
    runtime_proxy: Arc<Proxy>,
}

impl Runtime {
    /// Connect to the named socket, or to the one the environment selects.
    ///
    /// An inherited descriptor in `OBJIPC_FD` takes precedence and is
    /// consumed; otherwise the name (argument, then `OBJIPC_SOCKET`, then
    /// the default) is resolved against `XDG_RUNTIME_DIR` unless absolute.
    pub fn connect(name: Option<&str>) -> Result<Arc<Self>> {
        if let Ok(fd_str) = std::env::var(FD_ENV) {
            std::env::remove_var(FD_ENV);
            if let Ok(raw) = fd_str.parse::<RawFd>() {
                let _ = nix::fcntl::fcntl(
                    raw,
                    nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
                );
                // SAFETY: the environment variable hands this process sole
                // ownership of the inherited descriptor, and it was unset
                // above so nothing else will adopt it.
                let socket = unsafe { OwnedFd::from_raw_fd(raw) };
                return Self::connect_to_fd(socket);
            }
        }

        let path = Self::socket_path(name)?;
        let len = path.as_os_str().len();
        if len >= MAX_PATH_LEN {
            return Err(ClientError::PathTooLong {
                path,
                len,
                max: MAX_PATH_LEN,
            });
        }

        let stream =
            std::os::unix::net::UnixStream::connect(&path).map_err(|e| ClientError::Connect {
                path: path.clone(),
                source: e,
            })?;
        debug!(?path, "connected to runtime socket");
        Self::connect_to_fd(OwnedFd::from(stream))
    }

    fn socket_path(name: Option<&str>) -> Result<PathBuf> {
        let name = match name {
            Some(n) => n.to_string(),
            None => std::env::var(SOCKET_ENV).unwrap_or_else(|_| DEFAULT_SOCKET_NAME.to_string()),
        };
        if name.starts_with('/') {
            return Ok(PathBuf::from(name));
        }
        let dir = std::env::var(RUNTIME_DIR_ENV).map_err(|_| ClientError::NoRuntimeDir)?;
        Ok(Path::new(&dir).join(name))
    }

    /// Adopt an already-connected stream socket.
    pub fn connect_to_fd(socket: OwnedFd) -> Result<Arc<Self>> {
        let debug = std::env::var(DEBUG_ENV).is_ok_and(|v| !v.is_empty() && v != "0");
        let socket_fd = socket.as_raw_fd();

        let mut queues = HashMap::new();
        queues.insert(DEFAULT_QUEUE, VecDeque::new());
        queues.insert(RUNTIME_QUEUE, VecDeque::new());

        let runtime = Arc::new_cyclic(|weak: &Weak<Runtime>| Runtime {
            inner: Mutex::new(Inner {
                conn: Connection::new(socket),
                map: ObjectMap::new(),
                queues,
                next_queue: 2,
                last_error: None,
                protocol_error: None,
                reader_count: 0,
                read_serial: 0,
            }),
            reader_cond: Condvar::new(),
            debug,
            socket_fd,
            runtime_proxy: Proxy::new(
                RUNTIME_OBJECT_ID,
                &RUNTIME_INTERFACE,
                1,
                weak.clone(),
                DEFAULT_QUEUE,
            ),
        });

        {
            let mut inner = runtime.lock();
            let id = inner.map.allocate();
            debug_assert_eq!(id, Some(RUNTIME_OBJECT_ID));
            inner
                .map
                .occupy(RUNTIME_OBJECT_ID, runtime.runtime_proxy.clone());
        }

        let weak = Arc::downgrade(&runtime);
        runtime
            .runtime_proxy
            .set_dispatcher(move |_, opcode, _, args| {
                if let Some(rt) = weak.upgrade() {
                    rt.handle_runtime_event(opcode, args);
                }
            })?;

        Ok(runtime)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The proxy for the connection's own control object (id 1).
    pub fn runtime_proxy(&self) -> Arc<Proxy> {
        self.runtime_proxy.clone()
    }

    /// The default dispatch queue.
    pub fn default_queue(&self) -> QueueToken {
        QueueToken { id: DEFAULT_QUEUE }
    }

    /// Create a dedicated dispatch queue.
    pub fn create_queue(&self) -> QueueToken {
        let mut inner = self.lock();
        let id = QueueId(inner.next_queue);
        inner.next_queue += 1;
        inner.queues.insert(id, VecDeque::new());
        QueueToken { id }
    }

    /// Destroy a queue, discarding (and unwinding) any pending events.
    pub fn destroy_queue(&self, queue: &QueueToken) {
        let mut inner = self.lock();
        inner.queues.remove(&queue.id);
    }

    /// Bytes received but not yet decoded into events.
    pub fn pending_input(&self) -> usize {
        self.lock().conn.pending_input()
    }

    /// The latched fatal error, if any. A remote protocol error reports as
    /// [`ClientError::Protocol`] with its details.
    pub fn last_error(&self) -> Option<ClientError> {
        let inner = self.lock();
        if let Some(info) = &inner.protocol_error {
            return Some(ClientError::Protocol {
                code: info.code,
                object_id: info.object_id,
                interface: info.interface.clone(),
            });
        }
        inner
            .last_error
            .as_ref()
            .map(|msg| ClientError::Fatal(msg.clone()))
    }

    /// Details of a remote protocol error, once one arrived.
    pub fn protocol_error(&self) -> Option<ProtocolErrorInfo> {
        self.lock().protocol_error.clone()
    }

    /// Create a proxy without sending anything — for constructor messages
    /// whose encoding the caller drives itself. The new object inherits the
    /// factory's version and queue.
    pub fn create_proxy(
        self: &Arc<Self>,
        factory: &Proxy,
        interface: &'static Interface,
    ) -> Result<Arc<Proxy>> {
        let mut inner = self.lock();
        if let Some(msg) = &inner.last_error {
            return Err(ClientError::Fatal(msg.clone()));
        }
        let Some(id) = inner.map.allocate() else {
            let msg = "client object ids exhausted".to_string();
            self.fatal_locked(&mut inner, msg.clone());
            return Err(ClientError::Fatal(msg));
        };
        let proxy = Proxy::new(
            id,
            interface,
            factory.version(),
            Arc::downgrade(self),
            factory.queue_id(),
        );
        inner.map.occupy(id, proxy.clone());
        Ok(proxy)
    }

    /// Send a request carrying no new-object argument.
    pub fn send_request(
        self: &Arc<Self>,
        sender: &Proxy,
        opcode: u16,
        args: Vec<Argument<ObjectId>>,
    ) -> Result<()> {
        self.marshal(sender, opcode, args, None).map(|_| ())
    }

    /// Send a request whose `n` argument creates a new object.
    pub fn send_constructor(
        self: &Arc<Self>,
        sender: &Proxy,
        opcode: u16,
        args: Vec<Argument<ObjectId>>,
        interface: &'static Interface,
    ) -> Result<Arc<Proxy>> {
        self.send_constructor_versioned(sender, opcode, args, interface, sender.version())
    }

    /// Send a constructor request binding the new object to an explicit
    /// version.
    pub fn send_constructor_versioned(
        self: &Arc<Self>,
        sender: &Proxy,
        opcode: u16,
        args: Vec<Argument<ObjectId>>,
        interface: &'static Interface,
        version: u32,
    ) -> Result<Arc<Proxy>> {
        self.marshal(sender, opcode, args, Some((interface, version)))?
            .ok_or_else(|| ClientError::InvalidArgument("message creates no object".to_string()))
    }

    fn marshal(
        self: &Arc<Self>,
        sender: &Proxy,
        opcode: u16,
        mut args: Vec<Argument<ObjectId>>,
        new: Option<(&'static Interface, u32)>,
    ) -> Result<Option<Arc<Proxy>>> {
        let mut inner = self.lock();
        if let Some(msg) = &inner.last_error {
            return Err(ClientError::Fatal(msg.clone()));
        }

        let desc = sender
            .interface()
            .requests
            .get(opcode as usize)
            .ok_or_else(|| {
                ClientError::InvalidArgument(format!(
                    "interface '{}' has no request {opcode}",
                    sender.class()
                ))
            })?;

        // New object ids are allocated locally and optimistically; the peer
        // is expected to accept them.
        let mut new_proxy = None;
        if let Some((interface, version)) = new {
            let Some(id) = inner.map.allocate() else {
                let msg = "client object ids exhausted".to_string();
                self.fatal_locked(&mut inner, msg.clone());
                return Err(ClientError::Fatal(msg));
            };
            let slot = args.iter_mut().find_map(|a| match a {
                Argument::NewId(slot) => Some(slot),
                _ => None,
            });
            let Some(slot) = slot else {
                inner.map.release(id);
                return Err(ClientError::InvalidArgument(
                    "constructor message has no new-id argument".to_string(),
                ));
            };
            *slot = id;
            let proxy = Proxy::new(
                id,
                interface,
                version,
                Arc::downgrade(self),
                sender.queue_id(),
            );
            inner.map.occupy(id, proxy.clone());
            new_proxy = Some(proxy);
        }

        let closure = match Closure::marshal(sender.id(), opcode, desc, args) {
            Ok(c) => c,
            Err(e) => return Err(self.abort_marshal(&mut inner, new_proxy.as_deref(), e)),
        };

        if self.debug {
            eprintln!("{}", closure.trace_line(sender.class(), true));
        }

        match closure.send(&mut inner.conn) {
            Ok(()) => Ok(new_proxy),
            Err(e) => Err(self.abort_marshal(&mut inner, new_proxy.as_deref(), e)),
        }
    }

    /// Unwind a failed request: the never-announced object is buried (its id
    /// is burned, never recycled) and the runtime latches the failure.
    fn abort_marshal(
        &self,
        inner: &mut Inner,
        new_proxy: Option<&Proxy>,
        cause: CodecError,
    ) -> ClientError {
        if let Some(p) = new_proxy {
            inner.map.set(p.id(), Entry::Dead);
            p.mark_destroyed();
        }
        let msg = format!("error sending request: {cause}");
        self.fatal_locked(inner, msg.clone());
        ClientError::Fatal(msg)
    }

    pub(crate) fn destroy_proxy(&self, proxy: &Proxy) -> Result<()> {
        let mut inner = self.lock();
        if proxy.is_destroyed() {
            return Err(ClientError::InvalidArgument(
                "proxy already destroyed".to_string(),
            ));
        }
        let id = proxy.id();
        if proxy.is_id_deleted() {
            // The peer already recycled the id; the slot is free now.
            inner.map.release(id);
        } else {
            // Both id ranges zombify: in-flight events toward the dead
            // object may carry fds whose counts must survive the destroy.
            // Client ids leave the zombie state on delete_id; server ids
            // simply stay defunct.
            inner
                .map
                .set(id, Entry::Zombie(Zombie::for_interface(proxy.interface())));
        }
        proxy.mark_destroyed();
        Ok(())
    }

    /// Send buffered requests. `WouldBlock` leaves the rest queued; poll the
    /// socket writable and call again.
    pub fn flush(&self) -> Result<usize> {
        let mut inner = self.lock();
        if let Some(msg) = &inner.last_error {
            return Err(ClientError::Fatal(msg.clone()));
        }
        match inner.conn.flush() {
            Ok(n) => Ok(n),
            // A closed peer is not latched here: events already received may
            // still explain the failure once dispatched.
            Err(e @ (WireError::WouldBlock | WireError::Closed)) => Err(ClientError::Wire(e)),
            Err(e) => {
                let msg = format!("flush failed: {e}");
                self.fatal_locked(&mut inner, msg.clone());
                Err(ClientError::Fatal(msg))
            }
        }
    }

    /// Announce the intent to read the socket on behalf of the default
    /// queue. See the module docs for the coordination protocol.
    pub fn prepare_read(&self) -> Result<()> {
        self.prepare_read_queue(&self.default_queue())
    }

    /// Announce the intent to read the socket on behalf of `queue`. Fails
    /// `Busy` while the queue holds undispatched events.
    pub fn prepare_read_queue(&self, queue: &QueueToken) -> Result<()> {
        let mut inner = self.lock();
        let q = inner
            .queues
            .get(&queue.id)
            .ok_or_else(|| ClientError::InvalidArgument("unknown queue".to_string()))?;
        if !q.is_empty() {
            return Err(ClientError::Busy);
        }
        inner.reader_count += 1;
        Ok(())
    }

    /// Back out of a prepared read; the last cancellation wakes all waiting
    /// readers so none of them sleeps through data another thread consumed.
    pub fn cancel_read(&self) {
        let mut inner = self.lock();
        inner.reader_count -= 1;
        if inner.reader_count == 0 {
            self.wake_locked(&mut inner);
        }
    }

    /// Complete a prepared read. Exactly one of the prepared threads (the
    /// last one in) performs the socket read and queues events; the rest
    /// block until that read finishes, then re-check their own queues.
    pub fn read_events(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(msg) = &inner.last_error {
            let msg = msg.clone();
            inner.reader_count -= 1;
            if inner.reader_count == 0 {
                self.wake_locked(&mut inner);
            }
            return Err(ClientError::Fatal(msg));
        }

        inner.reader_count -= 1;
        if inner.reader_count == 0 {
            let outcome = match inner.conn.read() {
                Ok(_) => self.queue_incoming(&mut inner),
                Err(WireError::WouldBlock) => Ok(()),
                Err(e) => Err(ClientError::from(e)),
            };
            let result = match outcome {
                Ok(()) => Ok(()),
                Err(e) => {
                    let msg = format!("read failed: {e}");
                    self.fatal_locked(&mut inner, msg.clone());
                    Err(ClientError::Fatal(msg))
                }
            };
            self.wake_locked(&mut inner);
            result
        } else {
            let serial = inner.read_serial;
            while inner.read_serial == serial {
                inner = self
                    .reader_cond
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match &inner.last_error {
                Some(msg) => Err(ClientError::Fatal(msg.clone())),
                None => Ok(()),
            }
        }
    }

    /// Decode every complete message in the incoming buffer into queued
    /// events. A trailing partial message stays buffered for the next read.
    fn queue_incoming(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        loop {
            let pending = inner.conn.pending_input();
            if pending < HEADER_SIZE {
                return Ok(());
            }

            let mut hdr = [0u8; HEADER_SIZE];
            inner.conn.copy_incoming(&mut hdr);
            let sender = ObjectId::new(u32::from_ne_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]));
            let word = u32::from_ne_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
            let size = (word >> 16) as usize;
            let opcode = (word & 0xffff) as u16;

            if size < HEADER_SIZE {
                return Err(CodecError::Protocol("runt message header".to_string()).into());
            }
            if pending < size {
                return Ok(());
            }
            self.queue_one(inner, sender, opcode, size)?;
        }
    }

    fn queue_one(
        self: &Arc<Self>,
        inner: &mut Inner,
        sender: ObjectId,
        opcode: u16,
        size: usize,
    ) -> Result<()> {
        let Some(target) = inner.map.lookup_live(sender) else {
            // Destroyed or unknown object: discard the message, closing
            // exactly the descriptors its opcode is known to carry.
            let fd_count = inner.map.zombie_fd_count(sender, opcode);
            if fd_count > 0 {
                inner.conn.close_incoming_fds(fd_count);
            }
            debug!(
                object = sender.raw(),
                opcode, "discarding event for defunct object"
            );
            inner.conn.consume_incoming(size);
            return Ok(());
        };

        let Some(desc) = target.interface().events.get(opcode as usize) else {
            inner.conn.consume_incoming(size);
            return Err(CodecError::Protocol(format!(
                "interface '{}' has no event {opcode}",
                target.class()
            ))
            .into());
        };

        let closure = Closure::decode(&mut inner.conn, size, desc)?;
        let args = self.resolve_args(inner, &target, desc, closure.args)?;

        let queue_id = if sender == RUNTIME_OBJECT_ID {
            RUNTIME_QUEUE
        } else {
            target.queue_id()
        };
        match inner.queues.get_mut(&queue_id) {
            Some(q) => q.push_back(QueuedEvent {
                target,
                opcode,
                desc,
                args,
            }),
            None => debug!(
                object = sender.raw(),
                opcode, "dropping event bound to a destroyed queue"
            ),
        }
        Ok(())
    }

    /// Resolve raw wire arguments into dispatchable ones: object ids become
    /// proxy handles (zombies become null rather than erroring), `n` ids
    /// become freshly created proxies. On failure, proxies created for this
    /// message are buried again before the error propagates.
    fn resolve_args(
        self: &Arc<Self>,
        inner: &mut Inner,
        sender: &Arc<Proxy>,
        desc: &'static MessageDesc,
        args: Vec<Argument<ObjectId>>,
    ) -> Result<Vec<Argument<Arc<Proxy>>>> {
        let mut out: Vec<Argument<Arc<Proxy>>> = Vec::with_capacity(args.len());

        let result = (|| {
            for (i, arg) in args.into_iter().enumerate() {
                let expected = desc.arg_interfaces.get(i).copied().flatten();
                let resolved = match arg {
                    Argument::Int(v) => Argument::Int(v),
                    Argument::Uint(v) => Argument::Uint(v),
                    Argument::Fixed(v) => Argument::Fixed(v),
                    Argument::Str(v) => Argument::Str(v),
                    Argument::Array(v) => Argument::Array(v),
                    Argument::Fd(v) => Argument::Fd(v),
                    Argument::Object(None) => Argument::Object(None),
                    Argument::Object(Some(id)) => {
                        if inner.map.is_zombie(id) {
                            Argument::Object(None)
                        } else if let Some(p) = inner.map.lookup_live(id) {
                            if let Some(expected) = expected {
                                if !p.interface().same_as(expected) {
                                    return Err(ClientError::InvalidArgument(format!(
                                        "object {id} is '{}', event {} expects '{}'",
                                        p.class(),
                                        desc.name,
                                        expected.name
                                    )));
                                }
                            }
                            Argument::Object(Some(p))
                        } else {
                            return Err(ClientError::InvalidArgument(format!(
                                "unknown object {id} in event {}",
                                desc.name
                            )));
                        }
                    }
                    Argument::NewId(id) => {
                        if id.is_null() {
                            Argument::Object(None)
                        } else {
                            let Some(interface) = expected else {
                                return Err(ClientError::InvalidArgument(format!(
                                    "event {} creates an object of unknown interface",
                                    desc.name
                                )));
                            };
                            let proxy = Proxy::new(
                                id,
                                interface,
                                sender.version(),
                                Arc::downgrade(self),
                                sender.queue_id(),
                            );
                            inner
                                .map
                                .insert_at(id, Entry::Live(proxy.clone()))
                                .map_err(|_| {
                                    ClientError::InvalidArgument(format!(
                                        "invalid new object id {id} in event {}",
                                        desc.name
                                    ))
                                })?;
                            Argument::NewId(proxy)
                        }
                    }
                };
                out.push(resolved);
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(out),
            Err(e) => {
                for arg in &out {
                    if let Argument::NewId(p) = arg {
                        inner.map.set(p.id(), Entry::Dead);
                        p.mark_destroyed();
                    }
                }
                Err(e)
            }
        }
    }

    /// Dispatch queued events without reading the socket. Runtime-queue
    /// events drain first. Returns the number of listener invocations.
    pub fn dispatch_queue_pending(&self, queue: &QueueToken) -> Result<usize> {
        let mut inner = self.lock();
        let mut count = 0usize;
        loop {
            let event = match Self::pop_next(&mut inner, queue.id) {
                Some(ev) => ev,
                None => break,
            };

            // A destroy may have raced in since the event was queued.
            if event.target.is_destroyed() {
                continue;
            }
            let mut args = event.args;
            for arg in &mut args {
                if let Argument::Object(Some(p)) = arg {
                    if p.is_destroyed() {
                        *arg = Argument::Object(None);
                    }
                }
            }

            let dispatcher = event.target.dispatcher();
            drop(inner);

            if self.debug {
                eprintln!("{}", trace_event(&event.target, event.desc, &args));
            }
            if let Some(dispatch) = dispatcher {
                dispatch(&event.target, event.opcode, event.desc, &mut args);
                count += 1;
            }
            // References (and any unclaimed fds) release here, after the
            // invocation, whatever the listener did.
            drop(args);

            inner = self.lock();
            if let Some(msg) = &inner.last_error {
                return Err(ClientError::Fatal(msg.clone()));
            }
        }
        Ok(count)
    }

    fn pop_next(inner: &mut Inner, queue: QueueId) -> Option<QueuedEvent> {
        if let Some(q) = inner.queues.get_mut(&RUNTIME_QUEUE) {
            if let Some(ev) = q.pop_front() {
                return Some(ev);
            }
        }
        inner.queues.get_mut(&queue)?.pop_front()
    }

    /// Dispatch pending events on the default queue.
    pub fn dispatch_pending(&self) -> Result<usize> {
        self.dispatch_queue_pending(&self.default_queue())
    }

    /// Block until events arrive for `queue`, then dispatch them. Flushes
    /// outgoing requests first and cooperates with concurrent readers.
    pub fn dispatch_queue(self: &Arc<Self>, queue: &QueueToken) -> Result<usize> {
        match self.prepare_read_queue(queue) {
            Ok(()) => {}
            Err(ClientError::Busy) => return self.dispatch_queue_pending(queue),
            Err(e) => return Err(e),
        }

        loop {
            match self.flush() {
                Ok(_) => break,
                Err(ClientError::Wire(WireError::WouldBlock)) => {
                    if let Err(e) = self.poll_socket(PollFlags::POLLOUT) {
                        self.cancel_read();
                        return Err(e);
                    }
                }
                // Peer hung up; whatever it sent before may still explain
                // why once dispatched.
                Err(ClientError::Wire(WireError::Closed)) => break,
                Err(e) => {
                    self.cancel_read();
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.poll_socket(PollFlags::POLLIN) {
            self.cancel_read();
            return Err(e);
        }
        self.read_events()?;
        self.dispatch_queue_pending(queue)
    }

    /// Block until events arrive on the default queue, then dispatch.
    pub fn dispatch(self: &Arc<Self>) -> Result<usize> {
        self.dispatch_queue(&self.default_queue())
    }

    /// Block until every request issued so far has been processed by the
    /// peer: sends a `sync` marker bound to `queue` and drives
    /// read/dispatch until its acknowledgment comes back.
    pub fn roundtrip_queue(self: &Arc<Self>, queue: &QueueToken) -> Result<usize> {
        let done = Arc::new(AtomicBool::new(false));

        // The wrapper pins the marker to the caller's queue without racing a
        // queue change on the shared runtime proxy.
        let wrapper = self.runtime_proxy.create_wrapper();
        wrapper.set_queue(queue);
        let callback = self.send_constructor(
            &wrapper,
            REQ_SYNC,
            vec![Argument::NewId(ObjectId::NULL)],
            &CALLBACK_INTERFACE,
        )?;
        drop(wrapper);

        let done_flag = done.clone();
        callback.set_dispatcher(move |_, opcode, _, _| {
            if opcode == EVT_DONE {
                done_flag.store(true, Ordering::Release);
            }
        })?;

        let mut total = 0usize;
        while !done.load(Ordering::Acquire) {
            match self.dispatch_queue(queue) {
                Ok(n) => total += n,
                Err(e) => {
                    let _ = callback.destroy();
                    return Err(e);
                }
            }
        }
        callback.destroy()?;
        Ok(total)
    }

    /// Roundtrip on the default queue.
    pub fn roundtrip(self: &Arc<Self>) -> Result<usize> {
        self.roundtrip_queue(&self.default_queue())
    }

    fn poll_socket(&self, flags: PollFlags) -> Result<()> {
        // SAFETY: the socket is owned by `self.inner` for the whole lifetime
        // of the runtime; this borrow only polls readiness.
        let fd = unsafe { BorrowedFd::borrow_raw(self.socket_fd) };
        let mut pfd = [PollFd::new(fd, flags)];
        loop {
            match nix::poll::poll(&mut pfd, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(ClientError::Wire(WireError::Io(
                        std::io::Error::from_raw_os_error(e as i32),
                    )))
                }
            }
        }
    }

    fn handle_runtime_event(&self, opcode: u16, args: &mut [Argument<Arc<Proxy>>]) {
        match opcode {
            EVT_ERROR => {
                let (object_id, interface) = match args.first() {
                    Some(Argument::Object(Some(p))) => (p.id().raw(), p.class().to_string()),
                    _ => (0, "<destroyed object>".to_string()),
                };
                let code = match args.get(1) {
                    Some(Argument::Uint(c)) => *c,
                    _ => 0,
                };
                let message = match args.get(2) {
                    Some(Argument::Str(Some(s))) => s.to_string_lossy().into_owned(),
                    _ => String::new(),
                };
                warn!(code, object_id, %interface, "peer reported protocol error: {message}");

                let mut inner = self.lock();
                inner.protocol_error = Some(ProtocolErrorInfo {
                    code,
                    object_id,
                    interface: interface.clone(),
                });
                self.fatal_locked(
                    &mut inner,
                    format!("protocol error {code} on {interface}@{object_id}: {message}"),
                );
            }
            EVT_DELETE_ID => {
                let raw = match args.first() {
                    Some(Argument::Uint(id)) => *id,
                    _ => return,
                };
                self.handle_delete_id(raw);
            }
            _ => {}
        }
    }

    /// The peer acknowledged that an id is retired: recycle it, or flag the
    /// still-live proxy so its eventual destroy recycles immediately.
    fn handle_delete_id(&self, raw: u32) {
        let mut inner = self.lock();
        let id = ObjectId::new(raw);
        enum Action {
            Flag(Arc<Proxy>),
            Release,
            Unknown,
        }
        let action = match inner.map.lookup(id) {
            Some(Entry::Live(p)) => Action::Flag(p.clone()),
            Some(Entry::Zombie(_)) => Action::Release,
            _ => Action::Unknown,
        };
        match action {
            Action::Flag(p) => p.mark_id_deleted(),
            Action::Release => inner.map.release(id),
            Action::Unknown => warn!(id = raw, "received delete_id for unknown id"),
        }
    }

    fn fatal_locked(&self, inner: &mut Inner, msg: String) {
        if inner.last_error.is_none() {
            warn!("runtime entering failed state: {msg}");
            inner.last_error = Some(msg);
        }
        self.wake_locked(inner);
    }

    fn wake_locked(&self, inner: &mut Inner) {
        inner.read_serial += 1;
        self.reader_cond.notify_all();
    }
}

impl AsRawFd for Runtime {
    fn as_raw_fd(&self) -> RawFd {
        self.socket_fd
    }
}

fn trace_event(target: &Proxy, desc: &MessageDesc, args: &[Argument<Arc<Proxy>>]) -> String {
    use std::fmt::Write as _;
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut line = format!(
        "[{:7}.{:03}] {}@{}.{}(",
        now.as_secs(),
        now.subsec_millis(),
        target.class(),
        target.id(),
        desc.name
    );
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.push_str(", ");
        }
        match arg {
            Argument::Int(v) => {
                let _ = write!(line, "{v}");
            }
            Argument::Uint(v) => {
                let _ = write!(line, "{v}");
            }
            Argument::Fixed(v) => {
                let _ = write!(line, "{v}");
            }
            Argument::Str(Some(s)) => {
                let _ = write!(line, "{:?}", s.to_string_lossy());
            }
            Argument::Str(None) => line.push_str("nil"),
            Argument::Object(Some(p)) => {
                let _ = write!(line, "{}@{}", p.class(), p.id());
            }
            Argument::Object(None) => line.push_str("nil"),
            Argument::NewId(p) => {
                let _ = write!(line, "new id {}@{}", p.class(), p.id());
            }
            Argument::Array(Some(a)) => {
                let _ = write!(line, "array[{}]", a.len());
            }
            Argument::Array(None) => line.push_str("nil"),
            Argument::Fd(Some(fd)) => {
                let _ = write!(line, "fd {}", fd.as_raw_fd());
            }
            Argument::Fd(None) => line.push_str("fd (taken)"),
        }
    }
    line.push(')');
    line
}

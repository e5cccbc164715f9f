//! The id table: sparse map from protocol object id to proxy state.
//!
//! Client-allocated ids grow upward from 1; ids at or above
//! [`SERVER_ID_START`] belong to the peer. A client id freed by local
//! destruction may be recycled only after the peer acknowledges with
//! `delete_id` — until then the slot holds a zombie (enough bookkeeping to
//! discard in-flight traffic safely) and stays off the free list.

use std::sync::Arc;

use objipc_codec::{Interface, ObjectId};

use crate::proxy::Proxy;

/// First object id the peer allocates from.
pub const SERVER_ID_START: u32 = 0xff00_0000;

/// Residual bookkeeping for a destroyed object: how many file descriptors
/// each of its events carries, so messages still in flight toward it can be
/// discarded without leaking descriptors.
#[derive(Debug)]
pub(crate) struct Zombie {
    /// One count per event opcode; `None` when no event carries fds.
    fd_counts: Option<Box<[usize]>>,
}

impl Zombie {
    pub(crate) fn for_interface(interface: &Interface) -> Self {
        let counts: Box<[usize]> = interface.events.iter().map(|m| m.fd_count()).collect();
        Self {
            fd_counts: counts.iter().any(|&c| c > 0).then_some(counts),
        }
    }

    pub(crate) fn fd_count(&self, opcode: u16) -> usize {
        self.fd_counts
            .as_ref()
            .and_then(|c| c.get(opcode as usize).copied())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
pub(crate) enum Entry {
    /// An object the application can still address.
    Live(Arc<Proxy>),
    /// Destroyed locally; awaiting the peer's delete-id acknowledgment.
    Zombie(Zombie),
    /// Slot that can never be recycled from this side (destroyed
    /// server-allocated object, or a client id burned by an error path).
    Dead,
    /// Recyclable slot.
    Free,
}

pub(crate) struct ObjectMap {
    client: Vec<Entry>,
    server: Vec<Entry>,
    free: Vec<u32>,
}

impl ObjectMap {
    pub(crate) fn new() -> Self {
        Self {
            client: Vec::new(),
            server: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Reserve a fresh client-side id. Returns `None` when the client range
    /// is exhausted.
    pub(crate) fn allocate(&mut self) -> Option<ObjectId> {
        if let Some(id) = self.free.pop() {
            return Some(ObjectId::new(id));
        }
        let id = self.client.len() as u32 + 1;
        if id >= SERVER_ID_START {
            return None;
        }
        self.client.push(Entry::Dead);
        Some(ObjectId::new(id))
    }

    fn slot_mut(&mut self, id: ObjectId) -> Option<&mut Entry> {
        let raw = id.raw();
        if raw == 0 {
            None
        } else if raw < SERVER_ID_START {
            self.client.get_mut(raw as usize - 1)
        } else {
            self.server.get_mut((raw - SERVER_ID_START) as usize)
        }
    }

    fn slot(&self, id: ObjectId) -> Option<&Entry> {
        let raw = id.raw();
        if raw == 0 {
            None
        } else if raw < SERVER_ID_START {
            self.client.get(raw as usize - 1)
        } else {
            self.server.get((raw - SERVER_ID_START) as usize)
        }
    }

    /// Place an entry at an explicit id, growing the owning side as needed.
    /// Fails if the slot already holds a live object.
    pub(crate) fn insert_at(&mut self, id: ObjectId, entry: Entry) -> Result<(), ()> {
        let raw = id.raw();
        if raw == 0 {
            return Err(());
        }
        let (side, index) = if raw < SERVER_ID_START {
            (&mut self.client, raw as usize - 1)
        } else {
            (&mut self.server, (raw - SERVER_ID_START) as usize)
        };
        while side.len() <= index {
            side.push(Entry::Free);
        }
        if matches!(side[index], Entry::Live(_)) {
            return Err(());
        }
        side[index] = entry;
        Ok(())
    }

    pub(crate) fn occupy(&mut self, id: ObjectId, proxy: Arc<Proxy>) {
        if let Some(slot) = self.slot_mut(id) {
            *slot = Entry::Live(proxy);
        }
    }

    pub(crate) fn lookup(&self, id: ObjectId) -> Option<&Entry> {
        self.slot(id)
    }

    pub(crate) fn lookup_live(&self, id: ObjectId) -> Option<Arc<Proxy>> {
        match self.slot(id) {
            Some(Entry::Live(p)) => Some(p.clone()),
            _ => None,
        }
    }

    pub(crate) fn is_zombie(&self, id: ObjectId) -> bool {
        matches!(self.slot(id), Some(Entry::Zombie(_)))
    }

    pub(crate) fn zombie_fd_count(&self, id: ObjectId, opcode: u16) -> usize {
        match self.slot(id) {
            Some(Entry::Zombie(z)) => z.fd_count(opcode),
            _ => 0,
        }
    }

    /// Mark a client id recyclable and put it on the free list.
    pub(crate) fn release(&mut self, id: ObjectId) {
        let raw = id.raw();
        if let Some(slot) = self.slot_mut(id) {
            *slot = Entry::Free;
            if raw < SERVER_ID_START {
                self.free.push(raw);
            }
        }
    }

    /// Replace a slot without touching the free list (destroy paths that
    /// must wait for the peer's acknowledgment).
    pub(crate) fn set(&mut self, id: ObjectId, entry: Entry) {
        if let Some(slot) = self.slot_mut(id) {
            *slot = entry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RUNTIME_INTERFACE;

    fn dummy_proxy(id: ObjectId) -> Arc<Proxy> {
        Proxy::detached_for_tests(id, &RUNTIME_INTERFACE, 1)
    }

    #[test]
    fn ids_allocate_upward_from_one() {
        let mut map = ObjectMap::new();
        assert_eq!(map.allocate().unwrap().raw(), 1);
        assert_eq!(map.allocate().unwrap().raw(), 2);
        assert_eq!(map.allocate().unwrap().raw(), 3);
    }

    #[test]
    fn id_reuse_only_after_release() {
        let mut map = ObjectMap::new();
        let a = map.allocate().unwrap();
        let b = map.allocate().unwrap();
        map.occupy(a, dummy_proxy(a));
        map.occupy(b, dummy_proxy(b));

        // Destroy: zombie, not recyclable yet.
        map.set(a, Entry::Zombie(Zombie::for_interface(&RUNTIME_INTERFACE)));
        assert!(map.is_zombie(a));
        assert_ne!(map.allocate().unwrap(), a);

        // Peer acknowledgment makes the id recyclable.
        map.release(a);
        assert!(!map.is_zombie(a));
        assert_eq!(map.allocate().unwrap(), a);
    }

    #[test]
    fn server_side_ids_indexed_separately() {
        let mut map = ObjectMap::new();
        let sid = ObjectId::new(SERVER_ID_START + 4);
        map.insert_at(sid, Entry::Live(dummy_proxy(sid))).unwrap();

        assert!(map.lookup_live(sid).is_some());
        assert!(map.lookup_live(ObjectId::new(SERVER_ID_START)).is_none());
        // Server entries zombify like client ones, but release never puts
        // them on the client free list.
        map.set(sid, Entry::Zombie(Zombie::for_interface(&RUNTIME_INTERFACE)));
        assert!(map.is_zombie(sid));
        map.release(sid);
        assert_ne!(map.allocate().unwrap(), sid);
    }

    #[test]
    fn insert_at_rejects_live_collision() {
        let mut map = ObjectMap::new();
        let id = map.allocate().unwrap();
        map.occupy(id, dummy_proxy(id));
        assert!(map.insert_at(id, Entry::Dead).is_err());
    }

    #[test]
    fn zombie_fd_counts_follow_event_signatures() {
        static FD_EVENTS: [objipc_codec::MessageDesc; 2] = [
            objipc_codec::MessageDesc {
                name: "plain",
                signature: "u",
                arg_interfaces: &[None],
            },
            objipc_codec::MessageDesc {
                name: "carries_fds",
                signature: "hh",
                arg_interfaces: &[None, None],
            },
        ];
        static FD_IFACE: objipc_codec::Interface = objipc_codec::Interface {
            name: "fd_iface",
            version: 1,
            requests: &[],
            events: &FD_EVENTS,
        };

        let z = Zombie::for_interface(&FD_IFACE);
        assert_eq!(z.fd_count(0), 0);
        assert_eq!(z.fd_count(1), 2);
        assert_eq!(z.fd_count(9), 0);

        let no_fds = Zombie::for_interface(&RUNTIME_INTERFACE);
        assert_eq!(no_fds.fd_count(0), 0);
    }
}

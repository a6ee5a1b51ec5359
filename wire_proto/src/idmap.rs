// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use crate::error::{Error, ProtocolError};
use crate::protocol::Interface;

/// The id at and above which ids are server-allocated. Ids below this threshold are
/// client-allocated. The display singleton always occupies id 1.
pub const SERVER_ID_START: u32 = 0xff00_0000;

pub const DISPLAY_ID: ObjectId = ObjectId(1);

/// A 32-bit wire object identifier. Id 0 is a nil sentinel and never denotes a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub const NULL: ObjectId = ObjectId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn side(self) -> Side {
        if self.0 >= SERVER_ID_START {
            Side::Server
        } else {
            Side::Client
        }
    }
}

impl From<u32> for ObjectId {
    fn from(v: u32) -> Self {
        ObjectId(v)
    }
}

/// Which half of the id space an id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// A live proxy (client side) or resource (server side) record. `S` is the per-endpoint
/// application state type handlers are given mutable access to; each object carries its own
/// handler rather than sharing one global procedure table.
pub struct ObjectRecord<S> {
    pub id: ObjectId,
    pub interface: &'static Interface,
    pub handler: Option<Handler<S>>,
    /// Marks objects created by `sync`/`frame` (and, implicitly, `bind`'s one-shot cousins):
    /// their completion is signaled by a `delete_id` for an id that was never locally destroyed,
    /// which would otherwise look like the "delete_id for live object" protocol anomaly.
    pub is_callback: bool,
    /// Server-side only: run once, in reverse registration order, when the owning client
    /// disconnects or the resource is explicitly destroyed.
    pub destroy_hook: Option<DestroyHook<S>>,
}

impl<S> ObjectRecord<S> {
    pub fn new(id: ObjectId, interface: &'static Interface) -> Self {
        Self {
            id,
            interface,
            handler: None,
            is_callback: false,
            destroy_hook: None,
        }
    }
}

/// A one-shot teardown hook attached to a server-side resource.
pub type DestroyHook<S> = Box<dyn FnOnce(&mut S)>;

/// A handler attached to an object. Unlike the C idiom of a function-pointer vtable plus a
/// `void *` user-data pointer, the per-object state a handler needs is captured directly in the
/// closure; `S` is only the application state shared by the whole endpoint.
pub type Handler<S> =
    Box<dyn FnMut(&mut S, u16, Vec<crate::codec::Argument>) -> Result<(), Error>>;

enum Slot<S> {
    Free,
    Live(ObjectRecord<S>),
    /// Client side only: the owning proxy was destroyed locally but the peer has not yet
    /// acknowledged via `delete_id`. Absorbs and discards any message still in flight to it.
    Zombie,
}

/// The id → record mapping, partitioned into a client-allocated low range and a server-allocated
/// high range, as two dense vectors indexed by offset from the start of each range.
pub struct IdMap<S> {
    client_slots: Vec<Slot<S>>,
    server_slots: Vec<Slot<S>>,
}

impl<S> IdMap<S> {
    pub fn new() -> Self {
        Self {
            client_slots: Vec::new(),
            server_slots: Vec::new(),
        }
    }

    fn slots_mut(&mut self, side: Side) -> &mut Vec<Slot<S>> {
        match side {
            Side::Client => &mut self.client_slots,
            Side::Server => &mut self.server_slots,
        }
    }

    fn index_of(side: Side, id: ObjectId) -> usize {
        match side {
            Side::Client => (id.0 - 1) as usize,
            Side::Server => (id.0 - SERVER_ID_START) as usize,
        }
    }

    fn id_of(side: Side, index: usize) -> ObjectId {
        match side {
            Side::Client => ObjectId(index as u32 + 1),
            Side::Server => ObjectId(index as u32 + SERVER_ID_START),
        }
    }

    /// Allocate the lowest free slot on the given side and register `record` there.
    pub fn insert_new(
        &mut self,
        side: Side,
        make_record: impl FnOnce(ObjectId) -> ObjectRecord<S>,
    ) -> ObjectId {
        let slots = self.slots_mut(side);

        let index = slots.iter().position(|s| matches!(s, Slot::Free));
        let index = index.unwrap_or_else(|| {
            slots.push(Slot::Free);
            slots.len() - 1
        });

        let id = Self::id_of(side, index);
        slots[index] = Slot::Live(make_record(id));
        id
    }

    /// Store a record at a specific id, as when a peer nominates an id in a new-id field. Fails
    /// if the slot is currently live.
    pub fn insert_at(&mut self, id: ObjectId, record: ObjectRecord<S>) -> Result<(), Error> {
        let side = id.side();
        let index = Self::index_of(side, id);
        let slots = self.slots_mut(side);

        if index >= slots.len() {
            slots.resize_with(index + 1, || Slot::Free);
        }

        if matches!(slots[index], Slot::Live(_)) {
            return Err(Error::Protocol(ProtocolError::InvalidObject(id.0)));
        }

        slots[index] = Slot::Live(record);
        Ok(())
    }

    pub fn lookup(&self, id: ObjectId) -> Lookup<'_, S> {
        if id.is_null() {
            return Lookup::Free;
        }

        let side = id.side();
        let index = Self::index_of(side, id);
        let slots = match side {
            Side::Client => &self.client_slots,
            Side::Server => &self.server_slots,
        };

        match slots.get(index) {
            None | Some(Slot::Free) => Lookup::Free,
            Some(Slot::Zombie) => Lookup::Zombie,
            Some(Slot::Live(r)) => Lookup::Live(r),
        }
    }

    pub fn lookup_mut(&mut self, id: ObjectId) -> Option<&mut ObjectRecord<S>> {
        if id.is_null() {
            return None;
        }

        let side = id.side();
        let index = Self::index_of(side, id);
        let slots = self.slots_mut(side);

        match slots.get_mut(index) {
            Some(Slot::Live(r)) => Some(r),
            _ => None,
        }
    }

    /// Transition a client-allocated slot to zombie: the owning proxy is gone locally, but the
    /// peer's acknowledgement (`delete_id`) is still outstanding. No-op-safe to call only on
    /// live, client-side ids.
    pub fn zombify(&mut self, id: ObjectId) {
        debug_assert_eq!(id.side(), Side::Client);
        let index = Self::index_of(Side::Client, id);
        if let Some(slot) = self.client_slots.get_mut(index) {
            *slot = Slot::Zombie;
        }
    }

    /// Free a slot outright: used on `delete_id` acknowledgement (client side) and on immediate
    /// server-side resource destruction.
    pub fn remove(&mut self, id: ObjectId) {
        let side = id.side();
        let index = Self::index_of(side, id);
        if let Some(slot) = self.slots_mut(side).get_mut(index) {
            *slot = Slot::Free;
        }
    }

    pub fn is_zombie(&self, id: ObjectId) -> bool {
        matches!(self.lookup(id), Lookup::Zombie)
    }
}

impl<S> Default for IdMap<S> {
    fn default() -> Self {
        Self::new()
    }
}

pub enum Lookup<'a, S> {
    Live(&'a ObjectRecord<S>),
    Zombie,
    Free,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CALLBACK_INTERFACE;

    #[test]
    fn client_ids_start_at_one_and_are_reused_lowest_first() {
        let mut map: IdMap<()> = IdMap::new();
        let a = map.insert_new(Side::Client, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        let b = map.insert_new(Side::Client, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        assert_eq!(a, ObjectId(1));
        assert_eq!(b, ObjectId(2));

        map.zombify(a);
        map.remove(a);
        let c = map.insert_new(Side::Client, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        assert_eq!(c, ObjectId(1));
    }

    #[test]
    fn zombie_is_not_reused_until_removed() {
        let mut map: IdMap<()> = IdMap::new();
        let a = map.insert_new(Side::Client, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        map.zombify(a);
        assert!(map.is_zombie(a));

        let b = map.insert_new(Side::Client, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        assert_ne!(a, b, "zombie slot must not be reused before remove()");
    }

    #[test]
    fn insert_at_rejects_live_slot() {
        let mut map: IdMap<()> = IdMap::new();
        let id = ObjectId(SERVER_ID_START);
        map.insert_at(id, ObjectRecord::new(id, &CALLBACK_INTERFACE))
            .unwrap();
        let err = map.insert_at(id, ObjectRecord::new(id, &CALLBACK_INTERFACE));
        assert!(err.is_err());
    }

    #[test]
    fn server_ids_start_at_threshold() {
        let mut map: IdMap<()> = IdMap::new();
        let id = map.insert_new(Side::Server, |id| ObjectRecord::new(id, &CALLBACK_INTERFACE));
        assert_eq!(id, ObjectId(SERVER_ID_START));
    }
}

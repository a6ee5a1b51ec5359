// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The client-side mirror of the server's global registry: a name -> (interface, version) lookup
//! table, replicated to every connected client and kept in sync by push (`global`/`global_remove`
//! events) rather than queried on demand.

/// One advertised (name, interface, version) triple, as cached by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalEntry {
    pub name: u32,
    pub interface: String,
    pub version: u32,
}

/// A change to the client's global cache, delivered to every registered listener. A listener
/// registered after some globals were already advertised is replayed `Added` for each of them
/// before it sees any subsequent change, so it observes the same sequence as a listener that was
/// there from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalEvent {
    Added(GlobalEntry),
    Removed(u32),
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Static interface descriptors, keyed by interface/opcode. Nothing here is produced by a schema
//! compiler; these are plain `'static` data.

/// One signature type code per wire argument, in the order they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Uint,
    Fixed,
    String,
    Object,
    NewId,
    Array,
    Fd,
}

/// A request or event signature: its name (for tracing) and argument kinds in wire order.
#[derive(Debug, Clone, Copy)]
pub struct MessageSig {
    pub name: &'static str,
    pub args: &'static [ArgKind],
    /// For a signature containing a `NewId` argument whose target interface is statically known
    /// (as opposed to `bind`'s dynamically-named interface), the descriptor of the created
    /// object. `None` for `bind`, which nominates its interface by name at the argument level.
    pub new_id_interface: Option<&'static Interface>,
}

/// A static interface descriptor: name, version, and its ordered request/event tables. Opcodes
/// are positions into `requests`/`events`.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    pub version: u32,
    pub requests: &'static [MessageSig],
    pub events: &'static [MessageSig],
}

/// The interface of the one-shot objects created by `sync` and `frame`: no requests, a single
/// `done` event with no arguments (the event the dispatcher fires to unblock a round-trip or
/// publish a frame).
pub static CALLBACK_INTERFACE: Interface = Interface {
    name: "wl_callback",
    version: 1,
    requests: &[],
    events: &[MessageSig {
        name: "done",
        args: &[ArgKind::Uint],
        new_id_interface: None,
    }],
};

/// The registry interface bound off the display singleton via `bind`. Carries no requests or
/// events of its own in this core; applications layer their own interfaces over resources it
/// creates. Present so `bind`'s target has a concrete, non-callback descriptor to point at in
/// tests and examples.
pub static REGISTRY_INTERFACE: Interface = Interface {
    name: "wl_registry",
    version: 1,
    requests: &[],
    events: &[],
};

/// Display-singleton requests, in opcode order: `sync`, `bind`. Frame is expressed as a request
/// carried on whichever object supports it in the full protocol vocabulary (out of scope here),
/// but the display-level `frame` control message described by the wire format is exposed here
/// directly since this core treats it as a built-in alongside `sync`/`bind`.
pub const OP_DISPLAY_SYNC: u16 = 0;
pub const OP_DISPLAY_BIND: u16 = 1;
pub const OP_DISPLAY_FRAME: u16 = 2;

/// Display-singleton events, in opcode order.
pub const EV_DISPLAY_ERROR: u16 = 0;
pub const EV_DISPLAY_GLOBAL: u16 = 1;
pub const EV_DISPLAY_GLOBAL_REMOVE: u16 = 2;
pub const EV_DISPLAY_DELETE_ID: u16 = 3;
pub const EV_DISPLAY_INVALID_OBJECT: u16 = 4;
pub const EV_DISPLAY_INVALID_METHOD: u16 = 5;
pub const EV_DISPLAY_NO_MEMORY: u16 = 6;
pub const EV_DISPLAY_RANGE: u16 = 7;

/// The built-in display singleton's interface descriptor. Always lives at id 1 on both sides.
pub static DISPLAY_INTERFACE: Interface = Interface {
    name: "wl_display",
    version: 1,
    requests: &[
        MessageSig {
            name: "sync",
            args: &[ArgKind::NewId],
            new_id_interface: Some(&CALLBACK_INTERFACE),
        },
        MessageSig {
            name: "bind",
            args: &[
                ArgKind::Uint,
                ArgKind::String,
                ArgKind::Uint,
                ArgKind::NewId,
            ],
            new_id_interface: None,
        },
        MessageSig {
            name: "frame",
            args: &[ArgKind::NewId],
            new_id_interface: Some(&CALLBACK_INTERFACE),
        },
    ],
    events: &[
        MessageSig {
            name: "error",
            args: &[ArgKind::Object, ArgKind::Uint, ArgKind::String],
            new_id_interface: None,
        },
        MessageSig {
            name: "global",
            args: &[ArgKind::Uint, ArgKind::String, ArgKind::Uint],
            new_id_interface: None,
        },
        MessageSig {
            name: "global_remove",
            args: &[ArgKind::Uint],
            new_id_interface: None,
        },
        MessageSig {
            name: "delete_id",
            args: &[ArgKind::Uint],
            new_id_interface: None,
        },
        MessageSig {
            name: "invalid_object",
            args: &[ArgKind::Uint],
            new_id_interface: None,
        },
        MessageSig {
            name: "invalid_method",
            args: &[ArgKind::Uint, ArgKind::Uint],
            new_id_interface: None,
        },
        MessageSig {
            name: "no_memory",
            args: &[],
            new_id_interface: None,
        },
        MessageSig {
            name: "range",
            args: &[ArgKind::Uint],
            new_id_interface: None,
        },
    ],
};

impl Interface {
    pub fn request(&self, opcode: u16) -> Option<&'static MessageSig> {
        self.requests.get(opcode as usize)
    }

    pub fn event(&self, opcode: u16) -> Option<&'static MessageSig> {
        self.events.get(opcode as usize)
    }
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The client endpoint: connection setup, the proxy factory, round-trip synchronization, and the
//! global-registry cache. A long-lived, multi-object connection built around marshal/send/dispatch
//! rather than one-shot call/reply pairs.

use std::env;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::{trace, warn};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::codec::{self, Argument};
use crate::config::EndpointConfig;
use crate::debug::{self, Direction};
use crate::dispatch::{self, Header, Peeked};
use crate::error::{Error, ProtocolError};
use crate::global::{GlobalEntry, GlobalEvent};
use crate::idmap::{Handler, IdMap, Lookup, ObjectId, ObjectRecord, Side, DISPLAY_ID};
use crate::protocol::{
    ArgKind, Interface, CALLBACK_INTERFACE, DISPLAY_INTERFACE, EV_DISPLAY_DELETE_ID,
    EV_DISPLAY_ERROR, EV_DISPLAY_GLOBAL, EV_DISPLAY_GLOBAL_REMOVE, EV_DISPLAY_INVALID_METHOD,
    EV_DISPLAY_INVALID_OBJECT, EV_DISPLAY_NO_MEMORY, EV_DISPLAY_RANGE, OP_DISPLAY_BIND,
    OP_DISPLAY_FRAME, OP_DISPLAY_SYNC,
};
use crate::wire::{Connection, Interest};

/// The linux/BSD `sockaddr_un` path length limit, including the trailing nul. Exceeding it is a
/// *name-too-long* failure.
const UNIX_PATH_MAX: usize = 108;

/// The block size the server grants at a time; the client tracks its own remaining count so it
/// knows when `bind` is about to run out, purely for diagnostics (the server is the one that
/// decides to refill, per the server endpoint's watermark).
#[derive(Debug, Clone, Copy)]
struct ServerIdRange {
    next: u32,
    remaining: u32,
}

/// A registered global-listener closure: replayed the full current cache on registration, then
/// invoked for every subsequent `Added`/`Removed`.
type GlobalListener<S> = Box<dyn FnMut(&mut S, &GlobalEvent)>;

/// The client endpoint. `S` is the application state type every object handler and global
/// listener is given mutable access to.
pub struct Client<S> {
    connection: Connection,
    idmap: IdMap<S>,
    config: EndpointConfig,
    state: S,
    /// Set by a protocol error, an `error` event, or a decode failure on the client side. Once
    /// set, every subsequent operation fails until the client is torn down and reconnected.
    fatal: bool,
    globals: Vec<GlobalEntry>,
    listeners: Vec<GlobalListener<S>>,
    server_range: Option<ServerIdRange>,
}

impl<S> Client<S> {
    /// Connect, preferring an inherited, pre-connected descriptor named by `WAYLAND_SOCKET`,
    /// falling back to dialing `$XDG_RUNTIME_DIR/<name>`.
    pub fn connect(state: S) -> Result<Self, Error> {
        let config = EndpointConfig::from_env();

        let stream = if let Some(stream) = take_inherited_socket()? {
            stream
        } else {
            dial(&config)?
        };

        Self::new(stream, config, state)
    }

    /// Build a client directly from an already-connected stream, bypassing the
    /// inherit-or-dial rules `connect` applies. Used by tests wiring both endpoints over a
    /// `socketpair`, and available to callers that already own a connected descriptor.
    pub fn from_stream(stream: UnixStream, state: S) -> Result<Self, Error> {
        Self::new(stream, EndpointConfig::from_env(), state)
    }

    fn new(stream: UnixStream, config: EndpointConfig, state: S) -> Result<Self, Error> {
        let connection = Connection::new(stream)?;
        let mut idmap = IdMap::new();
        idmap
            .insert_at(DISPLAY_ID, ObjectRecord::new(DISPLAY_ID, &DISPLAY_INTERFACE))
            .expect("id 1 is free on a freshly constructed client");

        Ok(Self {
            connection,
            idmap,
            config,
            state,
            fatal: false,
            globals: Vec::new(),
            listeners: Vec::new(),
            server_range: None,
        })
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// True once a fatal protocol/transport error has occurred; every other method that touches
    /// the wire will return `ProtocolError::Fatal` until the client is dropped and reconnected.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn globals(&self) -> &[GlobalEntry] {
        &self.globals
    }

    /// True if `id` currently names a live proxy. Useful for polling a callback's completion
    /// (as `roundtrip` does internally) or checking a resource outlived a round trip.
    pub fn is_live(&self, id: ObjectId) -> bool {
        matches!(self.idmap.lookup(id), Lookup::Live(_))
    }

    /// Allocate a new client-side proxy id and register it. Used for objects whose lifecycle the
    /// client owns outright (as opposed to `bind`-created resources, whose ids are drawn from the
    /// server-granted range).
    pub fn create(&mut self, interface: &'static Interface) -> ObjectId {
        self.idmap
            .insert_new(Side::Client, |id| ObjectRecord::new(id, interface))
    }

    /// Register a proxy at an id the peer has already nominated (e.g., a `new_id` argument
    /// decoded from an incoming event). Fails if the slot is already live.
    pub fn create_at(&mut self, id: ObjectId, interface: &'static Interface) -> Result<(), Error> {
        self.idmap.insert_at(id, ObjectRecord::new(id, interface))
    }

    /// Attach `handler` to `id`. Fails if a handler is already attached.
    pub fn add_listener(&mut self, id: ObjectId, handler: Handler<S>) -> Result<(), Error> {
        let record = self
            .idmap
            .lookup_mut(id)
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(id.0)))?;
        if record.handler.is_some() {
            return Err(Error::Protocol(ProtocolError::HandlerAlreadySet));
        }
        record.handler = Some(handler);
        Ok(())
    }

    /// Register a listener for the global cache. It is immediately replayed the entire current
    /// set (the "late listener" replay law), then invoked for every later `global`/`global_remove`.
    pub fn add_global_listener(&mut self, mut listener: GlobalListener<S>) {
        for entry in self.globals.clone() {
            listener(&mut self.state, &GlobalEvent::Added(entry));
        }
        self.listeners.push(listener);
    }

    /// Destroy a locally-owned (client-allocated) proxy: transitions the slot to zombie and
    /// awaits the peer's `delete_id` acknowledgement before the id can be reused. The caller is
    /// responsible for having already sent whatever interface-specific `destroy` request applies;
    /// this only updates local id bookkeeping.
    pub fn destroy_proxy(&mut self, id: ObjectId) {
        self.idmap.zombify(id);
    }

    /// Issue `sync`: a fresh callback proxy (drawn from the client's own low range, like any other
    /// locally-owned object) whose `done` event fires once the server has processed every request
    /// sent before this one.
    pub fn sync(&mut self) -> Result<ObjectId, Error> {
        self.send_callback_request(OP_DISPLAY_SYNC)
    }

    /// Issue `frame`: registers a one-shot callback the server fires at the next frame
    /// publication.
    pub fn frame(&mut self) -> Result<ObjectId, Error> {
        self.send_callback_request(OP_DISPLAY_FRAME)
    }

    fn send_callback_request(&mut self, opcode: u16) -> Result<ObjectId, Error> {
        let id = self.idmap.insert_new(Side::Client, |id| {
            let mut record = ObjectRecord::new(id, &CALLBACK_INTERFACE);
            record.is_callback = true;
            record
        });

        let sig = &DISPLAY_INTERFACE.requests[opcode as usize];
        if let Err(e) = self.send_request(DISPLAY_ID, opcode, sig, vec![Argument::NewId(id.0)]) {
            self.idmap.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Bind a global by name, creating a resource proxy of `interface`. The new id is drawn from
    /// the block of server-allocated ids the server has most recently granted this client.
    pub fn bind(
        &mut self,
        name: u32,
        interface: &'static Interface,
        version: u32,
    ) -> Result<ObjectId, Error> {
        let id = self.next_server_range_id()?;
        self.idmap.insert_at(id, ObjectRecord::new(id, interface))?;

        let sig = &DISPLAY_INTERFACE.requests[OP_DISPLAY_BIND as usize];
        let args = vec![
            Argument::Uint(name),
            Argument::String(Some(interface.name.to_string())),
            Argument::Uint(version),
            Argument::NewId(id.0),
        ];

        if let Err(e) = self.send_request(DISPLAY_ID, OP_DISPLAY_BIND, sig, args) {
            self.idmap.remove(id);
            return Err(e);
        }
        Ok(id)
    }

    fn next_server_range_id(&mut self) -> Result<ObjectId, Error> {
        let range = self
            .server_range
            .as_mut()
            .filter(|r| r.remaining > 0)
            .ok_or(Error::Protocol(ProtocolError::NoMemory))?;

        let id = ObjectId(range.next);
        range.next += 1;
        range.remaining -= 1;
        Ok(id)
    }

    /// Send an arbitrary request. New-id arguments must already carry an id the caller has
    /// registered (via `create`/`create_at`/`bind`) before this is called: encoding never
    /// allocates on its own.
    pub fn send_request(
        &mut self,
        receiver: ObjectId,
        opcode: u16,
        sig: &'static crate::protocol::MessageSig,
        args: Vec<Argument>,
    ) -> Result<(), Error> {
        self.send_request_with_fds(receiver, opcode, sig, args, Vec::new())
    }

    pub fn send_request_with_fds(
        &mut self,
        receiver: ObjectId,
        opcode: u16,
        sig: &'static crate::protocol::MessageSig,
        args: Vec<Argument>,
        fds: Vec<OwnedFd>,
    ) -> Result<(), Error> {
        if self.fatal {
            return Err(Error::Protocol(ProtocolError::Fatal));
        }

        let bytes = dispatch::build_message(receiver.0, opcode, sig, &args)?;
        let header = Header::decode(
            bytes[..dispatch::HEADER_LEN]
                .try_into()
                .expect("build_message always writes a full header"),
        );

        let interface_name = match self.idmap.lookup(receiver) {
            Lookup::Live(record) => record.interface.name,
            _ if receiver == DISPLAY_ID => "wl_display",
            _ => "?",
        };
        debug::trace_message(
            self.config.debug,
            Direction::Sent,
            interface_name,
            sig.name,
            &header,
            &args,
        );

        match self.connection.send(&bytes, fds)? {
            crate::wire::SendOutcome::Queued => Ok(()),
            crate::wire::SendOutcome::WouldBlock(fds) => Err(Error::WouldBlock(fds)),
        }
    }

    /// Drain the socket and dispatch every fully-buffered message currently waiting, without
    /// blocking. Returns the number of messages dispatched.
    pub fn iterate(&mut self) -> Result<usize, Error> {
        self.connection.drain(Interest::both())?;
        let dispatched = self.dispatch_pending()?;
        if self.connection.is_dead() {
            self.fatal = true;
        }
        Ok(dispatched)
    }

    /// `sync` plus dispatch until its callback fires, guaranteeing every request sent before this
    /// call has been processed by the server. The dispatched-message accumulator is explicitly
    /// initialized to zero before the loop runs.
    pub fn roundtrip(&mut self) -> Result<usize, Error> {
        let callback = self.sync()?;
        let mut total = 0usize;

        loop {
            if self.fatal {
                return Err(Error::Protocol(ProtocolError::Fatal));
            }
            if !self.is_live(callback) {
                return Ok(total);
            }
            total += self.iterate()?;
        }
    }

    fn dispatch_pending(&mut self) -> Result<usize, Error> {
        let mut dispatched = 0usize;
        loop {
            let peeked = dispatch::peek_message(&self.connection.inbound.bytes)?;
            let (header, payload) = match peeked {
                Peeked::Incomplete => break,
                Peeked::Message { header, payload } => (header, payload),
            };
            self.connection
                .inbound
                .bytes
                .consume(dispatch::message_len(&header));

            self.handle_message(header, payload)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    fn handle_message(&mut self, header: Header, payload: Vec<u8>) -> Result<(), Error> {
        let receiver = ObjectId(header.receiver);

        if receiver == DISPLAY_ID {
            return self.handle_display_event(header.opcode, &payload);
        }

        let interface = match self.idmap.lookup(receiver) {
            Lookup::Free => {
                warn!("event for unknown object {}", receiver.0);
                return Ok(());
            }
            Lookup::Zombie => {
                trace!("discarding event for zombie object {}", receiver.0);
                return Ok(());
            }
            Lookup::Live(record) => record.interface,
        };

        let Some(sig) = interface.event(header.opcode) else {
            self.fatal = true;
            return Err(Error::Protocol(ProtocolError::InvalidMethod {
                object: receiver.0,
                opcode: header.opcode,
            }));
        };

        let mut args = codec::decode_payload(sig, &payload).map_err(|e| {
            self.fatal = true;
            e
        })?;
        dispatch::validate_objects(&args, sig, &self.idmap).map_err(|e| {
            self.fatal = true;
            e
        })?;
        dispatch::resolve_fds(&mut args, sig, &mut self.connection.inbound.fds).map_err(|e| {
            self.fatal = true;
            e
        })?;

        debug::trace_message(
            self.config.debug,
            Direction::Received,
            interface.name,
            sig.name,
            &header,
            &args,
        );

        if let Some(pos) = sig.args.iter().position(|k| *k == ArgKind::NewId) {
            let Argument::NewId(raw) = args[pos] else {
                unreachable!("position came from a NewId slot")
            };
            let new_iface = sig
                .new_id_interface
                .expect("non-bind signatures carry a static new-id interface");
            self.idmap
                .insert_at(ObjectId(raw), ObjectRecord::new(ObjectId(raw), new_iface))
                .map_err(|e| {
                    self.fatal = true;
                    e
                })?;
        }

        self.invoke_handler(receiver, header.opcode, args)
    }

    fn invoke_handler(&mut self, receiver: ObjectId, opcode: u16, args: Vec<Argument>) -> Result<(), Error> {
        let taken = self
            .idmap
            .lookup_mut(receiver)
            .and_then(|record| record.handler.take());

        let Some(mut handler) = taken else {
            return Ok(());
        };

        let result = handler(&mut self.state, opcode, args);
        if let Some(record) = self.idmap.lookup_mut(receiver) {
            record.handler = Some(handler);
        }
        result
    }

    fn handle_display_event(&mut self, opcode: u16, payload: &[u8]) -> Result<(), Error> {
        let Some(sig) = DISPLAY_INTERFACE.event(opcode) else {
            self.fatal = true;
            return Err(Error::Protocol(ProtocolError::InvalidMethod {
                object: DISPLAY_ID.0,
                opcode,
            }));
        };

        let mut args = codec::decode_payload(sig, payload).map_err(|e| {
            self.fatal = true;
            e
        })?;
        dispatch::validate_objects(&args, sig, &self.idmap).map_err(|e| {
            self.fatal = true;
            e
        })?;
        dispatch::resolve_fds(&mut args, sig, &mut self.connection.inbound.fds).map_err(|e| {
            self.fatal = true;
            e
        })?;

        let header = Header {
            receiver: DISPLAY_ID.0,
            opcode,
            size: 0,
        };
        debug::trace_message(
            self.config.debug,
            Direction::Received,
            "wl_display",
            sig.name,
            &header,
            &args,
        );

        match opcode {
            EV_DISPLAY_ERROR => {
                let (Argument::Object(object), Argument::Uint(code), Argument::String(msg)) =
                    (&args[0], &args[1], &args[2])
                else {
                    unreachable!("error's signature is fixed")
                };
                log::error!(
                    "protocol error on object {object} (code {code}): {}",
                    msg.as_deref().unwrap_or("")
                );
                self.fatal = true;
            }
            EV_DISPLAY_GLOBAL => {
                let (Argument::Uint(name), Argument::String(Some(iface)), Argument::Uint(version)) =
                    (&args[0], &args[1], &args[2])
                else {
                    unreachable!("global's signature is fixed")
                };
                let entry = GlobalEntry {
                    name: *name,
                    interface: iface.clone(),
                    version: *version,
                };
                self.globals.push(entry.clone());
                let event = GlobalEvent::Added(entry);
                for listener in &mut self.listeners {
                    listener(&mut self.state, &event);
                }
            }
            EV_DISPLAY_GLOBAL_REMOVE => {
                let Argument::Uint(name) = args[0] else {
                    unreachable!("global_remove's signature is fixed")
                };
                self.globals.retain(|g| g.name != name);
                let event = GlobalEvent::Removed(name);
                for listener in &mut self.listeners {
                    listener(&mut self.state, &event);
                }
            }
            EV_DISPLAY_DELETE_ID => {
                let Argument::Uint(id) = args[0] else {
                    unreachable!("delete_id's signature is fixed")
                };
                let target = ObjectId(id);
                match target.side() {
                    // Server-allocated ids are always destroyed at the server's initiative; a
                    // `delete_id` for one is never a surprise.
                    Side::Server => self.idmap.remove(target),
                    Side::Client => {
                        let is_callback =
                            matches!(self.idmap.lookup(target), Lookup::Live(r) if r.is_callback);
                        if self.idmap.is_zombie(target) || is_callback {
                            self.idmap.remove(target);
                        } else {
                            warn!("delete_id for live object {id}");
                        }
                    }
                }
            }
            EV_DISPLAY_INVALID_OBJECT => {
                let Argument::Uint(id) = args[0] else {
                    unreachable!()
                };
                log::error!("server reports invalid_object({id}) for our own request");
            }
            EV_DISPLAY_INVALID_METHOD => {
                let (Argument::Uint(id), Argument::Uint(op)) = (&args[0], &args[1]) else {
                    unreachable!()
                };
                log::error!("server reports invalid_method(id={id}, opcode={op}) for our own request");
            }
            EV_DISPLAY_NO_MEMORY => {
                log::error!("server reports no_memory for our own request");
            }
            EV_DISPLAY_RANGE => {
                let Argument::Uint(base) = args[0] else {
                    unreachable!("range's signature is fixed")
                };
                self.server_range = Some(ServerIdRange {
                    next: base,
                    remaining: 256,
                });
            }
            _ => unreachable!("DISPLAY_INTERFACE.events has exactly these opcodes"),
        }

        Ok(())
    }
}

/// Consume `WAYLAND_SOCKET`, if set: a pre-connected descriptor the client should use instead of
/// dialing. The variable is cleared and the descriptor is marked close-on-exec once taken.
fn take_inherited_socket() -> Result<Option<UnixStream>, Error> {
    let Some(raw) = env::var_os("WAYLAND_SOCKET") else {
        return Ok(None);
    };

    // SAFETY: removing an inherited env var the process no longer needs; no other code in this
    // process relies on re-reading it concurrently (the client runs single-threaded).
    env::remove_var("WAYLAND_SOCKET");

    let fd: RawFd = raw
        .to_str()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Protocol(ProtocolError::NotFound))?;

    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(Error::from)?;

    // SAFETY: `fd` names a descriptor the parent process handed us exclusively for this purpose.
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    Ok(Some(stream))
}

fn dial(config: &EndpointConfig) -> Result<UnixStream, Error> {
    let dir = config
        .runtime_dir
        .as_ref()
        .ok_or(Error::Protocol(ProtocolError::NotFound))?;

    let path = socket_path(dir, &config.socket_name)?;
    UnixStream::connect(&path).map_err(Error::from)
}

fn socket_path(dir: &Path, name: &str) -> Result<PathBuf, Error> {
    let path = dir.join(name);
    // +1 for the trailing nul the kernel's sockaddr_un requires.
    if path.as_os_str().len() + 1 > UNIX_PATH_MAX {
        return Err(Error::Protocol(ProtocolError::NameTooLong));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_rejects_oversized_names() {
        let dir = PathBuf::from("/tmp");
        let long_name = "x".repeat(200);
        let err = socket_path(&dir, &long_name).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::NameTooLong)));
    }

    #[test]
    fn socket_path_joins_dir_and_name() {
        let dir = PathBuf::from("/run/user/1000");
        let path = socket_path(&dir, "wayland-0").unwrap();
        assert_eq!(path, PathBuf::from("/run/user/1000/wayland-0"));
    }
}

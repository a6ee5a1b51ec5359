// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The server endpoint: listening sockets, client acceptance, per-client resource lists, the
//! id-range grant protocol, and global advertisement. The global table is a name -> (interface,
//! version) registry pushed to every client as it changes, rather than served on request.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

use log::{debug, trace, warn};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::codec::{self, Argument};
use crate::debug::{self, Direction};
use crate::dispatch::{self, Header, Peeked};
use crate::error::{Error, ProtocolError};
use crate::global::GlobalEntry;
use crate::idmap::{DestroyHook, Handler, IdMap, Lookup, ObjectId, ObjectRecord, DISPLAY_ID};
use crate::protocol::{
    ArgKind, Interface, CALLBACK_INTERFACE, DISPLAY_INTERFACE, EV_DISPLAY_DELETE_ID,
    EV_DISPLAY_GLOBAL, EV_DISPLAY_GLOBAL_REMOVE, EV_DISPLAY_INVALID_METHOD,
    EV_DISPLAY_INVALID_OBJECT, EV_DISPLAY_RANGE, OP_DISPLAY_BIND, OP_DISPLAY_FRAME,
    OP_DISPLAY_SYNC,
};
use crate::wire::{Connection, Interest};
use crate::{config::EndpointConfig, idmap::SERVER_ID_START};

/// The size of each id-range grant, and the low-watermark that triggers the next one.
const RANGE_GRANT: u32 = 256;
const RANGE_WATERMARK: u32 = 64;

/// Identifies one connected client, stable for the lifetime of the connection. Indexes into
/// `Server::clients`; a disconnected client's slot becomes `None` rather than being reused, so a
/// stale `ClientId` reliably fails instead of silently addressing a different client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(usize);

pub type BindHook<S> = Box<dyn FnMut(&mut S, ClientId, ObjectId)>;

struct Global<S> {
    name: u32,
    interface: &'static Interface,
    version: u32,
    bind_hook: Option<BindHook<S>>,
}

/// A one-shot `frame` registration: fires (a `done` event, immediately followed by `delete_id`)
/// the next time the application calls `publish_frame`.
struct FrameListener<S> {
    client: ClientId,
    callback: ObjectId,
    destroy_hook: Option<DestroyHook<S>>,
}

struct ClientHandle<S> {
    connection: Connection,
    idmap: IdMap<S>,
    /// Registration order of every resource inserted for this client, oldest first; torn down in
    /// reverse on disconnect.
    resource_order: Vec<ObjectId>,
    range_remaining: u32,
}

/// The server endpoint. `S` is the shared application state every resource handler, bind hook,
/// and frame-listener destroy hook is given mutable access to.
pub struct Server<S> {
    config: EndpointConfig,
    state: S,
    listeners: Vec<(UnixListener, PathBuf)>,
    clients: Vec<Option<ClientHandle<S>>>,
    globals: Vec<Global<S>>,
    next_name: u32,
    next_range_cursor: u32,
    frame_listeners: Vec<FrameListener<S>>,
}

impl<S> Server<S> {
    /// Build a server endpoint. The display object occupies id 1 in every client's id map by
    /// construction; there is no separate global for it, matching the client's own reserved id 1.
    pub fn create(state: S) -> Self {
        Self {
            config: EndpointConfig::from_env(),
            state,
            listeners: Vec::new(),
            clients: Vec::new(),
            globals: Vec::new(),
            next_name: 1,
            next_range_cursor: SERVER_ID_START,
            frame_listeners: Vec::new(),
        }
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Bind a listening socket under `$XDG_RUNTIME_DIR/<name>` (falling back to `.` with a
    /// warning, per the server's runtime-directory policy), removing a stale socket file left
    /// over from a prior run first.
    pub fn add_socket(&mut self, name: &str) -> Result<(), Error> {
        let dir = self.config.server_runtime_dir();
        let path = dir.join(name);

        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        set_nonblocking(listener.as_fd().as_raw_fd())?;

        debug!("listening on {}", path.display());
        self.listeners.push((listener, path));
        Ok(())
    }

    /// Advertise a new global, assigning it the next name and immediately pushing a `global` event
    /// to every already-connected client. Returns the assigned name.
    pub fn add_global(
        &mut self,
        interface: &'static Interface,
        version: u32,
        bind_hook: Option<BindHook<S>>,
    ) -> u32 {
        let name = self.next_name;
        self.next_name += 1;

        self.globals.push(Global {
            name,
            interface,
            version,
            bind_hook,
        });

        let entry = GlobalEntry {
            name,
            interface: interface.name.to_string(),
            version,
        };
        self.broadcast_global_added(&entry);
        name
    }

    /// Withdraw a global, pushing `global_remove` to every connected client.
    pub fn remove_global(&mut self, name: u32) {
        self.globals.retain(|g| g.name != name);
        let sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_GLOBAL_REMOVE as usize];
        self.broadcast(DISPLAY_ID, EV_DISPLAY_GLOBAL_REMOVE, sig, || {
            vec![Argument::Uint(name)]
        });
    }

    fn broadcast_global_added(&mut self, entry: &GlobalEntry) {
        let sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_GLOBAL as usize];
        self.broadcast(DISPLAY_ID, EV_DISPLAY_GLOBAL, sig, || {
            vec![
                Argument::Uint(entry.name),
                Argument::String(Some(entry.interface.clone())),
                Argument::Uint(entry.version),
            ]
        });
    }

    /// Post the same event, freshly built per client via `make_args`, to every connected client.
    /// `Argument` carries non-`Clone` descriptor payloads, so a shared argument vector can't be
    /// reused across sends; each client gets its own built from scratch instead.
    fn broadcast(
        &mut self,
        receiver: ObjectId,
        opcode: u16,
        sig: &'static crate::protocol::MessageSig,
        make_args: impl Fn() -> Vec<Argument>,
    ) {
        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| ClientId(i)))
            .collect();
        for id in ids {
            if let Err(e) = self.post_event(id, receiver, opcode, sig, make_args()) {
                warn!("broadcast to client {} failed: {e}", id.0);
            }
        }
    }

    /// Accept every pending connection on every listening socket without blocking, completing the
    /// range-grant and global-replay handshake for each.
    pub fn accept_pending(&mut self) -> Result<Vec<ClientId>, Error> {
        let mut accepted = Vec::new();
        for (listener, _path) in &self.listeners {
            loop {
                match listener.accept() {
                    Ok((stream, _addr)) => accepted.push(stream),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::from(e)),
                }
            }
        }

        let mut ids = Vec::with_capacity(accepted.len());
        for stream in accepted {
            ids.push(self.client_create(stream)?);
        }
        Ok(ids)
    }

    /// Wrap an accepted descriptor in a connection, grant its initial id range, and replay every
    /// currently-advertised global.
    pub fn client_create(&mut self, stream: UnixStream) -> Result<ClientId, Error> {
        let connection = Connection::new(stream)?;
        let mut idmap = IdMap::new();
        idmap
            .insert_at(DISPLAY_ID, ObjectRecord::new(DISPLAY_ID, &DISPLAY_INTERFACE))
            .expect("id 1 is free on a freshly accepted client");

        let slot = ClientHandle {
            connection,
            idmap,
            resource_order: Vec::new(),
            range_remaining: 0,
        };

        let index = self
            .clients
            .iter()
            .position(|c| c.is_none())
            .unwrap_or(self.clients.len());
        if index == self.clients.len() {
            self.clients.push(Some(slot));
        } else {
            self.clients[index] = Some(slot);
        }
        let id = ClientId(index);

        self.grant_range(id)?;

        let globals: Vec<GlobalEntry> = self
            .globals
            .iter()
            .map(|g| GlobalEntry {
                name: g.name,
                interface: g.interface.name.to_string(),
                version: g.version,
            })
            .collect();
        let sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_GLOBAL as usize];
        for entry in globals {
            let args = vec![
                Argument::Uint(entry.name),
                Argument::String(Some(entry.interface)),
                Argument::Uint(entry.version),
            ];
            self.post_event(id, DISPLAY_ID, EV_DISPLAY_GLOBAL, sig, args)?;
        }

        trace!("accepted client {}", id.0);
        Ok(id)
    }

    fn grant_range(&mut self, id: ClientId) -> Result<(), Error> {
        let base = self.next_range_cursor;
        self.next_range_cursor += RANGE_GRANT;

        let client = self.client_mut(id)?;
        client.range_remaining += RANGE_GRANT;

        let sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_RANGE as usize];
        self.post_event(
            id,
            DISPLAY_ID,
            EV_DISPLAY_RANGE,
            sig,
            vec![Argument::Uint(base)],
        )
    }

    fn client_mut(&mut self, id: ClientId) -> Result<&mut ClientHandle<S>, Error> {
        self.clients
            .get_mut(id.0)
            .and_then(|c| c.as_mut())
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(0)))
    }

    fn client(&self, id: ClientId) -> Result<&ClientHandle<S>, Error> {
        self.clients
            .get(id.0)
            .and_then(|c| c.as_ref())
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(0)))
    }

    /// Register a resource (explicitly, outside of the generic new-id decode path) for a client.
    pub fn insert_resource(
        &mut self,
        client: ClientId,
        id: ObjectId,
        interface: &'static Interface,
    ) -> Result<(), Error> {
        let c = self.client_mut(client)?;
        c.idmap.insert_at(id, ObjectRecord::new(id, interface))?;
        c.resource_order.push(id);
        Ok(())
    }

    pub fn add_listener(
        &mut self,
        client: ClientId,
        id: ObjectId,
        handler: Handler<S>,
    ) -> Result<(), Error> {
        let record = self
            .client_mut(client)?
            .idmap
            .lookup_mut(id)
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(id.0)))?;
        if record.handler.is_some() {
            return Err(Error::Protocol(ProtocolError::HandlerAlreadySet));
        }
        record.handler = Some(handler);
        Ok(())
    }

    pub fn set_destroy_hook(
        &mut self,
        client: ClientId,
        id: ObjectId,
        hook: DestroyHook<S>,
    ) -> Result<(), Error> {
        let record = self
            .client_mut(client)?
            .idmap
            .lookup_mut(id)
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(id.0)))?;
        record.destroy_hook = Some(hook);
        Ok(())
    }

    /// Attach a teardown hook to a pending `frame` callback, run once the frame fires or the
    /// client disconnects before it does.
    pub fn set_frame_destroy_hook(
        &mut self,
        client: ClientId,
        callback: ObjectId,
        hook: DestroyHook<S>,
    ) -> Result<(), Error> {
        let listener = self
            .frame_listeners
            .iter_mut()
            .find(|l| l.client == client && l.callback == callback)
            .ok_or(Error::Protocol(ProtocolError::InvalidObject(callback.0)))?;
        listener.destroy_hook = Some(hook);
        Ok(())
    }

    /// Send an event to a specific client.
    pub fn post_event(
        &mut self,
        client: ClientId,
        receiver: ObjectId,
        opcode: u16,
        sig: &'static crate::protocol::MessageSig,
        args: Vec<Argument>,
    ) -> Result<(), Error> {
        self.post_event_with_fds(client, receiver, opcode, sig, args, Vec::new())
    }

    /// Send an event that carries one or more descriptors, in the order they should be matched up
    /// with the signature's `Fd` argument slots.
    pub fn post_event_with_fds(
        &mut self,
        client: ClientId,
        receiver: ObjectId,
        opcode: u16,
        sig: &'static crate::protocol::MessageSig,
        args: Vec<Argument>,
        fds: Vec<OwnedFd>,
    ) -> Result<(), Error> {
        let bytes = dispatch::build_message(receiver.0, opcode, sig, &args)?;
        let header = Header::decode(
            bytes[..dispatch::HEADER_LEN]
                .try_into()
                .expect("build_message always writes a full header"),
        );

        let debug = self.config.debug;
        let c = self.client_mut(client)?;
        let interface_name = match c.idmap.lookup(receiver) {
            Lookup::Live(record) => record.interface.name,
            _ if receiver == DISPLAY_ID => "wl_display",
            _ => "?",
        };
        debug::trace_message(debug, Direction::Sent, interface_name, sig.name, &header, &args);

        match c.connection.send(&bytes, fds)? {
            crate::wire::SendOutcome::Queued => Ok(()),
            crate::wire::SendOutcome::WouldBlock(fds) => Err(Error::WouldBlock(fds)),
        }
    }

    /// One iteration of the event loop: drain readiness on every listening and client socket,
    /// dispatch whatever arrived, and accept new connections. Blocks until at least one fd is
    /// ready (no deadlines are modeled).
    pub fn iterate(&mut self) -> Result<(), Error> {
        self.wait_for_readiness()?;
        self.accept_pending()?;

        let ids: Vec<ClientId> = self
            .clients
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|_| ClientId(i)))
            .collect();

        for id in ids {
            if let Err(e) = self.dispatch_client(id) {
                warn!("client {} failed: {e}; disconnecting", id.0);
                self.disconnect_client(id);
            }
        }
        Ok(())
    }

    /// Run the event loop forever.
    pub fn run(&mut self) -> Result<(), Error> {
        loop {
            self.iterate()?;
        }
    }

    fn wait_for_readiness(&self) -> Result<(), Error> {
        let mut fds: Vec<PollFd> = Vec::new();
        for (listener, _) in &self.listeners {
            // SAFETY: the listener outlives this poll call; we only read its readiness.
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(listener.as_fd().as_raw_fd()) },
                PollFlags::POLLIN,
            ));
        }
        for client in self.clients.iter().flatten() {
            // SAFETY: same as above; the connection outlives this poll call.
            fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(client.connection.as_raw_fd()) },
                PollFlags::POLLIN | PollFlags::POLLOUT,
            ));
        }

        if fds.is_empty() {
            return Ok(());
        }

        poll(&mut fds, PollTimeout::NONE).map_err(Error::from)?;
        Ok(())
    }

    /// Drain and dispatch whatever is currently available for one client, without blocking. Used
    /// by `iterate`'s poll-driven loop, and directly useful to a caller that drives a single known
    /// connection by hand (as tests do, with no listening socket involved).
    pub fn dispatch_client(&mut self, id: ClientId) -> Result<(), Error> {
        let c = self.client_mut(id)?;
        c.connection.drain(Interest::both())?;
        let peer_gone = c.connection.is_dead();

        self.dispatch_pending(id)?;

        if peer_gone {
            self.disconnect_client(id);
        }
        Ok(())
    }

    fn dispatch_pending(&mut self, id: ClientId) -> Result<(), Error> {
        loop {
            let c = self.client_mut(id)?;
            let peeked = dispatch::peek_message(&c.connection.inbound.bytes)?;
            let (header, payload) = match peeked {
                Peeked::Incomplete => return Ok(()),
                Peeked::Message { header, payload } => (header, payload),
            };
            c.connection
                .inbound
                .bytes
                .consume(dispatch::message_len(&header));

            self.handle_message(id, header, payload)?;
        }
    }

    fn handle_message(&mut self, id: ClientId, header: Header, payload: Vec<u8>) -> Result<(), Error> {
        let receiver = ObjectId(header.receiver);

        if receiver == DISPLAY_ID {
            return self.handle_display_request(id, header.opcode, &payload);
        }

        let c = self.client_mut(id)?;
        let interface = match c.idmap.lookup(receiver) {
            Lookup::Free => {
                let sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_OBJECT as usize];
                self.post_event(
                    id,
                    DISPLAY_ID,
                    EV_DISPLAY_INVALID_OBJECT,
                    sig,
                    vec![Argument::Uint(receiver.0)],
                )?;
                return Ok(());
            }
            Lookup::Zombie => return Ok(()),
            Lookup::Live(record) => record.interface,
        };

        let Some(sig) = interface.request(header.opcode) else {
            let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
            self.post_event(
                id,
                DISPLAY_ID,
                EV_DISPLAY_INVALID_METHOD,
                ev,
                vec![Argument::Uint(receiver.0), Argument::Uint(header.opcode as u32)],
            )?;
            return Ok(());
        };

        let mut args = match codec::decode_payload(sig, &payload) {
            Ok(a) => a,
            Err(_) => {
                let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
                self.post_event(
                    id,
                    DISPLAY_ID,
                    EV_DISPLAY_INVALID_METHOD,
                    ev,
                    vec![Argument::Uint(receiver.0), Argument::Uint(header.opcode as u32)],
                )?;
                return Ok(());
            }
        };

        let c = self.client_mut(id)?;
        let objects_ok = dispatch::validate_objects(&args, sig, &c.idmap).is_ok();
        let fds_ok = objects_ok
            && dispatch::resolve_fds(&mut args, sig, &mut c.connection.inbound.fds).is_ok();
        if !fds_ok {
            let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
            self.post_event(
                id,
                DISPLAY_ID,
                EV_DISPLAY_INVALID_METHOD,
                ev,
                vec![Argument::Uint(receiver.0), Argument::Uint(header.opcode as u32)],
            )?;
            return Ok(());
        }

        let debug = self.config.debug;
        debug::trace_message(debug, Direction::Received, interface.name, sig.name, &header, &args);

        if let Some(pos) = sig.args.iter().position(|k| *k == ArgKind::NewId) {
            let Argument::NewId(raw) = args[pos] else {
                unreachable!("position came from a NewId slot")
            };
            let new_iface = sig
                .new_id_interface
                .expect("non-bind request signatures carry a static new-id interface");
            let new_id = ObjectId(raw);
            let c = self.client_mut(id)?;
            c.idmap.insert_at(new_id, ObjectRecord::new(new_id, new_iface))?;
            c.resource_order.push(new_id);
        }

        self.invoke_handler(id, receiver, header.opcode, args)
    }

    fn invoke_handler(
        &mut self,
        id: ClientId,
        receiver: ObjectId,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<(), Error> {
        let c = self.client_mut(id)?;
        let taken = c.idmap.lookup_mut(receiver).and_then(|r| r.handler.take());

        let Some(mut handler) = taken else {
            return Ok(());
        };

        let result = handler(&mut self.state, opcode, args);
        if let Ok(c) = self.client_mut(id) {
            if let Some(record) = c.idmap.lookup_mut(receiver) {
                record.handler = Some(handler);
            }
        }
        result
    }

    fn handle_display_request(&mut self, id: ClientId, opcode: u16, payload: &[u8]) -> Result<(), Error> {
        let Some(sig) = DISPLAY_INTERFACE.request(opcode) else {
            let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
            return self.post_event(
                id,
                DISPLAY_ID,
                EV_DISPLAY_INVALID_METHOD,
                ev,
                vec![Argument::Uint(DISPLAY_ID.0), Argument::Uint(opcode as u32)],
            );
        };

        let mut args = match codec::decode_payload(sig, payload) {
            Ok(a) => a,
            Err(_) => {
                let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
                return self.post_event(
                    id,
                    DISPLAY_ID,
                    EV_DISPLAY_INVALID_METHOD,
                    ev,
                    vec![Argument::Uint(DISPLAY_ID.0), Argument::Uint(opcode as u32)],
                );
            }
        };

        let c = self.client_mut(id)?;
        let objects_ok = dispatch::validate_objects(&args, sig, &c.idmap).is_ok();
        let fds_ok = objects_ok
            && dispatch::resolve_fds(&mut args, sig, &mut c.connection.inbound.fds).is_ok();
        if !fds_ok {
            let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_METHOD as usize];
            return self.post_event(
                id,
                DISPLAY_ID,
                EV_DISPLAY_INVALID_METHOD,
                ev,
                vec![Argument::Uint(DISPLAY_ID.0), Argument::Uint(opcode as u32)],
            );
        }

        let header = Header {
            receiver: DISPLAY_ID.0,
            opcode,
            size: 0,
        };
        let debug = self.config.debug;
        debug::trace_message(debug, Direction::Received, "wl_display", sig.name, &header, &args);

        match opcode {
            OP_DISPLAY_SYNC => {
                let Argument::NewId(raw) = args[0] else {
                    unreachable!("sync's signature is fixed")
                };
                self.fire_callback(id, ObjectId(raw))
            }
            OP_DISPLAY_FRAME => {
                let Argument::NewId(raw) = args[0] else {
                    unreachable!("frame's signature is fixed")
                };
                self.frame_listeners.push(FrameListener {
                    client: id,
                    callback: ObjectId(raw),
                    destroy_hook: None,
                });
                Ok(())
            }
            OP_DISPLAY_BIND => self.handle_bind(id, &args),
            _ => unreachable!("DISPLAY_INTERFACE.requests has exactly these opcodes"),
        }
    }

    /// Immediately fire a one-shot callback's `done` event, then reclaim its id with `delete_id`.
    fn fire_callback(&mut self, client: ClientId, callback: ObjectId) -> Result<(), Error> {
        let done_sig = &CALLBACK_INTERFACE.events[0];
        self.post_event(client, callback, 0, done_sig, vec![Argument::Uint(0)])?;

        let del_sig = &DISPLAY_INTERFACE.events[EV_DISPLAY_DELETE_ID as usize];
        self.post_event(
            client,
            DISPLAY_ID,
            EV_DISPLAY_DELETE_ID,
            del_sig,
            vec![Argument::Uint(callback.0)],
        )
    }

    /// Drain every registered frame listener, firing each exactly as `fire_callback` does. The
    /// application calls this whenever it decides a frame has been published; the core has no
    /// opinion on when that is (vsync/event-loop timing lives outside this core).
    pub fn publish_frame(&mut self) {
        let listeners = std::mem::take(&mut self.frame_listeners);
        for mut listener in listeners {
            if let Err(e) = self.fire_callback(listener.client, listener.callback) {
                warn!("frame callback delivery failed: {e}");
            }
            if let Some(hook) = listener.destroy_hook.take() {
                hook(&mut self.state);
            }
        }
    }

    fn handle_bind(&mut self, id: ClientId, args: &[Argument]) -> Result<(), Error> {
        let (Argument::Uint(name), Argument::String(Some(_requested)), Argument::Uint(version), Argument::NewId(raw)) =
            (&args[0], &args[1], &args[2], &args[3])
        else {
            unreachable!("bind's signature is fixed")
        };
        let name = *name;
        let version = *version;
        let new_id = ObjectId(*raw);

        let Some(pos) = self.globals.iter().position(|g| g.name == name) else {
            let ev = &DISPLAY_INTERFACE.events[EV_DISPLAY_INVALID_OBJECT as usize];
            return self.post_event(
                id,
                DISPLAY_ID,
                EV_DISPLAY_INVALID_OBJECT,
                ev,
                vec![Argument::Uint(name)],
            );
        };

        let interface = self.globals[pos].interface;

        let c = self.client_mut(id)?;
        c.idmap.insert_at(new_id, ObjectRecord::new(new_id, interface))?;
        c.resource_order.push(new_id);
        c.range_remaining = c.range_remaining.saturating_sub(1);
        let needs_refill = c.range_remaining < RANGE_WATERMARK;

        if needs_refill {
            self.grant_range(id)?;
        }

        if let Some(hook) = self.globals[pos].bind_hook.as_mut() {
            hook(&mut self.state, id, new_id);
        }

        let _ = version;
        Ok(())
    }

    /// Tear down a client: run every resource's destroy hook in reverse registration order, then
    /// drop the connection.
    pub fn disconnect_client(&mut self, id: ClientId) {
        let Some(mut slot) = self.clients.get_mut(id.0).and_then(Option::take) else {
            return;
        };

        while let Some(resource_id) = slot.resource_order.pop() {
            if let Some(record) = slot.idmap.lookup_mut(resource_id) {
                if let Some(hook) = record.destroy_hook.take() {
                    hook(&mut self.state);
                }
            }
        }

        let (dead, live): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.frame_listeners)
                .into_iter()
                .partition(|l| l.client == id);
        self.frame_listeners = live;
        for mut listener in dead {
            if let Some(hook) = listener.destroy_hook.take() {
                hook(&mut self.state);
            }
        }

        trace!("disconnected client {}", id.0);
    }
}

fn set_nonblocking(raw: RawFd) -> Result<(), Error> {
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_starts_with_no_clients_or_globals() {
        let server: Server<()> = Server::create(());
        assert_eq!(server.clients.len(), 0);
        assert_eq!(server.globals.len(), 0);
        assert_eq!(server.next_range_cursor, SERVER_ID_START);
    }
}

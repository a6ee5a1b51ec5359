// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;

/// The possible errors that can arise while running the wire protocol core.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level errors: framing violations, bad object references, decode failures. These
    /// are returned by the codec/dispatcher before any handler runs.
    Protocol(ProtocolError),

    /// Errors returned by I/O failures on the underlying socket.
    Io(io::Error),

    /// A send could not be queued because the outbound ring was full even after a non-blocking
    /// flush. Carries back any descriptors the caller passed in, since they were never queued and
    /// would otherwise be silently closed; the caller should hold onto them and retry the send
    /// once writable interest fires.
    WouldBlock(Vec<OwnedFd>),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::WouldBlock(fds) => {
                write!(f, "send would block, {} descriptor(s) returned", fds.len())
            }
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self::Io(io::Error::from(e))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// The protocol-level error kinds this wire format can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Truncated header, or a message size that isn't a multiple of 4.
    Framing,

    /// A message was addressed to an id that is not currently live (unknown or zombie).
    InvalidObject(u32),

    /// A message's opcode was out of range for the receiver's interface, or its payload violated
    /// the declared signature.
    InvalidMethod { object: u32, opcode: u16 },

    /// An allocation the codec needed (a fresh object id, a buffer) could not be satisfied.
    NoMemory,

    /// The runtime directory required to locate the display socket was not found.
    NotFound,

    /// The computed socket path does not fit in the platform's socket address length limit.
    NameTooLong,

    /// The client-side fatal-error flag is set; no further operations are permitted until the
    /// endpoint is destroyed and recreated.
    Fatal,

    /// Attempted to attach a handler to an object that already has one.
    HandlerAlreadySet,

    /// The outbound ring could not hold a message even after a non-blocking flush; the caller
    /// should wait for writable interest before retrying.
    WouldBlock,
}

impl std::error::Error for ProtocolError {}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Framing => write!(f, "truncated or misaligned message framing"),
            Self::InvalidObject(id) => write!(f, "message addressed to invalid object {id}"),
            Self::InvalidMethod { object, opcode } => {
                write!(f, "invalid method {opcode} on object {object}")
            }
            Self::NoMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "runtime directory not found"),
            Self::NameTooLong => write!(f, "socket path exceeds platform limit"),
            Self::Fatal => write!(f, "endpoint is in a fatal error state"),
            Self::HandlerAlreadySet => write!(f, "object already has a handler attached"),
            Self::WouldBlock => write!(f, "operation would block"),
        }
    }
}

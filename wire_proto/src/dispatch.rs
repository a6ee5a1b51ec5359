// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Framing shared by the client and server dispatch loops: peeking and validating the 8-byte
//! header, and the housekeeping involved in draining a fully-buffered message off the inbound
//! ring. The loops themselves differ enough in lookup/error policy between client and server to
//! live in `client.rs`/`server.rs`.

use crate::codec::{self, Argument};
use crate::error::{Error, ProtocolError};
use crate::idmap::{IdMap, Lookup, ObjectId};
use crate::protocol::{ArgKind, MessageSig};
use crate::wire::buffer::{ByteRing, FdRing};

/// The 8-byte wire header: receiver id, then `(size << 16) | opcode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub receiver: u32,
    pub opcode: u16,
    /// Total message size including this header, always a multiple of 4.
    pub size: u16,
}

pub const HEADER_LEN: usize = 8;

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.receiver.to_ne_bytes());
        let packed = ((self.size as u32) << 16) | self.opcode as u32;
        out[4..8].copy_from_slice(&packed.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        let receiver = u32::from_ne_bytes(bytes[0..4].try_into().unwrap());
        let packed = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        Self {
            receiver,
            opcode: (packed & 0xffff) as u16,
            size: (packed >> 16) as u16,
        }
    }
}

/// What the caller should do with the bytes that were peeked.
pub enum Peeked {
    /// Fewer than `HEADER_LEN` bytes are buffered; wait for more data.
    Incomplete,
    /// A full message is buffered; here it is, bytes not yet consumed.
    Message { header: Header, payload: Vec<u8> },
}

/// Peek (without consuming) the next complete message on `ring`, if any. A decoded header whose
/// size is not a 4-byte multiple, or is smaller than the header itself, is a framing violation:
/// the whole connection is unrecoverable at that point since the read cursor can no longer be
/// trusted to point at a header boundary.
pub fn peek_message(ring: &ByteRing) -> Result<Peeked, Error> {
    if ring.len() < HEADER_LEN {
        return Ok(Peeked::Incomplete);
    }

    let raw = ring.copy(HEADER_LEN).expect("len checked above");
    let header = Header::decode(raw[..].try_into().expect("exactly HEADER_LEN bytes"));

    let size = header.size as usize;
    if size < HEADER_LEN || size % 4 != 0 {
        return Err(Error::Protocol(ProtocolError::Framing));
    }

    if ring.len() < size {
        return Ok(Peeked::Incomplete);
    }

    let whole = ring.copy(size).expect("len checked above");
    let payload = whole[HEADER_LEN..].to_vec();
    Ok(Peeked::Message { header, payload })
}

/// Bytes to advance the ring by after a message (successfully dispatched or discarded) is done
/// with: the full framed size, header included.
pub fn message_len(header: &Header) -> usize {
    header.size as usize
}

/// Marshal a full wire message (header + payload) for `receiver`/`opcode` per `sig`. Shared by
/// the client and server send paths so the header's size field is computed in exactly one place.
pub fn build_message(
    receiver: u32,
    opcode: u16,
    sig: &MessageSig,
    args: &[Argument],
) -> Result<Vec<u8>, Error> {
    let payload = codec::encode_payload(sig, args)?;
    let size = HEADER_LEN + payload.len();
    if size > u16::MAX as usize {
        return Err(Error::Protocol(ProtocolError::NoMemory));
    }

    let header = Header {
        receiver,
        opcode,
        size: size as u16,
    };

    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// After a successful decode, pop one real descriptor from `fds` for every `Fd`-kind argument, in
/// the order `sig` declares them, replacing the codec's `Fd(None)` placeholder. Fails if the ring
/// runs dry before every `Fd` slot is filled: per the codec's demarshalling contract, an `h`
/// argument with no descriptor behind it is a framing violation, not a null.
pub fn resolve_fds(args: &mut [Argument], sig: &MessageSig, fds: &mut FdRing) -> Result<(), Error> {
    for (kind, arg) in sig.args.iter().zip(args.iter_mut()) {
        if *kind == ArgKind::Fd {
            let fd = fds
                .pop_fd()
                .ok_or(Error::Protocol(ProtocolError::Framing))?;
            *arg = Argument::Fd(Some(fd));
        }
    }
    Ok(())
}

/// After a successful decode, every `Object`-kind argument must name a currently live record: id
/// 0 is the null sentinel and always passes, but any other id whose slot is free or a zombie is
/// an *invalid-object* demarshalling violation.
pub fn validate_objects<S>(args: &[Argument], sig: &MessageSig, idmap: &IdMap<S>) -> Result<(), Error> {
    for (kind, arg) in sig.args.iter().zip(args.iter()) {
        if *kind == ArgKind::Object {
            let Argument::Object(raw) = arg else {
                unreachable!("position came from an Object slot")
            };
            if *raw != 0 {
                match idmap.lookup(ObjectId(*raw)) {
                    Lookup::Live(_) => {}
                    Lookup::Zombie | Lookup::Free => {
                        return Err(Error::Protocol(ProtocolError::InvalidObject(*raw)));
                    }
                }
            }
        }
    }
    Ok(())
}

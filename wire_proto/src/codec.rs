// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Signature-driven marshalling. These functions are pure transforms between a typed argument
//! vector and wire bytes; they know nothing about the ID map or connections. New-id allocation and
//! object resolution (which *do* require the ID map), and popping real descriptors off the fd ring
//! (which requires the connection), are layered on top by the dispatcher, which calls here only to
//! get/put the raw `u32` id carried by `Object`/`NewId` arguments and the `Fd` placeholder slot.

use std::os::fd::{AsRawFd, OwnedFd};

use crate::error::{Error, ProtocolError};
use crate::protocol::{ArgKind, MessageSig};

/// 24.8 fixed-point, matching the wire format's `f` signature code.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fixed(i32);

impl Fixed {
    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub fn to_bits(self) -> i32 {
        self.0
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 256.0
    }

    pub fn from_f64(v: f64) -> Self {
        Self((v * 256.0).round() as i32)
    }
}

/// One decoded or to-be-encoded wire argument.
#[derive(Debug)]
pub enum Argument {
    Int(i32),
    Uint(u32),
    Fixed(Fixed),
    String(Option<String>),
    /// The raw object id carried on the wire; 0 means null. Resolving this to a live record is
    /// the dispatcher's job, not the codec's.
    Object(u32),
    /// The raw id nominated for a freshly created object.
    NewId(u32),
    Array(Vec<u8>),
    /// Where a file descriptor sits in argument order. Encoding ignores the payload here
    /// entirely (the real `OwnedFd` to send travels separately, alongside the message, as the
    /// fds parameter to `send_request_with_fds`/`post_event_with_fds`); callers building an
    /// argument list to encode should pass `Fd(None)`. Decoding always produces `Some`, holding
    /// the descriptor the dispatcher popped off the inbound fd ring for this slot.
    Fd(Option<OwnedFd>),
}

impl PartialEq for Argument {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Argument::Int(a), Argument::Int(b)) => a == b,
            (Argument::Uint(a), Argument::Uint(b)) => a == b,
            (Argument::Fixed(a), Argument::Fixed(b)) => a == b,
            (Argument::String(a), Argument::String(b)) => a == b,
            (Argument::Object(a), Argument::Object(b)) => a == b,
            (Argument::NewId(a), Argument::NewId(b)) => a == b,
            (Argument::Array(a), Argument::Array(b)) => a == b,
            (Argument::Fd(a), Argument::Fd(b)) => {
                a.as_ref().map(OwnedFd::as_raw_fd) == b.as_ref().map(OwnedFd::as_raw_fd)
            }
            _ => false,
        }
    }
}

/// Encode `args` into a payload (header excluded) per `sig`. Returns the payload bytes; any `Fd`
/// arguments are skipped (they carry no payload bytes, only ancillary data) and must be pushed to
/// the outbound fd ring by the caller in the same order they appear in `args`.
pub fn encode_payload(sig: &MessageSig, args: &[Argument]) -> Result<Vec<u8>, Error> {
    if args.len() != sig.args.len() {
        return Err(Error::Protocol(ProtocolError::InvalidMethod {
            object: 0,
            opcode: 0,
        }));
    }

    let mut out = Vec::new();
    for (kind, arg) in sig.args.iter().zip(args) {
        encode_one(*kind, arg, &mut out)?;
    }
    Ok(out)
}

fn encode_one(kind: ArgKind, arg: &Argument, out: &mut Vec<u8>) -> Result<(), Error> {
    match (kind, arg) {
        (ArgKind::Int, Argument::Int(v)) => out.extend_from_slice(&v.to_ne_bytes()),
        (ArgKind::Uint, Argument::Uint(v)) => out.extend_from_slice(&v.to_ne_bytes()),
        (ArgKind::Fixed, Argument::Fixed(v)) => out.extend_from_slice(&v.to_bits().to_ne_bytes()),
        (ArgKind::Object, Argument::Object(id)) => out.extend_from_slice(&id.to_ne_bytes()),
        (ArgKind::NewId, Argument::NewId(id)) => out.extend_from_slice(&id.to_ne_bytes()),
        (ArgKind::String, Argument::String(s)) => encode_string(s.as_deref(), out),
        (ArgKind::Array, Argument::Array(bytes)) => encode_array(bytes, out),
        (ArgKind::Fd, Argument::Fd(_)) => {}
        _ => {
            return Err(Error::Protocol(ProtocolError::InvalidMethod {
                object: 0,
                opcode: 0,
            }))
        }
    }
    Ok(())
}

fn encode_string(s: Option<&str>, out: &mut Vec<u8>) {
    match s {
        None => out.extend_from_slice(&0u32.to_ne_bytes()),
        Some(s) => {
            let len = s.len() as u32 + 1;
            out.extend_from_slice(&len.to_ne_bytes());
            out.extend_from_slice(s.as_bytes());
            out.push(0);
            pad4(out);
        }
    }
}

fn encode_array(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_ne_bytes());
    out.extend_from_slice(bytes);
    pad4(out);
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Decode `args.len() == sig.args.len()` arguments from `payload` per `sig`. `payload` holds
/// exactly the message's payload bytes (header already stripped and validated by the caller).
/// `Fd` arguments produce `Argument::Fd(None)` placeholders; popping the actual descriptor from
/// the inbound fd ring and filling it in is the dispatcher's responsibility (`dispatch::resolve_fds`),
/// in argument order. Likewise `Object` arguments carry only the raw wire id here; validating it
/// against the ID map (`dispatch::validate_objects`) is also the dispatcher's job.
pub fn decode_payload(sig: &MessageSig, payload: &[u8]) -> Result<Vec<Argument>, Error> {
    let mut cursor = 0usize;
    let mut args = Vec::with_capacity(sig.args.len());

    for kind in sig.args {
        let arg = decode_one(*kind, payload, &mut cursor)?;
        args.push(arg);
    }

    Ok(args)
}

fn decode_one(kind: ArgKind, payload: &[u8], cursor: &mut usize) -> Result<Argument, Error> {
    match kind {
        ArgKind::Int => Ok(Argument::Int(i32::from_ne_bytes(take4(payload, cursor)?))),
        ArgKind::Uint => Ok(Argument::Uint(u32::from_ne_bytes(take4(payload, cursor)?))),
        ArgKind::Fixed => Ok(Argument::Fixed(Fixed::from_bits(i32::from_ne_bytes(
            take4(payload, cursor)?,
        )))),
        ArgKind::Object => Ok(Argument::Object(u32::from_ne_bytes(take4(
            payload, cursor,
        )?))),
        ArgKind::NewId => Ok(Argument::NewId(u32::from_ne_bytes(take4(
            payload, cursor,
        )?))),
        ArgKind::String => decode_string(payload, cursor),
        ArgKind::Array => decode_array(payload, cursor),
        ArgKind::Fd => Ok(Argument::Fd(None)),
    }
}

fn take4(payload: &[u8], cursor: &mut usize) -> Result<[u8; 4], Error> {
    let end = *cursor + 4;
    let bytes = payload
        .get(*cursor..end)
        .ok_or(Error::Protocol(ProtocolError::Framing))?;
    *cursor = end;
    Ok(bytes.try_into().expect("slice of len 4"))
}

fn decode_string(payload: &[u8], cursor: &mut usize) -> Result<Argument, Error> {
    let len = u32::from_ne_bytes(take4(payload, cursor)?) as usize;
    if len == 0 {
        return Ok(Argument::String(None));
    }

    let end = *cursor + len;
    let raw = payload
        .get(*cursor..end)
        .ok_or(Error::Protocol(ProtocolError::Framing))?;
    let (text, nul) = raw.split_at(len - 1);
    if nul != [0] {
        return Err(Error::Protocol(ProtocolError::Framing));
    }
    let s = std::str::from_utf8(text)
        .map_err(|_| Error::Protocol(ProtocolError::Framing))?
        .to_string();

    *cursor = end;
    advance_padded(cursor);
    Ok(Argument::String(Some(s)))
}

fn decode_array(payload: &[u8], cursor: &mut usize) -> Result<Argument, Error> {
    let len = u32::from_ne_bytes(take4(payload, cursor)?) as usize;
    let end = *cursor + len;
    let bytes = payload
        .get(*cursor..end)
        .ok_or(Error::Protocol(ProtocolError::Framing))?
        .to_vec();

    *cursor = end;
    advance_padded(cursor);
    Ok(Argument::Array(bytes))
}

fn advance_padded(cursor: &mut usize) {
    while *cursor % 4 != 0 {
        *cursor += 1;
    }
}

// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The `WAYLAND_DEBUG` trace line: one `log::trace!` call per sent or received message, gated by
//! `EndpointConfig::debug` rather than a process-wide global.

use crate::codec::Argument;
use crate::dispatch::Header;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "->"),
            Self::Received => write!(f, "<-"),
        }
    }
}

/// Emit one trace line for a dispatched or sent message, if tracing is enabled. Call sites pass
/// the interface/message name resolved by the caller, since the header alone only carries ids and
/// opcodes.
pub fn trace_message(
    debug: bool,
    direction: Direction,
    interface_name: &str,
    message_name: &str,
    header: &Header,
    args: &[Argument],
) {
    if !debug {
        return;
    }

    log::trace!(
        "{direction} {interface_name}#{}.{message_name}({})",
        header.receiver,
        format_args(args),
    );
}

fn format_args(args: &[Argument]) -> String {
    args.iter()
        .map(format_one)
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_one(arg: &Argument) -> String {
    match arg {
        Argument::Int(v) => v.to_string(),
        Argument::Uint(v) => v.to_string(),
        Argument::Fixed(v) => format!("{:.3}", v.as_f64()),
        Argument::String(Some(s)) => format!("{s:?}"),
        Argument::String(None) => "nil".to_string(),
        Argument::Object(id) => format!("object@{id}"),
        Argument::NewId(id) => format!("new_id@{id}"),
        Argument::Array(bytes) => format!("array[{}]", bytes.len()),
        Argument::Fd(Some(fd)) => format!("fd@{}", std::os::fd::AsRawFd::as_raw_fd(fd)),
        Argument::Fd(None) => "fd".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_trace_does_not_panic_on_empty_args() {
        let header = Header {
            receiver: 1,
            opcode: 0,
            size: 8,
        };
        trace_message(false, Direction::Sent, "wl_display", "sync", &header, &[]);
    }

    #[test]
    fn formats_mixed_argument_kinds() {
        let args = vec![
            Argument::Uint(7),
            Argument::String(Some("foo".into())),
            Argument::String(None),
        ];
        assert_eq!(format_args(&args), r#"7, "foo", nil"#);
    }
}

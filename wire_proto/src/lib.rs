// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The core of a display-server wire protocol runtime: object identity, the signature-driven
//! argument codec, message framing, and the client/server dispatch loops built on top of them.
//! No interface vocabulary (surfaces, buffers, input) lives here — only the display singleton's
//! built-in requests/events (`sync`, `bind`, `frame`, `global`, `delete_id`, ...) that every
//! interface vocabulary is built against.

pub mod client;
pub mod codec;
pub mod config;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod global;
pub mod idmap;
pub mod protocol;
pub mod server;
pub mod wire;

pub use client::Client;
pub use codec::{Argument, Fixed};
pub use config::EndpointConfig;
pub use error::{Error, ProtocolError};
pub use global::{GlobalEntry, GlobalEvent};
pub use idmap::{Handler, ObjectId, DISPLAY_ID};
pub use protocol::{Interface, MessageSig, CALLBACK_INTERFACE, DISPLAY_INTERFACE, REGISTRY_INTERFACE};
pub use server::{BindHook, ClientId, Server};

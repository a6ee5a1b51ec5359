// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::env;
use std::path::PathBuf;

use log::warn;

/// Endpoint-scoped configuration, resolved once at construction time instead of read from
/// process-wide mutable state on every send/receive.
///
/// The upstream implementation this core is modeled on keeps the `WAYLAND_DEBUG` trace flag as a
/// process-wide global checked on every message; here it is resolved once into this struct and
/// carried by the endpoint that owns it.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// When set, every sent/received message is traced via `log::trace!` with its decoded
    /// arguments.
    pub debug: bool,

    /// `$XDG_RUNTIME_DIR`, if present.
    pub runtime_dir: Option<PathBuf>,

    /// The socket name to connect to or listen on, defaulting to `$WAYLAND_DISPLAY` and then
    /// `wayland-0`.
    pub socket_name: String,
}

impl EndpointConfig {
    /// Resolve configuration from the environment, the way a freshly-constructed client or server
    /// endpoint would.
    pub fn from_env() -> Self {
        let debug = env::var_os("WAYLAND_DEBUG").is_some();
        let runtime_dir = env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
        let socket_name = env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| "wayland-0".to_string());

        Self {
            debug,
            runtime_dir,
            socket_name,
        }
    }

    /// The server falls back to the current directory when no runtime directory is configured,
    /// logging a warning rather than failing outright (the client has no such fallback).
    pub fn server_runtime_dir(&self) -> PathBuf {
        match &self.runtime_dir {
            Some(dir) => dir.clone(),
            None => {
                warn!("XDG_RUNTIME_DIR is not set; falling back to the current directory");
                PathBuf::from(".")
            }
        }
    }
}

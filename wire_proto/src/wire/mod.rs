// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

pub mod buffer;
pub mod connection;

pub use buffer::{Buffer, ByteRing, FdRing};
pub use connection::{ConnState, Connection, Interest, SendOutcome};

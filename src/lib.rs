//! Host/worker execution bridge for an embedded Lua console.
//!
//! A host process spawns `replink --worker`, which owns a Lua VM and serves
//! line-delimited JSON requests over two per-session channels: control
//! (host to worker) and output (worker to host). [`host::WorkerHandle`]
//! supervises the worker from the host side; [`session::Session`] is the
//! worker-side message loop over the [`engine`] and the [`debug`] bridge.

pub mod channel;
pub mod console;
pub mod debug;
pub mod diagnostics;
pub mod display;
pub mod engine;
pub mod events;
pub mod host;
pub mod protocol;
pub mod session;

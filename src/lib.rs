//! Tree synchronisation engine.
//!
//! [`sync`] mirrors files and directories into a destination root, copying
//! only what changed, on a bounded pool of worker threads. [`remote`] runs
//! the same pool against a cloud-style object store. [`api`] and [`web`]
//! expose sessions over HTTP and WebSocket.

pub mod api;
pub mod remote;
pub mod sync;
pub mod utils;
pub mod web;

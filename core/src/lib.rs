//! Core domain logic for the remote terminal multiplexing service: PTY lifecycle, transcript
//! recording, VT emulation, the session registry, the subscription hub, auth and the wire
//! framing shared with the HTTP/WebSocket surface. No HTTP, no process entry point.

pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod keymap;
pub mod pty;
pub mod recorder;
pub mod registry;
pub mod session;
pub mod terminal;
pub mod wsframe;

//! Pier: a browser-facing gateway that streams video from, and injects
//! input into, Android devices through a local ADB host.
//!
//! The crate is a library plus a thin binary so integration tests and the
//! server share one surface. `ws` carries the per-connection machinery,
//! `mux` the channel multiplexer, `adb` everything that talks to the ADB
//! server, `recording` the capture/replay engine, and `api` the HTTP
//! action surface.

pub mod adb;
pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod fsls;
pub mod mux;
pub mod recording;
pub mod state;
pub mod sync;
pub mod ws;

//! Wharf agent library.
//!
//! The in-container agent of a remote development platform: a single
//! WebSocket multiplexes filesystem, process, watch and auth operations;
//! port-scan, process and file-change events are pushed to subscribers;
//! and the same listener proxies requests onto sibling machines.

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fs_ops;
pub mod ids;
pub mod mux;
pub mod orchestrator;
pub mod ports;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod rest;
pub mod safe_path;
pub mod server;
pub mod watch;

pub use config::Config;
pub use server::{build_router, run, AgentState};

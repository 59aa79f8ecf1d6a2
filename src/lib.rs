#![forbid(unsafe_code)]

//! Debug adapter bridge: relays DAP traffic between WebSocket clients and
//! debuggee processes running inside a shared Docker sandbox.

pub mod bridge;
pub mod config;
pub mod dap;
pub mod errors;
pub mod port;
pub mod queue;
pub mod sandbox;
pub mod server;
pub mod shutdown;
pub mod workspace;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};

//! Client ↔ debuggee bridging.
//!
//! [`BridgeContext`] holds what every session shares: configuration, the
//! sandbox and the port allocator. Each client connection owns exactly one
//! [`session::SessionBridge`].

pub mod session;

use std::sync::Arc;

use crate::config::GlobalConfig;
use crate::port::PortAllocator;
use crate::sandbox::Sandbox;

pub use session::{BridgeState, InitPayload, SessionBridge};

/// Shared dependencies injected into every session.
pub struct BridgeContext {
    /// Validated global configuration.
    pub config: Arc<GlobalConfig>,
    /// The process-wide sandbox.
    pub sandbox: Arc<dyn Sandbox>,
    /// Debug port allocator.
    pub ports: Arc<PortAllocator>,
}

impl BridgeContext {
    /// Bundle the shared dependencies.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            config,
            sandbox,
            ports: Arc::new(PortAllocator::new()),
        }
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("config", &self.config)
            .field("sandbox_state", &self.sandbox.state())
            .field("ports", &self.ports)
            .finish()
    }
}

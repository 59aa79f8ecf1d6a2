//! Ephemeral debug port allocation.
//!
//! Ports come from the operating system: a listener is bound to port 0 on
//! the loopback interface, the assigned port is read back and the listener
//! is closed. Another process may claim the port between that close and the
//! debuggee's own bind; the bridge accepts that window for a single-tenant
//! sandbox.
//!
//! Within this process, handed-out ports stay reserved until released so
//! that two live sessions never share a port.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Mutex, PoisonError};

use tokio::net::TcpListener;
use tracing::debug;

use crate::{AppError, Result};

/// Bind attempts before allocation gives up on colliding reservations.
const MAX_ALLOCATION_ATTEMPTS: usize = 16;

/// Allocates OS-assigned loopback ports and tracks live reservations.
#[derive(Debug, Default)]
pub struct PortAllocator {
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator with no reservations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a port that was unbound at the time of the call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a transient listener cannot be bound, or if
    /// the OS keeps returning ports that are already reserved here.
    pub async fn allocate(&self) -> Result<u16> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = probe_free_port().await?;
            if self.reserve(port) {
                debug!(port, "allocated debug port");
                return Ok(port);
            }
            debug!(port, "OS reissued a reserved port, probing again");
        }
        Err(AppError::Io(
            "no unreserved ephemeral port after repeated attempts".into(),
        ))
    }

    /// Return `port` to the pool.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if reserved.remove(&port) {
            debug!(port, "released debug port");
        }
    }

    /// Whether `port` is currently handed out.
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        let reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        reserved.contains(&port)
    }

    /// Number of live reservations.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        let reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        reserved.len()
    }

    fn reserve(&self, port: u16) -> bool {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        reserved.insert(port)
    }
}

/// Bind `127.0.0.1:0`, read back the assigned port, close the listener.
async fn probe_free_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(|err| AppError::Io(format!("failed to bind probe listener: {err}")))?;
    let port = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("failed to read probe address: {err}")))?
        .port();
    drop(listener);
    Ok(port)
}

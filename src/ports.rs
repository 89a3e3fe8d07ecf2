//! Sequential port allocation for preview listeners.

use crate::error::{PreviewError, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use tokio::net::TcpListener;
use tracing::debug;

/// Hands out listeners on ports starting at a fixed base.
///
/// A probe only says the port looked free a moment ago. The bind that follows
/// is what actually claims it, and a failed bind just moves on to the next
/// candidate.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    attempts: u16,
    bind_ip: IpAddr,
    held: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16, attempts: u16, bind_ip: IpAddr) -> Self {
        Self {
            base,
            attempts,
            bind_ip,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Bind a listener on the first usable candidate port.
    pub async fn acquire(&self) -> Result<(u16, TcpListener)> {
        for offset in 0..self.attempts {
            let Some(port) = self.base.checked_add(offset) else {
                break;
            };
            if self.is_held(port) {
                debug!(port, "Skipping port held by another preview");
                continue;
            }
            if !self.probe(port).await {
                debug!(port, "Port probe failed");
                continue;
            }

            let listener = match TcpListener::bind(SocketAddr::new(self.bind_ip, port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    debug!(port, error = %e, "Bind lost race after successful probe");
                    continue;
                }
            };

            // Another create in this process may have bound the same port on a
            // different interface between our probe and bind.
            if !self.hold(port) {
                continue;
            }
            return Ok((port, listener));
        }

        Err(PreviewError::PortExhausted {
            base: self.base,
            attempts: self.attempts,
        })
    }

    /// Check whether a port looks free without keeping it.
    pub async fn probe(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(self.bind_ip, port))
            .await
            .is_ok()
    }

    /// Return a port to the pool once its listener is gone.
    pub fn release(&self, port: u16) {
        self.held_ports().remove(&port);
    }

    pub fn is_held(&self, port: u16) -> bool {
        self.held_ports().contains(&port)
    }

    fn hold(&self, port: u16) -> bool {
        self.held_ports().insert(port)
    }

    fn held_ports(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        // The set is only touched in short non-panicking sections.
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn acquire_returns_distinct_ports() {
        let allocator = PortAllocator::new(42100, 50, LOOPBACK);
        let (a, _la) = allocator.acquire().await.unwrap();
        let (b, _lb) = allocator.acquire().await.unwrap();
        assert_ne!(a, b);
        assert!(allocator.is_held(a));
        assert!(allocator.is_held(b));
    }

    #[tokio::test]
    async fn acquire_skips_port_bound_elsewhere() {
        let foreign = std::net::TcpListener::bind("127.0.0.1:42200").unwrap();
        let allocator = PortAllocator::new(42200, 10, LOOPBACK);
        let (port, _listener) = allocator.acquire().await.unwrap();
        assert_ne!(port, 42200);
        drop(foreign);
    }

    #[tokio::test]
    async fn acquire_fails_when_every_candidate_is_taken() {
        let _foreign = std::net::TcpListener::bind("127.0.0.1:42300").unwrap();
        let allocator = PortAllocator::new(42300, 1, LOOPBACK);
        let err = allocator.acquire().await.unwrap_err();
        assert!(matches!(
            err,
            PreviewError::PortExhausted {
                base: 42300,
                attempts: 1
            }
        ));
    }

    #[tokio::test]
    async fn released_port_can_be_reacquired() {
        let allocator = PortAllocator::new(42400, 1, LOOPBACK);
        let (port, listener) = allocator.acquire().await.unwrap();
        drop(listener);
        allocator.release(port);
        let (again, _listener) = allocator.acquire().await.unwrap();
        assert_eq!(port, again);
    }

    #[tokio::test]
    async fn held_port_is_skipped_even_if_free() {
        let allocator = PortAllocator::new(42500, 2, LOOPBACK);
        let (first, listener) = allocator.acquire().await.unwrap();
        drop(listener);
        let (second, _listener) = allocator.acquire().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn listener_binds_the_configured_address() {
        let allocator = PortAllocator::new(42600, 10, LOOPBACK);
        let (port, listener) = allocator.acquire().await.unwrap();
        let local = listener.local_addr().unwrap();
        assert_eq!(local.ip(), LOOPBACK);
        assert_eq!(local.port(), port);
    }
}

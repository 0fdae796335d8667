//! Leases of unique ephemeral local ports for concurrent engine instances.
//!
//! Every concurrent test cycle across the scanner, profiler and optimizer
//! draws its local port from one shared [`PortPool`], constructed once and
//! passed in explicitly so isolated test instances and concurrent scan
//! sessions never collide.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

struct PoolInner {
    cursor: u16,
    in_use: HashSet<u16>,
}

/// A bounded `[start, end]` port range with a rotating cursor.
///
/// [`PortPool::acquire`] hands out the first free port at or after the
/// cursor, wrapping at the end of the range. While the whole range is
/// leased, `acquire` spins (with a short async sleep) until a lease is
/// released; it never errors on exhaustion. Known limitation, covered by
/// `exhausted_pool_blocks_fourth_acquire` below.
pub struct PortPool {
    start: u16,
    end: u16,
    inner: Mutex<PoolInner>,
}

impl PortPool {
    /// A pool over the inclusive range `[start, end]`.
    ///
    /// # Panics
    /// Panics if `start > end`.
    #[must_use]
    pub fn new(start: u16, end: u16) -> Arc<Self> {
        assert!(start <= end, "port range start must not exceed end");
        Arc::new(Self {
            start,
            end,
            inner: Mutex::new(PoolInner {
                cursor: start,
                in_use: HashSet::new(),
            }),
        })
    }

    /// Number of ports in the range.
    #[must_use]
    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Number of currently unreleased leases.
    #[must_use]
    pub fn leased(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }

    /// Leases the next free port. Never returns a port held by a concurrent
    /// unreleased lease; spins while the entire range is in use.
    pub async fn acquire(self: &Arc<Self>) -> PortLease {
        loop {
            if let Some(port) = self.try_acquire() {
                trace!("leased port {port}");
                return PortLease {
                    pool: Arc::clone(self),
                    port,
                };
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// One full rotation over the range, skipping leased ports.
    fn try_acquire(&self) -> Option<u16> {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..self.capacity() {
            let port = inner.cursor;
            inner.cursor = if port >= self.end { self.start } else { port + 1 };
            if inner.in_use.insert(port) {
                return Some(port);
            }
        }
        None
    }

    fn release(&self, port: u16) {
        trace!("released port {port}");
        self.inner.lock().unwrap().in_use.remove(&port);
    }
}

/// Exclusive use of one port while held. Releasing happens on drop, so every
/// exit path of a test cycle, error paths included, returns the port.
pub struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
}

impl PortLease {
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leases_are_unique_while_held() {
        let pool = PortPool::new(40000, 40004);
        let leases = vec![
            pool.acquire().await,
            pool.acquire().await,
            pool.acquire().await,
            pool.acquire().await,
            pool.acquire().await,
        ];
        let mut ports: Vec<u16> = leases.iter().map(PortLease::port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 5);
        assert_eq!(pool.leased(), 5);
    }

    #[tokio::test]
    async fn released_port_is_acquirable_again() {
        let pool = PortPool::new(41000, 41000);
        let lease = pool.acquire().await;
        assert_eq!(lease.port(), 41000);
        drop(lease);
        assert_eq!(pool.leased(), 0);
        let lease = pool.acquire().await;
        assert_eq!(lease.port(), 41000);
    }

    #[tokio::test]
    async fn cursor_rotates_through_the_range() {
        let pool = PortPool::new(42000, 42002);
        let first = pool.acquire().await;
        let second = pool.acquire().await;
        assert_eq!(first.port(), 42000);
        assert_eq!(second.port(), 42001);
        drop(first);
        // cursor keeps advancing before wrapping back to the freed port
        let third = pool.acquire().await;
        assert_eq!(third.port(), 42002);
        let fourth = pool.acquire().await;
        assert_eq!(fourth.port(), 42000);
    }

    #[tokio::test]
    async fn exhausted_pool_blocks_fourth_acquire() {
        let pool = PortPool::new(43000, 43002);
        let a = pool.acquire().await;
        let _b = pool.acquire().await;
        let _c = pool.acquire().await;

        let spinner = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.acquire().await.port() }
        });
        // the 4th acquire spins instead of erroring
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!spinner.is_finished());

        drop(a);
        let port = tokio::time::timeout(Duration::from_secs(1), spinner)
            .await
            .expect("acquire should complete once a lease is released")
            .unwrap();
        assert_eq!(port, 43000);
    }

    #[tokio::test]
    async fn concurrent_acquire_release_never_duplicates() {
        let pool = PortPool::new(44000, 44007);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let lease = pool.acquire().await;
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    drop(lease);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.leased(), 0);
    }
}

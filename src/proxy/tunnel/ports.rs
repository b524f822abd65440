//! Loopback port partitioning for concurrent tunnel probes
//!
//! The pool has one slot per concurrent tunnel worker. A probe holds a slot
//! for its whole lifetime; the ports it may try are `base + slot`,
//! `base + slot + slots`, `base + slot + 2 * slots`, ..., so two live probes
//! can never pick the same port.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct PortPool {
    base: u16,
    slots: usize,
    free: Mutex<Vec<usize>>,
}

impl PortPool {
    pub fn new(base: u16, slots: usize) -> Arc<Self> {
        let slots = slots.max(1);
        Arc::new(Self {
            base,
            slots,
            // Reversed so slot 0 is handed out first.
            free: Mutex::new((0..slots).rev().collect()),
        })
    }

    /// Take a free slot, or `None` if every slot is in use
    pub fn lease(self: &Arc<Self>) -> Option<PortLease> {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        free.pop().map(|slot| PortLease {
            pool: Arc::clone(self),
            slot,
        })
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn release(&self, slot: usize) {
        let mut free = self.free.lock().unwrap_or_else(|p| p.into_inner());
        free.push(slot);
    }
}

/// Exclusive hold on one slot of a [`PortPool`], released on drop
#[derive(Debug)]
pub struct PortLease {
    pool: Arc<PortPool>,
    slot: usize,
}

impl PortLease {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Port to use on the given attempt, `None` once past the port range
    pub fn port(&self, attempt: usize) -> Option<u16> {
        let offset = attempt.checked_mul(self.pool.slots)?.checked_add(self.slot)?;
        let port = usize::from(self.pool.base).checked_add(offset)?;
        u16::try_from(port).ok()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

/// Whether nothing is currently bound to `port` on loopback
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_leases_are_distinct_and_bounded() {
        let pool = PortPool::new(30000, 3);
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        let c = pool.lease().unwrap();
        assert!(pool.lease().is_none());
        assert_eq!(pool.available(), 0);

        let ports: HashSet<u16> = [&a, &b, &c].iter().map(|l| l.port(0).unwrap()).collect();
        assert_eq!(ports.len(), 3);

        drop(b);
        assert_eq!(pool.available(), 1);
        assert!(pool.lease().is_some());
    }

    #[test]
    fn test_retry_ports_stay_in_partition() {
        let pool = PortPool::new(30000, 4);
        let leases: Vec<_> = (0..4).map(|_| pool.lease().unwrap()).collect();

        let mut seen = HashSet::new();
        for lease in &leases {
            for attempt in 0..5 {
                let port = lease.port(attempt).unwrap();
                assert_eq!(usize::from(port - 30000) % 4, lease.slot());
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
    }

    #[test]
    fn test_port_overflow() {
        let pool = PortPool::new(65534, 2);
        let first = pool.lease().unwrap();
        assert_eq!(first.port(0), Some(65534));
        assert_eq!(first.port(1), None);
    }

    #[test]
    fn test_port_is_free() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
        assert!(port_is_free(port));
    }
}

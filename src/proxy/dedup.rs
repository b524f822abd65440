//! Run-scoped identity set used to drop duplicate servers

use crate::proxy::models::ServerIdentity;
use std::collections::HashSet;
use std::sync::Mutex;

/// Set of server identities accepted so far in this run
///
/// Shared by reference across all transport workers; `try_accept` is a
/// single check-and-insert under the lock.
#[derive(Debug, Default)]
pub struct IdentitySet {
    seen: Mutex<HashSet<ServerIdentity>>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `identity` is offered, `false` after
    pub fn try_accept(&self, identity: &ServerIdentity) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            // A panicking worker cannot leave the set half-updated.
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(identity.clone())
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map_or_else(|p| p.into_inner().len(), |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_accepts_once() {
        let set = IdentitySet::new();
        let id = ServerIdentity::new("10.0.0.1", 443);
        assert!(set.try_accept(&id));
        assert!(!set.try_accept(&id));
        assert!(!set.try_accept(&ServerIdentity::new("10.0.0.1", 443)));
        assert!(set.try_accept(&ServerIdentity::new("10.0.0.1", 8443)));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_concurrent_exactly_once() {
        let set = Arc::new(IdentitySet::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let distinct = 25;

        let handles: Vec<_> = (0..16)
            .map(|worker| {
                let set = Arc::clone(&set);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    for i in 0..distinct * 4 {
                        // Each worker walks the identities in a different order.
                        let n = (i * 7 + worker * 3) % distinct;
                        let id = ServerIdentity::new(&format!("10.0.0.{}", n), 443);
                        if set.try_accept(&id) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), distinct);
        assert_eq!(set.len(), distinct);
    }
}

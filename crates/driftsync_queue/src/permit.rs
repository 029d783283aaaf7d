//! Counting permits bounding per-tier concurrency.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug)]
struct PoolState {
    cap: usize,
    in_use: usize,
}

/// A counting permit pool for one tier.
///
/// Lowering the cap below the number of outstanding permits never
/// revokes them; new permits are refused until enough are released.
#[derive(Debug, Clone)]
pub struct PermitPool {
    state: Arc<Mutex<PoolState>>,
    released: Arc<Notify>,
}

impl PermitPool {
    /// Creates a pool with `cap` permits. Releases wake `released`.
    pub fn new(cap: usize, released: Arc<Notify>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState { cap, in_use: 0 })),
            released,
        }
    }

    /// Takes a permit if one is free.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.state.lock();
        if state.in_use >= state.cap {
            return None;
        }
        state.in_use += 1;
        Some(Permit { pool: self.clone() })
    }

    /// Free permits.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.cap.saturating_sub(state.in_use)
    }

    /// Outstanding permits.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Current cap.
    pub fn cap(&self) -> usize {
        self.state.lock().cap
    }

    /// Changes the cap.
    pub fn set_cap(&self, cap: usize) {
        let widened = {
            let mut state = self.state.lock();
            let widened = cap > state.cap;
            state.cap = cap;
            widened
        };
        if widened {
            self.released.notify_one();
        }
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
        }
        self.released.notify_one();
    }
}

/// A held permit. Dropping it returns the permit to its pool.
#[derive(Debug)]
pub struct Permit {
    pool: PermitPool,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_by_cap() {
        let pool = PermitPool::new(2, Arc::new(Notify::new()));
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.in_use(), 1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn narrowing_does_not_revoke() {
        let pool = PermitPool::new(3, Arc::new(Notify::new()));
        let held: Vec<Permit> = (0..3).filter_map(|_| pool.try_acquire()).collect();
        pool.set_cap(1);
        assert_eq!(pool.in_use(), 3);
        assert_eq!(pool.available(), 0);

        drop(held);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.cap(), 1);
    }

    #[tokio::test]
    async fn release_notifies() {
        let notify = Arc::new(Notify::new());
        let pool = PermitPool::new(1, Arc::clone(&notify));
        let permit = pool.try_acquire().unwrap();
        let waiter = {
            let notify = Arc::clone(&notify);
            tokio::spawn(async move { notify.notified().await })
        };
        drop(permit);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

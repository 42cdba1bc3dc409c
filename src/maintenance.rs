//! Background workers: the automover and the rebalancer.
//!
//! Exactly two pool-owned threads exist. The automover wakes on a timer
//! and files rebalance requests; the rebalancer parks on a condvar and
//! executes them one page at a time.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::pool::SlabPool;

/// Handle to the two maintenance workers.
///
/// Dropping the handle stops and joins the workers; [`stop`](Self::stop)
/// does the same explicitly. An in-flight rebalance completes its current
/// page before the worker exits, and no new jobs are accepted once a stop
/// has been requested.
pub struct MaintenanceHandle {
    pool: Arc<SlabPool>,
    automover: Option<JoinHandle<()>>,
    rebalancer: Option<JoinHandle<()>>,
}

impl SlabPool {
    /// Spawn the automover and rebalancer workers.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        self.stop_automover.store(false, Ordering::Release);
        self.stop_rebalancer.store(false, Ordering::Release);

        let pool = Arc::clone(self);
        let automover = thread::Builder::new()
            .name("slab-automove".into())
            .spawn(move || pool.automover_loop())
            .expect("failed to spawn automover thread");

        let pool = Arc::clone(self);
        let rebalancer = thread::Builder::new()
            .name("slab-rebalance".into())
            .spawn(move || pool.rebalancer_loop())
            .expect("failed to spawn rebalancer thread");

        debug!("slab maintenance workers started");
        MaintenanceHandle {
            pool: Arc::clone(self),
            automover: Some(automover),
            rebalancer: Some(rebalancer),
        }
    }
}

impl MaintenanceHandle {
    /// Stop and join both workers.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.pool.stop_automover.store(true, Ordering::Release);
        self.pool.stop_rebalancer.store(true, Ordering::Release);

        // Hold each worker's mutex while signalling, so a worker between
        // its stop check and its wait cannot miss the wakeup. Taking the
        // rebalance mutex also waits out an in-flight page.
        {
            let _guard = self.pool.maintenance_lock.lock();
            self.pool.maintenance_cond.notify_all();
        }
        {
            let _guard = self.pool.rebalance.lock();
            self.pool.rebalance_cond.notify_all();
        }

        if let Some(handle) = self.automover.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.rebalancer.take() {
            let _ = handle.join();
        }
        debug!("slab maintenance workers stopped");
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlabConfig;
    use crate::hooks::ItemStore;
    use crate::item::ItemHeader;
    use std::ptr::NonNull;

    struct NullStore;

    impl ItemStore for NullStore {
        unsafe fn unlink_item(&self, _item: NonNull<ItemHeader>, _key_hash: u64) {}
        fn evictions_snapshot(&self, _out: &mut [u64]) {}
    }

    #[test]
    fn test_start_stop() {
        let config = SlabConfig::new().limit_bytes(0).page_bytes(64 * 1024);
        let pool = Arc::new(SlabPool::new(config, Arc::new(NullStore)));

        let handle = pool.start_maintenance();
        handle.stop();
    }

    #[test]
    fn test_stop_via_drop() {
        let config = SlabConfig::new().limit_bytes(0).page_bytes(64 * 1024);
        let pool = Arc::new(SlabPool::new(config, Arc::new(NullStore)));

        {
            let _handle = pool.start_maintenance();
        }
        // Workers are joined; the pool is the only reference left.
        assert_eq!(Arc::strong_count(&pool), 1);
    }

    #[test]
    fn test_no_jobs_after_stop() {
        let config = SlabConfig::new().limit_bytes(0).page_bytes(64 * 1024);
        let pool = Arc::new(SlabPool::new(config, Arc::new(NullStore)));

        let handle = pool.start_maintenance();
        handle.stop();

        assert_eq!(
            pool.reassign(2, 3, 1),
            Err(crate::ReassignError::Running)
        );
    }
}

//! One-page-at-a-time migration of slab pages between classes.
//!
//! A rebalance moves a single page from a source class to a destination
//! class, or back to the arena when the destination is 0 (shrink). The
//! page cannot move while worker threads still hold references to its
//! chunks, so the mover walks the page chunk by chunk, reclaiming idle
//! chunks and unlinking live items through the item-subsystem hook, and
//! retries busy chunks until the page drains.
//!
//! Lock order is cache lock, then allocator lock, in `start`, `move`,
//! and `finish` alike. The inversion deadlocks.

use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::SMALLEST;
use crate::error::ReassignError;
use crate::hooks::key_hash;
use crate::item::{DEAD_CLASS_ID, ItemHeader};
use crate::pool::SlabPool;

/// No rebalance in flight; the worker parks on the condvar.
pub(crate) const REBALANCE_IDLE: u8 = 0;
/// A job descriptor is filled in and waiting for the worker.
pub(crate) const REBALANCE_REQUESTED: u8 = 1;
/// The worker is draining the killed page.
pub(crate) const REBALANCE_RUNNING: u8 = 2;

/// Backoff between move passes that found busy items, giving the item
/// subsystem time to drop its references.
const BUSY_BACKOFF: Duration = Duration::from_micros(50);

/// Descriptor of the rebalance in flight.
pub(crate) struct RebalanceJob {
    pub(crate) src: usize,
    /// Destination class, 0 for shrink.
    pub(crate) dst: usize,
    /// Pages still to migrate after the current one.
    pub(crate) remaining: usize,
    pub(crate) page_start: *mut u8,
    pub(crate) page_end: *mut u8,
    pub(crate) cursor: *mut u8,
    /// Busy chunks seen on the current pass over the page.
    pub(crate) busy_items: usize,
    pub(crate) done: bool,
}

// The page pointers are only dereferenced by the rebalance worker under
// the cache and allocator locks.
unsafe impl Send for RebalanceJob {}

impl RebalanceJob {
    pub(crate) fn empty() -> Self {
        Self {
            src: 0,
            dst: 0,
            remaining: 0,
            page_start: ptr::null_mut(),
            page_end: ptr::null_mut(),
            cursor: ptr::null_mut(),
            busy_items: 0,
            done: false,
        }
    }

    fn clear_page(&mut self) {
        self.page_start = ptr::null_mut();
        self.page_end = ptr::null_mut();
        self.cursor = ptr::null_mut();
    }
}

enum MoveStatus {
    Pass,
    Done,
    Busy,
}

impl SlabPool {
    /// Request a page migration.
    ///
    /// `src == -1` picks any class with at least two pages other than
    /// `dst`. `dst == 0` shrinks: the page goes back to the arena instead
    /// of another class. The work itself happens on the rebalance worker;
    /// this only files the request.
    pub fn reassign(&self, src: isize, dst: usize, num_slabs: usize) -> Result<(), ReassignError> {
        let Some(mut job) = self.rebalance.try_lock() else {
            return Err(ReassignError::Running);
        };
        self.do_reassign(&mut job, src, dst, num_slabs)
    }

    fn do_reassign(
        &self,
        job: &mut RebalanceJob,
        src: isize,
        dst: usize,
        num_slabs: usize,
    ) -> Result<(), ReassignError> {
        if !self.reassign_enabled {
            // Pages are not uniformly sized, so none of them can move.
            return Err(ReassignError::BadClass);
        }
        if self.stop_rebalancer.load(Ordering::Acquire)
            || self.rebalance_signal.load(Ordering::Acquire) != REBALANCE_IDLE
        {
            return Err(ReassignError::Running);
        }
        if src == dst as isize {
            return Err(ReassignError::SrcDstSame);
        }

        let src = if src == -1 {
            self.pick_any(dst).ok_or(ReassignError::NoSpare)?
        } else if src < 0 {
            return Err(ReassignError::BadClass);
        } else {
            src as usize
        };

        if !(SMALLEST..=self.largest).contains(&src)
            || (dst != 0 && !(SMALLEST..=self.largest).contains(&dst))
        {
            return Err(ReassignError::BadClass);
        }
        if num_slabs < 1 {
            return Err(ReassignError::KillFew);
        }
        {
            let st = self.state.lock();
            if st.classes[src].pages.len() < 1 + num_slabs {
                return Err(ReassignError::NoSpare);
            }
        }

        job.src = src;
        job.dst = dst;
        job.remaining = num_slabs;
        job.busy_items = 0;
        job.done = false;
        job.clear_page();

        self.rebalance_signal
            .store(REBALANCE_REQUESTED, Ordering::Release);
        self.rebalance_cond.notify_one();
        debug!(src, dst, num_slabs, "rebalance requested");
        Ok(())
    }

    /// Rotate through the classes and pick one with a spare page.
    ///
    /// Cheaper than a random pick: one sweep over the table per call.
    fn pick_any(&self, dst: usize) -> Option<usize> {
        let st = self.state.lock();
        let mut cur = self.pick_cursor.load(Ordering::Relaxed);
        for _ in SMALLEST..=self.largest {
            cur += 1;
            if cur > self.largest {
                cur = SMALLEST;
            }
            if cur == dst {
                continue;
            }
            if st.classes[cur].pages.len() > 1 {
                self.pick_cursor.store(cur, Ordering::Relaxed);
                return Some(cur);
            }
        }
        self.pick_cursor.store(cur, Ordering::Relaxed);
        None
    }

    /// Validate the job and stake out the page to drain.
    pub(crate) fn rebalance_start(&self, job: &mut RebalanceJob) -> Result<(), ()> {
        let _cache = self.lock_cache();
        let mut st = self.state.lock();

        let shrink = job.dst == 0;
        if !(SMALLEST..=self.largest).contains(&job.src)
            || (!shrink && !(SMALLEST..=self.largest).contains(&job.dst))
            || job.src == job.dst
        {
            return Err(());
        }

        // Grow the destination list now so finish cannot fail later.
        if !shrink && !self.grow_page_list(&mut st, job.dst, true) {
            return Err(());
        }

        // Never drain a class to zero pages.
        if st.classes[job.src].pages.len() < 2 {
            return Err(());
        }

        let s_cls = &mut st.classes[job.src];
        s_cls.killing = 1;
        job.remaining -= 1;

        job.page_start = s_cls.pages[s_cls.killing - 1];
        // SAFETY: the page spans size * perslab bytes
        job.page_end = unsafe { job.page_start.add(s_cls.size * s_cls.perslab) };
        job.cursor = job.page_start;
        job.busy_items = 0;
        job.done = false;

        self.rebalance_signal
            .store(REBALANCE_RUNNING, Ordering::Release);
        self.reassign_running.store(true, Ordering::Relaxed);
        debug!(src = job.src, dst = job.dst, shrink, "rebalance started");
        Ok(())
    }

    /// Advance the cursor over up to `bulk_check` chunks.
    ///
    /// Returns whether any chunk was busy. A chunk with refcount 0 and
    /// `SLABBED` set is free and comes straight off the freelist; a
    /// linked item with no other references is unlinked through the hook;
    /// everything else is busy and retried on the next pass.
    pub(crate) fn rebalance_move(&self, job: &mut RebalanceJob) -> bool {
        let _cache = self.lock_cache();
        let mut st = self.state.lock();

        let chunk_size = st.classes[job.src].size;
        let mut was_busy = false;

        for _ in 0..self.bulk_check {
            // SAFETY: cursor walks chunk starts within the killed page
            let it = unsafe { ItemHeader::from_ptr(job.cursor) };
            let mut status = MoveStatus::Pass;

            if it.class_id() != DEAD_CLASS_ID {
                let refcount = it.refcount_incr();
                if refcount == 1 {
                    if it.is_slabbed() {
                        st.classes[job.src].unlink_free(it);
                        status = MoveStatus::Done;
                    } else {
                        // Mid-write: allocated but not yet linked.
                        status = MoveStatus::Busy;
                    }
                } else if refcount == 2 {
                    if it.is_linked() {
                        // SAFETY: keys of linked items follow the header
                        let hash = key_hash(unsafe { it.key() });
                        // SAFETY: the item stays valid for the call; the
                        // cache lock is held
                        unsafe {
                            self.hooks
                                .unlink_item(NonNull::new_unchecked(it.as_ptr()), hash);
                        }
                        status = MoveStatus::Done;
                    } else {
                        // Just unlinked but not freed yet. Let the
                        // reference bleed off and try again later.
                        status = MoveStatus::Busy;
                    }
                } else {
                    trace!(
                        refcount,
                        src = job.src,
                        dst = job.dst,
                        "rebalance hit a busy item"
                    );
                    status = MoveStatus::Busy;
                }
            }

            match status {
                MoveStatus::Done => {
                    // A stale pointer into this chunk now reads a dead
                    // sentinel and must abort its operation.
                    it.set_refcount(0);
                    it.set_flags(0);
                    it.set_class_id(DEAD_CLASS_ID);
                }
                MoveStatus::Busy => {
                    job.busy_items += 1;
                    was_busy = true;
                    it.refcount_decr();
                }
                MoveStatus::Pass => {}
            }

            // SAFETY: cursor stays within page_start..=page_end
            job.cursor = unsafe { job.cursor.add(chunk_size) };
            if job.cursor >= job.page_end {
                break;
            }
        }

        if job.cursor >= job.page_end {
            if job.busy_items > 0 {
                // Some chunks were busy; sweep the page again.
                job.cursor = job.page_start;
                job.busy_items = 0;
            } else {
                job.done = true;
            }
        }

        was_busy
    }

    /// Detach the drained page and re-home or release it.
    pub(crate) fn rebalance_finish(&self, job: &mut RebalanceJob) {
        let _cache = self.lock_cache();
        let mut st = self.state.lock();

        let shrink = job.dst == 0;

        {
            let s_cls = &mut st.classes[job.src];
            let killed = s_cls.killing - 1;
            s_cls.pages.swap_remove(killed);
            s_cls.killing = 0;
        }

        if shrink {
            // SAFETY: the drained page is exclusively ours
            unsafe { ItemHeader::from_ptr(job.page_start).set_class_id(0) };
            if !st.arena.is_preallocated() {
                // SAFETY: the page came from arena.reserve(page_bytes)
                unsafe {
                    st.arena
                        .release(NonNull::new_unchecked(job.page_start), self.page_bytes);
                }
                self.mem_malloced
                    .fetch_sub(self.page_bytes, Ordering::Relaxed);
            }
        } else {
            self.grow_page_list(&mut st, job.dst, false);
            // SAFETY: the drained page is exclusively ours and uniform
            unsafe {
                ptr::write_bytes(job.page_start, 0, self.page_bytes);
                let d_cls = &mut st.classes[job.dst];
                d_cls.pages.push(job.page_start);
                d_cls.split_page(job.page_start);
            }
        }

        if job.remaining > 0 {
            // Not done yet: re-enter the request path with the same job.
            self.rebalance_signal
                .store(REBALANCE_REQUESTED, Ordering::Release);
        } else {
            self.rebalance_signal
                .store(REBALANCE_IDLE, Ordering::Release);
            job.src = 0;
            job.dst = 0;
        }
        job.done = false;
        job.busy_items = 0;
        job.clear_page();

        self.reassign_running.store(false, Ordering::Relaxed);
        if shrink {
            self.slabs_shrunk.fetch_add(1, Ordering::Relaxed);
        } else {
            self.slabs_moved.fetch_add(1, Ordering::Relaxed);
        }
        debug!(shrink, "rebalance finished");
    }

    /// Body of the rebalance worker.
    ///
    /// Holds the rebalance lock for its whole life, releasing it only
    /// inside the condvar wait; `reassign()` admission is a try-lock, so
    /// a second request while running reports `Running` without blocking.
    pub(crate) fn rebalancer_loop(&self) {
        let mut job = self.rebalance.lock();
        loop {
            let mut was_busy = false;

            match self.rebalance_signal.load(Ordering::Acquire) {
                REBALANCE_REQUESTED => {
                    if self.rebalance_start(&mut job).is_err() {
                        job.remaining = 0;
                        job.clear_page();
                        self.rebalance_signal
                            .store(REBALANCE_IDLE, Ordering::Release);
                    }
                }
                REBALANCE_RUNNING if !job.page_start.is_null() => {
                    was_busy = self.rebalance_move(&mut job);
                }
                _ => {}
            }

            if job.done {
                self.rebalance_finish(&mut job);
            } else if was_busy {
                // Stuck behind held references; slow down so the item
                // subsystem can release them.
                std::thread::sleep(BUSY_BACKOFF);
            }

            if self.rebalance_signal.load(Ordering::Acquire) == REBALANCE_IDLE {
                if self.stop_rebalancer.load(Ordering::Acquire) {
                    break;
                }
                self.rebalance_cond.wait(&mut job);
            }
        }
    }
}

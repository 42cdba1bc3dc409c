//! Automatic page-move policy.
//!
//! The automover watches per-class eviction deltas. A class that keeps
//! evicting is starved for pages; a class with pages but no evictions is
//! over-provisioned. Every tick the policy picks a candidate source and
//! destination and files a rebalance request. It also reacts to a
//! lowered memory limit by filing shrink requests until the pool fits.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace};

use crate::config::SMALLEST;
use crate::pool::{SlabPool, ceil_div};

/// Decision period when the automover is aggressive.
const DECISION_SECONDS_SHORT: u32 = 1;

/// Decision period when the automover is gentle.
const DECISION_SECONDS_LONG: u32 = 10;

/// Coarse seconds since the epoch.
#[inline]
fn now_secs() -> u32 {
    clocksource::coarse::UnixInstant::now()
        .duration_since(clocksource::coarse::UnixInstant::EPOCH)
        .as_secs() as u32
}

/// Rolling policy state carried between ticks.
pub(crate) struct AutomoveState {
    /// Eviction counters at the previous tick.
    evicted_prev: Vec<u64>,
    /// Consecutive ticks a class had zero evictions.
    zero_streak: Vec<u32>,
    /// Current destination candidate.
    winner: usize,
    /// Consecutive ticks the candidate led the eviction deltas.
    winner_streak: u32,
    /// Earliest coarse time of the next decision.
    next_run: u32,
}

impl AutomoveState {
    pub(crate) fn new(largest: usize) -> Self {
        Self {
            evicted_prev: vec![0; largest + 1],
            zero_streak: vec![0; largest + 1],
            winner: 0,
            winner_streak: 0,
            next_run: 0,
        }
    }
}

/// Outcome of one policy tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AutomoveDecision {
    /// Nothing to do this tick.
    None,
    /// A source was found but no destination; only useful for shrinking.
    Source { src: usize, num_slabs: usize },
    /// A source and a destination were found.
    Pair {
        src: usize,
        dst: usize,
        num_slabs: usize,
    },
}

impl SlabPool {
    /// Run one policy tick.
    ///
    /// The candidate scan covers `SMALLEST..largest`; the largest class
    /// holds single-chunk pages and is never rebalanced automatically.
    pub(crate) fn automove_decision(
        &self,
        am: &mut AutomoveState,
        shrink_now: bool,
    ) -> AutomoveDecision {
        let now = now_secs();
        if now < am.next_run {
            return AutomoveDecision::None;
        }
        am.next_run = now
            + if self.automove > 1 {
                DECISION_SECONDS_SHORT
            } else {
                DECISION_SECONDS_LONG
            };

        let largest = self.largest;
        let mut evicted_new = vec![0u64; largest + 1];
        self.hooks.evictions_snapshot(&mut evicted_new);

        let mut pages = vec![0usize; largest + 1];
        {
            let st = self.state.lock();
            for (i, slot) in pages.iter_mut().enumerate().take(largest).skip(SMALLEST) {
                *slot = st.classes[i].pages.len();
            }
        }

        let mut source = 0usize;
        let mut emergency_source = 0usize;
        let mut dest = 0usize;
        let mut highest = 0usize;
        let mut evicted_max = 0u64;
        let mut evicted_min = u64::MAX;

        for i in SMALLEST..largest {
            let diff = evicted_new[i].saturating_sub(am.evicted_prev[i]);

            // A source went three ticks without evicting anything while
            // holding spare pages. The first such class wins.
            if diff == 0 && pages[i] > 2 {
                am.zero_streak[i] += 1;
                if source == 0 && am.zero_streak[i] >= 3 {
                    source = i;
                }
            } else {
                am.zero_streak[i] = 0;
                if diff > evicted_max {
                    evicted_max = diff;
                    highest = i;
                }
            }

            if pages[i] > 0 {
                trace!(class = i, diff, pages = pages[i], "automove tick");
            }

            // Aggressive mode keeps a fallback source: the class with the
            // fewest recent evictions that still has a page to spare,
            // ties broken by the larger page count.
            if self.automove > 1
                && pages[i] >= 2
                && (diff < evicted_min
                    || (diff == evicted_min
                        && emergency_source != 0
                        && pages[i] > pages[emergency_source]))
            {
                evicted_min = diff;
                if shrink_now {
                    debug!(from = emergency_source, to = i, "emergency source changed");
                }
                emergency_source = i;
            }

            am.evicted_prev[i] = evicted_new[i];
        }

        // A destination must lead the eviction deltas three ticks in a
        // row before pages start flowing to it.
        if am.winner != 0 && am.winner == highest {
            am.winner_streak += 1;
            if !shrink_now && am.winner_streak >= 3 {
                dest = am.winner;
            }
        } else {
            am.winner_streak = 1;
            am.winner = highest;
        }

        if self.automove > 1 && source == 0 {
            source = emergency_source;
        }

        if source == 0 {
            return AutomoveDecision::None;
        }

        let limit = self.limit.load(Ordering::Relaxed);
        let total = self.total_malloced();
        let num_slabs = if limit == 0 || total <= limit {
            // Not shrinking, just moving one page.
            1
        } else {
            let gap = (total - limit) as u64;
            let slabs_gap = ceil_div(gap, self.page_bytes as u64);
            if slabs_gap <= 1 {
                slabs_gap as usize
            } else {
                // Spread the shrinkage across the classes that can give
                // up pages: take at least an even share from the leading
                // candidate, rounded up, and re-evaluate the candidates
                // next tick.
                let active = (SMALLEST..largest).filter(|&i| pages[i] > 1).count();
                let mut num = ceil_div(slabs_gap, active as u64) as usize;
                if active * num < slabs_gap as usize {
                    num += 1;
                }
                // Never drain the source below one page.
                if pages[source] - 1 < num {
                    num = pages[source] - 1;
                }
                num
            }
        };

        if dest != 0 {
            AutomoveDecision::Pair {
                src: source,
                dst: dest,
                num_slabs,
            }
        } else {
            AutomoveDecision::Source {
                src: source,
                num_slabs,
            }
        }
    }

    /// Body of the automover worker.
    pub(crate) fn automover_loop(&self) {
        let mut am = AutomoveState::new(self.largest);
        let mut guard = self.maintenance_lock.lock();
        loop {
            if self.stop_automover.load(Ordering::Acquire) {
                break;
            }

            let limit = self.limit.load(Ordering::Relaxed);
            let shrink_now = limit > 0 && self.total_malloced() > limit;

            let interval = if self.reassign_enabled && (self.automove > 0 || shrink_now) {
                // Return codes are ignored: a rejected request is retried
                // on a later tick.
                match self.automove_decision(&mut am, shrink_now) {
                    AutomoveDecision::None => {}
                    AutomoveDecision::Source { src, num_slabs }
                    | AutomoveDecision::Pair { src, num_slabs, .. }
                        if shrink_now =>
                    {
                        // Shrinkage takes precedence over moving.
                        let _ = self.reassign(src as isize, 0, num_slabs);
                    }
                    AutomoveDecision::Pair { src, dst, num_slabs } => {
                        let _ = self.reassign(src as isize, dst, num_slabs);
                    }
                    AutomoveDecision::Source { .. } => {}
                }
                Duration::from_secs(DECISION_SECONDS_SHORT as u64)
            } else {
                // Wake rarely while disabled and under the limit.
                Duration::from_secs(5)
            };

            let _ = self
                .maintenance_cond
                .wait_for(&mut guard, interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlabConfig;
    use crate::hooks::ItemStore;
    use crate::item::ItemHeader;
    use crate::stats::StatSink;
    use parking_lot::Mutex;
    use std::ptr::NonNull;
    use std::sync::Arc;

    const PAGE: usize = 64 * 1024;

    #[derive(Default)]
    struct EvictStore {
        evictions: Mutex<Vec<u64>>,
    }

    impl EvictStore {
        fn bump(&self, class: usize, by: u64) {
            let mut ev = self.evictions.lock();
            if ev.len() <= class {
                ev.resize(class + 1, 0);
            }
            ev[class] += by;
        }
    }

    impl ItemStore for EvictStore {
        unsafe fn unlink_item(&self, _item: NonNull<ItemHeader>, _key_hash: u64) {}

        fn evictions_snapshot(&self, out: &mut [u64]) {
            let ev = self.evictions.lock();
            for (i, v) in ev.iter().enumerate().take(out.len()) {
                out[i] = *v;
            }
        }

        fn command_counters(&self, _class: usize, _sink: &mut dyn StatSink) {}
    }

    fn pool_with(automove: u8, store: Arc<EvictStore>) -> SlabPool {
        let config = SlabConfig::new()
            .limit_bytes(0)
            .page_bytes(PAGE)
            .slab_automove(automove);
        SlabPool::new(config, store)
    }

    /// Give `id` `pages` pages of entirely free chunks.
    fn grow_class(pool: &SlabPool, id: usize, pages: usize) {
        let size = pool.chunk_size(id).unwrap();
        let perslab = pool.class_stats(id).unwrap().chunks_per_page;
        let mut held = Vec::new();
        for _ in 0..(perslab * pages) {
            held.push(pool.alloc(size, id).unwrap());
        }
        for it in held {
            unsafe { pool.free(it, size, id) };
        }
    }

    fn tick(pool: &SlabPool, am: &mut AutomoveState, shrink_now: bool) -> AutomoveDecision {
        am.next_run = 0;
        pool.automove_decision(am, shrink_now)
    }

    #[test]
    fn test_pair_after_three_wins_and_three_zero_ticks() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(1, store.clone());
        grow_class(&pool, 2, 4);

        let mut am = AutomoveState::new(pool.largest());

        // Two warm-up ticks: class 2 is quiet, class 3 keeps evicting.
        for _ in 0..2 {
            store.bump(3, 5);
            assert_eq!(tick(&pool, &mut am, false), AutomoveDecision::None);
        }

        // Third tick: both streaks reach three.
        store.bump(3, 5);
        assert_eq!(
            tick(&pool, &mut am, false),
            AutomoveDecision::Pair {
                src: 2,
                dst: 3,
                num_slabs: 1
            }
        );
    }

    #[test]
    fn test_winner_streak_resets() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(1, store.clone());
        grow_class(&pool, 2, 4);

        let mut am = AutomoveState::new(pool.largest());

        store.bump(3, 5);
        assert_eq!(tick(&pool, &mut am, false), AutomoveDecision::None);
        store.bump(3, 5);
        assert_eq!(tick(&pool, &mut am, false), AutomoveDecision::None);

        // A different class takes the lead; its streak starts over, so
        // the next two ticks produce a source with no destination.
        store.bump(4, 50);
        assert_eq!(
            tick(&pool, &mut am, false),
            AutomoveDecision::Source {
                src: 2,
                num_slabs: 1
            }
        );
        store.bump(4, 50);
        assert_eq!(
            tick(&pool, &mut am, false),
            AutomoveDecision::Source {
                src: 2,
                num_slabs: 1
            }
        );
        store.bump(4, 50);
        assert_eq!(
            tick(&pool, &mut am, false),
            AutomoveDecision::Pair {
                src: 2,
                dst: 4,
                num_slabs: 1
            }
        );
    }

    #[test]
    fn test_emergency_source_in_aggressive_mode() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(2, store.clone());
        // Two pages: below the ordinary-source threshold, enough for the
        // emergency source.
        grow_class(&pool, 2, 2);

        let mut am = AutomoveState::new(pool.largest());
        assert_eq!(
            tick(&pool, &mut am, false),
            AutomoveDecision::Source {
                src: 2,
                num_slabs: 1
            }
        );
    }

    #[test]
    fn test_gentle_mode_has_no_emergency_source() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(1, store.clone());
        grow_class(&pool, 2, 2);

        let mut am = AutomoveState::new(pool.largest());
        // Never a source: two pages is not > 2 and gentle mode has no
        // fallback.
        for _ in 0..5 {
            assert_eq!(tick(&pool, &mut am, false), AutomoveDecision::None);
        }
    }

    #[test]
    fn test_shrink_num_slabs_spread() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(2, store.clone());
        grow_class(&pool, 2, 6);

        // Drop the limit to three pages; the gap is about three pages
        // plus the page-list array.
        pool.shrink_expand(3 * PAGE).unwrap();
        assert!(pool.total_malloced() > pool.limit());

        let mut am = AutomoveState::new(pool.largest());
        match tick(&pool, &mut am, true) {
            AutomoveDecision::Source { src, num_slabs } => {
                assert_eq!(src, 2);
                // Only one active class, so it owes the whole gap, capped
                // at leaving one page behind.
                assert!(num_slabs >= 3 && num_slabs <= 5, "num_slabs = {num_slabs}");
            }
            other => panic!("expected a shrink source, got {other:?}"),
        }
    }

    #[test]
    fn test_shrink_mode_suppresses_destination() {
        let store = Arc::new(EvictStore::default());
        let pool = pool_with(2, store.clone());
        grow_class(&pool, 2, 6);
        pool.shrink_expand(3 * PAGE).unwrap();

        let mut am = AutomoveState::new(pool.largest());
        // Give class 3 a winning streak; shrink mode must still not name
        // a destination.
        for _ in 0..4 {
            store.bump(3, 7);
            match tick(&pool, &mut am, true) {
                AutomoveDecision::Pair { .. } => panic!("destination chosen during shrink"),
                _ => {}
            }
        }
    }
}

//! Deferred release of entities freed while a query is in flight.

use std::{collections::HashSet, hash::Hash};

use atlas_core::FreeOutcome;

/// Re-entrancy counter plus bounded list of releases waiting for the
/// outermost query to finish.
///
/// Requests made while the depth is zero release immediately. Requests made
/// inside a locked region are queued and released exactly once when the
/// depth returns to zero; duplicates are filtered while draining so queueing
/// stays constant time.
#[derive(Debug)]
pub struct DeferredRelease<T> {
    depth: usize,
    pending: Vec<T>,
    capacity: usize,
    overflowed: bool,
    overflow_warnings: usize,
}

impl<T> DeferredRelease<T>
where
    T: Copy + Eq + Hash + std::fmt::Debug,
{
    /// Creates an unlocked arena that queues at most `capacity` releases.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            depth: 0,
            pending: Vec::new(),
            capacity,
            overflowed: false,
            overflow_warnings: 0,
        }
    }

    /// Current re-entrancy depth.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Number of queued releases, duplicates included.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Reports whether the item is queued for release.
    #[must_use]
    pub fn is_pending(&self, item: &T) -> bool {
        self.pending.contains(item)
    }

    /// Number of locked regions in which the queue overflowed.
    #[must_use]
    pub const fn overflow_warnings(&self) -> usize {
        self.overflow_warnings
    }

    /// Enters a locked region and returns the new depth.
    pub fn lock(&mut self) -> usize {
        self.depth += 1;
        self.depth
    }

    /// Leaves a locked region and returns the new depth.
    ///
    /// Leaving the outermost region drains the queue through `release`.
    /// Unbalanced calls are logged and leave the depth at zero.
    pub fn unlock<F>(&mut self, release: F) -> usize
    where
        F: FnMut(T),
    {
        match self.depth {
            0 => {
                log::error!("deferred release unlocked without a matching lock");
            }
            1 => {
                self.depth = 0;
                self.drain(release);
            }
            _ => self.depth -= 1,
        }
        self.depth
    }

    /// Requests the release of `item`.
    ///
    /// Outside a locked region the item is released on the spot. Inside one
    /// it is queued, unless the queue is full, in which case the request is
    /// refused and reported as [`FreeOutcome::Leaked`]. The first overflow of
    /// every locked region is logged.
    pub fn request_free<F>(&mut self, item: T, mut release: F) -> FreeOutcome
    where
        F: FnMut(T),
    {
        if self.depth == 0 {
            release(item);
            return FreeOutcome::Released;
        }

        if self.pending.len() >= self.capacity {
            if !self.overflowed {
                self.overflowed = true;
                self.overflow_warnings += 1;
                log::warn!(
                    "deferred release queue full ({} entries, depth {}), {item:?} leaks until \
                     the next sweep",
                    self.pending.len(),
                    self.depth,
                );
            }
            return FreeOutcome::Leaked;
        }

        self.pending.push(item);
        FreeOutcome::Deferred
    }

    /// Forces a lock that was never released back to zero and drains the
    /// queue. Returns `true` if a stale lock was found.
    pub fn recover_stale_lock<F>(&mut self, release: F) -> bool
    where
        F: FnMut(T),
    {
        if self.depth == 0 {
            return false;
        }
        log::error!("deferred release lock depth {} is stale, resetting", self.depth);
        self.depth = 0;
        self.drain(release);
        true
    }

    fn drain<F>(&mut self, mut release: F)
    where
        F: FnMut(T),
    {
        self.overflowed = false;
        let pending = std::mem::take(&mut self.pending);
        let mut released = HashSet::with_capacity(pending.len());
        for item in pending {
            if released.insert(item) {
                release(item);
            }
        }
    }
}

// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recycling of released buffer objects.
//!
//! Creating a buffer object and faulting in its pages is expensive, and drivers tend to allocate
//! and release buffers of the same handful of sizes over and over. A [`BoCache`] keeps released
//! buffer objects in per-size free lists, so that a later allocation can take one back instead of
//! asking the kernel for a new one.
//!
//! Cached buffer objects are marked as purgeable. Under memory pressure the kernel may drop their
//! pages, in which case they are discarded the next time an allocation looks at them. Objects that
//! sit in the cache for longer than the grace period are destroyed by the periodic sweep.
//!
//! # Examples
//!
//! Free lists are FIFO: allocations take the oldest entry, and the sweep evicts from the same end.
//!
//! ```
//! use bufmgr::{device::BoFlags, Device};
//! # fn example(device: std::sync::Arc<Device>) -> Result<(), Box<dyn std::error::Error>> {
//! let a = device.allocate_bo(10_000, BoFlags::empty())?;
//! let handle = a.handle();
//! drop(a);
//!
//! // Same bucket, so this recycles the buffer that was just released.
//! let b = device.allocate_bo(12_000, BoFlags::empty())?;
//! assert_eq!(b.handle(), handle);
//! # Ok(())
//! # }
//! ```

use super::{
    bucket::{BucketTable, MAX_BUCKETS},
    BoObject,
};
use crate::{
    device::{AccessFlags, BoHandle, Madvise},
    PAGE_SIZE,
};
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
    vec::Drain,
};

/// A set of size-bucketed free lists of released buffer objects.
///
/// The cache is not synchronized on its own. The device keeps its caches behind its lock.
#[derive(Debug)]
pub struct BoCache {
    buckets: BucketTable,
    grace_period: Duration,
    last_sweep: Option<Instant>,
    evicted: Vec<Evicted>,
}

/// A buffer object sitting in a free list.
#[derive(Debug)]
pub(crate) struct CachedBo {
    pub(super) obj: Arc<BoObject>,
    pub(super) free_time: Instant,
}

/// A cached object that the cache destroyed. The device still has to drop its lookup table
/// entries for it.
#[derive(Debug)]
pub(crate) struct Evicted {
    pub(crate) handle: BoHandle,
    pub(crate) name: Option<u32>,
    pub(crate) obj: Weak<BoObject>,
}

impl BoCache {
    /// Creates an empty cache. Caches of command stream buffers are `coarse`, and only have
    /// power-of-two buckets.
    pub(crate) fn new(coarse: bool, grace_period: Duration) -> Self {
        let buckets = BucketTable::new(coarse);
        debug_assert!(buckets.len() <= MAX_BUCKETS);

        BoCache {
            buckets,
            grace_period,
            last_sweep: None,
            evicted: Vec::new(),
        }
    }

    /// Returns the size of the bucket that an allocation of `size` bytes would use, or `None` if
    /// it's too large to be cached.
    pub fn bucket_size(&self, size: u32) -> Option<u32> {
        let size = crate::align_up(size, PAGE_SIZE)?;

        self.buckets
            .find(size)
            .map(|index| self.buckets.get(index).size())
    }

    /// Tries to recycle a buffer object of at least `size` bytes.
    ///
    /// Only the oldest entry of the matching bucket is considered. If the GPU is still using it,
    /// the allocation misses rather than stalling. Entries whose pages were reclaimed by the kernel
    /// are destroyed, and the next entry is tried instead.
    ///
    /// On success, returns the object with its logical reference count set to 1, together with
    /// the bucket size.
    pub(crate) fn alloc(&mut self, size: u32) -> Option<(Arc<BoObject>, u32)> {
        let size = crate::align_up(size, PAGE_SIZE)?;
        let index = self.buckets.find(size)?;
        let bucket = self.buckets.get_mut(index);

        loop {
            let head = bucket.free_list.front()?;

            if head.obj.is_busy(AccessFlags::READ | AccessFlags::WRITE) {
                return None;
            }

            let CachedBo { obj, .. } = bucket.free_list.pop_front()?;

            match obj.madvise(Madvise::WillNeed) {
                Ok(true) => {
                    obj.reset_refcount();
                    obj.reset_table_hint();

                    return Some((obj, bucket.size()));
                }
                Ok(false) => {
                    log::debug!("cached bo {:?} lost its backing pages", obj.handle());
                }
                Err(err) => {
                    log::warn!("failed to revive cached bo {:?}: {}", obj.handle(), err);
                }
            }

            destroy(&mut self.evicted, obj);
        }
    }

    /// Puts a buffer object that has no logical references left at the back of its bucket's free
    /// list, then sweeps the cache.
    ///
    /// Gives the object back if it can't be cached, either because it's larger than every bucket
    /// or because the kernel refused to make it purgeable. The caller must then destroy it.
    pub(crate) fn free(&mut self, obj: Arc<BoObject>, now: Instant) -> Result<(), Arc<BoObject>> {
        // Only exact bucket sizes are cached, so that a hit always satisfies the request.
        let Some(index) = self.buckets.find(obj.size()) else {
            return Err(obj);
        };

        let bucket = self.buckets.get_mut(index);

        if bucket.size() != obj.size() {
            return Err(obj);
        }

        if let Err(err) = obj.madvise(Madvise::DontNeed) {
            log::debug!("failed to make bo {:?} purgeable: {}", obj.handle(), err);

            return Err(obj);
        }

        bucket.free_list.push_back(CachedBo {
            obj,
            free_time: now,
        });

        self.cleanup(now);

        Ok(())
    }

    /// Destroys every entry that was released more than the grace period before `now`.
    ///
    /// Sweeping twice with the same `now` does nothing the second time.
    pub(crate) fn cleanup(&mut self, now: Instant) {
        if self.last_sweep == Some(now) {
            return;
        }

        let mut evicted = 0;

        for bucket in self.buckets.iter_mut() {
            while let Some(head) = bucket.free_list.front() {
                if now.saturating_duration_since(head.free_time) <= self.grace_period {
                    break;
                }

                if let Some(CachedBo { obj, .. }) = bucket.free_list.pop_front() {
                    destroy(&mut self.evicted, obj);
                    evicted += 1;
                }
            }
        }

        if evicted != 0 {
            log::debug!("evicted {} buffer objects from the cache", evicted);
        }

        self.last_sweep = Some(now);
    }

    /// Takes a specific object back out of the cache, for when it's found again through the
    /// handle table. Returns whether it was there.
    pub(crate) fn take(&mut self, obj: &Arc<BoObject>) -> bool {
        let Some(index) = self.buckets.find(obj.size()) else {
            return false;
        };

        let free_list = &mut self.buckets.get_mut(index).free_list;

        match free_list.iter().position(|entry| Arc::ptr_eq(&entry.obj, obj)) {
            Some(position) => {
                free_list.remove(position);
                true
            }
            None => false,
        }
    }

    /// Destroys every cached object.
    pub fn purge(&mut self) {
        for bucket in self.buckets.iter_mut() {
            for CachedBo { obj, .. } in bucket.free_list.drain(..) {
                destroy(&mut self.evicted, obj);
            }
        }
    }

    /// Returns the objects destroyed since the last call.
    pub(crate) fn drain_evicted(&mut self) -> Drain<'_, Evicted> {
        self.evicted.drain(..)
    }

    /// Returns the number of cached objects.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.free_list.len()).sum()
    }

    /// Returns whether the cache holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Drops the cache's strong reference, which destroys the object, and remembers it.
fn destroy(evicted: &mut Vec<Evicted>, obj: Arc<BoObject>) {
    evicted.push(Evicted {
        handle: obj.handle(),
        name: obj.name(),
        obj: Arc::downgrade(&obj),
    });
}

impl Drop for BoCache {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::debug!("destroying {} cached buffer objects", self.len());
        }
    }
}

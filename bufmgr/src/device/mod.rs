// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Communication channel with the kernel driver.
//!
//! The kernel side is abstracted by the [`KernelDevice`] trait, which the driver implements on top
//! of its ioctl transport. A [`Device`] wraps it and owns everything that is shared between
//! threads: the two buffer object caches and the tables that map kernel handles and global names
//! back to their wrapper objects. All of that shared state lives behind one lock, and every
//! operation that touches it (allocation, the last release of a buffer object, cache sweeps and
//! handle lookups) takes that lock for its whole duration.
//!
//! Command streams are not submitted to the device directly, but to one of its
//! [pipes](self::pipe).

use self::pipe::{PipeId, Timeout, WaitStatus};
use crate::{
    bo::{cache::BoCache, AllocationError, BoObject, BufferObject, ReusePolicy},
    macros::{impl_id_counter, kernel_bitflags},
    ringbuffer::submit::{SubmitRequest, SubmitResult},
    KernelError, NonExhaustive, PAGE_SIZE,
};
use foldhash::HashMap;
use parking_lot::Mutex;
use std::{
    fmt,
    hash::Hash,
    num::NonZeroU64,
    ops::Deref,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

pub mod pipe;

/// A kernel buffer object handle, only meaningful together with the device that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BoHandle(pub u32);

/// A sync file descriptor passed into or returned from a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FenceFd(pub i32);

kernel_bitflags! {
    /// Flags passed to the kernel when creating a buffer object.
    BoFlags = u32;

    /// The GPU can only read from the buffer.
    GPU_READONLY = 0x0000_0001,

    /// CPU mappings are cached.
    CACHED = 0x0001_0000,

    /// CPU mappings are write-combined.
    WRITE_COMBINE = 0x0002_0000,

    /// CPU mappings are uncached.
    UNCACHED = 0x0004_0000,
}

kernel_bitflags! {
    /// The kind of GPU access to check for when asking whether a buffer object is busy.
    AccessFlags = u32;

    /// Pending GPU reads.
    READ = 0x1,

    /// Pending GPU writes.
    WRITE = 0x2,
}

/// Advice given to the kernel about the backing pages of a buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Madvise {
    /// The buffer is about to be used again and its pages must be resident.
    WillNeed,

    /// The buffer is idle in a cache and the kernel may reclaim its pages under memory pressure.
    DontNeed,
}

/// The kernel interface consumed by this crate.
///
/// # Safety
///
/// - A pointer returned by [`map`] must stay valid for reads and writes of `size` bytes until it
///   is passed to [`unmap`] or the handle is passed to [`close_bo`].
/// - Handles returned by [`allocate_bo`] and [`open_bo`] must be unique among the handles that are
///   currently open on this device.
///
/// [`map`]: KernelDevice::map
/// [`unmap`]: KernelDevice::unmap
/// [`close_bo`]: KernelDevice::close_bo
/// [`allocate_bo`]: KernelDevice::allocate_bo
/// [`open_bo`]: KernelDevice::open_bo
pub unsafe trait KernelDevice: Send + Sync {
    /// Creates a new buffer object of exactly `size` bytes.
    fn allocate_bo(&self, size: u32, flags: BoFlags) -> Result<BoHandle, KernelError>;

    /// Opens the buffer object that was exported under the global `name`. Returns the new handle
    /// and the size of the buffer.
    fn open_bo(&self, name: u32) -> Result<(BoHandle, u32), KernelError>;

    /// Releases the handle. The kernel frees the buffer once the GPU is done with it.
    fn close_bo(&self, handle: BoHandle);

    /// Returns the GPU address the kernel is expected to place the buffer at, or 0 if the kernel
    /// patches all relocations itself.
    #[inline]
    fn iova(&self, handle: BoHandle) -> u64 {
        let _ = handle;

        0
    }

    /// Maps the buffer into the address space of the process.
    fn map(&self, handle: BoHandle, size: u32) -> Result<NonNull<u8>, KernelError>;

    /// Removes a mapping that was returned by [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// - `ptr` and `size` must be from a previous call to `map` with the same `handle`.
    /// - Nothing must access the mapping anymore.
    unsafe fn unmap(&self, handle: BoHandle, ptr: NonNull<u8>, size: u32);

    /// Returns whether the GPU still has pending work of the kind given by `access` that uses the
    /// buffer. Must never block.
    fn query_busy(&self, handle: BoHandle, access: AccessFlags) -> bool;

    /// Gives advice about the backing pages. Returns whether the pages are still resident, which
    /// is always `true` for [`Madvise::DontNeed`] unless the call itself fails.
    fn madvise(&self, handle: BoHandle, advice: Madvise) -> Result<bool, KernelError>;

    /// Submits a command stream.
    fn submit(&self, request: &SubmitRequest<'_>) -> Result<SubmitResult, KernelError>;

    /// Waits until the GPU has passed `timestamp` on `pipe`.
    fn wait(
        &self,
        pipe: PipeId,
        timestamp: u32,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError>;
}

/// Parameters to create a new `Device`.
#[derive(Clone, Debug)]
pub struct DeviceCreateInfo {
    /// Whether released buffer objects are kept in the caches for reuse. If `false`, every buffer
    /// object is destroyed as soon as its last reference is dropped.
    ///
    /// The default value is `true`.
    pub bo_reuse: bool,

    /// How long a released buffer object may sit in a cache before a sweep destroys it.
    ///
    /// The default value is 1 second.
    pub cache_grace_period: Duration,

    pub _ne: NonExhaustive,
}

impl Default for DeviceCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            bo_reuse: true,
            cache_grace_period: Duration::from_secs(1),
            _ne: NonExhaustive(()),
        }
    }
}

/// An open channel to the kernel driver, plus the buffer object caches.
pub struct Device {
    id: NonZeroU64,
    kernel: Arc<dyn KernelDevice>,
    bo_reuse: bool,
    tables: Mutex<DeviceTables>,
    // Source of ring generations. 0 is never handed out, so that it can mean "never seen".
    next_generation: AtomicU32,
}

impl Device {
    /// Creates a new `Device` on top of the kernel interface.
    pub fn new(kernel: Arc<dyn KernelDevice>, create_info: DeviceCreateInfo) -> Arc<Device> {
        let DeviceCreateInfo {
            bo_reuse,
            cache_grace_period,
            _ne: _,
        } = create_info;

        Arc::new(Device {
            id: Self::next_id(),
            kernel,
            bo_reuse,
            tables: Mutex::new(DeviceTables {
                handles: HashMap::default(),
                names: HashMap::default(),
                bo_cache: BoCache::new(false, cache_grace_period),
                ring_cache: BoCache::new(true, cache_grace_period),
            }),
            next_generation: AtomicU32::new(1),
        })
    }

    /// Returns the kernel interface.
    #[inline]
    pub fn kernel(&self) -> &Arc<dyn KernelDevice> {
        &self.kernel
    }

    /// Returns whether released buffer objects are cached.
    #[inline]
    pub fn bo_reuse(&self) -> bool {
        self.bo_reuse
    }

    /// Allocates a buffer object of at least `size` bytes, recycling one from the cache if
    /// possible.
    ///
    /// The size is rounded up to the size of the cache bucket it falls in, so that the buffer
    /// object can be recycled again later. If the size is larger than the largest bucket, it is
    /// only rounded up to a whole page and the buffer object bypasses the cache.
    pub fn allocate_bo(
        self: &Arc<Self>,
        size: u32,
        flags: BoFlags,
    ) -> Result<BufferObject, AllocationError> {
        self.allocate_inner(size, flags, ReusePolicy::BucketCached)
    }

    /// Allocates a buffer object for command stream storage. These are recycled through a
    /// separate cache with coarser buckets.
    pub fn allocate_ring_bo(self: &Arc<Self>, size: u32) -> Result<BufferObject, AllocationError> {
        self.allocate_inner(size, BoFlags::GPU_READONLY, ReusePolicy::RingCached)
    }

    fn allocate_inner(
        self: &Arc<Self>,
        size: u32,
        flags: BoFlags,
        reuse_policy: ReusePolicy,
    ) -> Result<BufferObject, AllocationError> {
        let reuse_policy = if self.bo_reuse {
            reuse_policy
        } else {
            ReusePolicy::NoCache
        };
        let size = crate::align_up(size.max(1), PAGE_SIZE)
            .ok_or(AllocationError::AllocationFailed(KernelError::ENOMEM))?;
        let mut bo_size = size;

        let mut tables = self.tables.lock();

        if let Some(cache) = tables.cache_mut(reuse_policy) {
            let recycled = cache.alloc(size);

            if let Some(bucket_size) = cache.bucket_size(size) {
                bo_size = bucket_size;
            }

            tables.forget_evicted();

            if let Some((obj, _)) = recycled {
                log::trace!(
                    "recycled bo {:?} ({} bytes) for a request of {} bytes",
                    obj.handle(),
                    obj.size(),
                    size,
                );

                return Ok(unsafe { BufferObject::from_object(obj, self.clone()) });
            }
        }

        drop(tables);

        let handle = self
            .kernel
            .allocate_bo(bo_size, flags)
            .map_err(AllocationError::AllocationFailed)?;
        let obj = BoObject::new(self.kernel.clone(), handle, bo_size, reuse_policy);
        log::trace!("created bo {:?} ({} bytes)", handle, bo_size);

        self.tables
            .lock()
            .handles
            .insert(handle, Arc::downgrade(&obj));

        Ok(unsafe { BufferObject::from_object(obj, self.clone()) })
    }

    /// Wraps a buffer object handle that was created outside of this crate, for example imported
    /// from a dma-buf.
    ///
    /// If the handle is already known, the existing buffer object is returned instead, so that
    /// there is never more than one wrapper per kernel handle. Imported buffer objects are never
    /// cached.
    pub fn import_bo(self: &Arc<Self>, handle: BoHandle, size: u32) -> BufferObject {
        let mut tables = self.tables.lock();

        if let Some(bo) = tables.lookup_handle(handle, self) {
            return bo;
        }

        let obj = BoObject::new(self.kernel.clone(), handle, size, ReusePolicy::NoCache);
        tables.handles.insert(handle, Arc::downgrade(&obj));

        unsafe { BufferObject::from_object(obj, self.clone()) }
    }

    /// Opens a buffer object that another process exported under a global name.
    ///
    /// Opening the same name twice returns the same buffer object.
    pub fn open_bo(self: &Arc<Self>, name: u32) -> Result<BufferObject, AllocationError> {
        let mut tables = self.tables.lock();

        if let Some(bo) = tables.lookup_name(name, self) {
            return Ok(bo);
        }

        let (handle, size) = self
            .kernel
            .open_bo(name)
            .map_err(AllocationError::ImportFailed)?;

        // The kernel hands out the same handle if the buffer is already open in this process.
        let bo = match tables.lookup_handle(handle, self) {
            Some(bo) => bo,
            None => {
                let obj = BoObject::new(self.kernel.clone(), handle, size, ReusePolicy::NoCache);
                tables.handles.insert(handle, Arc::downgrade(&obj));

                unsafe { BufferObject::from_object(obj, self.clone()) }
            }
        };

        bo.set_name(name);
        tables.names.insert(name, bo.downgrade());

        Ok(bo)
    }

    /// Destroys the buffer objects that have been sitting in the caches for longer than the grace
    /// period at time `now`.
    ///
    /// This also happens on every release of a cached buffer object, so calling it is only
    /// needed to trim the caches while nothing is being released.
    pub fn cleanup_caches(&self, now: Instant) {
        let mut tables = self.tables.lock();
        tables.bo_cache.cleanup(now);
        tables.ring_cache.cleanup(now);
        tables.forget_evicted();
    }

    /// Destroys every buffer object in the caches, regardless of how long it has been there.
    pub fn purge_caches(&self) {
        let mut tables = self.tables.lock();
        tables.bo_cache.purge();
        tables.ring_cache.purge();
        tables.forget_evicted();
    }

    /// Returns the number of buffer objects that currently sit in the caches.
    pub fn cached_bo_count(&self) -> usize {
        let tables = self.tables.lock();

        tables.bo_cache.len() + tables.ring_cache.len()
    }

    /// Drops one logical reference of `obj`. The last one either hands it to a cache or removes it
    /// from the lookup tables so that it gets destroyed.
    pub(crate) fn release_bo(&self, obj: &Arc<BoObject>) {
        // Fast path: this isn't the last reference, so no lock is needed.
        if obj.release_unless_last() {
            return;
        }

        let now = Instant::now();
        let mut tables = self.tables.lock();

        // Someone may have revived the object through the handle table in the meantime.
        if !obj.release() {
            return;
        }

        if let Some(cache) = tables.cache_mut(obj.reuse_policy()) {
            // Fails if the object is too large for any bucket.
            let freed = cache.free(obj.clone(), now).is_ok();
            tables.forget_evicted();

            if freed {
                log::trace!("bo {:?} returned to the cache", obj.handle());
                return;
            }
        }

        tables.forget(obj);
        log::trace!("bo {:?} released", obj.handle());
    }

    /// Returns a generation number that was never returned before.
    pub(crate) fn next_generation(&self) -> u32 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        if generation == 0 {
            // Wrapped around, skip the reserved value.
            self.next_generation.fetch_add(1, Ordering::Relaxed)
        } else {
            generation
        }
    }
}

impl_id_counter!(Device);

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("bo_reuse", &self.bo_reuse)
            .finish_non_exhaustive()
    }
}

/// Shared state of a device, guarded by its lock.
struct DeviceTables {
    // Handle to object, so that a handle never has more than one wrapper.
    handles: HashMap<BoHandle, Weak<BoObject>>,
    // Global (flink) name to object.
    names: HashMap<u32, Weak<BoObject>>,
    bo_cache: BoCache,
    ring_cache: BoCache,
}

impl DeviceTables {
    fn cache_mut(&mut self, reuse_policy: ReusePolicy) -> Option<&mut BoCache> {
        match reuse_policy {
            ReusePolicy::NoCache => None,
            ReusePolicy::BucketCached => Some(&mut self.bo_cache),
            ReusePolicy::RingCached => Some(&mut self.ring_cache),
        }
    }

    fn lookup_handle(&mut self, handle: BoHandle, device: &Arc<Device>) -> Option<BufferObject> {
        let obj = self.handles.get(&handle).and_then(Weak::upgrade)?;

        Some(self.revive(obj, device))
    }

    fn lookup_name(&mut self, name: u32, device: &Arc<Device>) -> Option<BufferObject> {
        let obj = self.names.get(&name).and_then(Weak::upgrade)?;

        Some(self.revive(obj, device))
    }

    // Takes a new logical reference on an object found through one of the tables. An object
    // without logical references is sitting in a cache and must be taken out of it first.
    fn revive(&mut self, obj: Arc<BoObject>, device: &Arc<Device>) -> BufferObject {
        if !obj.acquire_if_live() {
            let taken = self
                .cache_mut(obj.reuse_policy())
                .is_some_and(|cache| cache.take(&obj));
            debug_assert!(taken);
            obj.reset_refcount();
        }

        unsafe { BufferObject::from_object(obj, device.clone()) }
    }

    fn forget(&mut self, obj: &Arc<BoObject>) {
        let weak = Arc::downgrade(obj);
        remove_entry(&mut self.handles, obj.handle(), &weak);

        if let Some(name) = obj.name() {
            remove_entry(&mut self.names, name, &weak);
        }
    }

    // Drops the table entries of the objects that the caches destroyed.
    fn forget_evicted(&mut self) {
        let DeviceTables {
            handles,
            names,
            bo_cache,
            ring_cache,
        } = self;

        for evicted in bo_cache.drain_evicted().chain(ring_cache.drain_evicted()) {
            remove_entry(handles, evicted.handle, &evicted.obj);

            if let Some(name) = evicted.name {
                remove_entry(names, name, &evicted.obj);
            }
        }
    }
}

// Removes `key` if it still refers to `obj`. The key may have been reused by another object.
fn remove_entry<K: Eq + Hash>(map: &mut HashMap<K, Weak<BoObject>>, key: K, obj: &Weak<BoObject>) {
    if map.get(&key).is_some_and(|weak| Weak::ptr_eq(weak, obj)) {
        map.remove(&key);
    }
}

/// Implemented on objects that belong to a device.
///
/// # Safety
///
/// `device` must always return the same device.
pub unsafe trait DeviceOwned {
    /// Returns the device that owns `self`.
    fn device(&self) -> &Arc<Device>;
}

unsafe impl<T> DeviceOwned for T
where
    T: Deref,
    T::Target: DeviceOwned,
{
    #[inline]
    fn device(&self) -> &Arc<Device> {
        (**self).device()
    }
}

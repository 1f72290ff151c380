// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! GPU buffer objects.
//!
//! A [`BufferObject`] is a logical reference to a kernel buffer. Cloning it takes another
//! reference, and dropping the last one hands the buffer back to the [`Device`], which either puts
//! it into one of its [caches](cache) or destroys it, depending on its [`ReusePolicy`].
//!
//! The kernel buffer itself is owned by an internal object that can outlive all logical
//! references while it sits in a cache. Being in a cache and being live are mutually exclusive:
//! an object is only ever handed out again after it was taken out of its free list.

use crate::{
    device::{AccessFlags, BoHandle, Device, DeviceOwned, KernelDevice, Madvise},
    macros::impl_id_counter,
    KernelError,
};
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt,
    hash::{Hash, Hasher},
    num::NonZeroU64,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Weak,
    },
};

pub mod bucket;
pub mod cache;

/// What happens to a buffer object when its last reference is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum ReusePolicy {
    /// The buffer object is destroyed.
    NoCache = 0,

    /// The buffer object goes into the device's general cache.
    BucketCached = 1,

    /// The buffer object goes into the device's command stream cache.
    RingCached = 2,
}

impl ReusePolicy {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => ReusePolicy::BucketCached,
            2 => ReusePolicy::RingCached,
            _ => ReusePolicy::NoCache,
        }
    }
}

/// A reference-counted handle to a GPU buffer.
pub struct BufferObject {
    obj: Arc<BoObject>,
    device: Arc<Device>,
}

impl BufferObject {
    /// # Safety
    ///
    /// The logical reference count of `obj` must already account for the returned handle.
    #[inline]
    pub(crate) unsafe fn from_object(obj: Arc<BoObject>, device: Arc<Device>) -> Self {
        debug_assert!(obj.refcount() > 0);

        BufferObject { obj, device }
    }

    /// Returns the kernel handle.
    #[inline]
    pub fn handle(&self) -> BoHandle {
        self.obj.handle
    }

    /// Returns the size in bytes. This can be larger than what was requested at allocation.
    #[inline]
    pub fn size(&self) -> u32 {
        self.obj.size
    }

    /// Returns the presumed GPU address.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.obj.iova
    }

    /// Returns the global name the buffer object was opened with, if any.
    #[inline]
    pub fn name(&self) -> Option<u32> {
        self.obj.name()
    }

    /// Returns the number of logical references.
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.obj.refcount()
    }

    /// Returns what happens to the buffer object when the last reference is dropped.
    #[inline]
    pub fn reuse_policy(&self) -> ReusePolicy {
        self.obj.reuse_policy()
    }

    /// Makes sure the buffer object is destroyed instead of cached once it's released. This must
    /// be called before sharing the buffer with another process, which could keep using it
    /// after it was recycled here.
    #[inline]
    pub fn disable_reuse(&self) {
        self.obj
            .reuse
            .store(ReusePolicy::NoCache as u8, Ordering::Relaxed);
    }

    /// Returns a CPU pointer to the start of the buffer, creating the mapping on first use. The
    /// mapping stays until the kernel buffer is destroyed.
    pub fn map(&self) -> Result<NonNull<u8>, AllocationError> {
        self.obj.map().map_err(AllocationError::MapFailed)
    }

    /// Returns whether the GPU still has pending accesses of the given kind to the buffer.
    #[inline]
    pub fn is_busy(&self, access: AccessFlags) -> bool {
        self.obj.is_busy(access)
    }

    #[inline]
    pub(crate) fn object(&self) -> &Arc<BoObject> {
        &self.obj
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<BoObject> {
        Arc::downgrade(&self.obj)
    }

    #[inline]
    pub(crate) fn set_name(&self, name: u32) {
        self.obj.name.store(name, Ordering::Relaxed);
    }
}

impl Clone for BufferObject {
    #[inline]
    fn clone(&self) -> Self {
        self.obj.refcount.fetch_add(1, Ordering::Relaxed);

        BufferObject {
            obj: self.obj.clone(),
            device: self.device.clone(),
        }
    }
}

impl Drop for BufferObject {
    #[inline]
    fn drop(&mut self) {
        self.device.release_bo(&self.obj);
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.obj.handle)
            .field("size", &self.obj.size)
            .field("iova", &self.obj.iova)
            .field("refcount", &self.obj.refcount())
            .field("reuse_policy", &self.obj.reuse_policy())
            .finish_non_exhaustive()
    }
}

impl PartialEq for BufferObject {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.obj.id == other.obj.id
    }
}

impl Eq for BufferObject {}

impl Hash for BufferObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.obj.id.hash(state);
    }
}

unsafe impl DeviceOwned for BufferObject {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

/// The kernel buffer behind one or more [`BufferObject`]s. Dropping it unmaps and closes the
/// handle.
pub(crate) struct BoObject {
    id: NonZeroU64,
    kernel: Arc<dyn KernelDevice>,
    handle: BoHandle,
    size: u32,
    iova: u64,
    name: AtomicU32,
    mapping: Mutex<Option<NonNull<u8>>>,
    // Logical references. 0 while the object sits in a cache.
    refcount: AtomicU32,
    reuse: AtomicU8,
    // Where the object was last put in a ring's buffer table: the ring's generation in the high
    // half, the index in the low half.
    table_hint: AtomicU64,
}

// The mapping is plain memory shared with the GPU. Accesses are synchronized by the users of the
// mapping, not by this object.
unsafe impl Send for BoObject {}
unsafe impl Sync for BoObject {}

impl BoObject {
    /// Wraps a new kernel handle, with one logical reference.
    pub(crate) fn new(
        kernel: Arc<dyn KernelDevice>,
        handle: BoHandle,
        size: u32,
        reuse_policy: ReusePolicy,
    ) -> Arc<BoObject> {
        let iova = kernel.iova(handle);

        Arc::new(BoObject {
            id: Self::next_id(),
            kernel,
            handle,
            size,
            iova,
            name: AtomicU32::new(0),
            mapping: Mutex::new(None),
            refcount: AtomicU32::new(1),
            reuse: AtomicU8::new(reuse_policy as u8),
            table_hint: AtomicU64::new(0),
        })
    }

    #[inline]
    pub(crate) fn handle(&self) -> BoHandle {
        self.handle
    }

    #[inline]
    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub(crate) fn name(&self) -> Option<u32> {
        match self.name.load(Ordering::Relaxed) {
            0 => None,
            name => Some(name),
        }
    }

    #[inline]
    pub(crate) fn reuse_policy(&self) -> ReusePolicy {
        ReusePolicy::from_u8(self.reuse.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Drops a logical reference, unless it's the last one. Returns whether it was dropped.
    #[inline]
    pub(crate) fn release_unless_last(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 1).then(|| count - 1)
            })
            .is_ok()
    }

    /// Drops a logical reference. Returns whether it was the last one.
    #[inline]
    pub(crate) fn release(&self) -> bool {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);

        previous == 1
    }

    /// Takes a logical reference, unless there are none. Returns whether it was taken.
    #[inline]
    pub(crate) fn acquire_if_live(&self) -> bool {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            })
            .is_ok()
    }

    /// Gives an object that was just taken out of a cache its first logical reference.
    #[inline]
    pub(crate) fn reset_refcount(&self) {
        self.refcount.store(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn table_hint(&self, generation: u32) -> Option<u32> {
        let hint = self.table_hint.load(Ordering::Relaxed);

        (generation != 0 && (hint >> 32) as u32 == generation).then_some(hint as u32)
    }

    #[inline]
    pub(crate) fn set_table_hint(&self, generation: u32, index: u32) {
        self.table_hint.store(
            (u64::from(generation) << 32) | u64::from(index),
            Ordering::Relaxed,
        );
    }

    #[inline]
    pub(crate) fn reset_table_hint(&self) {
        self.table_hint.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_busy(&self, access: AccessFlags) -> bool {
        self.kernel.query_busy(self.handle, access)
    }

    #[inline]
    pub(crate) fn madvise(&self, advice: Madvise) -> Result<bool, KernelError> {
        self.kernel.madvise(self.handle, advice)
    }

    pub(crate) fn map(&self) -> Result<NonNull<u8>, KernelError> {
        let mut mapping = self.mapping.lock();

        if let Some(ptr) = *mapping {
            return Ok(ptr);
        }

        let ptr = self.kernel.map(self.handle, self.size)?;
        *mapping = Some(ptr);

        Ok(ptr)
    }
}

impl_id_counter!(BoObject);

impl Drop for BoObject {
    fn drop(&mut self) {
        if let Some(ptr) = self.mapping.get_mut().take() {
            unsafe { self.kernel.unmap(self.handle, ptr, self.size) };
        }

        self.kernel.close_bo(self.handle);
        log::trace!("destroyed bo {:?}", self.handle);
    }
}

impl fmt::Debug for BoObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}

/// Error that can be returned when creating or mapping a buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The kernel failed to create the buffer object.
    AllocationFailed(KernelError),

    /// The kernel failed to map the buffer object.
    MapFailed(KernelError),

    /// The kernel failed to open a buffer object by name.
    ImportFailed(KernelError),
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AllocationFailed(err) | Self::MapFailed(err) | Self::ImportFailed(err) => {
                Some(err)
            }
        }
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::AllocationFailed(_) => "the kernel failed to create the buffer object",
            Self::MapFailed(_) => "the kernel failed to map the buffer object",
            Self::ImportFailed(_) => "the kernel failed to open the buffer object",
        };

        f.write_str(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BoFlags, DeviceCreateInfo};
    use crossbeam_queue::ArrayQueue;
    use std::{thread, time::Duration};

    #[test]
    fn clone_and_drop() {
        let (device, kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let clone = bo.clone();
        assert_eq!(bo.refcount(), 2);
        assert_eq!(bo, clone);

        drop(clone);
        assert_eq!(bo.refcount(), 1);
        assert_eq!(device.cached_bo_count(), 0);

        let handle = bo.handle();
        drop(bo);
        assert_eq!(device.cached_bo_count(), 1);
        assert!(!kernel.is_closed(handle));
    }

    #[test]
    fn disable_reuse() {
        let (device, kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        bo.disable_reuse();
        assert_eq!(bo.reuse_policy(), ReusePolicy::NoCache);

        let handle = bo.handle();
        drop(bo);
        assert_eq!(device.cached_bo_count(), 0);
        assert!(kernel.is_closed(handle));
    }

    #[test]
    fn map_is_lazy_and_stable() {
        let (device, kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        assert_eq!(kernel.map_count(), 0);

        let ptr = bo.map().unwrap();
        assert_eq!(bo.map().unwrap(), ptr);
        assert_eq!(kernel.map_count(), 1);

        // The mapping survives a trip through the cache.
        drop(bo);
        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        assert_eq!(bo.map().unwrap(), ptr);
        assert_eq!(kernel.map_count(), 1);
    }

    #[test]
    fn map_failure() {
        let (device, kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        kernel.fail_next_map(KernelError::ENOMEM);
        assert_eq!(
            bo.map().unwrap_err(),
            AllocationError::MapFailed(KernelError::ENOMEM),
        );
        assert!(bo.map().is_ok());
    }

    #[test]
    fn busy_query() {
        let (device, kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        assert!(!bo.is_busy(AccessFlags::READ | AccessFlags::WRITE));

        kernel.set_busy(bo.handle(), true);
        assert!(bo.is_busy(AccessFlags::WRITE));
    }

    #[test]
    fn table_hint_is_gated_by_generation() {
        let (device, _kernel) = mock_device!();

        let bo = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let obj = bo.object();
        assert_eq!(obj.table_hint(0), None);

        obj.set_table_hint(3, 7);
        assert_eq!(obj.table_hint(3), Some(7));
        assert_eq!(obj.table_hint(4), None);
    }

    #[test]
    fn concurrent_allocate_and_release() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        // Nothing may expire while the threads run.
        let (device, kernel) = mock_device!(DeviceCreateInfo {
            cache_grace_period: Duration::from_secs(3600),
            ..Default::default()
        });
        let handles = ArrayQueue::new(THREADS * ROUNDS);

        thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for round in 0..ROUNDS {
                        let size = 4096 * (1 + (round % 3) as u32);
                        let bo = device.allocate_bo(size, BoFlags::empty()).unwrap();
                        let clone = bo.clone();
                        handles.push(bo.handle()).unwrap();
                        drop(bo);
                        drop(clone);
                    }
                });
            }
        });

        assert_eq!(handles.len(), THREADS * ROUNDS);

        // At most one buffer per size class per thread is ever live at once.
        assert!(kernel.allocation_count() <= THREADS * 3);
        assert!(device.cached_bo_count() <= THREADS * 3);
    }
}

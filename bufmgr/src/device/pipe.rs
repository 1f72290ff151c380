// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Hardware queues.
//!
//! A [`Pipe`] is where command streams are submitted to and where fences are waited on. It also
//! owns the buffer that short-lived streaming state objects are carved out of.

use super::{Device, DeviceOwned};
use crate::{
    bo::{AllocationError, BufferObject},
    KernelError, NonExhaustive,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

/// Size of the buffers that streaming state objects are suballocated from.
pub(crate) const SUBALLOC_SIZE: u32 = 32 * 1024;

/// Alignment of each suballocation.
pub(crate) const SUBALLOC_ALIGNMENT: u32 = 0x10;

/// Identifies a hardware queue to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PipeId(pub u32);

impl PipeId {
    /// The 3D queue.
    pub const THREE_D: Self = Self(1);

    /// The 2D queue.
    pub const TWO_D: Self = Self(2);
}

/// How long a wait may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the wait completes.
    Infinite,

    /// Only check, never block.
    NonBlocking,

    /// Block for at most this long.
    Duration(Duration),
}

/// The outcome of a successful wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The GPU has passed the timestamp.
    Complete,

    /// The timeout elapsed first.
    TimedOut,
}

/// Parameters to create a new `Pipe`.
#[derive(Clone, Debug)]
pub struct PipeCreateInfo {
    /// The queue to submit to.
    ///
    /// The default value is [`PipeId::THREE_D`].
    pub id: PipeId,

    /// The GPU generation, for example `630`. From 500 on, GPU addresses are 64 bits wide and
    /// take two command words.
    ///
    /// The default value is `0`.
    pub gpu_id: u32,

    pub _ne: NonExhaustive,
}

impl Default for PipeCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            id: PipeId::THREE_D,
            gpu_id: 0,
            _ne: NonExhaustive(()),
        }
    }
}

/// A hardware queue of a device.
#[derive(Debug)]
pub struct Pipe {
    device: Arc<Device>,
    id: PipeId,
    gpu_id: u32,
    suballoc: Mutex<Option<Suballoc>>,
}

// The most recent streaming buffer, and where the next suballocation may start.
#[derive(Debug)]
struct Suballoc {
    bo: BufferObject,
    next: u32,
}

impl Pipe {
    /// Creates a new `Pipe`.
    pub fn new(device: Arc<Device>, create_info: PipeCreateInfo) -> Arc<Pipe> {
        let PipeCreateInfo {
            id,
            gpu_id,
            _ne: _,
        } = create_info;

        Arc::new(Pipe {
            device,
            id,
            gpu_id,
            suballoc: Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> PipeId {
        self.id
    }

    #[inline]
    pub fn gpu_id(&self) -> u32 {
        self.gpu_id
    }

    /// Returns whether GPU addresses take two command words.
    #[inline]
    pub fn has_wide_addresses(&self) -> bool {
        self.gpu_id >= 500
    }

    /// Waits until the GPU has passed `timestamp` on this pipe.
    pub fn wait(&self, timestamp: u32, timeout: Timeout) -> Result<WaitStatus, KernelError> {
        let status = self.device.kernel().wait(self.id, timestamp, timeout)?;

        if status == WaitStatus::TimedOut {
            log::trace!("wait for fence {} on {:?} timed out", timestamp, self.id);
        }

        Ok(status)
    }

    /// Carves `size` bytes out of the current streaming buffer, right after the previous
    /// suballocation. Starts a new buffer if the current one is full.
    ///
    /// Returns the buffer and the offset of the suballocation. The whole range is reserved for
    /// the caller, whether it ends up writing all of it or not.
    pub(crate) fn suballocate(&self, size: u32) -> Result<(BufferObject, u32), AllocationError> {
        let mut suballoc = self.suballoc.lock();

        let offset = suballoc.as_ref().and_then(|current| {
            let end = current.next.checked_add(size)?;

            (end <= current.bo.size()).then_some(current.next)
        });

        let (bo, offset) = match (offset, suballoc.take()) {
            (Some(offset), Some(current)) => (current.bo, offset),
            _ => {
                let bo = self.device.allocate_ring_bo(size.max(SUBALLOC_SIZE))?;
                log::trace!("new streaming buffer {:?} on {:?}", bo.handle(), self.id);

                (bo, 0)
            }
        };

        // Past the end of the buffer means full, which the size check above handles.
        let next = crate::align_up(offset + size, SUBALLOC_ALIGNMENT).unwrap_or(u32::MAX);
        *suballoc = Some(Suballoc {
            bo: bo.clone(),
            next,
        });

        Ok((bo, offset))
    }
}

unsafe impl DeviceOwned for Pipe {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_addresses() {
        let (device, _kernel) = mock_device!();

        let pipe = Pipe::new(device.clone(), PipeCreateInfo::default());
        assert!(!pipe.has_wide_addresses());

        let pipe = Pipe::new(
            device,
            PipeCreateInfo {
                gpu_id: 530,
                ..Default::default()
            },
        );
        assert!(pipe.has_wide_addresses());
    }

    #[test]
    fn suballocations_are_packed() {
        let (_device, pipe, kernel) = mock_pipe!();

        let (bo, offset) = pipe.suballocate(100).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(bo.size(), SUBALLOC_SIZE);

        let (next, offset) = pipe.suballocate(100).unwrap();
        assert_eq!(next, bo);
        assert_eq!(offset, 112);

        let (_, offset) = pipe.suballocate(16).unwrap();
        assert_eq!(offset, 224);
        assert_eq!(kernel.allocation_count(), 1);
    }

    #[test]
    fn full_buffer_is_replaced() {
        let (_device, pipe, kernel) = mock_pipe!();

        let (bo, _) = pipe.suballocate(SUBALLOC_SIZE - 64).unwrap();

        let (next, offset) = pipe.suballocate(128).unwrap();
        assert_ne!(next, bo);
        assert_eq!(offset, 0);
        assert_eq!(kernel.allocation_count(), 2);

        // Larger than the default buffer size.
        let (big, offset) = pipe.suballocate(SUBALLOC_SIZE * 2).unwrap();
        assert_eq!(offset, 0);
        assert!(big.size() >= SUBALLOC_SIZE * 2);
    }

    #[test]
    fn wait_forwards_to_kernel() {
        let (_device, pipe, kernel) = mock_pipe!();

        kernel.set_completed_fence(4);
        assert_eq!(pipe.wait(3, Timeout::NonBlocking), Ok(WaitStatus::Complete));
        assert_eq!(pipe.wait(5, Timeout::NonBlocking), Ok(WaitStatus::TimedOut));
    }
}

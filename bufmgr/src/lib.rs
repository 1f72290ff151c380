// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Buffer object cache and command stream submission for userspace GPU drivers talking to a
//! DRM-style kernel interface.
//!
//! # Brief summary
//!
//! - The [`KernelDevice`](crate::device::KernelDevice) trait is the boundary to the kernel. It
//!   creates, maps and destroys GPU buffers, queries whether they are busy, and submits command
//!   streams. This crate never issues ioctls itself; the driver provides an implementation.
//!
//! - A [`Device`](crate::device::Device) wraps a `KernelDevice` and owns the shared state: the
//!   [buffer object caches](crate::bo::cache) and the tables that map kernel handles back to their
//!   wrapper objects. All of it sits behind a single lock.
//!
//! - A [`BufferObject`](crate::bo::BufferObject) is a reference-counted handle to a GPU buffer.
//!   When the last handle is dropped, the buffer is either put in a cache free list so that a
//!   later allocation of a similar size can recycle it, or destroyed right away.
//!
//! - A [`Pipe`](crate::device::pipe::Pipe) identifies a hardware queue. Command streams are
//!   submitted to, and waited on, a pipe.
//!
//! - A [`Ringbuffer`](crate::ringbuffer::Ringbuffer) records command words into one or more
//!   BO-backed [segments](crate::ringbuffer::segment::CommandSegment). Every reference to another
//!   buffer or to another ring is deduplicated per submission, and
//!   [`flush`](crate::ringbuffer::Ringbuffer::flush) assembles the final descriptor (buffer list,
//!   command list and per-command relocations) and hands it to the kernel.

pub use bo::{cache::BoCache, BufferObject, ReusePolicy};
pub use device::{pipe::Pipe, Device, DeviceOwned, KernelDevice};
pub use ringbuffer::Ringbuffer;
use std::{error::Error, fmt};

#[macro_use]
mod tests;
mod macros;
pub mod bo;
pub mod device;
pub mod ringbuffer;

/// An error code reported by the kernel interface.
///
/// This is a thin wrapper over the (positive) `errno` value returned by the failing call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct KernelError(pub i32);

impl KernelError {
    pub const EPERM: Self = Self(1);
    pub const ENOENT: Self = Self(2);
    pub const EINTR: Self = Self(4);
    pub const EIO: Self = Self(5);
    pub const EAGAIN: Self = Self(11);
    pub const ENOMEM: Self = Self(12);
    pub const EFAULT: Self = Self(14);
    pub const EBUSY: Self = Self(16);
    pub const EINVAL: Self = Self(22);
    pub const ENOSPC: Self = Self(28);
    pub const ETIMEDOUT: Self = Self(110);

    /// Returns the raw `errno` value.
    #[inline]
    pub fn errno(self) -> i32 {
        self.0
    }
}

impl Error for KernelError {}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::EPERM => "operation not permitted",
            Self::ENOENT => "no such object",
            Self::EINTR => "interrupted",
            Self::EIO => "I/O error",
            Self::EAGAIN => "resource temporarily unavailable",
            Self::ENOMEM => "out of memory",
            Self::EFAULT => "bad address",
            Self::EBUSY => "device or resource busy",
            Self::EINVAL => "invalid argument",
            Self::ENOSPC => "no space left on device",
            Self::ETIMEDOUT => "timed out",
            _ => return write!(f, "kernel error (errno {})", self.0),
        };

        write!(f, "{} (errno {})", name, self.0)
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

const PAGE_SIZE: u32 = 4096;

/// Rounds `val` up to a multiple of `alignment`. Returns `None` if the result doesn't fit.
#[inline]
fn align_up(val: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());

    Some(val.checked_add(alignment - 1)? & !(alignment - 1))
}

// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Contiguous pieces of a command stream.

use crate::{
    bo::{AllocationError, BufferObject},
    macros::impl_id_counter,
};
use std::{
    num::NonZeroU64,
    ptr::{self, NonNull},
    slice,
};

/// A command word that the kernel patches with the address of a buffer object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Relocation {
    /// Index of the buffer object in the buffer table of the ring that recorded the word.
    pub bo_index: u32,

    /// Byte offset of the patched word within the segment's backing buffer.
    pub submit_offset: u32,

    /// Byte offset within the referenced buffer object.
    pub offset: u32,

    /// Bits ORed into the patched word.
    pub or: u32,

    /// How far the address is shifted before it is ORed in. Negative values shift right.
    pub shift: i32,
}

/// A range of a buffer object that command words are written into.
///
/// Words are appended at the write cursor, which only moves forward until the segment is
/// rewound. A segment that was chained to a successor is finalized and never written again.
#[derive(Debug)]
pub struct CommandSegment {
    id: NonZeroU64,
    bo: BufferObject,
    offset: u32,
    capacity: u32,
    cur: u32,
    size: u32,
    relocs: Vec<Relocation>,
    ptr: NonNull<u8>,
}

// `ptr` points into the mapping of `bo`, which is kept alive by `bo`.
unsafe impl Send for CommandSegment {}
unsafe impl Sync for CommandSegment {}

impl CommandSegment {
    /// Creates a segment covering `capacity` bytes of `bo`, starting at `offset`. The range must
    /// not overlap any other live segment.
    pub(crate) fn new(bo: BufferObject, offset: u32, capacity: u32) -> Result<Self, AllocationError> {
        assert!(offset % 4 == 0 && capacity % 4 == 0);
        assert!(u64::from(offset) + u64::from(capacity) <= u64::from(bo.size()));

        let base = bo.map()?;
        // SAFETY: `offset` is within the mapping, checked above.
        let ptr = unsafe { base.as_ptr().add(offset as usize) };
        // SAFETY: `base` is non-null and the offset doesn't wrap.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        Ok(CommandSegment {
            id: Self::next_id(),
            bo,
            offset,
            capacity,
            cur: 0,
            size: 0,
            relocs: Vec::new(),
            ptr,
        })
    }

    /// Returns the backing buffer object.
    #[inline]
    pub fn bo(&self) -> &BufferObject {
        &self.bo
    }

    /// Returns the offset of the segment within its buffer object.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns the number of bytes that fit in the segment.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns the number of bytes written so far.
    #[inline]
    pub fn len(&self) -> u32 {
        self.cur
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cur == 0
    }

    /// Returns the number of bytes that can still be written.
    #[inline]
    pub fn remaining(&self) -> u32 {
        self.capacity - self.cur
    }

    /// Returns the size the segment had when it was last finalized.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns the relocations recorded in the segment, in write order.
    #[inline]
    pub fn relocations(&self) -> &[Relocation] {
        &self.relocs
    }

    /// Returns the words written so far.
    pub fn words(&self) -> Vec<u32> {
        // SAFETY: the first `cur` bytes were initialized by `write`.
        let bytes = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.cur as usize) };

        bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Returns the byte offset within the backing buffer where the next word will be written.
    #[inline]
    pub(crate) fn write_offset(&self) -> u32 {
        self.offset + self.cur
    }

    pub(crate) fn write(&mut self, words: &[u32]) {
        let bytes: &[u8] = bytemuck::cast_slice(words);
        assert!(
            bytes.len() <= self.remaining() as usize,
            "command segment overflow",
        );

        // SAFETY: `cur` is within the segment.
        let dst = unsafe { self.ptr.as_ptr().add(self.cur as usize) };
        // SAFETY: the range is within the segment, checked above. The copy is bytewise since the
        // mapping may not be aligned to 4 bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        self.cur += bytes.len() as u32;
    }

    #[inline]
    pub(crate) fn push_relocation(&mut self, relocation: Relocation) {
        debug_assert_eq!(relocation.submit_offset, self.write_offset());
        self.relocs.push(relocation);
    }

    /// Fixes the size of the segment at the current write position.
    #[inline]
    pub(crate) fn finalize(&mut self) {
        self.size = self.cur;
    }

    /// Forgets the relocations, which only make sense within one submission.
    #[inline]
    pub(crate) fn clear_relocations(&mut self) {
        self.relocs.clear();
    }

    /// Moves the write cursor back to the start.
    pub(crate) fn rewind(&mut self) {
        self.cur = 0;
        self.size = 0;
        self.relocs.clear();
    }
}

impl_id_counter!(CommandSegment);

// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Recording and submission of command streams.
//!
//! A [`Ringbuffer`] records command words into [segments](segment::CommandSegment) that live in
//! buffer objects. Besides plain words, it records two kinds of references:
//!
//! - [Relocations](Ringbuffer::append_relocation): a word that the kernel patches with the GPU
//!   address of a buffer object. The buffer object is added to the ring's buffer table.
//! - [Ring references](Ringbuffer::append_ring_reference): a jump into a segment of another ring,
//!   typically a state object recorded once and executed from many command streams. The segment
//!   is added to the ring's command table.
//!
//! Both tables deduplicate, so a buffer object or segment referenced a thousand times still
//! appears once in the submission. On [`flush`](Ringbuffer::flush), the references of every
//! referenced ring are followed transitively and merged into the tables of the flushed ring,
//! which are then turned into the descriptor handed to the kernel.
//!
//! There are three flavors of ring:
//!
//! - Fixed-size rings have a single segment. They panic when they run out of space.
//! - Growable rings chain a new segment twice the size of the previous one when they run out of
//!   space. All chained segments are part of the next submission.
//! - State objects are never submitted directly, only referenced from other rings. Streaming
//!   state objects are suballocated from a buffer shared by the whole pipe, which makes them
//!   cheap enough to record once per draw.
//!
//! Rings referencing each other must not be flushed from different threads at the same time if
//! the references form a cycle.

use self::{
    segment::{CommandSegment, Relocation},
    submit::{FlushInfo, SubmissionBuilder, SubmitResult},
    table::{BoTable, CmdEntry, CmdTable, CmdTarget},
};
use crate::{
    bo::{AllocationError, BufferObject},
    device::{
        pipe::{Pipe, Timeout, WaitStatus},
        Device, DeviceOwned,
    },
    macros::{impl_id_counter, kernel_bitflags},
    KernelError, NonExhaustive,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt,
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

pub mod segment;
pub mod submit;
mod table;

kernel_bitflags! {
    /// Properties of a ringbuffer.
    RingbufferFlags = u32;

    /// The ring chains new segments when it runs out of space.
    GROWABLE = 0x1,

    /// The ring is a state object. It can't be flushed, only referenced from other rings.
    OBJECT = 0x2,

    /// The ring is a state object suballocated from the pipe's streaming buffer. Implies `OBJECT`.
    STREAMING = 0x4,
}

kernel_bitflags! {
    /// How the GPU accesses a buffer object referenced by a submission.
    RelocFlags = u32;

    /// The GPU reads from the buffer.
    READ = 0x1,

    /// The GPU writes to the buffer.
    WRITE = 0x2,

    /// The buffer is included in GPU crash dumps.
    DUMP = 0x4,
}

/// A reference to a buffer object, written as its (shifted) GPU address.
#[derive(Clone, Copy, Debug)]
pub struct Reloc<'a> {
    /// The buffer object whose address is written.
    pub bo: &'a BufferObject,

    /// How the GPU accesses the buffer object.
    pub flags: RelocFlags,

    /// Byte offset added to the address of the buffer object.
    pub offset: u32,

    /// Bits ORed into the low word.
    pub or: u32,

    /// How far the address is shifted. Negative values shift right.
    pub shift: i32,

    /// Bits ORed into the high word, on GPUs with wide addresses.
    pub orhi: u32,
}

impl<'a> Reloc<'a> {
    /// Returns a relocation of the start of `bo`, without any shifting or extra bits.
    #[inline]
    pub fn new(bo: &'a BufferObject, flags: RelocFlags) -> Self {
        Reloc {
            bo,
            flags,
            offset: 0,
            or: 0,
            shift: 0,
            orhi: 0,
        }
    }
}

/// Parameters to create a new `Ringbuffer`.
#[derive(Clone, Debug)]
pub struct RingbufferCreateInfo {
    /// The size in bytes of the first segment. Must be a multiple of 4.
    ///
    /// The default value is `0x1000`.
    pub size: u32,

    /// The flavor of the ring.
    ///
    /// The default value is empty, which is a fixed-size ring.
    pub flags: RingbufferFlags,

    pub _ne: NonExhaustive,
}

impl Default for RingbufferCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            size: 0x1000,
            flags: RingbufferFlags::empty(),
            _ne: NonExhaustive(()),
        }
    }
}

/// A command stream under construction.
pub struct Ringbuffer {
    id: NonZeroU64,
    pipe: Arc<Pipe>,
    flags: RingbufferFlags,
    initial_size: u32,
    last_timestamp: AtomicU32,
    state: Mutex<RingState>,
}

#[derive(Debug)]
pub(crate) struct RingState {
    // Size of the next segment to allocate.
    size: u32,
    segments: SmallVec<[CommandSegment; 1]>,
    bos: BoTable,
    cmds: CmdTable,
    section: Option<Section>,
    // Where the last successful submission of a fixed-size ring ended.
    flushed_to: u32,
}

#[derive(Clone, Copy, Debug)]
struct Section {
    reserved: u32,
    written: u32,
}

impl Ringbuffer {
    /// Creates a new `Ringbuffer` and allocates its first segment.
    ///
    /// # Panics
    ///
    /// - Panics if `create_info.size` is 0 or not a multiple of 4.
    /// - Panics if `create_info.flags` contains both `GROWABLE` and `OBJECT` or `STREAMING`.
    pub fn new(
        pipe: Arc<Pipe>,
        create_info: RingbufferCreateInfo,
    ) -> Result<Arc<Ringbuffer>, AllocationError> {
        let RingbufferCreateInfo {
            size,
            mut flags,
            _ne: _,
        } = create_info;

        assert!(size != 0 && size % 4 == 0);

        if flags.contains(RingbufferFlags::STREAMING) {
            flags |= RingbufferFlags::OBJECT;
        }

        assert!(
            !(flags.contains(RingbufferFlags::GROWABLE) && flags.contains(RingbufferFlags::OBJECT)),
            "state objects can't grow",
        );

        let generation = pipe.device().next_generation();
        let mut ring = Ringbuffer {
            id: Self::next_id(),
            pipe,
            flags,
            initial_size: size,
            last_timestamp: AtomicU32::new(0),
            state: Mutex::new(RingState {
                size,
                segments: SmallVec::new(),
                bos: BoTable::new(generation),
                cmds: CmdTable::default(),
                section: None,
                flushed_to: 0,
            }),
        };

        let segment = ring.new_segment(size)?;
        ring.state.get_mut().segments.push(segment);

        log::trace!("created ringbuffer {} ({:?}, {} bytes)", ring.id, flags, size);

        Ok(Arc::new(ring))
    }

    /// Creates a fixed-size state object.
    #[inline]
    pub fn new_object(pipe: Arc<Pipe>, size: u32) -> Result<Arc<Ringbuffer>, AllocationError> {
        Self::new(
            pipe,
            RingbufferCreateInfo {
                size,
                flags: RingbufferFlags::OBJECT,
                ..Default::default()
            },
        )
    }

    /// Creates a streaming state object.
    #[inline]
    pub fn new_streaming(
        pipe: Arc<Pipe>,
        size: u32,
    ) -> Result<Arc<Ringbuffer>, AllocationError> {
        Self::new(
            pipe,
            RingbufferCreateInfo {
                size,
                flags: RingbufferFlags::STREAMING,
                ..Default::default()
            },
        )
    }

    #[inline]
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    #[inline]
    pub fn flags(&self) -> RingbufferFlags {
        self.flags
    }

    #[inline]
    pub fn is_growable(&self) -> bool {
        self.flags.contains(RingbufferFlags::GROWABLE)
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        self.flags.contains(RingbufferFlags::OBJECT)
    }

    /// Returns the fence of the last submission that executed this ring, or 0 if there was none.
    #[inline]
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    /// Waits for the last submission that executed this ring.
    pub fn wait(&self, timeout: Timeout) -> Result<WaitStatus, KernelError> {
        self.pipe.wait(self.last_timestamp(), timeout)
    }

    /// Appends one word.
    ///
    /// # Panics
    ///
    /// - Panics if the ring isn't growable and the word doesn't fit.
    pub fn emit(&self, word: u32) -> Result<(), RingError> {
        self.emit_words(&[word])
    }

    /// Appends words. They always end up contiguous in one segment.
    ///
    /// # Panics
    ///
    /// - Panics if the ring isn't growable and the words don't fit.
    pub fn emit_words(&self, words: &[u32]) -> Result<(), RingError> {
        let mut state = self.state.lock();
        self.current_segment(&mut state, words.len() as u32)?
            .write(words);
        state.account(words.len() as u32);

        Ok(())
    }

    /// Appends a relocation: the GPU address of `reloc.bo` plus `reloc.offset`, shifted by
    /// `reloc.shift` and ORed with `reloc.or`. On GPUs with wide addresses, the high word follows,
    /// ORed with `reloc.orhi`.
    ///
    /// Returns the index of the buffer object in this ring's buffer table. Referencing the same
    /// buffer object again returns the same index, with the access flags merged.
    ///
    /// # Panics
    ///
    /// - Panics if `reloc.bo` belongs to another device.
    /// - Panics if the ring isn't growable and the address doesn't fit.
    pub fn append_relocation(&self, reloc: &Reloc<'_>) -> Result<u32, RingError> {
        assert_eq!(reloc.bo.device(), self.device());

        let mut state = self.state.lock();

        Ok(self.append_relocation_locked(&mut state, reloc)?)
    }

    fn append_relocation_locked(
        &self,
        state: &mut RingState,
        reloc: &Reloc<'_>,
    ) -> Result<u32, AllocationError> {
        let wide = self.pipe.has_wide_addresses();
        let ndwords = if wide { 2 } else { 1 };

        // Reserve first, so that the relocations land in the segment the words do.
        self.current_segment(state, ndwords)?;

        let bo_index = state.bos.add(reloc.bo, reloc.flags);
        let address = reloc.bo.iova() + u64::from(reloc.offset);
        let segment = state.last_segment_mut();

        segment.push_relocation(Relocation {
            bo_index,
            submit_offset: segment.write_offset(),
            offset: reloc.offset,
            or: reloc.or,
            shift: reloc.shift,
        });
        segment.write(&[shift_address(address, reloc.shift) | reloc.or]);

        if wide {
            segment.push_relocation(Relocation {
                bo_index,
                submit_offset: segment.write_offset(),
                offset: reloc.offset,
                or: reloc.orhi,
                shift: reloc.shift - 32,
            });
            segment.write(&[shift_address(address, reloc.shift - 32) | reloc.orhi]);
        }

        state.account(ndwords);

        Ok(bo_index)
    }

    /// Appends the address of segment `segment_index` of `target`, and makes that segment part of
    /// every submission of this ring until the next reset.
    ///
    /// Returns the size in bytes of the referenced segment, which the caller needs to encode the
    /// jump. For the last segment of `target`, this is what has been written so far.
    ///
    /// # Panics
    ///
    /// - Panics if `target` is `self`, or belongs to another device.
    /// - Panics if `target` has no segment `segment_index`.
    /// - Panics if the ring isn't growable and the address doesn't fit.
    pub fn append_ring_reference(
        &self,
        target: &Arc<Ringbuffer>,
        segment_index: usize,
    ) -> Result<u32, RingError> {
        assert_ne!(self.id, target.id, "a ringbuffer can't reference itself");
        assert_eq!(target.device(), self.device());

        // Never hold both locks at once.
        let (cmd, bo) = {
            let target_state = target.state.lock();
            let count = target_state.segments.len();
            let segment = target_state.segments.get(segment_index).unwrap_or_else(|| {
                panic!(
                    "segment index {} out of range for a ringbuffer with {} segments",
                    segment_index, count,
                )
            });
            let size = if segment_index + 1 == count {
                segment.len()
            } else {
                segment.size()
            };

            let cmd = CmdEntry::new(
                CmdTarget::Ring(target.clone()),
                segment_index,
                segment,
                segment.offset(),
                size,
            );

            (cmd, segment.bo().clone())
        };

        let (size, offset) = (cmd.size, cmd.submit_offset);
        let mut state = self.state.lock();

        let (_, added) = state.cmds.register(cmd);

        if added {
            log::trace!(
                "ringbuffer {} references segment {} of ringbuffer {}",
                self.id,
                segment_index,
                target.id,
            );
        }

        let reloc = Reloc {
            offset,
            ..Reloc::new(&bo, RelocFlags::READ)
        };
        self.append_relocation_locked(&mut state, &reloc)?;

        Ok(size)
    }

    /// Makes sure that the next `ndwords` words end up contiguous in one segment, and starts
    /// counting the words written until [`end_section`](Self::end_section).
    ///
    /// # Panics
    ///
    /// - Panics if a section is already open.
    /// - Panics if the ring isn't growable and the words don't fit.
    pub fn begin_section(&self, ndwords: u32) -> Result<(), RingError> {
        let mut state = self.state.lock();
        assert!(state.section.is_none(), "sections can't be nested");

        self.current_segment(&mut state, ndwords)?;
        state.section = Some(Section {
            reserved: ndwords,
            written: 0,
        });

        Ok(())
    }

    /// Closes the open section, checking that exactly the reserved number of words was written.
    ///
    /// # Panics
    ///
    /// - Panics if no section is open.
    pub fn end_section(&self) -> Result<(), RingError> {
        let Section { reserved, written } = self
            .state
            .lock()
            .section
            .take()
            .expect("no section is open");

        if reserved != written {
            log::error!(
                "ringbuffer {}: section of {} words closed after {} words",
                self.id,
                reserved,
                written,
            );

            return Err(RingError::SectionMismatch { reserved, written });
        }

        Ok(())
    }

    /// Chains a new segment of `size` bytes. The current one is finalized and becomes part of
    /// the next submission. An empty current segment is replaced instead.
    ///
    /// This happens on its own when a write doesn't fit anymore, so calling it directly is only
    /// useful to control the size of the next segment.
    ///
    /// # Panics
    ///
    /// - Panics if the ring isn't growable.
    pub fn grow(&self, size: u32) -> Result<(), RingError> {
        assert!(self.is_growable(), "only growable ringbuffers can grow");
        assert!(size != 0 && size % 4 == 0);

        let mut state = self.state.lock();

        Ok(self.grow_locked(&mut state, size)?)
    }

    fn grow_locked(&self, state: &mut RingState, size: u32) -> Result<(), AllocationError> {
        // Allocate first, so that a failure leaves the current segment open.
        let segment = self.new_segment(size)?;

        if let Some(index) = state.segments.len().checked_sub(1) {
            let current = &mut state.segments[index];

            if current.is_empty() {
                // Nothing to execute, so it's replaced rather than chained.
                state.segments.pop();
            } else {
                current.finalize();

                let cmd = CmdEntry::new(
                    CmdTarget::Own,
                    index,
                    current,
                    current.offset(),
                    current.size(),
                );
                state.cmds.register(cmd);
            }
        }

        log::debug!(
            "ringbuffer {} grows to {} segments of up to {} bytes",
            self.id,
            state.segments.len() + 1,
            size,
        );

        state.segments.push(segment);
        state.size = size;

        Ok(())
    }

    // Returns the segment to write the next `ndwords` words into, growing if needed.
    fn current_segment<'s>(
        &self,
        state: &'s mut RingState,
        ndwords: u32,
    ) -> Result<&'s mut CommandSegment, AllocationError> {
        let bytes = ndwords * 4;

        if state.segments.is_empty() {
            // A reset couldn't allocate a fresh segment, try again now.
            let size = state.size.max(bytes.next_power_of_two());
            let segment = self.new_segment(size)?;
            state.segments.push(segment);
            state.size = size;
        }

        if state.last_segment_mut().remaining() < bytes {
            if !self.is_growable() {
                panic!(
                    "ringbuffer overflow: {} bytes requested, {} bytes left",
                    bytes,
                    state.last_segment_mut().remaining(),
                );
            }

            let mut size = state.size.saturating_mul(2);

            while size < bytes {
                size = size.saturating_mul(2);
            }

            self.grow_locked(state, size)?;
        }

        Ok(state.last_segment_mut())
    }

    fn new_segment(&self, size: u32) -> Result<CommandSegment, AllocationError> {
        if self.flags.contains(RingbufferFlags::STREAMING) {
            let (bo, offset) = self.pipe.suballocate(size)?;

            CommandSegment::new(bo, offset, size)
        } else {
            let bo = self.pipe.device().allocate_ring_bo(size)?;

            CommandSegment::new(bo, 0, size)
        }
    }

    /// Submits the ring, and everything it references, to its pipe.
    ///
    /// On success, every ring that took part is stamped with the returned fence, and this ring
    /// is reset for the next submission. On failure, nothing is reset. The caller can flush
    /// again, or discard the recorded state with [`reset`](Self::reset).
    ///
    /// # Panics
    ///
    /// - Panics if the ring is a state object.
    /// - Panics if `flush_info.last_start` is past the end of what was written to the last
    ///   segment.
    /// - Panics if a referenced ring was reset after the reference was recorded.
    pub fn flush(&self, flush_info: FlushInfo) -> Result<SubmitResult, RingError> {
        assert!(!self.is_object(), "state objects can't be flushed");

        let mut state = self.state.lock();
        let result = SubmissionBuilder::new(self, &mut state).submit(flush_info)?;
        self.reset_locked(&mut state, false);

        Ok(result)
    }

    /// Discards everything recorded since the last submission, and moves the write position of a
    /// fixed-size ring back to the start.
    ///
    /// The GPU may still be executing the previous submission, see [`wait`](Self::wait).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.reset_locked(&mut state, true);
    }

    fn reset_locked(&self, state: &mut RingState, rewind: bool) {
        let generation = self.device().next_generation();
        state.bos.reset(generation);
        state.cmds.clear();
        state.section = None;

        if self.is_growable() {
            state.segments.clear();
            state.size = self.initial_size;
            state.flushed_to = 0;

            match self.new_segment(self.initial_size) {
                Ok(segment) => state.segments.push(segment),
                Err(err) => {
                    log::warn!(
                        "ringbuffer {} couldn't allocate a fresh segment, deferring: {}",
                        self.id,
                        err,
                    );
                }
            }
        } else {
            for segment in &mut state.segments {
                if rewind {
                    segment.rewind();
                } else {
                    segment.clear_relocations();
                }
            }

            state.flushed_to = if rewind {
                0
            } else {
                state.segments.last().map_or(0, CommandSegment::len)
            };
        }
    }

    /// Returns the number of segments.
    pub fn segment_count(&self) -> usize {
        self.state.lock().segments.len()
    }

    /// Returns the size in bytes of segment `index`. For the last segment, this is what has been
    /// written so far.
    pub fn segment_size(&self, index: usize) -> u32 {
        let state = self.state.lock();
        let segment = &state.segments[index];

        if index + 1 == state.segments.len() {
            segment.len()
        } else {
            segment.size()
        }
    }

    /// Returns the offset of segment `index` within its buffer object.
    pub fn segment_offset(&self, index: usize) -> u32 {
        self.state.lock().segments[index].offset()
    }

    /// Returns the words written to segment `index`.
    pub fn segment_words(&self, index: usize) -> Vec<u32> {
        self.state.lock().segments[index].words()
    }

    /// Returns the relocations recorded in segment `index` since the last submission.
    pub fn relocations(&self, index: usize) -> Vec<Relocation> {
        self.state.lock().segments[index].relocations().to_vec()
    }

    /// Returns the number of distinct buffer objects referenced since the last submission.
    pub fn bo_count(&self) -> usize {
        self.state.lock().bos.len()
    }

    /// Returns the number of distinct segments of other rings referenced since the last
    /// submission.
    pub fn reference_count(&self) -> usize {
        self.state
            .lock()
            .cmds
            .entries()
            .iter()
            .filter(|cmd| matches!(cmd.target, CmdTarget::Ring(_)))
            .count()
    }
}

impl_id_counter!(Ringbuffer);

impl RingState {
    fn last_segment_mut(&mut self) -> &mut CommandSegment {
        let last = self.segments.len() - 1;

        &mut self.segments[last]
    }

    fn account(&mut self, ndwords: u32) {
        if let Some(section) = &mut self.section {
            section.written += ndwords;
        }
    }
}

unsafe impl DeviceOwned for Ringbuffer {
    #[inline]
    fn device(&self) -> &Arc<Device> {
        self.pipe.device()
    }
}

impl fmt::Debug for Ringbuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ringbuffer")
            .field("id", &self.id)
            .field("pipe", &self.pipe.id())
            .field("flags", &self.flags)
            .field("last_timestamp", &self.last_timestamp())
            .finish_non_exhaustive()
    }
}

impl Drop for Ringbuffer {
    fn drop(&mut self) {
        log::trace!("destroying ringbuffer {}", self.id);
    }
}

fn shift_address(address: u64, shift: i32) -> u32 {
    let shifted = if shift < 0 {
        address.checked_shr(shift.unsigned_abs())
    } else {
        address.checked_shl(shift.unsigned_abs())
    };

    shifted.unwrap_or(0) as u32
}

/// Error that can be returned when recording or submitting a ringbuffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingError {
    /// A new segment couldn't be allocated.
    Allocation(AllocationError),

    /// A section wasn't filled with exactly the number of words reserved for it.
    SectionMismatch { reserved: u32, written: u32 },

    /// The kernel rejected the submission.
    SubmissionRejected(KernelError),
}

impl Error for RingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Allocation(err) => Some(err),
            Self::SubmissionRejected(err) => Some(err),
            Self::SectionMismatch { .. } => None,
        }
    }
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allocation(_) => write!(f, "failed to allocate a command segment"),
            Self::SectionMismatch { reserved, written } => write!(
                f,
                "{} words were reserved for the section, but {} were written",
                reserved, written,
            ),
            Self::SubmissionRejected(_) => write!(f, "the kernel rejected the submission"),
        }
    }
}

impl From<AllocationError> for RingError {
    #[inline]
    fn from(err: AllocationError) -> Self {
        Self::Allocation(err)
    }
}

// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-submission deduplication tables.
//!
//! Every buffer object and every command segment that a submission touches must appear exactly
//! once in the descriptor handed to the kernel, no matter how often it's referenced. The tables
//! here assign each a stable index on first sight and return that same index afterwards.

use super::{segment::CommandSegment, RelocFlags, Ringbuffer};
use crate::bo::BufferObject;
use foldhash::HashMap;
use std::{collections::hash_map::Entry, num::NonZeroU64, sync::Arc};

/// A buffer object used by a submission, with the union of all the ways it's accessed.
#[derive(Debug)]
pub(crate) struct BoEntry {
    pub(crate) bo: BufferObject,
    pub(crate) flags: RelocFlags,
}

/// The buffer objects referenced by one ring since its last reset, in first-seen order.
///
/// Lookups first try the index cached on the buffer object itself, which is only trusted if it was
/// stored under this table's generation. A fresh generation on every reset makes all cached
/// indices stale at once.
#[derive(Debug)]
pub(crate) struct BoTable {
    entries: Vec<BoEntry>,
    index: HashMap<NonZeroU64, u32>,
    generation: u32,
}

impl BoTable {
    pub(crate) fn new(generation: u32) -> Self {
        BoTable {
            entries: Vec::new(),
            index: HashMap::default(),
            generation,
        }
    }

    /// Returns the index of `bo`, adding it if it isn't in the table yet. `flags` are merged into
    /// the entry either way.
    pub(crate) fn add(&mut self, bo: &BufferObject, flags: RelocFlags) -> u32 {
        let obj = bo.object();

        if let Some(index) = obj.table_hint(self.generation) {
            if let Some(entry) = self.entries.get_mut(index as usize) {
                if entry.bo == *bo {
                    entry.flags |= flags;
                    return index;
                }
            }
        }

        let index = match self.index.entry(obj.id()) {
            Entry::Occupied(entry) => {
                let index = *entry.get();
                self.entries[index as usize].flags |= flags;

                index
            }
            Entry::Vacant(entry) => {
                let index = self.entries.len() as u32;
                self.entries.push(BoEntry {
                    bo: bo.clone(),
                    flags,
                });
                entry.insert(index);

                index
            }
        };

        obj.set_table_hint(self.generation, index);

        index
    }

    #[inline]
    pub(crate) fn get(&self, index: u32) -> &BoEntry {
        &self.entries[index as usize]
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[BoEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    /// Empties the table, dropping its buffer object references, and starts a new generation.
    pub(crate) fn reset(&mut self, generation: u32) {
        debug_assert_ne!(generation, self.generation);

        self.entries.clear();
        self.index.clear();
        self.generation = generation;
    }
}

/// The ring whose segment a command refers to.
#[derive(Clone, Debug)]
pub(crate) enum CmdTarget {
    /// The ring that owns the table.
    Own,

    /// Another ring, kept alive until the table is cleared.
    Ring(Arc<Ringbuffer>),
}

/// A command segment that a submission executes.
#[derive(Clone, Debug)]
pub(crate) struct CmdEntry {
    pub(crate) target: CmdTarget,
    pub(crate) segment_index: usize,
    pub(crate) segment_id: NonZeroU64,
    /// Start of the executed range within the segment's buffer object.
    pub(crate) submit_offset: u32,
    pub(crate) size: u32,
}

impl CmdEntry {
    pub(crate) fn new(
        target: CmdTarget,
        segment_index: usize,
        segment: &CommandSegment,
        submit_offset: u32,
        size: u32,
    ) -> Self {
        CmdEntry {
            target,
            segment_index,
            segment_id: segment.id(),
            submit_offset,
            size,
        }
    }
}

/// The command segments executed by one submission, in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct CmdTable {
    entries: Vec<CmdEntry>,
    index: HashMap<NonZeroU64, u32>,
}

impl CmdTable {
    /// Adds a command unless its segment is already in the table. Returns the index and whether
    /// it was added.
    ///
    /// Registering a segment again refreshes the executed range. For segments of other rings,
    /// the range only ever grows, since another reference may have been recorded while the
    /// segment was shorter.
    pub(crate) fn register(&mut self, cmd: CmdEntry) -> (u32, bool) {
        match self.index.entry(cmd.segment_id) {
            Entry::Occupied(entry) => {
                let index = *entry.get();
                let existing = &mut self.entries[index as usize];

                match cmd.target {
                    CmdTarget::Own => {
                        existing.submit_offset = cmd.submit_offset;
                        existing.size = cmd.size;
                    }
                    CmdTarget::Ring(_) => existing.size = existing.size.max(cmd.size),
                }

                (index, false)
            }
            Entry::Vacant(entry) => {
                let index = self.entries.len() as u32;
                entry.insert(index);
                self.entries.push(cmd);

                (index, true)
            }
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &CmdEntry {
        &self.entries[index]
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[CmdEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Empties the table, releasing the references to other rings.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BoFlags;

    #[test]
    fn dedup_merges_flags() {
        let (device, _kernel) = mock_device!();
        let a = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let b = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        let mut table = BoTable::new(device.next_generation());
        assert_eq!(table.add(&a, RelocFlags::READ), 0);
        assert_eq!(table.add(&b, RelocFlags::READ), 1);
        assert_eq!(table.add(&a, RelocFlags::WRITE), 0);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).flags, RelocFlags::READ | RelocFlags::WRITE);
        assert_eq!(table.get(1).flags, RelocFlags::READ);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn reset_invalidates_hints() {
        let (device, _kernel) = mock_device!();
        let a = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let b = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        let mut table = BoTable::new(device.next_generation());
        table.add(&a, RelocFlags::READ);
        table.add(&b, RelocFlags::READ);
        assert_eq!(b.object().table_hint(table.generation()), Some(1));

        table.reset(device.next_generation());
        assert_eq!(table.len(), 0);
        assert_eq!(a.refcount(), 1);
        assert_eq!(b.object().table_hint(table.generation()), None);

        // `b` comes first now.
        assert_eq!(table.add(&b, RelocFlags::READ), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn hints_of_other_tables_are_verified() {
        let (device, _kernel) = mock_device!();
        let a = device.allocate_bo(4096, BoFlags::empty()).unwrap();
        let b = device.allocate_bo(4096, BoFlags::empty()).unwrap();

        let generation = device.next_generation();
        let mut first = BoTable::new(generation);
        let mut second = BoTable::new(generation);

        first.add(&a, RelocFlags::READ);
        second.add(&b, RelocFlags::READ);
        // `a` carries a hint for index 0 under the shared generation, which is `b` in `second`.
        assert_eq!(second.add(&a, RelocFlags::READ), 1);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn commands_register_once() {
        let (device, _kernel) = mock_device!();
        let bo = device.allocate_ring_bo(4096).unwrap();
        let segment = CommandSegment::new(bo, 0, 4096).unwrap();

        let mut table = CmdTable::default();
        let (index, added) = table.register(CmdEntry::new(CmdTarget::Own, 0, &segment, 0, 16));
        assert_eq!((index, added), (0, true));

        let (index, added) = table.register(CmdEntry::new(CmdTarget::Own, 0, &segment, 8, 24));
        assert_eq!((index, added), (0, false));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).submit_offset, 8);
        assert_eq!(table.get(0).size, 24);

        table.clear();
        assert_eq!(table.len(), 0);
    }
}

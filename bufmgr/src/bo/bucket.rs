// Copyright (c) 2024 The bufmgr developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Size classes of a buffer object cache.

use super::cache::CachedBo;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Upper bound on the number of buckets of one cache. The fine-grained table uses 55 of them.
pub(crate) const MAX_BUCKETS: usize = 64;

const SMALLEST_POWER_OF_TWO: u32 = 16 * 1024;
const LARGEST_POWER_OF_TWO: u32 = 64 * 1024 * 1024;

/// One size class: a size and the free list of cached buffer objects of exactly that size, the
/// oldest at the front.
#[derive(Debug)]
pub(crate) struct Bucket {
    size: u32,
    pub(super) free_list: VecDeque<CachedBo>,
}

impl Bucket {
    #[inline]
    pub(crate) fn size(&self) -> u32 {
        self.size
    }
}

/// The ordered list of size classes of a cache.
#[derive(Debug)]
pub(crate) struct BucketTable {
    buckets: SmallVec<[Bucket; MAX_BUCKETS]>,
}

impl BucketTable {
    /// Creates the size classes.
    ///
    /// Both flavors start with 4 KiB and 8 KiB, followed by every power of two from 16 KiB to
    /// 64 MiB. The fine-grained flavor (`coarse == false`) adds 12 KiB and, for every power of two,
    /// three intermediate steps at 1.25, 1.5 and 1.75 times its size. Ring buffers use the coarse
    /// flavor since their sizes are always powers of two.
    pub(crate) fn new(coarse: bool) -> Self {
        let mut table = BucketTable {
            buckets: SmallVec::new(),
        };

        table.add(4096);
        table.add(4096 * 2);

        if !coarse {
            table.add(4096 * 3);
        }

        let mut size = SMALLEST_POWER_OF_TWO;

        while size <= LARGEST_POWER_OF_TWO {
            table.add(size);

            if !coarse {
                table.add(size + size / 4);
                table.add(size + size * 2 / 4);
                table.add(size + size * 3 / 4);
            }

            size *= 2;
        }

        table
    }

    fn add(&mut self, size: u32) {
        assert!(
            self.buckets.len() < MAX_BUCKETS,
            "too many cache buckets",
        );
        debug_assert!(self.buckets.last().is_none_or(|last| last.size < size));

        self.buckets.push(Bucket {
            size,
            free_list: VecDeque::new(),
        });
    }

    /// Returns the index of the smallest bucket whose size is at least `size`, or `None` if the
    /// size is larger than every bucket.
    pub(crate) fn find(&self, size: u32) -> Option<usize> {
        // Linear scan. There are few buckets and small sizes are by far the most common.
        self.buckets.iter().position(|bucket| bucket.size >= size)
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &Bucket {
        &self.buckets[index]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Bucket {
        &mut self.buckets[index]
    }

    #[inline]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter()
    }

    #[inline]
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Bucket> {
        self.buckets.iter_mut()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }
}

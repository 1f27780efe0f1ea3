// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Address-ordered free region list for one bank.

/// A contiguous byte range inside a bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

impl Region {
    pub(crate) fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Region search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fit {
    /// Lowest address that fits.
    First,
    /// Smallest region that fits, lowest address on ties.
    Best,
}

/// Free regions of one bank, sorted by offset and never adjacent.
#[derive(Debug, Clone)]
pub(crate) struct FreeList {
    capacity: usize,
    free: Vec<Region>,
    free_bytes: usize,
}

impl FreeList {
    pub(crate) fn new(capacity: usize) -> Self {
        let free = if capacity > 0 {
            vec![Region {
                offset: 0,
                size: capacity,
            }]
        } else {
            Vec::new()
        };
        Self {
            capacity,
            free,
            free_bytes: capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub(crate) fn largest_free(&self) -> usize {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }

    fn find(&self, size: usize, fit: Fit) -> Option<usize> {
        match fit {
            Fit::First => self.free.iter().position(|r| r.size >= size),
            Fit::Best => self
                .free
                .iter()
                .enumerate()
                .filter(|(_, r)| r.size >= size)
                .min_by_key(|(_, r)| r.size)
                .map(|(index, _)| index),
        }
    }

    /// Carves `size` bytes from the front of a fitting region.
    pub(crate) fn allocate(&mut self, size: usize, fit: Fit) -> Option<usize> {
        let index = self.find(size, fit)?;
        let region = &mut self.free[index];
        let offset = region.offset;
        region.offset += size;
        region.size -= size;
        if region.size == 0 {
            self.free.remove(index);
        }
        self.free_bytes -= size;
        Some(offset)
    }

    /// Lowest offset below `limit` where `size` bytes fit.
    pub(crate) fn lowest_fit_below(&self, size: usize, limit: usize) -> Option<usize> {
        self.free
            .iter()
            .take_while(|r| r.offset < limit)
            .find(|r| r.size >= size)
            .map(|r| r.offset)
    }

    /// Marks `offset..offset + size` as used. The range must be free.
    pub(crate) fn reserve(&mut self, offset: usize, size: usize) -> bool {
        let index = self.free.partition_point(|r| r.end() <= offset);
        let Some(region) = self.free.get(index).copied() else {
            return false;
        };
        if region.offset > offset || region.end() < offset + size {
            return false;
        }
        let head = Region {
            offset: region.offset,
            size: offset - region.offset,
        };
        let tail = Region {
            offset: offset + size,
            size: region.end() - (offset + size),
        };
        match (head.size > 0, tail.size > 0) {
            (true, true) => {
                self.free[index] = head;
                self.free.insert(index + 1, tail);
            }
            (true, false) => self.free[index] = head,
            (false, true) => self.free[index] = tail,
            (false, false) => {
                self.free.remove(index);
            }
        }
        self.free_bytes -= size;
        true
    }

    /// Returns `offset..offset + size` to the list, merging with neighbours.
    pub(crate) fn release(&mut self, offset: usize, size: usize) {
        debug_assert!(offset + size <= self.capacity(), "release past bank end");
        let index = self.free.partition_point(|r| r.offset < offset);
        debug_assert!(
            index == 0 || self.free[index - 1].end() <= offset,
            "release overlaps a free region"
        );
        debug_assert!(
            index == self.free.len() || offset + size <= self.free[index].offset,
            "release overlaps a free region"
        );

        let merges_prev = index > 0 && self.free[index - 1].end() == offset;
        let merges_next = index < self.free.len() && self.free[index].offset == offset + size;
        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += size + next.size;
            }
            (true, false) => self.free[index - 1].size += size,
            (false, true) => {
                self.free[index].offset = offset;
                self.free[index].size += size;
            }
            (false, false) => self.free.insert(index, Region { offset, size }),
        }
        self.free_bytes += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_coalesces_neighbours() {
        let mut list = FreeList::new(1024);
        let a = list.allocate(256, Fit::First).unwrap();
        let b = list.allocate(256, Fit::First).unwrap();
        let c = list.allocate(256, Fit::First).unwrap();
        assert_eq!((a, b, c), (0, 256, 512));

        list.release(a, 256);
        list.release(c, 256);
        assert_eq!(list.largest_free(), 512, "c merges with the tail");

        list.release(b, 256);
        assert_eq!(list.largest_free(), 1024);
        assert_eq!(list.free_bytes(), list.capacity());
    }

    #[test]
    fn test_best_fit_prefers_the_tightest_hole() {
        let mut list = FreeList::new(2048);
        let offsets: Vec<_> = (0..4)
            .map(|_| list.allocate(512, Fit::First).unwrap())
            .collect();
        // Holes: 512 at 0, then 128 carved out of the slot at 1024.
        list.release(offsets[0], 512);
        list.release(offsets[2], 512);
        assert!(list.reserve(1024 + 128, 384));

        assert_eq!(list.allocate(128, Fit::Best), Some(1024));
        assert_eq!(list.allocate(128, Fit::First), Some(0));
    }

    #[test]
    fn test_reserve_splits_and_rejects_used_ranges() {
        let mut list = FreeList::new(1024);
        assert!(list.reserve(256, 128));
        assert_eq!(list.free_bytes(), 896);
        assert!(!list.reserve(300, 128), "inside a used range");
        assert!(!list.reserve(128, 256), "straddles a used range");
        assert_eq!(list.lowest_fit_below(128, 1024), Some(0));
        assert_eq!(list.lowest_fit_below(512, 384), None);
        assert_eq!(list.lowest_fit_below(512, 1024), Some(384));
    }
}

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

//! Fixed-slot partition allocator.
//!
//! `table[..partition]` holds the allocated slots and `table[partition..]`
//! the free ones; `remap[slot]` is the slot's position in `table`. Both
//! allocate and free are O(1): freeing swaps the slot with the last
//! allocated one and shrinks the partition.

#[derive(Debug, Clone)]
pub(crate) struct PartitionAllocator {
    table: Vec<u32>,
    remap: Vec<u32>,
    partition: usize,
}

impl PartitionAllocator {
    pub(crate) fn new(capacity: usize) -> Self {
        let table: Vec<u32> = (0..capacity as u32).collect();
        Self {
            remap: table.clone(),
            table,
            partition: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.partition
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.partition == 0
    }

    pub(crate) fn allocate(&mut self) -> Option<u32> {
        if self.partition >= self.capacity() {
            return None;
        }
        let slot = self.table[self.partition];
        self.partition += 1;
        Some(slot)
    }

    /// Returns `false` for a slot that is not allocated.
    pub(crate) fn free(&mut self, slot: u32) -> bool {
        let Some(&position) = self.remap.get(slot as usize) else {
            return false;
        };
        let position = position as usize;
        if position >= self.partition {
            return false;
        }
        self.partition -= 1;
        let last = self.table[self.partition];
        self.table.swap(position, self.partition);
        self.remap[last as usize] = position as u32;
        self.remap[slot as usize] = self.partition as u32;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_until_full() {
        let mut slots = PartitionAllocator::new(3);
        assert_eq!(slots.allocate(), Some(0));
        assert_eq!(slots.allocate(), Some(1));
        assert_eq!(slots.allocate(), Some(2));
        assert_eq!(slots.allocate(), None);
        assert_eq!(slots.len(), 3);
    }

    #[test]
    fn test_free_swaps_with_last() {
        let mut slots = PartitionAllocator::new(4);
        for _ in 0..4 {
            slots.allocate();
        }
        assert!(slots.free(1));
        assert!(slots.free(3));
        assert!(!slots.free(1), "double free is rejected");
        assert_eq!(slots.len(), 2);

        let mut again = [slots.allocate().unwrap(), slots.allocate().unwrap()];
        again.sort_unstable();
        assert_eq!(again, [1, 3]);
        assert_eq!(slots.allocate(), None);
    }

    #[test]
    fn test_free_everything_in_any_order() {
        let mut slots = PartitionAllocator::new(8);
        let taken: Vec<u32> = (0..8).filter_map(|_| slots.allocate()).collect();
        for slot in taken.iter().rev().step_by(2).chain(taken.iter().step_by(2)) {
            assert!(slots.free(*slot));
        }
        assert!(slots.is_empty());
        assert!(!slots.free(9));
    }
}

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

//! The non-defragmenting allocator: one free list per bank, searched in
//! bank order.

use super::free_list::{Fit, FreeList};
use super::{AllocFailure, Allocation};

#[derive(Debug)]
pub(crate) struct DirectAllocator {
    banks: Vec<FreeList>,
    fit: Fit,
    max_allocs: usize,
    live: usize,
}

impl DirectAllocator {
    pub(crate) fn new(fit: Fit, max_allocs: usize) -> Self {
        Self {
            banks: Vec::new(),
            fit,
            max_allocs,
            live: 0,
        }
    }

    pub(crate) fn extend(&mut self, capacity: usize) {
        self.banks.push(FreeList::new(capacity));
    }

    pub(crate) fn bank_count(&self) -> usize {
        self.banks.len()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<Allocation, AllocFailure> {
        if self.live >= self.max_allocs {
            return Err(AllocFailure::HandlesExhausted);
        }
        let found = match self.fit {
            Fit::First => self
                .banks
                .iter_mut()
                .enumerate()
                .find_map(|(bank, list)| list.allocate(size, Fit::First).map(|o| (bank, o))),
            Fit::Best => {
                // Tightest bank first so large holes stay available.
                let bank = self
                    .banks
                    .iter()
                    .enumerate()
                    .filter(|(_, list)| list.largest_free() >= size)
                    .min_by_key(|(_, list)| list.free_bytes())
                    .map(|(bank, _)| bank);
                bank.and_then(|bank| {
                    self.banks[bank]
                        .allocate(size, Fit::Best)
                        .map(|offset| (bank, offset))
                })
            }
        };
        let (bank, offset) = found.ok_or(AllocFailure::NoSpace)?;
        self.live += 1;
        Ok(Allocation {
            bank,
            offset,
            block: None,
        })
    }

    pub(crate) fn free(&mut self, bank: usize, offset: usize, size: usize) {
        if let Some(list) = self.banks.get_mut(bank) {
            list.release(offset, size);
            self.live -= 1;
        } else {
            debug_assert!(false, "free into unknown bank {bank}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_fit_walks_banks_in_order() {
        let mut allocator = DirectAllocator::new(Fit::First, 16);
        assert_eq!(allocator.allocate(128), Err(AllocFailure::NoSpace));

        allocator.extend(256);
        allocator.extend(256);
        let a = allocator.allocate(256).unwrap();
        let b = allocator.allocate(128).unwrap();
        assert_eq!((a.bank, a.offset), (0, 0));
        assert_eq!((b.bank, b.offset), (1, 0));

        allocator.free(a.bank, a.offset, 256);
        let c = allocator.allocate(128).unwrap();
        assert_eq!((c.bank, c.offset), (0, 0));
        assert_eq!(allocator.live(), 2);
    }

    #[test]
    fn test_best_fit_fills_the_fullest_bank() {
        let mut allocator = DirectAllocator::new(Fit::Best, 16);
        allocator.extend(1024);
        allocator.extend(1024);
        let _pad = allocator.allocate(1024).unwrap();
        let partial = allocator.allocate(512).unwrap();
        assert_eq!(partial.bank, 1);

        allocator.free(0, 0, 1024);
        let next = allocator.allocate(256).unwrap();
        assert_eq!(next.bank, 1, "bank 1 has the least free space that still fits");
    }

    #[test]
    fn test_handle_limit() {
        let mut allocator = DirectAllocator::new(Fit::First, 1);
        allocator.extend(1024);
        allocator.allocate(128).unwrap();
        assert_eq!(allocator.allocate(128), Err(AllocFailure::HandlesExhausted));
    }
}

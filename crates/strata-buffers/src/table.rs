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

//! A generational slot table.
//!
//! Items and defrag blocks are referenced by [`SlotKey`]s: a slot index plus
//! the generation the slot had when the value was inserted. Removing a value
//! bumps the slot's generation and pushes the index on a free list, so the
//! slot is reused while keys to the old value stop resolving.

/// A key into a [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SlotKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl SlotKey {
    /// A key no table ever hands out.
    pub(crate) const DANGLING: Self = Self {
        index: u32::MAX,
        generation: u32::MAX,
    };
}

#[derive(Debug, Clone)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug, Clone)]
pub(crate) struct SlotTable<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            len: 0,
        }
    }
}

impl<T> SlotTable<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn insert(&mut self, value: T) -> SlotKey {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none(), "free list points at a live slot");
            slot.value = Some(value);
            return SlotKey {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        SlotKey {
            index,
            generation: 0,
        }
    }

    pub(crate) fn remove(&mut self, key: SlotKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn get(&self, key: SlotKey) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: SlotKey) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn contains(&self, key: SlotKey) -> bool {
        self.get(key).is_some()
    }

    /// Borrows two distinct live values at once.
    pub(crate) fn get_pair_mut(&mut self, a: SlotKey, b: SlotKey) -> Option<(&mut T, &mut T)> {
        if a.index == b.index || !self.contains(a) || !self.contains(b) {
            return None;
        }
        let (low, high, swapped) = if a.index < b.index {
            (a.index as usize, b.index as usize, false)
        } else {
            (b.index as usize, a.index as usize, true)
        };
        let (head, tail) = self.slots.split_at_mut(high);
        let first = head[low].value.as_mut()?;
        let second = tail[0].value.as_mut()?;
        Some(if swapped {
            (second, first)
        } else {
            (first, second)
        })
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotKey, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_key_goes_stale_when_slot_is_reused() {
        let mut table = SlotTable::new();
        let first = table.insert("first");
        assert_eq!(table.remove(first), Some("first"));

        let second = table.insert("second");
        assert_eq!(second.index, first.index, "slot is recycled");
        assert_ne!(second.generation, first.generation);
        assert!(table.get(first).is_none(), "stale key must not alias");
        assert_eq!(table.get(second), Some(&"second"));
        assert_eq!(table.remove(first), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_pair_mut_preserves_argument_order() {
        let mut table = SlotTable::new();
        let a = table.insert(1);
        let b = table.insert(2);

        let (x, y) = table.get_pair_mut(b, a).expect("distinct live keys");
        assert_eq!((*x, *y), (2, 1));
        std::mem::swap(x, y);
        assert_eq!(table.get(a), Some(&2));
        assert_eq!(table.get(b), Some(&1));

        assert!(table.get_pair_mut(a, a).is_none());
    }

    #[test]
    fn test_iter_skips_vacant_slots() {
        let mut table = SlotTable::new();
        let keys: Vec<_> = (0..4).map(|i| table.insert(i)).collect();
        table.remove(keys[1]);
        let live: Vec<_> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(live, vec![0, 2, 3]);
        assert!(!table.is_empty());
    }
}

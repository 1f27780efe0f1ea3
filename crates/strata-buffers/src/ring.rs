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

//! The fence-keyed deferred ring.
//!
//! Values (freed items, retired constant slots) are pushed into the open
//! slot. Each `Update` seals the open slot with the frame fence the manager
//! issues right after the update, then opens the slot for the next frame.
//! A sealed slot is handed back once its fence is observed satisfied, which
//! can only happen on a later update, so nothing is recycled within the
//! frame it was released in.
//!
//! Every seal also closes an *interval*: a monotonically increasing frame
//! counter. Interval `n` is known complete once the fence that sealed it
//! has been satisfied.

use strata_core::{BufferDevice, DeviceError, FenceId};

use crate::types::{FRAME_QUERY_COUNT, FRAME_QUERY_MASK};

#[derive(Debug)]
struct RingSlot<T> {
    values: Vec<T>,
    fence: Option<FenceId>,
    interval: u64,
}

#[derive(Debug)]
pub(crate) struct DeferredRing<T> {
    slots: [RingSlot<T>; FRAME_QUERY_COUNT],
    current: usize,
    open_interval: u64,
    completed_interval: u64,
}

impl<T> Default for DeferredRing<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeferredRing<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| RingSlot {
                values: Vec::new(),
                fence: None,
                interval: 0,
            }),
            current: 0,
            open_interval: 1,
            completed_interval: 0,
        }
    }

    pub(crate) fn push(&mut self, value: T) {
        self.slots[self.current].values.push(value);
    }

    /// The interval writes are currently attributed to.
    pub(crate) fn open_interval(&self) -> u64 {
        self.open_interval
    }

    /// Values waiting in any slot.
    pub(crate) fn pending(&self) -> usize {
        self.slots.iter().map(|slot| slot.values.len()).sum()
    }

    fn drain_slot(&mut self, index: usize, out: &mut Vec<T>) {
        let slot = &mut self.slots[index];
        out.append(&mut slot.values);
        slot.fence = None;
        self.completed_interval = self.completed_interval.max(slot.interval);
    }

    /// Moves the contents of every sealed slot whose fence is satisfied into `out`.
    pub(crate) fn retire_ready(
        &mut self,
        device: &dyn BufferDevice,
        out: &mut Vec<T>,
    ) -> Result<(), DeviceError> {
        for index in 0..FRAME_QUERY_COUNT {
            if let Some(fence) = self.slots[index].fence {
                if device.sync_fence(fence, false)? {
                    self.drain_slot(index, out);
                }
            }
        }
        Ok(())
    }

    /// Seals the open slot with `fence` and opens the slot of `frame_id + 1`.
    ///
    /// A slot that is still sealed when it comes around again is waited on
    /// and drained into `out` before reuse.
    pub(crate) fn seal(
        &mut self,
        device: &dyn BufferDevice,
        frame_id: u64,
        fence: FenceId,
        out: &mut Vec<T>,
    ) -> Result<(), DeviceError> {
        let sealed = self.current;
        self.slots[sealed].fence = Some(fence);
        self.slots[sealed].interval = self.open_interval;
        self.open_interval += 1;

        let mut next = ((frame_id + 1) & FRAME_QUERY_MASK) as usize;
        if next == sealed {
            next = (sealed + 1) % FRAME_QUERY_COUNT;
        }
        if let Some(stale) = self.slots[next].fence {
            log::debug!("Deferred ring slot {next} still sealed on reuse, waiting for its fence");
            device.sync_fence(stale, true)?;
            self.drain_slot(next, out);
        }
        self.current = next;
        Ok(())
    }

    /// Waits for every sealed slot and drains it. The open slot is kept.
    pub(crate) fn retire_sealed_blocking(
        &mut self,
        device: &dyn BufferDevice,
        out: &mut Vec<T>,
    ) -> Result<(), DeviceError> {
        for index in 0..FRAME_QUERY_COUNT {
            if let Some(fence) = self.slots[index].fence {
                device.sync_fence(fence, true)?;
                self.drain_slot(index, out);
            }
        }
        Ok(())
    }

    /// Drains everything, open slot included. The caller must already have
    /// waited for the GPU to finish all submitted work.
    pub(crate) fn drain_all(&mut self, out: &mut Vec<T>) {
        for index in 0..FRAME_QUERY_COUNT {
            self.drain_slot(index, out);
        }
        self.completed_interval = self.open_interval;
        self.open_interval += 1;
    }

    /// `true` once the GPU is proven past everything submitted in `interval`.
    ///
    /// The newest seal never counts: its fence is issued by the manager only
    /// after the update that sealed it returns.
    pub(crate) fn interval_completed(
        &mut self,
        device: &dyn BufferDevice,
        interval: u64,
    ) -> Result<bool, DeviceError> {
        if interval <= self.completed_interval {
            return Ok(true);
        }
        if interval + 1 >= self.open_interval {
            return Ok(false);
        }
        let fence = self
            .slots
            .iter()
            .find(|slot| slot.interval == interval)
            .and_then(|slot| slot.fence);
        match fence {
            Some(fence) if device.sync_fence(fence, false)? => {
                self.completed_interval = self.completed_interval.max(interval);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

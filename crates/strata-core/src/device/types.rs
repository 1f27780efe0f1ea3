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

//! Native handles, flags and descriptors exchanged with a [`BufferDevice`].
//!
//! [`BufferDevice`]: super::BufferDevice

use std::borrow::Cow;
use std::ptr::NonNull;

use crate::strata_bitflags;

/// An opaque handle to a native buffer owned by a [`super::BufferDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeBufferId(pub usize);

/// An opaque handle to a device fence.
///
/// A fence is issued after some GPU work has been submitted and is
/// satisfied once the device has executed everything submitted before it.
/// Fences are reusable: issuing one again moves it to the current point of
/// the submission stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceId(pub usize);

strata_bitflags! {
    /// The pipeline stages a native buffer may be bound to.
    pub struct BindFlags: u32 {
        /// Bound as a vertex stream.
        const VERTEX = 1 << 0;
        /// Bound as an index stream.
        const INDEX = 1 << 1;
        /// Bound as a constant (uniform) buffer.
        const CONSTANT = 1 << 2;
    }
}

strata_bitflags! {
    /// How a native buffer is accessed by the CPU and the GPU.
    pub struct UsageFlags: u32 {
        /// Frequently rewritten by the CPU.
        const DYNAMIC = 1 << 0;
        /// The CPU maps the buffer for writing.
        const CPU_WRITE = 1 << 1;
        /// The CPU maps the buffer for reading.
        const CPU_READ = 1 << 2;
        /// Staging memory used only as a copy source or destination.
        const STAGING = 1 << 3;
        /// The buffer is persistently mapped and reachable through a base pointer.
        const DIRECT_ACCESS = 1 << 4;
        /// CPU caches need no explicit invalidation after writes.
        const CPU_COHERENT = 1 << 5;
        /// GPU caches need no explicit flush after CPU writes.
        const GPU_COHERENT = 1 << 6;
        /// Contents only live for the current frame.
        const TRANSIENT = 1 << 7;
    }
}

/// Access mode requested when mapping a native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    /// Map existing contents for reading.
    Read,
    /// Map for writing; the device may have to wait for the GPU.
    Write,
    /// Map for writing and discard the previous contents.
    WriteDiscard,
    /// Map for writing, promising not to touch ranges the GPU may be using.
    WriteNoOverwrite,
}

/// Describes a native buffer to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeBufferDescriptor<'a> {
    /// Optional debug label.
    pub label: Option<Cow<'a, str>>,
    /// Size in bytes.
    pub size: usize,
    /// Access pattern.
    pub usage: UsageFlags,
    /// Pipeline bindings.
    pub bind: BindFlags,
}

impl<'a> NativeBufferDescriptor<'a> {
    /// Shorthand for an unlabeled descriptor.
    pub fn new(size: usize, usage: UsageFlags, bind: BindFlags) -> Self {
        Self {
            label: None,
            size,
            usage,
            bind,
        }
    }

    /// Attaches a debug label.
    pub fn with_label(mut self, label: impl Into<Cow<'a, str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A CPU-visible window onto device memory.
///
/// The window stays valid until the buffer it came from is unmapped or
/// destroyed. Reading or writing through it is therefore `unsafe`: the
/// caller must guarantee the buffer is still alive and mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a mapped range is a plain address; all access goes through the
// unsafe accessors below, whose callers uphold the aliasing rules.
unsafe impl Send for MappedRange {}
// SAFETY: see above.
unsafe impl Sync for MappedRange {}

impl MappedRange {
    /// Wraps a raw mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the mapping is used.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` for a zero-length window.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The start address.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// A sub-window `offset..offset + len`, or `None` if it does not fit.
    pub fn subrange(&self, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: `offset <= self.len`, so the pointer stays inside the mapping.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Some(Self { ptr, len })
    }

    /// Views the window as bytes.
    ///
    /// # Safety
    ///
    /// The underlying mapping must still be alive and nobody may be writing
    /// to it for the lifetime of the returned slice.
    pub unsafe fn as_slice<'m>(&self) -> &'m [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Views the window as mutable bytes.
    ///
    /// # Safety
    ///
    /// The underlying mapping must still be alive and the returned slice
    /// must be the only live access to it.
    pub unsafe fn as_mut_slice<'m>(&mut self) -> &'m mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subrange_bounds() {
        let mut storage = vec![0u8; 64];
        let ptr = NonNull::new(storage.as_mut_ptr()).unwrap();
        let range = unsafe { MappedRange::from_raw_parts(ptr, storage.len()) };

        let mut tail = range.subrange(48, 16).expect("tail fits");
        assert_eq!(tail.len(), 16);
        unsafe { tail.as_mut_slice().fill(7) };
        assert_eq!(&storage[48..], &[7u8; 16]);
        assert_eq!(storage[47], 0);

        assert!(range.subrange(48, 17).is_none());
        assert!(range.subrange(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = NativeBufferDescriptor::new(256, UsageFlags::STAGING, BindFlags::EMPTY)
            .with_label("staging");
        assert_eq!(desc.label.as_deref(), Some("staging"));
        assert_eq!(desc.size, 256);
    }
}

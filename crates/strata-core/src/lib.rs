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

//! # Strata Core
//!
//! Foundational crate for the Strata buffer pooling subsystem. It defines the
//! boundary between the pools and whatever graphics backend owns the actual
//! device memory, the native handle types crossing that boundary, and the
//! process-wide video memory counters.

#![warn(missing_docs)]

pub mod device;
pub mod memory;
pub mod utils;

pub use device::{
    BindFlags, BufferDevice, DeviceError, FenceId, MapMode, MappedRange, NativeBufferDescriptor,
    NativeBufferId, UsageFlags,
};

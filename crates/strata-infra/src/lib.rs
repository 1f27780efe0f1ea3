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

//! # Strata Infra
//!
//! Concrete implementations of [`strata_core::BufferDevice`].
//!
//! - [`graphics::host::HostBufferDevice`] keeps every native buffer in CPU
//!   memory and simulates the GPU timeline. It backs headless tools and the
//!   test suites of the pooling crates.
//! - `graphics::wgpu::WgpuBufferDevice` (feature `wgpu`) drives a real
//!   `wgpu` device.

#![warn(missing_docs)]

pub mod graphics;

pub use graphics::host::{HostBufferDevice, HostDeviceSettings};

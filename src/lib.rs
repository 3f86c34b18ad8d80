// Epoll-based event-driven I/O dispatcher with a zero-copy dual-ended streaming buffer.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Event-driven I/O for POSIX systems, built from two tightly coupled parts.
//!
//! The [`Dispatcher`] owns an epoll instance and a dedicated thread blocked on it. Devices
//! register interest per direction; readiness becomes jobs on a bounded queue drained by a
//! [`WorkerPool`], with per-device in-flight bits guaranteeing that no two workers ever
//! handle the same event kind of the same device concurrently. Device teardown is staged
//! through a lock-free deletion list so that destruction only ever runs on the dispatcher
//! thread.
//!
//! Underneath the devices sits a dual-ended streaming buffer: a chain of reference-counted
//! memory blocks carrying a byte-exact FIFO stream from one producer thread to one consumer
//! thread with no locks on the data path and no copying inside the buffer. A drained block is
//! recycled by rewinding the write cursor instead of allocating, so a well-paced stream runs
//! through a single block indefinitely. Decoders frame messages directly out of buffer
//! memory via reference-counted [`MsgSlice`] views.
//!
//! All descriptors must be non-blocking; see [`DeviceCore::init`].

#[macro_use]
extern crate amplify;

mod block;
pub mod buffer;
mod decoder;
pub mod device;
mod dispatcher;
mod fuzzy;
pub mod input;
pub mod output;
pub mod poller;
mod workers;

pub use block::MsgSlice;
pub use buffer::{stream_buffer, BufStats, Consumer, InputBuffer, OutputBuffer, Producer};
pub use decoder::{BufferSizes, Decoder, DEFAULT_INPUT_BLOCK_SIZE};
pub use device::{set_nonblocking, Device, DeviceCore, DeviceRc, Direction, Flags, StateGuard};
pub use dispatcher::{Dispatcher, StartError};
pub use fuzzy::Fuzzy;
pub use input::{ErrorAction, InputDevice, InputHalf};
pub use output::{OutputDevice, OutputHalf, Writer};
pub use workers::{Job, WorkerPool};

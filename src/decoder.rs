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

//! Interface between an input device and the protocol layer framing its byte stream.

use crate::block::MsgSlice;

/// Default smallest payload of an input buffer block.
pub const DEFAULT_INPUT_BLOCK_SIZE: usize = 512;

/// Sizing of the input buffer a decoder wants to read from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufferSizes {
    /// Smallest payload to allocate per block.
    pub min_block_size: usize,
    /// Occupancy at which the buffer reports backpressure.
    pub full_watermark: usize,
    /// Hard cap on outstanding block memory.
    pub max_alloc: usize,
}

impl Default for BufferSizes {
    fn default() -> Self {
        BufferSizes {
            min_block_size: DEFAULT_INPUT_BLOCK_SIZE,
            full_watermark: 8 * DEFAULT_INPUT_BLOCK_SIZE,
            max_alloc: usize::MAX,
        }
    }
}

/// Frames messages out of an input device's byte stream and consumes them.
///
/// `end_of_msg_finder` is called once per chunk of freshly arrived bytes and again after each
/// message is cut off the front, so a stateful implementation sees every byte exactly once.
/// `decode` runs on the worker thread driving the device; a decoder shared between devices
/// must synchronize its own state.
pub trait Decoder: Send + Sync {
    /// Sizing for the buffer created by [`crate::InputHalf::set_decoder`].
    fn buffer_sizes(&self) -> BufferSizes { BufferSizes::default() }

    /// Returns the length of the first complete message within `new_data`, including its
    /// terminator, or zero when no complete message has arrived yet.
    fn end_of_msg_finder(&self, new_data: &[u8]) -> usize;

    /// Consumes one framed message. The slice stays valid for as long as it is held, even
    /// after the buffer's read cursor moves past it.
    fn decode(&self, msg: MsgSlice);
}

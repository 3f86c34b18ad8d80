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

use std::ptr::{copy_nonoverlapping, null_mut};
use std::sync::atomic::Ordering;

use super::{Producer, PutArea};
use crate::block::{round_down_block_size, round_up_block_size, MemoryBlock};
use crate::device::Direction;
use crate::Fuzzy;

impl Producer {
    fn put(&self) -> &mut PutArea {
        // Sound under the SPSC discipline: this handle is the only accessor of the put area
        // and it is not clonable.
        unsafe { &mut *self.sb.put.get() }
    }

    /// Publishes the write cursor to the consumer.
    ///
    /// The shadow always receives the latest value; the main cell is skipped while it holds
    /// the rewind signal, and the consumer's pickup loop recovers the value from the shadow.
    fn publish(&self, pptr: *mut u8) {
        self.sb.frontier_shadow.store(pptr, Ordering::SeqCst);
        if !self.sb.frontier.load(Ordering::SeqCst).is_null() {
            self.sb.frontier.store(pptr, Ordering::SeqCst);
        }
    }

    /// Rewinds the put area to the block start when the consumer has caught up inside the
    /// current block, then returns the write cursor and the contiguous room behind it.
    ///
    /// The rewind never runs twice in a row: the null frontier blocks a second rewind until
    /// the consumer has picked the first one up.
    fn update_put_area(&mut self) -> (*mut u8, usize) {
        let put = self.put();
        if put.pptr != put.pbase
            && !self.sb.frontier.load(Ordering::SeqCst).is_null()
            && put.pptr == self.sb.drained_gptr.load(Ordering::Acquire)
        {
            #[cfg(feature = "log")]
            log::trace!(target: "buffer", "Rewinding the put area to the block start");
            self.sb.frontier_shadow.store(put.pbase, Ordering::SeqCst);
            self.sb.frontier.store(null_mut(), Ordering::SeqCst);
            put.total_reset += put.pptr as isize - put.pbase as isize;
            put.pptr = put.pbase;
        }
        (put.pptr, put.epptr as usize - put.pptr as usize)
    }

    /// Appends a freshly allocated block behind the current tail. Returns `false` when the
    /// allocation cap refuses even a minimum-size block.
    fn grow(&mut self) -> bool {
        let mut block_size = self.new_block_size();
        let allocated = self.allocated_upper_bound();
        if allocated + block_size > self.sb.max_alloc {
            block_size = round_down_block_size(self.sb.max_alloc.saturating_sub(allocated));
            if block_size < self.sb.min_block_size {
                self.sb.was_full.store(true, Ordering::Relaxed);
                #[cfg(feature = "log")]
                log::debug!(target: "buffer", "Allocation cap reached; backpressuring the producer");
                return false;
            }
        }
        let block = MemoryBlock::create(block_size);
        let start = unsafe { block.as_ref() }.start();
        let put = self.put();
        put.total_allocated += block_size;
        // Link before publishing a cursor inside the new block.
        unsafe { put.head.as_ref() }.link_next(block);
        self.publish(start);
        let put = self.put();
        put.head = block;
        put.pbase = start;
        put.pptr = start;
        put.epptr = unsafe { block.as_ref() }.end();
        true
    }

    /// Block size for the next growth: enough for everything currently buffered, at least the
    /// minimum.
    fn new_block_size(&self) -> usize {
        round_up_block_size(self.data_size_upper_bound().max(self.sb.min_block_size))
    }

    /// Contiguous room at the write cursor right now.
    pub fn contiguous(&self) -> usize {
        let put = self.put();
        put.epptr as usize - put.pptr as usize
    }

    /// Contiguous room at the write cursor, rewinding or growing as necessary. Returns zero
    /// only when the allocation cap is hit.
    pub fn contiguous_forced(&mut self) -> usize {
        let (_, available) = self.update_put_area();
        if available > 0 {
            return available;
        }
        if !self.grow() {
            return 0;
        }
        self.contiguous()
    }

    /// The write cursor. Data must be stored here before calling [`Self::commit`].
    pub fn put_ptr(&self) -> *mut u8 { self.put().pptr }

    /// Publishes `n` bytes previously written at [`Self::put_ptr`].
    pub fn commit(&mut self, n: usize) {
        let put = self.put();
        debug_assert!(n <= put.epptr as usize - put.pptr as usize);
        put.pptr = unsafe { put.pptr.add(n) };
        let pptr = put.pptr;
        self.publish(pptr);
    }

    /// Bulk write. Copies as much of `src` as the allocation cap allows and returns the number
    /// of bytes taken; a short count is the backpressure signal.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let total = src.len();
        let mut remaining = total;
        while remaining > 0 {
            let (pptr, available) = self.update_put_area();
            if available > 0 {
                let len = available.min(remaining);
                let off = total - remaining;
                unsafe { copy_nonoverlapping(src[off..].as_ptr(), pptr, len) };
                self.commit(len);
                remaining -= len;
            }
            if remaining > 0 && !self.grow() {
                break;
            }
        }
        total - remaining
    }

    /// Unused room in the tail block.
    pub fn unused_in_last_block(&self) -> usize { self.contiguous() }

    /// Payload bytes currently allocated across all reachable blocks.
    pub fn allocated_upper_bound(&self) -> usize {
        self.put().total_allocated - self.sb.total_freed.load(Ordering::Acquire)
    }

    /// Bytes currently buffered. An upper bound: the consumer may be draining concurrently.
    pub fn data_size_upper_bound(&self) -> usize {
        let put = self.put();
        let unused = put.epptr as usize - put.pptr as usize;
        (put.total_allocated as isize - unused as isize + put.total_reset
            - self.sb.total_read.load(Ordering::Acquire) as isize) as usize
    }

    /// Whether buffered data reached the backpressure watermark.
    pub fn buffer_full(&self) -> bool { self.data_size_upper_bound() >= self.sb.full_watermark }

    /// Whether the consumer has nothing left to read.
    ///
    /// From the producer's side an empty buffer stays empty, so `True` is stable; a non-empty
    /// answer is transitory because the consumer may drain it at any moment.
    pub fn nothing_to_get(&self) -> Fuzzy {
        let put = self.put();
        let empty = if self.sb.frontier.load(Ordering::SeqCst).is_null() {
            // A rewind is pending: everything published before it was consumed, so the buffer
            // is empty iff nothing was written since.
            put.pptr == put.pbase
        } else {
            let gptr = unsafe { &*self.sb.get.get() }.gptr.load(Ordering::Relaxed);
            gptr == self.sb.frontier.load(Ordering::SeqCst)
        };
        if empty {
            Fuzzy::True
        } else {
            Fuzzy::TransitoryFalse
        }
    }

    /// Starts the attached output device when there is data to drain. Called by writers after
    /// they are done appending.
    pub fn flush(&self) {
        let odevice = self.sb.odevice.load(Ordering::Acquire);
        let Some(odevice) = (unsafe { odevice.as_ref() }) else {
            return;
        };
        let condition = || !self.nothing_to_get();
        if condition().is_momentary_false() {
            return;
        }
        let state = odevice.state();
        odevice.dispatcher().start_if(&state, condition, Direction::Write, odevice);
    }
}

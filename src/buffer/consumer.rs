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

use std::ptr::copy_nonoverlapping;
use std::sync::atomic::Ordering;

use super::{Consumer, GetArea};
use crate::block::{MemoryBlock, MsgSlice};
use crate::device::Direction;
use crate::Fuzzy;

impl Consumer {
    fn get(&self) -> &mut GetArea {
        // Sound under the SPSC discipline: this handle is the only accessor of the get area
        // and it is not clonable.
        unsafe { &mut *self.sb.get.get() }
    }

    /// Records the read cursor of a buffer just observed empty, which arms the producer's
    /// put-area rewind. Must also run whenever the head block is released, so that a stale
    /// value can never alias memory the allocator handed back to the producer.
    fn store_drained_gptr(&self, gptr: *mut u8) {
        self.sb.drained_gptr.store(gptr, Ordering::Release);
    }

    /// Refreshes the get area against the producer's published frontier.
    ///
    /// Handles the rewind pickup: a null frontier means the producer rewound the put area, so
    /// the read cursor goes back to the block start and the frontier is re-synchronized from
    /// the shadow in a CAS loop which cannot miss the latest publication.
    ///
    /// Returns the read cursor, the contiguous bytes behind it, and whether the area ends at
    /// the block boundary with another block already linked behind it.
    fn update_get_area(&mut self) -> (*mut u8, usize, bool) {
        let get = self.get();
        let mut frontier = self.sb.frontier.load(Ordering::SeqCst);
        let mut start = unsafe { get.head.as_ref() }.start();
        let mut end = unsafe { get.head.as_ref() }.end();
        let mut cur_gptr = get.gptr.load(Ordering::Relaxed);

        if frontier.is_null() {
            #[cfg(feature = "log")]
            log::trace!(target: "buffer", "Picking up a put-area rewind; resetting the get area");
            self.store_drained_gptr(start);
            self.sb.frontier.store(start, Ordering::SeqCst);
            // The producer may have published into the shadow after signalling the rewind but
            // before our store above; loop until the frontier and the shadow agree.
            let mut expected = start;
            loop {
                let shadow = self.sb.frontier_shadow.load(Ordering::SeqCst);
                match self.sb.frontier.compare_exchange(
                    expected,
                    shadow,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        frontier = shadow;
                        break;
                    }
                    Err(actual) => expected = actual,
                }
            }
            cur_gptr = start;
        }

        let mut cur_egptr;
        let in_block;
        loop {
            let frontier_in_block = start <= frontier && frontier <= end;
            cur_egptr = if frontier_in_block { frontier } else { end };
            let available = cur_egptr as usize - cur_gptr as usize;
            if available != 0 {
                in_block = frontier_in_block;
                break;
            }
            if frontier_in_block {
                // Empty and the producer is still in this block: nothing to advance to.
                get.eback = start;
                get.gptr.store(cur_gptr, Ordering::Relaxed);
                get.egptr = cur_egptr;
                return (cur_gptr, 0, false);
            }
            // The frontier is beyond this exhausted block, so a linked successor exists.
            let next = unsafe { get.head.as_ref() }.next();
            debug_assert!(!next.is_null());
            let prev = get.head;
            get.head = unsafe { std::ptr::NonNull::new_unchecked(next) };
            start = unsafe { get.head.as_ref() }.start();
            end = unsafe { get.head.as_ref() }.end();
            cur_gptr = start;
            self.store_drained_gptr(start);
            self.release_block(prev);
            cur_egptr = end;
            // At most one more pass: with the cursor at the block start, the area can only be
            // empty again if the frontier equals it, which lands in the branch above.
        }

        let get = self.get();
        get.eback = start;
        get.gptr.store(cur_gptr, Ordering::Relaxed);
        get.egptr = cur_egptr;
        (cur_gptr, cur_egptr as usize - cur_gptr as usize, cur_egptr == end && !in_block)
    }

    /// Gives one exhausted block back, bumping the freed counter. Single writer of
    /// `total_freed`, so a plain load/store pair replaces a read-modify-write.
    fn release_block(&self, block: std::ptr::NonNull<MemoryBlock>) {
        let size = unsafe { block.as_ref() }.size();
        #[cfg(feature = "log")]
        log::trace!(target: "buffer", "Freeing a drained block of {size} bytes");
        let new_freed = self.sb.total_freed.load(Ordering::Relaxed) + size;
        self.sb.total_freed.store(new_freed, Ordering::Release);
        unsafe { MemoryBlock::release(block) };
    }

    /// Contiguous bytes behind the read cursor right now. May be zero while the buffer is
    /// not empty; [`Self::contiguous_forced`] refreshes against the producer's frontier.
    /// Saturating: the end pointer is refreshed lazily and [`Self::advance`] may legally
    /// outrun it.
    pub fn contiguous(&self) -> usize {
        let get = self.get();
        (get.egptr as usize).saturating_sub(get.gptr.load(Ordering::Relaxed) as usize)
    }

    /// Contiguous bytes behind the read cursor, refreshed. Returns zero only when everything
    /// published by the producer has been read.
    pub fn contiguous_forced(&mut self) -> usize {
        let available = self.contiguous();
        if available > 0 {
            return available;
        }
        let (gptr, available, _) = self.update_get_area();
        if available == 0 {
            self.store_drained_gptr(gptr);
        }
        available
    }

    /// The read cursor.
    pub fn get_ptr(&self) -> *const u8 { self.get().gptr.load(Ordering::Relaxed) }

    /// Advances the read cursor past `n` bytes which were consumed in place. May move beyond
    /// the lazily refreshed end pointer, but never beyond the head block.
    pub fn advance(&mut self, n: usize) {
        let get = self.get();
        let gptr = get.gptr.load(Ordering::Relaxed);
        debug_assert!(unsafe { gptr.add(n) } <= unsafe { get.head.as_ref() }.end());
        get.gptr.store(unsafe { gptr.add(n) }, Ordering::Relaxed);
        self.bump_total_read(n);
    }

    fn bump_total_read(&self, n: usize) {
        // Single writer; a load/store pair instead of fetch_add.
        let new_read = self.sb.total_read.load(Ordering::Relaxed) + n;
        self.sb.total_read.store(new_read, Ordering::Release);
    }

    /// Bulk read. Copies up to `dst.len()` bytes, crossing block boundaries, and returns the
    /// number of bytes obtained.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let total = dst.len();
        let mut remaining = total;
        while remaining > 0 {
            let (cur_gptr, available, at_end_has_next) = self.update_get_area();
            let mut len = 0;
            if available != 0 {
                len = available.min(remaining);
                let off = total - remaining;
                unsafe { copy_nonoverlapping(cur_gptr, dst[off..].as_mut_ptr(), len) };
                let get = self.get();
                get.gptr.store(unsafe { cur_gptr.add(len) }, Ordering::Relaxed);
                remaining -= len;
            }
            if !at_end_has_next {
                if available == len {
                    // Drained the buffer exactly; arm the producer's rewind.
                    self.store_drained_gptr(unsafe { cur_gptr.add(len) });
                }
                break;
            }
            if available == len {
                // The area ended at the block boundary and a successor exists.
                let get = self.get();
                let prev = get.head;
                let next = unsafe { get.head.as_ref() }.next();
                debug_assert!(!next.is_null());
                get.head = unsafe { std::ptr::NonNull::new_unchecked(next) };
                let start = unsafe { get.head.as_ref() }.start();
                get.eback = start;
                get.gptr.store(start, Ordering::Relaxed);
                get.egptr = start;
                self.store_drained_gptr(start);
                self.release_block(prev);
            }
        }
        self.bump_total_read(total - remaining);
        total - remaining
    }

    /// Whether `len` bytes behind the read cursor lie within the current head block.
    pub fn is_contiguous(&self, len: usize) -> bool {
        let get = self.get();
        let gptr = get.gptr.load(Ordering::Relaxed);
        unsafe { gptr.add(len) <= get.head.as_ref().end() }
    }

    /// A message slice over `len` contiguous bytes behind the read cursor, pinning the head
    /// block alive.
    pub fn slice(&self, len: usize) -> MsgSlice {
        let get = self.get();
        debug_assert!(self.is_contiguous(len));
        unsafe { MsgSlice::new(get.gptr.load(Ordering::Relaxed), len, get.head) }
    }

    /// Whether the producer has published anything not yet read.
    ///
    /// From the consumer's side a non-empty buffer stays non-empty, so `False` is stable; an
    /// empty answer is transitory because the producer may publish at any moment.
    pub fn nothing_to_get(&self) -> Fuzzy {
        let frontier = self.sb.frontier.load(Ordering::SeqCst);
        let empty = if frontier.is_null() {
            // Rewind pending: the shadow holds the only publication that matters.
            self.sb.frontier_shadow.load(Ordering::SeqCst) == self.get().eback
        } else {
            frontier == self.get().gptr.load(Ordering::Relaxed)
        };
        if empty {
            Fuzzy::TransitoryTrue
        } else {
            Fuzzy::False
        }
    }

    /// Restarts the attached input device if the producer was refused memory and enough has
    /// been drained since. The edge is detected through the flag set by the producer, so the
    /// common path costs one relaxed load.
    pub fn restart_input_if_needed(&self) {
        if !self.sb.was_full.load(Ordering::Relaxed) {
            return;
        }
        // The producer is stopped while the flag is set, so reading its allocation counter
        // here is stable.
        let get = self.get();
        let unused_in_first_block = get.gptr.load(Ordering::Relaxed) as usize - get.eback as usize;
        let allocated =
            unsafe { &*self.sb.put.get() }.total_allocated - self.sb.total_freed.load(Ordering::Relaxed);
        if allocated - unused_in_first_block >= self.sb.full_watermark {
            return;
        }
        self.sb.was_full.store(false, Ordering::Relaxed);
        let idevice = self.sb.idevice.load(Ordering::Acquire);
        if let Some(idevice) = unsafe { idevice.as_ref() } {
            #[cfg(feature = "log")]
            log::debug!(target: "buffer", "Buffer drained below the watermark; restarting input");
            let state = idevice.state();
            idevice.dispatcher().start(&state, Direction::Read, idevice);
        }
    }
}

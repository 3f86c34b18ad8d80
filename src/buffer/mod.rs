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

//! Dual-ended streaming buffer: a chain of reference-counted memory blocks carrying a
//! byte-exact FIFO stream from a single producer to a single consumer.
//!
//! Data is never moved. The producer appends at the put area of the tail block, the consumer
//! reads from the get area of the head block, and blocks strictly between the two are full.
//! When the consumer catches up inside the tail block the producer rewinds its cursor to the
//! block start instead of growing the chain, which lets an arbitrary amount of data stream
//! through a single recycled block.
//!
//! The two ends synchronize exclusively through atomics; no lock is taken on the read or write
//! path. [`Producer`] and [`Consumer`] are the two handles; neither is clonable, which pins the
//! single-producer / single-consumer discipline into ownership.

mod consumer;
mod producer;

use std::cell::UnsafeCell;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::block::{round_up_block_size, MemoryBlock};
use crate::device::DeviceCore;

/// Producer-owned half of the cursor state. Only the producer thread touches it.
pub(super) struct PutArea {
    pub(super) head: NonNull<MemoryBlock>,
    pub(super) pbase: *mut u8,
    pub(super) pptr: *mut u8,
    pub(super) epptr: *mut u8,
    /// Running total of payload bytes ever allocated for this buffer.
    pub(super) total_allocated: usize,
    /// Correction term keeping the occupancy arithmetic exact across cursor rewinds and
    /// buffer reductions. May go negative after a reduction.
    pub(super) total_reset: isize,
}

/// Consumer-owned half of the cursor state. Only the consumer thread touches it, except for
/// `gptr` which the producer may probe to detect an empty buffer.
pub(super) struct GetArea {
    pub(super) head: NonNull<MemoryBlock>,
    pub(super) eback: *mut u8,
    pub(super) gptr: AtomicPtr<u8>,
    pub(super) egptr: *mut u8,
}

/// Shared core of the streaming buffer.
pub(crate) struct StreamBuf {
    pub(super) min_block_size: usize,
    pub(super) full_watermark: usize,
    pub(super) max_alloc: usize,

    /// The write cursor as published to the consumer. Null while a put-area rewind is waiting
    /// for the consumer to reset its get area.
    pub(super) frontier: AtomicPtr<u8>,
    /// Always-latest write cursor, consulted by the consumer when it picks up a rewind. The
    /// pair closes the race of a publication landing between the rewind signal and its pickup.
    pub(super) frontier_shadow: AtomicPtr<u8>,
    /// The read cursor at the moment the consumer last observed an empty buffer. The producer
    /// rewinds only when its write cursor equals this value.
    pub(super) drained_gptr: AtomicPtr<u8>,

    /// Running total of payload bytes freed; written by the consumer only.
    pub(super) total_freed: AtomicUsize,
    /// Running total of bytes read out of the buffer; written by the consumer only.
    pub(super) total_read: AtomicUsize,
    /// Set by the producer when the allocation cap refuses a new block; cleared by the
    /// consumer once enough room has been drained.
    pub(super) was_full: AtomicBool,

    /// Back-reference to the device reading from an fd into this buffer, restarted when a
    /// previously full buffer drains. Not an owning pointer; cleared before the device dies.
    pub(super) idevice: AtomicPtr<DeviceCore>,
    /// Back-reference to the device flushing this buffer out to an fd, started on flush.
    pub(super) odevice: AtomicPtr<DeviceCore>,
    /// Number of devices attached to this buffer (at most one per direction).
    pub(super) device_counter: AtomicI32,

    pub(super) put: UnsafeCell<PutArea>,
    pub(super) get: UnsafeCell<GetArea>,
}

// The unsafe cells are partitioned between the two handle types; each is accessed by exactly
// one thread at a time under the SPSC discipline.
unsafe impl Send for StreamBuf {}
unsafe impl Sync for StreamBuf {}

/// Snapshot of the buffer's running counters.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufStats {
    pub allocated: usize,
    pub freed: usize,
    pub read: usize,
    pub reset: isize,
}

impl StreamBuf {
    pub(crate) fn new(min_block_size: usize, full_watermark: usize, max_alloc: usize) -> Arc<Self> {
        let block_size = round_up_block_size(min_block_size);
        let block = MemoryBlock::create(block_size);
        let start = unsafe { block.as_ref() }.start();
        Arc::new(StreamBuf {
            min_block_size: block_size,
            full_watermark,
            max_alloc,
            frontier: AtomicPtr::new(start),
            frontier_shadow: AtomicPtr::new(start),
            drained_gptr: AtomicPtr::new(null_mut()),
            total_freed: AtomicUsize::new(0),
            total_read: AtomicUsize::new(0),
            was_full: AtomicBool::new(false),
            idevice: AtomicPtr::new(null_mut()),
            odevice: AtomicPtr::new(null_mut()),
            device_counter: AtomicI32::new(0),
            put: UnsafeCell::new(PutArea {
                head: block,
                pbase: start,
                pptr: start,
                epptr: unsafe { block.as_ref() }.end(),
                total_allocated: block_size,
                total_reset: 0,
            }),
            get: UnsafeCell::new(GetArea {
                head: block,
                eback: start,
                gptr: AtomicPtr::new(start),
                egptr: start,
            }),
        })
    }

    /// Smallest block payload this buffer will allocate, after rounding.
    pub(crate) fn min_block_size(&self) -> usize { self.min_block_size }

    pub(crate) fn stats(&self) -> BufStats {
        // `total_allocated` and `total_reset` are producer fields; reading them from another
        // role gives an instantaneous upper bound, which is all the callers need.
        let put = unsafe { &*self.put.get() };
        BufStats {
            allocated: put.total_allocated,
            freed: self.total_freed.load(Ordering::Acquire),
            read: self.total_read.load(Ordering::Acquire),
            reset: put.total_reset,
        }
    }

    /// Registers the device which fills this buffer from its fd.
    pub(crate) fn set_input_device(&self, device: &DeviceCore) {
        self.idevice.store(device as *const _ as *mut _, Ordering::Release);
        self.attached_device();
    }

    /// Registers the device which drains this buffer into its fd.
    pub(crate) fn set_output_device(&self, device: &DeviceCore) {
        self.odevice.store(device as *const _ as *mut _, Ordering::Release);
        self.attached_device();
    }

    fn attached_device(&self) {
        if self.device_counter.fetch_add(1, Ordering::AcqRel) + 1 == 2 {
            // Two devices share this buffer; the output side must not die before the input
            // side stops feeding it.
            let odevice = self.odevice.load(Ordering::Acquire);
            if let Some(odevice) = unsafe { odevice.as_ref() } {
                odevice.inhibit_deletion();
            }
        }
    }

    pub(crate) fn clear_input_device(&self) {
        self.idevice.store(null_mut(), Ordering::Release);
        self.detached_device();
    }

    pub(crate) fn clear_output_device(&self) {
        self.odevice.store(null_mut(), Ordering::Release);
        self.detached_device();
    }

    fn detached_device(&self) {
        if self.device_counter.fetch_sub(1, Ordering::AcqRel) == 2 {
            let odevice = self.odevice.load(Ordering::Acquire);
            if let Some(odevice) = unsafe { odevice.as_ref() } {
                odevice.allow_deletion();
            }
        }
    }

    /// Exact number of buffered bytes. Sole-owner operation: the caller must currently be both
    /// the producer and the consumer of this buffer.
    pub(super) unsafe fn data_size(&self) -> usize {
        let put = &*self.put.get();
        let unused_in_last_block = put.epptr as usize - put.pptr as usize;
        (put.total_allocated as isize - unused_in_last_block as isize + put.total_reset
            - self.total_read.load(Ordering::Relaxed) as isize) as usize
    }

    /// Whether the chain currently holds more than one block. Sole-owner operation.
    pub(super) unsafe fn has_multiple_blocks(&self) -> bool {
        (*self.get.get()).head != (*self.put.get()).head
    }

    /// Swaps an oversized single block for a minimum-size one and rewinds all cursors to its
    /// start. Sole-owner operation on an empty buffer.
    pub(super) unsafe fn reduce(&self) {
        let put = &mut *self.put.get();
        let get = &mut *self.get.get();
        debug_assert_eq!(get.head, put.head);

        let old_unused = put.epptr as usize - put.pptr as usize;
        let old_size = get.head.as_ref().size();
        let mut delta_allocated = 0usize;

        if old_size > self.min_block_size {
            let block = MemoryBlock::create(self.min_block_size);
            put.total_allocated += self.min_block_size;
            delta_allocated = self.min_block_size;
            let new_freed = self.total_freed.load(Ordering::Relaxed) + old_size;
            let old_block = get.head;
            get.head = block;
            put.head = block;
            self.total_freed.store(new_freed, Ordering::Release);
            MemoryBlock::release(old_block);
        }

        let start = get.head.as_ref().start();
        let block_size = get.head.as_ref().size();
        get.eback = start;
        get.gptr.store(start, Ordering::Relaxed);
        get.egptr = start;

        // Keep `data_size` at zero: the unused tail space grew by `block_size - old_unused`
        // while `total_allocated` grew by `delta_allocated`.
        put.total_reset += block_size as isize - old_unused as isize - delta_allocated as isize;
        put.pbase = start;
        put.pptr = start;
        put.epptr = get.head.as_ref().end();
        self.frontier_shadow.store(start, Ordering::SeqCst);
        self.frontier.store(start, Ordering::SeqCst);
        self.drained_gptr.store(start, Ordering::Release);
    }
}

impl Drop for StreamBuf {
    fn drop(&mut self) {
        // The chain owns one reference per block; outstanding message slices keep their
        // blocks alive past this point.
        let mut head = Some(unsafe { &*self.get.get() }.head);
        while let Some(block) = head {
            let next = unsafe { block.as_ref() }.next();
            unsafe { MemoryBlock::release(block) };
            head = NonNull::new(next);
        }
    }
}

/// Write end of a streaming buffer. Exactly one thread at a time may own it.
pub struct Producer {
    pub(crate) sb: Arc<StreamBuf>,
}

/// Read end of a streaming buffer. Exactly one thread at a time may own it.
pub struct Consumer {
    pub(crate) sb: Arc<StreamBuf>,
}

unsafe impl Send for Producer {}
unsafe impl Send for Consumer {}

/// Creates a streaming buffer and returns its two ends.
///
/// `min_block_size` is the smallest payload to allocate per block (rounded up to an
/// allocator-friendly size), `full_watermark` the occupancy at which [`Producer::buffer_full`]
/// starts reporting backpressure, and `max_alloc` the hard cap on outstanding block memory.
///
/// ```
/// let (mut tx, mut rx) = io_dispatch::stream_buffer(64, 512, usize::MAX);
///
/// assert_eq!(tx.write(b"ping"), 4);
///
/// let mut buf = [0u8; 4];
/// assert_eq!(rx.read(&mut buf), 4);
/// assert_eq!(&buf, b"ping");
/// ```
pub fn stream_buffer(
    min_block_size: usize,
    full_watermark: usize,
    max_alloc: usize,
) -> (Producer, Consumer) {
    let sb = StreamBuf::new(min_block_size, full_watermark, max_alloc);
    (Producer { sb: sb.clone() }, Consumer { sb })
}

/// Buffer filled by an input device from its fd and drained by the decode path. The owning
/// device acts as producer while reading and as consumer while decoding, so this type carries
/// both ends.
pub struct InputBuffer {
    pub(crate) prod: Producer,
    pub(crate) cons: Consumer,
}

impl InputBuffer {
    pub fn new(min_block_size: usize, full_watermark: usize, max_alloc: usize) -> Self {
        let (prod, cons) = stream_buffer(min_block_size, full_watermark, max_alloc);
        InputBuffer { prod, cons }
    }

    pub(crate) fn set_input_device(&self, device: &DeviceCore) {
        self.prod.sb.set_input_device(device);
    }

    /// Contiguous room at the write cursor right now.
    pub fn write_space(&self) -> usize { self.prod.contiguous() }

    /// Contiguous room at the write cursor, growing the chain when exhausted. Zero means the
    /// allocation cap was hit.
    pub fn write_space_forced(&mut self) -> usize { self.prod.contiguous_forced() }

    pub fn write_ptr(&self) -> *mut u8 { self.prod.put_ptr() }

    /// Publishes `n` bytes which were written at [`Self::write_ptr`].
    pub fn commit(&mut self, n: usize) { self.prod.commit(n) }

    pub fn read_ptr(&self) -> *const u8 { self.cons.get_ptr() }

    /// Whether `len` bytes starting at the read cursor lie within the current head block.
    pub fn is_contiguous(&self, len: usize) -> bool { self.cons.is_contiguous(len) }

    /// A message slice over `len` contiguous bytes at the read cursor.
    pub fn slice(&self, len: usize) -> crate::MsgSlice { self.cons.slice(len) }

    /// Advances the read cursor past `n` decoded bytes.
    pub fn advance_read(&mut self, n: usize) { self.cons.advance(n) }

    /// Copies up to `dst.len()` buffered bytes out, crossing block boundaries.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.cons.read(dst);
        self.cons.restart_input_if_needed();
        n
    }

    /// Exact number of buffered bytes. Safe here because this type is the sole owner of both
    /// ends.
    pub fn data_size(&self) -> usize { unsafe { self.prod.sb.data_size() } }

    pub fn has_multiple_blocks(&self) -> bool { unsafe { self.prod.sb.has_multiple_blocks() } }

    pub fn min_block_size(&self) -> usize { self.prod.sb.min_block_size() }

    /// Shrinks an empty buffer back to a single minimum-size block.
    pub fn reduce_if_empty(&mut self) {
        if self.data_size() == 0 {
            unsafe { self.prod.sb.reduce() };
            self.cons.restart_input_if_needed();
        }
    }

    pub fn stats(&self) -> BufStats { self.prod.sb.stats() }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        if !self.prod.sb.idevice.load(Ordering::Acquire).is_null() {
            self.prod.sb.clear_input_device();
        }
    }
}

/// Read end of a buffer drained by an output device; the matching [`Producer`] is held by the
/// user-facing writer.
pub struct OutputBuffer {
    pub(crate) cons: Consumer,
}

impl OutputBuffer {
    pub(crate) fn contiguous_forced(&mut self) -> usize { self.cons.contiguous_forced() }

    pub(crate) fn get_ptr(&self) -> *const u8 { self.cons.get_ptr() }

    pub(crate) fn advance(&mut self, n: usize) {
        self.cons.advance(n);
        self.cons.restart_input_if_needed();
    }

    pub(crate) fn nothing_to_get(&self) -> crate::Fuzzy { self.cons.nothing_to_get() }
}

impl Drop for OutputBuffer {
    fn drop(&mut self) {
        if !self.cons.sb.odevice.load(Ordering::Acquire).is_null() {
            self.cons.sb.clear_output_device();
        }
    }
}

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

//! Reference-counted memory blocks forming the chain a streaming buffer flows through, and
//! message slices pinning a block alive after the read cursor moved past it.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::fmt::{self, Debug, Formatter};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{fence, AtomicI32, AtomicPtr, Ordering};

/// Bytes occupied by the [`MemoryBlock`] header at the front of every allocation.
pub(crate) const BLOCK_HEADER: usize = size_of::<MemoryBlock>();

/// Header of a single heap allocation; the payload bytes immediately follow it.
///
/// A block is retained by the get-area head, the put-area head and every outstanding
/// [`MsgSlice`], and is deallocated exactly when the last of those references is gone.
#[repr(C)]
pub struct MemoryBlock {
    count: AtomicI32,
    next: AtomicPtr<MemoryBlock>,
    block_size: usize,
}

impl MemoryBlock {
    /// Allocates a block with a payload of exactly `block_size` bytes and a reference count
    /// of one.
    ///
    /// `block_size` must come from [`round_up_block_size`] or [`round_down_block_size`] so that
    /// header plus payload lands on an allocator-friendly boundary.
    pub(crate) fn create(block_size: usize) -> NonNull<MemoryBlock> {
        let layout = Self::layout(block_size);
        let raw = unsafe { alloc(layout) } as *mut MemoryBlock;
        let Some(block) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        unsafe {
            block.as_ptr().write(MemoryBlock {
                count: AtomicI32::new(1),
                next: AtomicPtr::new(std::ptr::null_mut()),
                block_size,
            });
        }
        block
    }

    fn layout(block_size: usize) -> Layout {
        Layout::from_size_align(BLOCK_HEADER + block_size, align_of::<MemoryBlock>())
            .expect("block size overflows the address space")
    }

    /// First payload byte.
    pub fn start(&self) -> *mut u8 {
        unsafe { (self as *const MemoryBlock as *mut u8).add(BLOCK_HEADER) }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize { self.block_size }

    /// One past the last payload byte.
    pub fn end(&self) -> *mut u8 { unsafe { self.start().add(self.block_size) } }

    /// The following block in the chain, or null for the current tail.
    pub(crate) fn next(&self) -> *mut MemoryBlock { self.next.load(Ordering::Acquire) }

    /// Links `next` behind this block. Must happen before the producer publishes a write
    /// frontier inside `next`, so that a consumer seeing the frontier also sees the link.
    pub(crate) fn link_next(&self, next: NonNull<MemoryBlock>) {
        self.next.store(next.as_ptr(), Ordering::Release);
    }

    pub(crate) fn add_reference(&self) { self.count.fetch_add(1, Ordering::Relaxed); }

    /// Drops one reference; frees the allocation when it was the last one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being released and must not touch the block afterward.
    pub(crate) unsafe fn release(block: NonNull<MemoryBlock>) {
        if block.as_ref().count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let layout = Self::layout(block.as_ref().block_size);
            dealloc(block.as_ptr() as *mut u8, layout);
        }
    }

    #[cfg(test)]
    pub(crate) fn refcount(&self) -> i32 { self.count.load(Ordering::Relaxed) }
}

/// Rounds a requested payload size up so that header plus payload occupies a power of two
/// (small blocks) or a whole number of pages (large blocks).
pub(crate) fn round_up_block_size(requested: usize) -> usize {
    const PAGE: usize = 4096;
    let heap = BLOCK_HEADER + requested;
    let rounded = if heap <= PAGE {
        // Leaves room for at least a few payload bytes beside the header.
        heap.next_power_of_two().max(64)
    } else {
        (heap + PAGE - 1) / PAGE * PAGE
    };
    rounded - BLOCK_HEADER
}

/// Rounds a payload budget down to the largest allocator-friendly size not exceeding it.
/// Returns zero when the budget cannot hold even the block header.
pub(crate) fn round_down_block_size(budget: usize) -> usize {
    const PAGE: usize = 4096;
    let heap = BLOCK_HEADER.saturating_add(budget);
    let rounded = if heap >= 2 * PAGE {
        heap / PAGE * PAGE
    } else {
        // Largest power of two not above `heap`.
        1usize << (usize::BITS - 1 - heap.leading_zeros())
    };
    rounded.saturating_sub(BLOCK_HEADER)
}

/// A view into a [`MemoryBlock`] payload holding one strong reference to the block.
///
/// Handed to decoders for every framed message. Cloning the slice clones the reference; the
/// block outlives the buffer's read cursor for as long as any slice exists.
pub struct MsgSlice {
    ptr: *const u8,
    len: usize,
    block: NonNull<MemoryBlock>,
}

// The block reference count is atomic and the viewed bytes are not mutated while the slice is
// the only way to reach them.
unsafe impl Send for MsgSlice {}
unsafe impl Sync for MsgSlice {}

impl MsgSlice {
    /// Creates a slice over `len` bytes starting at `ptr`, taking a new reference on `block`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must lie inside the payload of `block`, and `block` must be alive.
    pub(crate) unsafe fn new(ptr: *const u8, len: usize, block: NonNull<MemoryBlock>) -> Self {
        debug_assert!(ptr as *mut u8 >= block.as_ref().start());
        debug_assert!((ptr as *mut u8).add(len) <= block.as_ref().end());
        block.as_ref().add_reference();
        MsgSlice { ptr, len, block }
    }

    pub fn as_bytes(&self) -> &[u8] { unsafe { slice::from_raw_parts(self.ptr, self.len) } }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Shrinks the view from the front by `n` bytes.
    pub fn remove_prefix(&mut self, n: usize) {
        assert!(n <= self.len);
        self.ptr = unsafe { self.ptr.add(n) };
        self.len -= n;
    }

    /// Shrinks the view from the back by `n` bytes.
    pub fn remove_suffix(&mut self, n: usize) {
        assert!(n <= self.len);
        self.len -= n;
    }
}

impl Clone for MsgSlice {
    fn clone(&self) -> Self {
        unsafe { self.block.as_ref() }.add_reference();
        MsgSlice {
            ptr: self.ptr,
            len: self.len,
            block: self.block,
        }
    }
}

impl Drop for MsgSlice {
    fn drop(&mut self) {
        unsafe { MemoryBlock::release(self.block) };
    }
}

impl Debug for MsgSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MsgSlice(\"{}\")", self.as_bytes().escape_ascii())
    }
}

impl AsRef<[u8]> for MsgSlice {
    fn as_ref(&self) -> &[u8] { self.as_bytes() }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rounding_up_is_allocator_friendly() {
        for requested in [1usize, 7, 64, 100, 512, 4000] {
            let payload = round_up_block_size(requested);
            assert!(payload >= requested);
            let heap = payload + BLOCK_HEADER;
            assert!(heap.is_power_of_two() || heap % 4096 == 0, "heap size {heap}");
        }
        // Large requests land on page multiples.
        let payload = round_up_block_size(100_000);
        assert_eq!((payload + BLOCK_HEADER) % 4096, 0);
    }

    #[test]
    fn rounding_down_stays_under_budget() {
        for budget in [64usize, 104, 1000, 5000, 100_000] {
            let payload = round_down_block_size(budget);
            assert!(payload <= budget);
        }
        assert_eq!(round_down_block_size(0), 0);
    }

    #[test]
    fn up_then_down_is_identity() {
        for requested in [1usize, 100, 512, 5000] {
            let payload = round_up_block_size(requested);
            assert_eq!(round_down_block_size(payload), payload);
        }
    }

    #[test]
    fn block_lifecycle() {
        let block = MemoryBlock::create(round_up_block_size(64));
        let r = unsafe { block.as_ref() };
        assert_eq!(r.refcount(), 1);
        assert!(r.next().is_null());
        assert_eq!(r.end() as usize - r.start() as usize, r.size());
        unsafe { MemoryBlock::release(block) };
    }

    #[test]
    fn slice_pins_block() {
        let block = MemoryBlock::create(round_up_block_size(64));
        let start = unsafe { block.as_ref() }.start();
        unsafe { std::ptr::copy_nonoverlapping(b"hello".as_ptr(), start, 5) };

        let slice = unsafe { MsgSlice::new(start, 5, block) };
        assert_eq!(unsafe { block.as_ref() }.refcount(), 2);

        let copy = slice.clone();
        assert_eq!(unsafe { block.as_ref() }.refcount(), 3);

        // Give up the chain's own reference; the slices keep the payload readable.
        unsafe { MemoryBlock::release(block) };
        assert_eq!(slice.as_bytes(), b"hello");
        assert_eq!(copy.as_bytes(), b"hello");

        drop(slice);
        drop(copy);
    }

    #[test]
    fn slice_trimming() {
        let block = MemoryBlock::create(round_up_block_size(64));
        let start = unsafe { block.as_ref() }.start();
        unsafe { std::ptr::copy_nonoverlapping(b"status: ok\n".as_ptr(), start, 11) };
        let mut slice = unsafe { MsgSlice::new(start, 11, block) };
        unsafe { MemoryBlock::release(block) };

        slice.remove_prefix(8);
        slice.remove_suffix(1);
        assert_eq!(slice.as_bytes(), b"ok");
    }
}

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

//! Per-descriptor device state: the flag word, the state lock serializing compound
//! transitions, the intrusive reference count feeding deferred deletion, and the smart
//! pointer handing devices out to user code.

use std::cell::UnsafeCell;
use std::fmt::{self, Debug, Display, Formatter};
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard, Weak};

use crate::dispatcher::Dispatcher;
use crate::poller;

/// Direction of I/O on a device; most state bits exist once per direction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) fn open_bit(self) -> u32 {
        match self {
            Direction::Read => Flags::R_OPEN,
            Direction::Write => Flags::W_OPEN,
        }
    }

    pub(crate) fn active_bit(self) -> u32 {
        match self {
            Direction::Read => Flags::R_ACTIVE,
            Direction::Write => Flags::W_ACTIVE,
        }
    }

    pub(crate) fn added_bit(self) -> u32 {
        match self {
            Direction::Read => Flags::R_ADDED,
            Direction::Write => Flags::W_ADDED,
        }
    }

    pub(crate) fn disabled_bit(self) -> u32 {
        match self {
            Direction::Read => Flags::R_DISABLED,
            Direction::Write => Flags::W_DISABLED,
        }
    }

    /// The notifier event this direction subscribes to.
    pub(crate) fn event(self) -> u32 {
        match self {
            Direction::Read => poller::READ,
            Direction::Write => poller::WRITE,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// The device flag word. Individual bits are manipulated atomically; compound transitions
/// take the device state lock around several bit operations.
pub struct Flags(AtomicU32);

impl Flags {
    /// The fd is open for reading.
    pub const R_OPEN: u32 = 1 << 0;
    /// The fd is open for writing.
    pub const W_OPEN: u32 = 1 << 1;
    /// The read direction is armed in the interest set.
    pub const R_ACTIVE: u32 = 1 << 2;
    /// The write direction is armed in the interest set.
    pub const W_ACTIVE: u32 = 1 << 3;
    /// The read direction is present in the notifier.
    pub const R_ADDED: u32 = 1 << 4;
    /// The write direction is present in the notifier.
    pub const W_ADDED: u32 = 1 << 5;
    /// User-level veto on starting the read direction.
    pub const R_DISABLED: u32 = 1 << 6;
    /// User-level veto on starting the write direction.
    pub const W_DISABLED: u32 = 1 << 7;
    /// The device can read.
    pub const INPUT: u32 = 1 << 8;
    /// The device can write.
    pub const OUTPUT: u32 = 1 << 9;
    /// Regular file: always ready, bypasses the notifier.
    pub const REGULAR_FILE: u32 = 1 << 10;
    /// Reading and writing go through the same fd.
    pub const SAME: u32 = 1 << 11;
    /// The device does not keep the dispatcher alive during clean termination.
    pub const INFERIOR: u32 = 1 << 12;
    /// Terminal state entered when the last direction closes.
    pub const DEAD: u32 = 1 << 13;
    /// The fd is borrowed and must not be closed on teardown.
    pub const DONT_CLOSE: u32 = 1 << 14;

    /// A worker job for the given event kind is in flight.
    const PROCESSED_R: u32 = 1 << 16;
    const PROCESSED_W: u32 = 1 << 17;
    const PROCESSED_HUP: u32 = 1 << 18;
    const PROCESSED_ERR: u32 = 1 << 19;

    fn new(kind: u32) -> Self { Flags(AtomicU32::new(kind)) }

    pub fn test(&self, mask: u32) -> bool { self.0.load(Ordering::Relaxed) & mask != 0 }

    pub(crate) fn set(&self, mask: u32) { self.0.fetch_or(mask, Ordering::AcqRel); }

    pub(crate) fn clear(&self, mask: u32) { self.0.fetch_and(!mask, Ordering::AcqRel); }

    /// Sets `mask`; returns whether it was previously clear.
    pub(crate) fn test_and_set(&self, mask: u32) -> bool {
        self.0.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Clears `mask`; returns whether it was previously set.
    pub(crate) fn test_and_clear(&self, mask: u32) -> bool {
        self.0.fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Whether any direction is present in the notifier.
    pub fn is_added(&self) -> bool { self.test(Self::R_ADDED | Self::W_ADDED) }

    /// Marks `dir` as present in the notifier; returns whether the device as a whole was
    /// absent from it before, i.e. whether an add rather than a modify is due.
    pub(crate) fn test_and_set_added(&self, dir: Direction) -> bool {
        let old = self.0.fetch_or(dir.added_bit(), Ordering::AcqRel);
        old & (Self::R_ADDED | Self::W_ADDED) == 0
    }

    /// Whether any direction is still open.
    pub fn is_open(&self) -> bool { self.test(Self::R_OPEN | Self::W_OPEN) }

    /// Open for reading and not vetoed.
    pub fn is_readable(&self) -> bool {
        let flags = self.0.load(Ordering::Relaxed);
        flags & Self::R_OPEN != 0 && flags & Self::R_DISABLED == 0
    }

    /// Open for writing and not vetoed.
    pub fn is_writable(&self) -> bool {
        let flags = self.0.load(Ordering::Relaxed);
        flags & Self::W_OPEN != 0 && flags & Self::W_DISABLED == 0
    }

    /// The notifier events corresponding to the currently armed directions.
    pub(crate) fn armed_events(&self) -> u32 {
        let flags = self.0.load(Ordering::Relaxed);
        let mut events = 0;
        if flags & Self::R_ACTIVE != 0 {
            events |= poller::READ;
        }
        if flags & Self::W_ACTIVE != 0 {
            events |= poller::WRITE;
        }
        events
    }

    fn processed_bit(event: u32) -> u32 {
        match event {
            e if e == poller::READ => Self::PROCESSED_R,
            e if e == poller::WRITE => Self::PROCESSED_W,
            e if e == poller::HUP => Self::PROCESSED_HUP,
            e if e == poller::ERR => Self::PROCESSED_ERR,
            _ => 0,
        }
    }

    /// Atomically marks the given event kinds as in flight; returns the subset which already
    /// was, meaning a worker job is still running for it.
    pub(crate) fn test_and_set_processed(&self, events: u32) -> u32 {
        let mut wanted = 0;
        for event in [poller::READ, poller::WRITE, poller::HUP, poller::ERR] {
            if events & event != 0 {
                wanted |= Self::processed_bit(event);
            }
        }
        let old = self.0.fetch_or(wanted, Ordering::AcqRel);
        let mut already = 0;
        for event in [poller::READ, poller::WRITE, poller::HUP, poller::ERR] {
            if events & event != 0 && old & Self::processed_bit(event) != 0 {
                already |= event;
            }
        }
        already
    }

    pub(crate) fn clear_processed(&self, event: u32) {
        self.0.fetch_and(!Self::processed_bit(event), Ordering::AcqRel);
    }
}

impl Debug for Flags {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#07x})", self.0.load(Ordering::Relaxed))
    }
}

/// Proof that the device state lock is held; the dispatcher's arm/disarm entry points demand
/// it from the caller so that compound flag transitions stay serialized.
pub struct StateGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

/// Sets `O_NONBLOCK` on an fd, which every dispatched device requires.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Common state of every dispatched device.
///
/// Holds the fd, the flag word, the state lock and the intrusive reference count. The count
/// reaching zero does not destroy the device: it pushes it onto the dispatcher's deletion
/// list, and the dispatcher thread performs the actual destruction. This makes releasing a
/// reference safe from any thread and under any lock.
pub struct DeviceCore {
    /// Weak so that devices parked on the dispatcher's deletion list cannot keep the
    /// dispatcher itself alive in a cycle.
    dispatcher: Weak<Dispatcher>,
    fd: AtomicI32,
    flags: Flags,
    state_lock: RwLock<()>,
    count: AtomicI32,
    /// Deletion-list link, touched only by the list's push/flush protocol.
    pub(crate) next: AtomicPtr<DeviceCore>,
    /// Fat pointer back to the concrete device, set once before the first share.
    this: UnsafeCell<Option<NonNull<dyn Device>>>,
}

unsafe impl Send for DeviceCore {}
unsafe impl Sync for DeviceCore {}

impl DeviceCore {
    /// Creates the core of a device of the given kind: [`Flags::INPUT`], [`Flags::OUTPUT`] or
    /// both, optionally or'ed with [`Flags::REGULAR_FILE`], [`Flags::INFERIOR`] or
    /// [`Flags::DONT_CLOSE`].
    pub fn new(dispatcher: &Arc<Dispatcher>, kind: u32) -> Self {
        DeviceCore {
            dispatcher: Arc::downgrade(dispatcher),
            fd: AtomicI32::new(-1),
            flags: Flags::new(kind),
            state_lock: RwLock::new(()),
            count: AtomicI32::new(1),
            next: AtomicPtr::new(null_mut()),
            this: UnsafeCell::new(None),
        }
    }

    /// Adopts an open fd: switches it to non-blocking and marks the supported directions
    /// open. Must be called before the device is started.
    pub fn init(&self, fd: RawFd) -> io::Result<()> {
        set_nonblocking(fd)?;
        self.fd.store(fd, Ordering::Release);
        let mut open = 0;
        if self.flags.test(Flags::INPUT) {
            open |= Flags::R_OPEN;
        }
        if self.flags.test(Flags::OUTPUT) {
            open |= Flags::W_OPEN;
        }
        if open == Flags::R_OPEN | Flags::W_OPEN {
            open |= Flags::SAME;
        }
        self.flags.set(open);
        Ok(())
    }

    pub fn fd(&self) -> RawFd { self.fd.load(Ordering::Acquire) }

    pub fn flags(&self) -> &Flags { &self.flags }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.upgrade().expect("device used after its dispatcher was dropped")
    }

    /// Takes the device state lock.
    pub fn state(&self) -> StateGuard<'_> {
        StateGuard {
            _guard: self.state_lock.write().expect("device state lock poisoned"),
        }
    }

    /// Adds a strong reference, pinning the device alive.
    pub fn inhibit_deletion(&self) {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    /// Drops a strong reference. When the last one goes, the device is staged for destruction
    /// on the dispatcher thread; it is never destroyed on the calling thread.
    pub fn allow_deletion(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            match self.dispatcher.upgrade() {
                Some(dispatcher) => dispatcher.add_needs_deletion(self),
                None => {
                    // No dispatcher left to serialize destruction on. Leaking is the only
                    // option which cannot free the device under a concurrent accessor.
                    #[cfg(feature = "log")]
                    log::error!(target: "dispatcher", "Device released after its dispatcher; leaking it");
                }
            }
        }
    }

    pub(crate) fn set_this(&self, this: NonNull<dyn Device>) {
        unsafe { *self.this.get() = Some(this) };
    }

    pub(crate) fn this(&self) -> NonNull<dyn Device> {
        unsafe { *self.this.get() }.expect("device not owned by a DeviceRc")
    }

    /// Registers or re-arms this device's interest in the notifier.
    pub(crate) fn start_watching(&self, needs_adding: bool) {
        let events = self.flags.armed_events();
        let cookie = self as *const DeviceCore as u64;
        let dispatcher = self.dispatcher();
        let res = if needs_adding {
            dispatcher.notifier().add(self.fd(), events, cookie)
        } else {
            dispatcher.notifier().modify(self.fd(), events, cookie)
        };
        if let Err(_err) = res {
            #[cfg(feature = "log")]
            log::error!(target: "dispatcher", "Failed to watch fd {}: {_err}", self.fd());
        }
    }

    /// Drops or narrows this device's interest in the notifier.
    pub(crate) fn stop_watching(&self, needs_removal: bool) {
        let dispatcher = self.dispatcher();
        let res = if needs_removal {
            dispatcher.notifier().delete(self.fd())
        } else {
            let events = self.flags.armed_events();
            let cookie = self as *const DeviceCore as u64;
            dispatcher.notifier().modify(self.fd(), events, cookie)
        };
        if let Err(_err) = res {
            #[cfg(feature = "log")]
            log::error!(target: "dispatcher", "Failed to unwatch fd {}: {_err}", self.fd());
        }
    }

    /// Marks a worker job for `event` as finished.
    ///
    /// The in-flight bit is cleared before the interest set is reconsulted: readiness which
    /// became true while the handler ran must find the bit clear, otherwise the dispatcher
    /// would drop the event and the device would stall.
    pub(crate) fn clear_processed(&self, event: u32) {
        self.flags.clear_processed(event);
        if self.flags.is_added() && !self.flags.test(Flags::REGULAR_FILE) {
            self.start_watching(false);
        }
    }
}

/// A dispatched device. Implementations embed a [`DeviceCore`] and the input/output halves
/// they support; the event entry points run on worker threads, at most one job per
/// `(device, event kind)` at a time.
pub trait Device: Send + Sync + 'static {
    fn core(&self) -> &DeviceCore;

    /// The fd is readable.
    fn read_event(&self) {}

    /// The fd is writable.
    fn write_event(&self) {}

    /// The peer closed its end. The dispatcher closes the device right after this returns.
    fn hup_event(&self) {}

    /// The notifier reported an error condition on the fd.
    fn exceptional_event(&self) {}

    /// Closes every open direction of the device.
    fn close(&self) {}

    /// The last direction closed; the device is dead.
    fn closed(&self) {}
}

/// Strong reference to a device, backed by the intrusive count in its [`DeviceCore`].
///
/// When the last reference is dropped the device is handed to the dispatcher's deletion list
/// instead of being destroyed in place; destruction always runs on the dispatcher thread.
pub struct DeviceRc<T: Device> {
    ptr: NonNull<T>,
}

unsafe impl<T: Device> Send for DeviceRc<T> {}
unsafe impl<T: Device> Sync for DeviceRc<T> {}

impl<T: Device> DeviceRc<T> {
    /// Moves the device to the heap and takes the first reference on it.
    pub fn new(device: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(device)));
        let fat: NonNull<dyn Device> = ptr;
        unsafe { ptr.as_ref() }.core().set_this(fat);
        DeviceRc { ptr }
    }
}

impl<T: Device> Deref for DeviceRc<T> {
    type Target = T;

    fn deref(&self) -> &T { unsafe { self.ptr.as_ref() } }
}

impl<T: Device> Clone for DeviceRc<T> {
    fn clone(&self) -> Self {
        self.core().inhibit_deletion();
        DeviceRc { ptr: self.ptr }
    }
}

impl<T: Device> Drop for DeviceRc<T> {
    fn drop(&mut self) {
        self.core().allow_deletion();
    }
}

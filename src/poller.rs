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

//! Thin wrapper around the Linux epoll readiness notifier, plus the eventfd used to interrupt
//! a blocked wait from other threads.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// Readiness event kinds, as epoll reports them.
pub const READ: u32 = libc::EPOLLIN as u32;
pub const WRITE: u32 = libc::EPOLLOUT as u32;
pub const HUP: u32 = libc::EPOLLHUP as u32;
pub const ERR: u32 = libc::EPOLLERR as u32;

/// Cookie reserved for the wake-up eventfd; never collides with a device cookie, which is
/// always a heap address.
pub(crate) const WAKER_COOKIE: u64 = u64::MAX;

/// A single readiness report.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct IoEvent {
    /// Opaque value registered with the descriptor.
    pub cookie: u64,
    /// Bitmask of [`READ`], [`WRITE`], [`HUP`], [`ERR`].
    pub events: u32,
}

/// Owner of one epoll instance.
///
/// Interest-set mutations happen from whichever thread holds the relevant device state lock;
/// waiting happens on the dispatcher thread only. The fd is stored atomically so that a close
/// during shutdown turns later calls into no-ops instead of hitting a reused descriptor.
pub struct Poller {
    fd: AtomicI32,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller { fd: AtomicI32::new(fd) })
    }

    fn fd(&self) -> RawFd { self.fd.load(Ordering::Acquire) }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        let epfd = self.fd();
        if epfd == -1 {
            return Ok(());
        }
        let mut event = libc::epoll_event {
            events,
            u64: cookie,
        };
        let event_ptr = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut event as *mut libc::epoll_event
        };
        if unsafe { libc::epoll_ctl(epfd, op, fd, event_ptr) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, cookie)
    }

    pub fn modify(&self, fd: RawFd, events: u32, cookie: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, cookie)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Blocks until at least one descriptor is ready and appends the reports to `out`.
    ///
    /// An interrupted wait surfaces as `ErrorKind::Interrupted`; the caller decides whether
    /// to retry.
    pub fn wait(&self, out: &mut Vec<IoEvent>, max_events: usize) -> io::Result<()> {
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(max_events);
        let n = unsafe {
            libc::epoll_wait(self.fd(), events.as_mut_ptr(), max_events as libc::c_int, -1)
        };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        unsafe { events.set_len(n as usize) };
        for event in &events {
            out.push(IoEvent {
                cookie: event.u64,
                events: event.events,
            });
        }
        Ok(())
    }

    /// Closes the epoll instance; subsequent interest-set calls become no-ops.
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd != -1 {
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) { self.close(); }
}

/// Eventfd used to interrupt the dispatcher's blocked wait from any thread.
pub(crate) struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker { fd })
    }

    pub fn fd(&self) -> RawFd { self.fd }

    pub fn wake(&self) {
        let one: u64 = 1;
        // A full counter means a wake-up is already pending; nothing to do.
        unsafe { libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8) };
    }

    /// Drains the pending wake-ups after the dispatcher woke.
    pub fn reset(&self) {
        let mut counter: u64 = 0;
        unsafe { libc::read(self.fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

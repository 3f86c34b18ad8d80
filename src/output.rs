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

//! The output half of a device: the writable-event loop draining the buffer into the fd, the
//! user-facing writer handle, and open/close management of the write direction.

use std::io;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::buffer::{stream_buffer, OutputBuffer, Producer};
use crate::device::{Device, DeviceCore, Direction, Flags};
use crate::input::ErrorAction;

/// A device with a writable fd drained from an [`OutputBuffer`].
pub trait OutputDevice: Device {
    fn output(&self) -> &OutputHalf;

    /// Called for write errors other than `EINTR`/`EAGAIN`/`EWOULDBLOCK`.
    fn write_error(&self, _errno: i32) -> ErrorAction { ErrorAction::Close }
}

/// Buffer of a device's write direction, attached after construction via
/// [`OutputHalf::create_buffer`].
pub struct OutputHalf {
    inner: Mutex<Option<OutputBuffer>>,
}

impl Default for OutputHalf {
    fn default() -> Self { Self::new() }
}

impl OutputHalf {
    pub fn new() -> Self { OutputHalf { inner: empty!() } }

    /// Creates the output buffer and hands back the producing end. The writer pins the device
    /// alive for as long as it exists.
    ///
    /// Call this on a device already owned by a [`crate::DeviceRc`]: both the buffer and the
    /// writer keep back-references to `core`, which must be the device's final heap location.
    pub fn create_buffer(
        &self,
        core: &DeviceCore,
        min_block_size: usize,
        full_watermark: usize,
        max_alloc: usize,
    ) -> Writer {
        let (prod, cons) = stream_buffer(min_block_size, full_watermark, max_alloc);
        prod.sb.set_output_device(core);
        core.inhibit_deletion();
        *self.inner.lock().expect("output half poisoned") = Some(OutputBuffer { cons });
        Writer {
            prod,
            core: NonNull::from(core),
        }
    }
}

/// Producing end of an output device's buffer, held by user code on any one thread at a time.
pub struct Writer {
    prod: Producer,
    core: NonNull<DeviceCore>,
}

// Holds a strong reference on the device; the producer end is single-owner by construction.
unsafe impl Send for Writer {}

impl Writer {
    /// Appends bytes to the outgoing stream. A short count means the buffer's allocation cap
    /// backpressured the write.
    pub fn write(&mut self, data: &[u8]) -> usize { self.prod.write(data) }

    /// Whether buffered output reached the backpressure watermark.
    pub fn buffer_full(&self) -> bool { self.prod.buffer_full() }

    /// Starts the device draining everything appended so far.
    pub fn flush(&self) { self.prod.flush() }
}

impl Drop for Writer {
    fn drop(&mut self) {
        unsafe { self.core.as_ref() }.allow_deletion();
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let taken = Writer::write(self, buf);
        if taken == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        Writer::flush(self);
        Ok(())
    }
}

/// Arms the write direction unconditionally.
pub fn start_output(dev: &dyn OutputDevice) {
    let core = dev.core();
    let state = core.state();
    core.dispatcher().start(&state, Direction::Write, core);
}

/// Disarms the write direction.
pub fn stop_output(dev: &dyn OutputDevice) {
    let core = dev.core();
    let state = core.state();
    core.dispatcher().stop(&state, Direction::Write, core);
}

/// Closes the write direction: removes it from the dispatcher, closes the fd unless it is
/// borrowed or shared with a still-open read side, and marks the device dead when it was the
/// last direction.
pub fn close_output(dev: &dyn OutputDevice) {
    let core = dev.core();
    let flags = core.flags();
    let mut need_closed = false;
    {
        let state = core.state();
        if !flags.test_and_clear(Flags::W_OPEN) {
            return;
        }
        core.dispatcher().remove(&state, Direction::Write, core);
        if !(flags.test(Flags::DONT_CLOSE)
            || (flags.test(Flags::SAME) && flags.test(Flags::R_OPEN)))
        {
            if unsafe { libc::close(core.fd()) } == -1 {
                #[cfg(feature = "log")]
                log::warn!(target: "dispatcher", "Failed to close fd {}", core.fd());
            }
        }
        flags.clear(Flags::W_DISABLED);
        if !flags.is_open() {
            flags.set(Flags::DEAD);
            need_closed = true;
        }
    }
    if need_closed {
        dev.closed();
    }
}

enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
    Err(i32),
}

fn write_fd(fd: i32, ptr: *const u8, len: usize) -> WriteOutcome {
    loop {
        let res = unsafe { libc::write(fd, ptr as *const libc::c_void, len) };
        if res == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return WriteOutcome::WouldBlock,
                _ if errno == libc::EWOULDBLOCK => return WriteOutcome::WouldBlock,
                _ => return WriteOutcome::Err(errno),
            }
        }
        return WriteOutcome::Wrote(res as usize);
    }
}

/// The writable-event body: drains the buffer into the fd until the fd would block or the
/// buffer runs dry, in which case the device disarms itself.
pub fn write_event(dev: &dyn OutputDevice) {
    let core = dev.core();
    let fd = core.fd();
    let mut guard = dev.output().inner.lock().expect("output half poisoned");
    let Some(buf) = guard.as_mut() else {
        return;
    };

    loop {
        let len = buf.contiguous_forced();
        if len == 0 {
            // Drained. Disarm, unless the producer published new data in the meantime; the
            // re-check under the state lock closes the race with a concurrent flush.
            let state = core.state();
            if core.dispatcher().stop_if(&state, || buf.nothing_to_get(), Direction::Write, core)
            {
                return;
            }
            continue;
        }
        match write_fd(fd, buf.get_ptr(), len) {
            WriteOutcome::WouldBlock => return,
            WriteOutcome::Err(errno) => {
                drop(guard);
                if dev.write_error(errno) == ErrorAction::Close {
                    close_output(dev);
                }
                return;
            }
            WriteOutcome::Wrote(n) => buf.advance(n),
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::RawFd;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::DeviceRc;
    use crate::{Dispatcher, WorkerPool};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    struct PipeDrain {
        core: DeviceCore,
        output: OutputHalf,
    }

    impl PipeDrain {
        fn create(dispatcher: &Arc<Dispatcher>, fd: RawFd) -> (DeviceRc<Self>, Writer) {
            let core = DeviceCore::new(dispatcher, Flags::OUTPUT);
            core.init(fd).unwrap();
            let dev = DeviceRc::new(PipeDrain {
                core,
                output: OutputHalf::new(),
            });
            let writer = dev.output.create_buffer(dev.core(), 512, 1 << 16, usize::MAX);
            (dev, writer)
        }
    }

    impl Device for PipeDrain {
        fn core(&self) -> &DeviceCore { &self.core }

        fn write_event(&self) { super::write_event(self) }

        fn close(&self) { close_output(self) }
    }

    impl OutputDevice for PipeDrain {
        fn output(&self) -> &OutputHalf { &self.output }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn flush_drains_the_buffer_into_the_pipe() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let (dev, mut writer) = PipeDrain::create(&dispatcher, wr);

        assert_eq!(writer.write(b"over the wire\n"), 14);
        writer.flush();

        let mut out = Vec::new();
        let mut chunk = [0u8; 64];
        while out.len() < 14 {
            let n = unsafe { libc::read(rd, chunk.as_mut_ptr() as *mut libc::c_void, 64) };
            if n > 0 {
                out.extend_from_slice(&chunk[..n as usize]);
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(out, b"over the wire\n");

        // Once drained the device disarms itself.
        wait_until("the device to disarm", || !dev.core().flags().test(Flags::W_ACTIVE));
        assert_eq!(dispatcher.active_count(), 0);

        dev.close();
        drop(writer);
        drop(dev);
        unsafe { libc::close(rd) };
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn flush_of_an_empty_buffer_arms_nothing() {
        let pool = WorkerPool::new(1, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let (dev, writer) = PipeDrain::create(&dispatcher, wr);

        writer.flush();
        assert!(!dev.core().flags().test(Flags::W_ACTIVE));
        assert_eq!(dispatcher.active_count(), 0);

        dev.close();
        drop(writer);
        drop(dev);
        unsafe { libc::close(rd) };
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn kernel_backpressure_round_trips_a_large_stream() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let (dev, mut writer) = PipeDrain::create(&dispatcher, wr);

        // Much more than a pipe holds, so the drain loop must ride several writable cycles.
        let data: Vec<u8> = (0..300_000usize).map(|i| (i % 249) as u8).collect();
        assert_eq!(writer.write(&data), data.len());
        writer.flush();

        let mut out = Vec::with_capacity(data.len());
        let mut chunk = [0u8; 4096];
        let deadline = Instant::now() + Duration::from_secs(10);
        while out.len() < data.len() {
            assert!(Instant::now() < deadline, "drain stalled at {}", out.len());
            let n = unsafe { libc::read(rd, chunk.as_mut_ptr() as *mut libc::c_void, 4096) };
            if n > 0 {
                out.extend_from_slice(&chunk[..n as usize]);
            } else {
                thread::yield_now();
            }
        }
        assert_eq!(out, data);

        wait_until("the device to disarm", || !dev.core().flags().test(Flags::W_ACTIVE));

        dev.close();
        drop(writer);
        drop(dev);
        unsafe { libc::close(rd) };
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn writes_after_a_drain_restart_the_device() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let (dev, mut writer) = PipeDrain::create(&dispatcher, wr);

        for round in 0..10u8 {
            let line = [b'#', round, b'\n'];
            assert_eq!(writer.write(&line), 3);
            writer.flush();
            let mut got = [0u8; 3];
            let mut off = 0;
            while off < 3 {
                let n = unsafe {
                    libc::read(rd, got[off..].as_mut_ptr() as *mut libc::c_void, 3 - off)
                };
                if n > 0 {
                    off += n as usize;
                } else {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            assert_eq!(got, line);
        }

        dev.close();
        drop(writer);
        drop(dev);
        unsafe { libc::close(rd) };
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }
}

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

//! The input half of a device: the readable-event loop filling the buffer from the fd, the
//! framing loop handing complete messages to the decoder, and open/close/veto management of
//! the read direction.

use std::slice;
use std::sync::{Arc, Mutex};

use crate::block::{round_up_block_size, MemoryBlock, MsgSlice};
use crate::buffer::InputBuffer;
use crate::decoder::Decoder;
use crate::device::{Device, DeviceCore, Direction, Flags};

/// What to do after an fd-level error was reported to the device.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ErrorAction {
    /// Close the failed direction.
    Close,
    /// Keep the device open; the handler arranged recovery itself.
    Ignore,
}

/// A device with a readable fd feeding a decoder through an [`InputBuffer`].
pub trait InputDevice: Device {
    fn input(&self) -> &InputHalf;

    /// Called when read(2) returns zero. Returning a byte injects it into the buffer instead
    /// of closing; persistent file watchers use this to stay alive at end of file.
    fn read_returned_zero(&self) -> Option<u8> { None }

    /// Called for read errors other than `EINTR`/`EAGAIN`/`EWOULDBLOCK`.
    fn read_error(&self, _errno: i32) -> ErrorAction { ErrorAction::Close }
}

struct InputState {
    buf: InputBuffer,
    decoder: Arc<dyn Decoder>,
}

/// Buffer and decoder of a device's read direction, attached after construction via
/// [`InputHalf::create_buffer`].
pub struct InputHalf {
    inner: Mutex<Option<InputState>>,
}

impl Default for InputHalf {
    fn default() -> Self { Self::new() }
}

impl InputHalf {
    pub fn new() -> Self { InputHalf { inner: empty!() } }

    /// Creates the input buffer with explicit sizes and attaches the decoder which will frame
    /// and receive its messages.
    ///
    /// Call this on a device already owned by a [`crate::DeviceRc`]: the buffer keeps a
    /// back-reference to `core`, which must be the device's final heap location.
    pub fn create_buffer(
        &self,
        core: &DeviceCore,
        decoder: Arc<dyn Decoder>,
        min_block_size: usize,
        full_watermark: usize,
        max_alloc: usize,
    ) {
        let buf = InputBuffer::new(min_block_size, full_watermark, max_alloc);
        buf.set_input_device(core);
        *self.inner.lock().expect("input half poisoned") = Some(InputState { buf, decoder });
    }

    /// Like [`Self::create_buffer`] with the sizes the decoder asks for.
    pub fn set_decoder(&self, core: &DeviceCore, decoder: Arc<dyn Decoder>) {
        let sizes = decoder.buffer_sizes();
        self.create_buffer(core, decoder, sizes.min_block_size, sizes.full_watermark, sizes.max_alloc);
    }

    /// Runs `f` on the input buffer, serialized against the device's own read loop. This is
    /// the raw drain path for data the decoder does not frame.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut InputBuffer) -> R) -> Option<R> {
        self.inner.lock().expect("input half poisoned").as_mut().map(|state| f(&mut state.buf))
    }
}

/// Arms the read direction.
pub fn start_input(dev: &dyn InputDevice) {
    let core = dev.core();
    let state = core.state();
    core.dispatcher().start(&state, Direction::Read, core);
}

/// Disarms the read direction; the fd stays open and a later start resumes it.
pub fn stop_input(dev: &dyn InputDevice) {
    let core = dev.core();
    let state = core.state();
    core.dispatcher().stop(&state, Direction::Read, core);
}

/// Vetoes the read direction and stops it.
pub fn disable_input(dev: &dyn InputDevice) {
    let core = dev.core();
    let state = core.state();
    if core.flags().test_and_set(Flags::R_DISABLED) {
        core.dispatcher().stop(&state, Direction::Read, core);
    }
}

/// Lifts the veto and re-arms the read direction if the device is still readable.
pub fn enable_input(dev: &dyn InputDevice) {
    let core = dev.core();
    let state = core.state();
    if core.flags().test_and_clear(Flags::R_DISABLED) && core.flags().is_readable() {
        core.dispatcher().start(&state, Direction::Read, core);
    }
}

/// Closes the read direction: removes it from the dispatcher, closes the fd unless it is
/// borrowed or shared with a still-open write side, and marks the device dead when it was the
/// last direction.
pub fn close_input(dev: &dyn InputDevice) {
    let core = dev.core();
    let flags = core.flags();
    let mut need_closed = false;
    {
        let state = core.state();
        if !flags.test_and_clear(Flags::R_OPEN) {
            return;
        }
        core.dispatcher().remove(&state, Direction::Read, core);
        if !(flags.test(Flags::DONT_CLOSE)
            || (flags.test(Flags::SAME) && flags.test(Flags::W_OPEN)))
        {
            if unsafe { libc::close(core.fd()) } == -1 {
                #[cfg(feature = "log")]
                log::warn!(target: "dispatcher", "Failed to close fd {}", core.fd());
            }
        }
        flags.clear(Flags::R_DISABLED);
        if !flags.is_open() {
            flags.set(Flags::DEAD);
            need_closed = true;
        }
    }
    if need_closed {
        dev.closed();
    }
}

enum ReadOutcome {
    Read(usize),
    Eof,
    WouldBlock,
    Err(i32),
}

fn read_fd(fd: i32, ptr: *mut u8, space: usize) -> ReadOutcome {
    loop {
        let res = unsafe { libc::read(fd, ptr as *mut libc::c_void, space) };
        if res == -1 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            match errno {
                libc::EINTR => continue,
                libc::EAGAIN => return ReadOutcome::WouldBlock,
                _ if errno == libc::EWOULDBLOCK => return ReadOutcome::WouldBlock,
                _ => return ReadOutcome::Err(errno),
            }
        }
        if res == 0 {
            return ReadOutcome::Eof;
        }
        return ReadOutcome::Read(res as usize);
    }
}

/// The readable-event body: fills the buffer from the fd and drives the decoder, looping
/// until the fd would block, so that edge-style readiness is never lost.
pub fn read_event(dev: &dyn InputDevice) {
    let core = dev.core();
    let fd = core.fd();
    let mut guard = dev.input().inner.lock().expect("input half poisoned");
    let Some(state) = guard.as_mut() else {
        return;
    };

    loop {
        let mut space = state.buf.write_space();
        if space == 0 {
            space = state.buf.write_space_forced();
            if space == 0 {
                // Out of buffer memory. Stop reading; a drain restarts the device.
                #[cfg(feature = "log")]
                log::debug!(target: "dispatcher", "Input buffer of fd {fd} is full; stopping reads");
                let s = core.state();
                core.dispatcher().stop(&s, Direction::Read, core);
                return;
            }
        }

        let ptr = state.buf.write_ptr();
        let rlen = match read_fd(fd, ptr, space) {
            ReadOutcome::WouldBlock => return,
            ReadOutcome::Err(errno) => {
                drop(guard);
                if dev.read_error(errno) == ErrorAction::Close {
                    close_input(dev);
                }
                return;
            }
            ReadOutcome::Eof => match dev.read_returned_zero() {
                None => {
                    drop(guard);
                    close_input(dev);
                    return;
                }
                Some(byte) => {
                    unsafe { *ptr = byte };
                    1
                }
            },
            ReadOutcome::Read(rlen) => rlen,
        };

        state.buf.commit(rlen);
        data_received(dev, state, ptr as *const u8, rlen);

        if !core.flags().is_readable() {
            // Closed or vetoed from inside the decoder path.
            return;
        }
    }
}

/// Frames and decodes every complete message among the freshly arrived bytes.
///
/// The caller is both ends of the buffer here: producer for the bytes just committed and
/// consumer for everything the decoder eats. A message contained in one block is handed out
/// as a zero-copy slice; one spanning blocks is first gathered into a scratch block.
fn data_received(dev: &dyn InputDevice, state: &mut InputState, new_data: *const u8, rlen: usize) {
    let core = dev.core();
    let mut new_data = new_data;
    let mut rlen = rlen;

    let fresh = unsafe { slice::from_raw_parts(new_data, rlen) };
    let mut len = state.decoder.end_of_msg_finder(fresh);
    if len == 0 {
        return;
    }

    if state.buf.has_multiple_blocks() {
        // The message starts at the buffer head, so its length is everything buffered minus
        // what arrived beyond its end.
        let msg_len = state.buf.data_size() - (rlen - len);
        if state.buf.is_contiguous(msg_len) {
            let msg = state.buf.slice(msg_len);
            state.decoder.decode(msg);
            state.buf.advance_read(msg_len);
        } else {
            let mut block_size = state.buf.min_block_size();
            if msg_len > block_size {
                block_size = round_up_block_size(msg_len);
            }
            let scratch = MemoryBlock::create(block_size);
            let start = unsafe { scratch.as_ref() }.start();
            let gathered =
                state.buf.read_into(unsafe { slice::from_raw_parts_mut(start, msg_len) });
            debug_assert_eq!(gathered, msg_len);
            let msg = unsafe { MsgSlice::new(start, msg_len, scratch) };
            state.decoder.decode(msg);
            // The slice took its own reference.
            unsafe { MemoryBlock::release(scratch) };
        }
        state.buf.reduce_if_empty();
        if !core.flags().is_readable() {
            return;
        }
        rlen -= len;
        if rlen == 0 {
            return;
        }
        new_data = unsafe { new_data.add(len) };
        let fresh = unsafe { slice::from_raw_parts(new_data, rlen) };
        len = state.decoder.end_of_msg_finder(fresh);
        if len == 0 {
            return;
        }
    }

    // A single block is left; eat every complete message it holds.
    loop {
        let start = state.buf.read_ptr();
        let msg_len = (new_data as usize - start as usize) + len;
        let msg = state.buf.slice(msg_len);
        state.decoder.decode(msg);
        state.buf.advance_read(msg_len);
        state.buf.reduce_if_empty();
        if !core.flags().is_readable() {
            return;
        }
        rlen -= len;
        if rlen == 0 {
            return;
        }
        new_data = unsafe { new_data.add(len) };
        let fresh = unsafe { slice::from_raw_parts(new_data, rlen) };
        len = state.decoder.end_of_msg_finder(fresh);
        if len == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::RawFd;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::decoder::BufferSizes;
    use crate::device::DeviceRc;
    use crate::{Dispatcher, WorkerPool};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    /// A connected pair where shutting down one peer's write side delivers a clean
    /// end-of-stream (a closed pipe writer would raise a hang-up instead, which takes the
    /// hang-up path rather than the read loop's end-of-file path).
    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    fn write_all(fd: RawFd, mut data: &[u8]) {
        while !data.is_empty() {
            let n = unsafe { libc::write(fd, data.as_ptr() as *const _, data.len()) };
            if n == -1 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            data = &data[n as usize..];
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Frames on newline, inclusive.
    #[derive(Default)]
    struct LineDecoder {
        msgs: Mutex<Vec<Vec<u8>>>,
        sizes: Option<BufferSizes>,
    }

    impl Decoder for LineDecoder {
        fn buffer_sizes(&self) -> BufferSizes { self.sizes.unwrap_or_default() }

        fn end_of_msg_finder(&self, new_data: &[u8]) -> usize {
            new_data.iter().position(|&b| b == b'\n').map(|pos| pos + 1).unwrap_or(0)
        }

        fn decode(&self, msg: MsgSlice) {
            self.msgs.lock().unwrap().push(msg.as_bytes().to_vec());
        }
    }

    /// Never frames anything; fills the buffer until the cap backpressures the device.
    struct NopDecoder;

    impl Decoder for NopDecoder {
        fn buffer_sizes(&self) -> BufferSizes {
            BufferSizes {
                min_block_size: 64,
                full_watermark: 64,
                max_alloc: 104,
            }
        }

        fn end_of_msg_finder(&self, _new_data: &[u8]) -> usize { 0 }

        fn decode(&self, _msg: MsgSlice) { unreachable!("nothing is ever framed") }
    }

    struct LineSource {
        core: DeviceCore,
        input: InputHalf,
        closed_count: Arc<AtomicUsize>,
        inject: Option<AtomicBool>,
    }

    impl LineSource {
        fn create(
            dispatcher: &Arc<Dispatcher>,
            fd: RawFd,
            decoder: Arc<dyn Decoder>,
        ) -> (DeviceRc<Self>, Arc<AtomicUsize>) {
            let closed_count = Arc::new(AtomicUsize::new(0));
            let core = DeviceCore::new(dispatcher, Flags::INPUT);
            core.init(fd).unwrap();
            let dev = DeviceRc::new(LineSource {
                core,
                input: InputHalf::new(),
                closed_count: closed_count.clone(),
                inject: None,
            });
            dev.input.set_decoder(dev.core(), decoder);
            (dev, closed_count)
        }
    }

    impl Device for LineSource {
        fn core(&self) -> &DeviceCore { &self.core }

        fn read_event(&self) { super::read_event(self) }

        fn close(&self) { close_input(self) }

        fn closed(&self) {
            self.closed_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl InputDevice for LineSource {
        fn input(&self) -> &InputHalf { &self.input }

        fn read_returned_zero(&self) -> Option<u8> {
            let inject = self.inject.as_ref()?;
            if inject.swap(false, Ordering::SeqCst) {
                Some(b'\n')
            } else {
                None
            }
        }
    }

    fn harness() -> (WorkerPool, Arc<Dispatcher>) {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        (pool, dispatcher)
    }

    #[test]
    fn pipe_echo_frames_two_lines() {
        let (pool, dispatcher) = harness();
        let (rd, wr) = pipe();
        let decoder = Arc::new(LineDecoder::default());
        let (dev, _closed) = LineSource::create(&dispatcher, rd, decoder.clone());

        start_input(&*dev);
        write_all(wr, b"hello\nworld\n");
        wait_until("two decoded lines", || decoder.msgs.lock().unwrap().len() == 2);
        {
            let msgs = decoder.msgs.lock().unwrap();
            assert_eq!(msgs[0], b"hello\n");
            assert_eq!(msgs[1], b"world\n");
        }

        unsafe { libc::close(wr) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn eof_mid_message_decodes_nothing_spurious() {
        let (pool, dispatcher) = harness();
        let (rd, peer) = socketpair();
        let decoder = Arc::new(LineDecoder::default());
        let (dev, closed) = LineSource::create(&dispatcher, rd, decoder.clone());

        start_input(&*dev);
        write_all(peer, b"no terminator here");
        unsafe { libc::shutdown(peer, libc::SHUT_WR) };

        // End of stream closes the device; the partial message must never reach the decoder.
        wait_until("the device to close", || closed.load(Ordering::SeqCst) == 1);
        assert!(decoder.msgs.lock().unwrap().is_empty());
        assert!(dev.core().flags().test(Flags::DEAD));

        unsafe { libc::close(peer) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn message_spanning_blocks_is_gathered() {
        let (pool, dispatcher) = harness();
        let (rd, wr) = pipe();
        // A one-byte minimum gives a tiny first block, forcing the message across blocks.
        let decoder = Arc::new(LineDecoder {
            msgs: Mutex::new(Vec::new()),
            sizes: Some(BufferSizes {
                min_block_size: 1,
                full_watermark: usize::MAX,
                max_alloc: usize::MAX,
            }),
        });
        let (dev, _closed) = LineSource::create(&dispatcher, rd, decoder.clone());

        start_input(&*dev);
        let line = b"a message much longer than the smallest possible block\n";
        write_all(wr, line);
        wait_until("the gathered line", || !decoder.msgs.lock().unwrap().is_empty());
        assert_eq!(decoder.msgs.lock().unwrap()[0], line);

        unsafe { libc::close(wr) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn injected_byte_completes_the_last_line() {
        let (pool, dispatcher) = harness();
        let (rd, peer) = socketpair();
        let decoder = Arc::new(LineDecoder::default());
        let closed_count = Arc::new(AtomicUsize::new(0));
        let core = DeviceCore::new(&dispatcher, Flags::INPUT);
        core.init(rd).unwrap();
        let dev = DeviceRc::new(LineSource {
            core,
            input: InputHalf::new(),
            closed_count: closed_count.clone(),
            inject: Some(AtomicBool::new(true)),
        });
        dev.input.set_decoder(dev.core(), decoder.clone());

        start_input(&*dev);
        write_all(peer, b"unterminated");
        unsafe { libc::shutdown(peer, libc::SHUT_WR) };

        wait_until("the device to close", || closed_count.load(Ordering::SeqCst) == 1);
        let msgs = decoder.msgs.lock().unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0], b"unterminated\n");
        drop(msgs);

        unsafe { libc::close(peer) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn full_buffer_stops_reads_and_draining_restarts_them() {
        let (pool, dispatcher) = harness();
        let (rd, wr) = pipe();
        let (dev, _closed) = LineSource::create(&dispatcher, rd, Arc::new(NopDecoder));

        start_input(&*dev);
        let data: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        write_all(wr, &data);

        // The allocation cap fits a single block; the device must stop itself.
        wait_until("the device to stop on a full buffer", || {
            !dev.core().flags().test(Flags::R_ACTIVE)
        });

        // Draining restarts the device, which then picks up the rest of the pipe.
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while collected.len() < data.len() {
            assert!(Instant::now() < deadline, "drain stalled at {}", collected.len());
            let mut chunk = [0u8; 32];
            let n = dev
                .input()
                .with_buffer(|buf| buf.read_into(&mut chunk))
                .unwrap();
            collected.extend_from_slice(&chunk[..n]);
            if n == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(collected, data);

        unsafe { libc::close(wr) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn disabled_device_ignores_readiness_until_enabled() {
        let (pool, dispatcher) = harness();
        let (rd, wr) = pipe();
        let decoder = Arc::new(LineDecoder::default());
        let (dev, _closed) = LineSource::create(&dispatcher, rd, decoder.clone());

        start_input(&*dev);
        disable_input(&*dev);
        assert!(!dev.core().flags().test(Flags::R_ACTIVE));

        write_all(wr, b"late\n");
        thread::sleep(Duration::from_millis(50));
        assert!(decoder.msgs.lock().unwrap().is_empty());

        // Starting a disabled device must be refused.
        start_input(&*dev);
        assert!(!dev.core().flags().test(Flags::R_ACTIVE));

        enable_input(&*dev);
        wait_until("the line after enabling", || decoder.msgs.lock().unwrap().len() == 1);
        assert_eq!(decoder.msgs.lock().unwrap()[0], b"late\n");

        unsafe { libc::close(wr) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }
}

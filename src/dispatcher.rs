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

//! The dispatcher: a dedicated thread owning the readiness notifier, translating readiness
//! into worker jobs, serializing every interest-set mutation, and staging device destruction
//! so that it only ever happens on its own thread.

use std::io;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::device::{DeviceCore, Direction, Flags, StateGuard};
use crate::poller::{IoEvent, Poller, Waker, WAKER_COOKIE};
use crate::workers::Job;
use crate::{poller, Fuzzy};

/// Upper bound on readiness reports taken per notifier wait.
const MAX_EVENTS: usize = 64;

const TERMINATE_NOT_YET: u8 = 0;
const TERMINATE_CLEANLY: u8 = 1;
const TERMINATE_FORCED: u8 = 2;

/// Errors occurring while bringing the dispatcher up.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum StartError {
    /// unable to set up the readiness notifier: {0}
    #[from]
    Notifier(io::Error),

    /// unable to spawn the dispatcher thread: {0}
    Thread(io::Error),
}

/// The reactor. One instance owns one epoll set and one thread blocked on it.
///
/// All interest-set and keep-alive bookkeeping funnels through here: `start`/`stop` variants
/// arm and disarm directions under the caller's device state lock, `remove` drops a device
/// from the notifier, and `terminate` winds the thread down. Devices whose last reference is
/// released are destroyed by this thread only, via the lock-free deletion list.
pub struct Dispatcher {
    notifier: Poller,
    waker: Waker,
    queue: chan::Sender<Job>,
    /// Number of armed directions on non-inferior devices; reaching zero completes a clean
    /// termination.
    active: AtomicI32,
    terminate: AtomicU8,
    stop_running: AtomicBool,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    deletion_list: AtomicPtr<DeviceCore>,
}

impl Dispatcher {
    /// Creates the notifier and spawns the dispatcher thread, blocking the caller until the
    /// event loop is running. Jobs are pushed to `queue`; see [`crate::WorkerPool`].
    pub fn start(queue: chan::Sender<Job>) -> Result<Arc<Dispatcher>, StartError> {
        let notifier = Poller::new()?;
        let waker = Waker::new()?;
        notifier.add(waker.fd(), poller::READ, WAKER_COOKIE)?;

        let dispatcher = Arc::new(Dispatcher {
            notifier,
            waker,
            queue,
            active: AtomicI32::new(0),
            terminate: AtomicU8::new(TERMINATE_NOT_YET),
            stop_running: AtomicBool::new(false),
            running: AtomicBool::new(false),
            thread: empty!(),
            deletion_list: empty!(),
        });

        #[cfg(feature = "log")]
        log::debug!(target: "dispatcher-ctl", "Initializing the dispatcher thread...");
        let runner = dispatcher.clone();
        let handle = std::thread::Builder::new()
            .name("dispatcher".into())
            .spawn(move || runner.run())
            .map_err(StartError::Thread)?;
        *dispatcher.thread.lock().expect("dispatcher handle lock poisoned") = Some(handle);

        while !dispatcher.running.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        Ok(dispatcher)
    }

    pub(crate) fn notifier(&self) -> &Poller { &self.notifier }

    /// Number of armed non-inferior directions.
    pub fn active_count(&self) -> i32 { self.active.load(Ordering::Acquire) }

    fn run(self: Arc<Self>) {
        #[cfg(feature = "log")]
        log::info!(target: "dispatcher", "Entering the dispatcher event loop");
        self.running.store(true, Ordering::Release);

        let mut events: Vec<IoEvent> = Vec::with_capacity(MAX_EVENTS);
        while !self.stop_running.load(Ordering::Relaxed) {
            match self.notifier.wait(&mut events, MAX_EVENTS) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "dispatcher", "Error waiting on the notifier: {_err}");
                    continue;
                }
                Ok(()) => {}
            }

            for event in events.drain(..) {
                if event.cookie == WAKER_COOKIE {
                    #[cfg(feature = "log")]
                    log::trace!(target: "dispatcher", "Awoken");
                    self.waker.reset();
                    self.evaluate_terminate();
                    continue;
                }
                // The cookie is the address of a device pinned in the notifier; the pin taken
                // when it was added keeps the pointer valid until a removal.
                let device = unsafe { &*(event.cookie as *const DeviceCore) };
                let already = device.flags().test_and_set_processed(event.events);
                let fresh = event.events & !already;
                if fresh == 0 {
                    // A worker is still running for every reported kind; the re-arm on its
                    // completion will pick the readiness up.
                    continue;
                }
                device.inhibit_deletion();
                self.enqueue(Job::new(device, fresh));
            }

            self.garbage_collection();
        }

        self.running.store(false, Ordering::Release);
        self.garbage_collection();
        #[cfg(feature = "log")]
        log::info!(target: "dispatcher", "Leaving the dispatcher event loop");
    }

    /// Pushes a job, parking on the queue's full condition when the workers are behind.
    /// Backpressure here surfaces as dispatch latency, never as a lost event.
    fn enqueue(&self, job: Job) {
        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(chan::TrySendError::Full(job)) => {
                #[cfg(feature = "log")]
                log::warn!(target: "dispatcher", "Worker queue is full; pausing all event dispatch");
                self.queue.send(job).expect("worker queue disconnected");
                #[cfg(feature = "log")]
                log::warn!(target: "dispatcher", "Worker queue accepted the job; resuming dispatch");
            }
            Err(chan::TrySendError::Disconnected(_)) => panic!("worker queue disconnected"),
        }
    }

    /// Wakes the dispatcher thread out of its notifier wait.
    pub(crate) fn wake(&self) { self.waker.wake(); }

    fn evaluate_terminate(&self) {
        let terminate = self.terminate.load(Ordering::Acquire);
        if terminate == TERMINATE_FORCED
            || (terminate == TERMINATE_CLEANLY && self.active.load(Ordering::Acquire) == 0)
        {
            #[cfg(feature = "log")]
            log::debug!(target: "dispatcher", "Nothing keeps the dispatcher alive; stopping");
            self.stop_running.store(true, Ordering::Relaxed);
        }
    }

    /// Re-wakes the dispatcher when a termination request is pending, so it can re-evaluate
    /// whether the active count allows it to exit.
    fn bump_terminate(&self) {
        if self.terminate.load(Ordering::Acquire) != TERMINATE_NOT_YET {
            self.wake();
        }
    }

    /// Requests termination and joins the dispatcher thread. `normal` waits for every armed
    /// non-inferior direction to disappear; `false` forces an exit after the current pass.
    ///
    /// Must be called from the thread which owns the dispatcher lifecycle, never from a
    /// worker.
    pub fn terminate(&self, normal: bool) {
        #[cfg(feature = "log")]
        log::info!(target: "dispatcher-ctl", "Initiating dispatcher shutdown (normal = {normal})...");
        self.terminate.store(
            if normal { TERMINATE_CLEANLY } else { TERMINATE_FORCED },
            Ordering::Release,
        );
        self.wake();
        let handle = self.thread.lock().expect("dispatcher handle lock poisoned").take();
        if let Some(handle) = handle {
            handle.join().expect("dispatcher thread panicked");
        }
        self.notifier.close();
        self.terminate.store(TERMINATE_NOT_YET, Ordering::Release);
        self.stop_running.store(false, Ordering::Relaxed);
    }

    /// Arms `direction` on `device`. No-op when the direction is vetoed, not open, or already
    /// armed. The first armed direction adds the device to the notifier and pins it alive
    /// until [`Self::remove`].
    pub fn start(&self, _state: &StateGuard, direction: Direction, device: &DeviceCore) {
        let flags = device.flags();
        if !flags.test(direction.open_bit()) || flags.test(direction.disabled_bit()) {
            return;
        }
        if !flags.test_and_set(direction.active_bit()) {
            return;
        }
        self.arm(direction, device);
    }

    fn arm(&self, direction: Direction, device: &DeviceCore) {
        let flags = device.flags();
        let needs_adding = flags.test_and_set_added(direction);
        if !flags.test(Flags::INFERIOR) {
            self.active.fetch_add(1, Ordering::AcqRel);
        }
        if flags.test(Flags::REGULAR_FILE) {
            // Regular files never block in the notifier; dispatch the readiness directly.
            self.queue_ready(device, direction.event());
        } else {
            if needs_adding {
                // Pinned while present in the notifier; balanced in `remove`.
                device.inhibit_deletion();
            }
            device.start_watching(needs_adding);
        }
    }

    /// Arms `direction` on `device` if `condition` still holds under the state lock.
    ///
    /// For use when the condition is published by another thread before the check, such as
    /// "the buffer just became non-empty": the caller evaluates it as momentarily true, and
    /// this re-evaluates after taking the active bit so a concurrent consumer cannot slip a
    /// refutation in between. Returns `false` when the condition had become false and the
    /// device was left unarmed.
    pub fn start_if(
        &self,
        _state: &StateGuard,
        condition: impl Fn() -> Fuzzy,
        direction: Direction,
        device: &DeviceCore,
    ) -> bool {
        let value = condition();
        if value.is_false() {
            return false;
        }
        debug_assert!(!value.is_transitory_false());
        let flags = device.flags();
        if !flags.test(direction.open_bit()) || flags.test(direction.disabled_bit()) {
            return true;
        }
        if !flags.test_and_set(direction.active_bit()) {
            return true;
        }
        if value.is_transitory_true() && condition().is_momentary_false() {
            flags.clear(direction.active_bit());
            return false;
        }
        self.arm(direction, device);
        true
    }

    /// Disarms `direction` on `device`. The device stays in the notifier (with a narrower
    /// interest) and stays pinned; a later `start` resumes it cheaply.
    pub fn stop(&self, _state: &StateGuard, direction: Direction, device: &DeviceCore) {
        let flags = device.flags();
        if !flags.test_and_clear(direction.active_bit()) {
            return;
        }
        self.disarm(direction, device);
    }

    /// Disarms `direction` if `condition` still holds under the state lock; the mirror image
    /// of [`Self::start_if`]. Returns `false` when the condition had become false and the
    /// direction was left armed.
    pub fn stop_if(
        &self,
        _state: &StateGuard,
        condition: impl Fn() -> Fuzzy,
        direction: Direction,
        device: &DeviceCore,
    ) -> bool {
        let value = condition();
        if value.is_false() {
            return false;
        }
        debug_assert!(!value.is_transitory_false());
        let flags = device.flags();
        if !flags.test_and_clear(direction.active_bit()) {
            return true;
        }
        if value.is_transitory_true() && condition().is_momentary_false() {
            flags.set(direction.active_bit());
            return false;
        }
        self.disarm(direction, device);
        true
    }

    fn disarm(&self, direction: Direction, device: &DeviceCore) {
        let flags = device.flags();
        if !flags.test(Flags::REGULAR_FILE) {
            device.stop_watching(false);
        }
        if !flags.test(Flags::INFERIOR) && self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.bump_terminate();
        }
    }

    /// Drops `direction` from the notifier. When the last direction goes, the device leaves
    /// the notifier entirely and the pin taken on arming is released.
    pub fn remove(&self, _state: &StateGuard, direction: Direction, device: &DeviceCore) {
        let flags = device.flags();
        let had_added = flags.test_and_clear(direction.added_bit());
        let needs_removal = had_added && !flags.is_added();
        let cleared_active = flags.test_and_clear(direction.active_bit());
        if (cleared_active || needs_removal) && !flags.test(Flags::REGULAR_FILE) {
            device.stop_watching(needs_removal);
            if needs_removal {
                // Balances the pin taken on arming. Safe at any point: a zero count stages
                // the device for destruction on the dispatcher thread instead of destroying
                // it here.
                device.allow_deletion();
            }
        }
        if cleared_active
            && !flags.test(Flags::INFERIOR)
            && self.active.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.bump_terminate();
        }
    }

    /// Direct dispatch for always-ready devices.
    fn queue_ready(&self, device: &DeviceCore, event: u32) {
        let already = device.flags().test_and_set_processed(event);
        let fresh = event & !already;
        if fresh == 0 {
            return;
        }
        device.inhibit_deletion();
        self.enqueue(Job::new(device, fresh));
    }

    /// Stages a device whose last reference is gone for destruction on the dispatcher
    /// thread. Lock-free push onto the intrusive deletion stack.
    pub(crate) fn add_needs_deletion(&self, device: &DeviceCore) {
        let node = device as *const DeviceCore as *mut DeviceCore;
        let mut head = self.deletion_list.load(Ordering::Relaxed);
        loop {
            unsafe { &*node }.next.store(head, Ordering::Relaxed);
            match self.deletion_list.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Detaches the deletion stack and destroys every staged device.
    fn garbage_collection(&self) {
        let mut head = self.deletion_list.swap(null_mut(), Ordering::Acquire);
        while !head.is_null() {
            let next = unsafe { &*head }.next.load(Ordering::Relaxed);
            let device = unsafe { &*head }.this();
            #[cfg(feature = "log")]
            log::trace!(target: "dispatcher", "Destroying device {head:?}");
            drop(unsafe { Box::from_raw(device.as_ptr()) });
            head = next;
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Devices released after the thread exited are still on the stack.
        self.garbage_collection();
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::{Device, DeviceRc};
    use crate::WorkerPool;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(res, 0);
        (fds[0], fds[1])
    }

    #[derive(Default)]
    struct Probe {
        read_events: AtomicUsize,
        reads: AtomicUsize,
        hups: AtomicUsize,
        closed: AtomicUsize,
        dropped_on: Mutex<Option<String>>,
    }

    struct PipeTap {
        core: DeviceCore,
        probe: Arc<Probe>,
    }

    impl PipeTap {
        fn create(dispatcher: &Arc<Dispatcher>, fd: RawFd, probe: Arc<Probe>) -> DeviceRc<Self> {
            let core = DeviceCore::new(dispatcher, Flags::INPUT);
            core.init(fd).unwrap();
            DeviceRc::new(PipeTap { core, probe })
        }
    }

    impl Device for PipeTap {
        fn core(&self) -> &DeviceCore { &self.core }

        fn read_event(&self) {
            self.probe.read_events.fetch_add(1, Ordering::SeqCst);
            let mut sink = [0u8; 256];
            loop {
                let n = unsafe {
                    libc::read(self.core.fd(), sink.as_mut_ptr() as *mut libc::c_void, 256)
                };
                if n <= 0 {
                    break;
                }
                self.probe.reads.fetch_add(n as usize, Ordering::SeqCst);
            }
        }

        fn hup_event(&self) {
            self.probe.hups.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            let need_closed;
            {
                let state = self.core.state();
                self.core.dispatcher().remove(&state, Direction::Read, &self.core);
                need_closed = self.core.flags().test_and_clear(Flags::R_OPEN);
                if need_closed {
                    unsafe { libc::close(self.core.fd()) };
                    self.core.flags().set(Flags::DEAD);
                }
            }
            if need_closed {
                self.closed();
            }
        }

        fn closed(&self) {
            self.probe.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for PipeTap {
        fn drop(&mut self) {
            *self.probe.dropped_on.lock().unwrap() =
                thread::current().name().map(str::to_owned);
        }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn start_stop_is_idempotent() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let probe = Arc::new(Probe::default());
        let dev = PipeTap::create(&dispatcher, rd, probe);

        {
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
            assert_eq!(dispatcher.active_count(), 1);
            assert!(dev.core().flags().test(Flags::R_ACTIVE));
            assert!(dev.core().flags().test(Flags::R_ADDED));

            dispatcher.start(&state, Direction::Read, dev.core());
            assert_eq!(dispatcher.active_count(), 1);

            dispatcher.stop(&state, Direction::Read, dev.core());
            assert_eq!(dispatcher.active_count(), 0);
            assert!(!dev.core().flags().test(Flags::R_ACTIVE));

            dispatcher.stop(&state, Direction::Read, dev.core());
            assert_eq!(dispatcher.active_count(), 0);

            dispatcher.remove(&state, Direction::Read, dev.core());
            assert!(!dev.core().flags().is_added());
        }
        unsafe { libc::close(wr) };

        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn readiness_reaches_the_worker() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let probe = Arc::new(Probe::default());
        let dev = PipeTap::create(&dispatcher, rd, probe.clone());

        {
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
        }
        assert_eq!(unsafe { libc::write(wr, b"ping!".as_ptr() as *const _, 5) }, 5);
        wait_until("the read event", || probe.reads.load(Ordering::SeqCst) == 5);

        {
            let state = dev.core().state();
            dispatcher.remove(&state, Direction::Read, dev.core());
        }
        unsafe { libc::close(wr) };
        drop(dev);
        dispatcher.terminate(true);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn hup_closes_once_and_deletion_is_deferred() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let probe = Arc::new(Probe::default());
        let dev = PipeTap::create(&dispatcher, rd, probe.clone());

        {
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
        }
        // Release the only external reference while the device is armed; the notifier pin
        // keeps it alive.
        drop(dev);

        // Closing the write end hangs up the read end.
        unsafe { libc::close(wr) };
        wait_until("the hang-up", || probe.closed.load(Ordering::SeqCst) == 1);
        assert_eq!(probe.hups.load(Ordering::SeqCst), 1);

        // Let the worker finish its job and give the device back.
        thread::sleep(Duration::from_millis(50));
        dispatcher.terminate(true);

        // The device must have been destroyed on the dispatcher thread, not on a worker.
        assert_eq!(probe.dropped_on.lock().unwrap().as_deref(), Some("dispatcher"));

        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn clean_shutdown_joins_promptly() {
        let pool = WorkerPool::new(2, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();

        let mut devices = Vec::new();
        let mut write_ends = Vec::new();
        for _ in 0..10 {
            let (rd, wr) = pipe();
            let probe = Arc::new(Probe::default());
            let dev = PipeTap::create(&dispatcher, rd, probe);
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
            drop(state);
            devices.push(dev);
            write_ends.push(wr);
        }
        assert_eq!(dispatcher.active_count(), 10);

        for dev in &devices {
            let state = dev.core().state();
            dispatcher.stop(&state, Direction::Read, dev.core());
            dispatcher.remove(&state, Direction::Read, dev.core());
        }
        assert_eq!(dispatcher.active_count(), 0);

        drop(devices);
        let begin = Instant::now();
        dispatcher.terminate(true);
        assert!(begin.elapsed() < Duration::from_secs(1));

        for wr in write_ends {
            unsafe { libc::close(wr) };
        }
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn inferior_devices_do_not_block_termination() {
        let pool = WorkerPool::new(1, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let probe = Arc::new(Probe::default());

        let core = DeviceCore::new(&dispatcher, Flags::INPUT | Flags::INFERIOR);
        core.init(rd).unwrap();
        let dev = DeviceRc::new(PipeTap { core, probe });
        {
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
        }
        assert_eq!(dispatcher.active_count(), 0);

        // A clean terminate must not wait for the armed inferior device.
        let begin = Instant::now();
        dispatcher.terminate(true);
        assert!(begin.elapsed() < Duration::from_secs(1));

        {
            let state = dev.core().state();
            dispatcher.remove(&state, Direction::Read, dev.core());
        }
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        drop(dev);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn regular_files_bypass_the_notifier() {
        let pool = WorkerPool::new(1, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_RDONLY) };
        assert!(fd >= 0);
        let probe = Arc::new(Probe::default());

        let core = DeviceCore::new(&dispatcher, Flags::INPUT | Flags::REGULAR_FILE);
        core.init(fd).unwrap();
        let dev = DeviceRc::new(PipeTap { core, probe: probe.clone() });
        {
            let state = dev.core().state();
            dispatcher.start(&state, Direction::Read, dev.core());
        }
        // read(2) of /dev/null returns zero bytes; the point is that the job ran at all
        // without the fd ever entering the notifier.
        wait_until("the direct dispatch", || probe.read_events.load(Ordering::SeqCst) > 0);
        {
            let state = dev.core().state();
            dispatcher.remove(&state, Direction::Read, dev.core());
        }
        unsafe { libc::close(fd) };
        dispatcher.terminate(true);
        drop(dev);
        drop(dispatcher);
        pool.join();
    }

    #[test]
    fn start_if_reverts_on_a_lost_race() {
        let pool = WorkerPool::new(1, 32);
        let dispatcher = Dispatcher::start(pool.queue()).unwrap();
        let (rd, wr) = pipe();
        let probe = Arc::new(Probe::default());
        let dev = PipeTap::create(&dispatcher, rd, probe);

        // The condition flips to momentary-false on the re-check under the lock, as if a
        // consumer drained the buffer in between.
        let calls = Cell::new(0u32);
        {
            let state = dev.core().state();
            let armed = dispatcher.start_if(
                &state,
                || {
                    calls.set(calls.get() + 1);
                    if calls.get() == 1 {
                        Fuzzy::TransitoryTrue
                    } else {
                        Fuzzy::TransitoryFalse
                    }
                },
                Direction::Read,
                dev.core(),
            );
            assert!(!armed);
            assert!(!dev.core().flags().test(Flags::R_ACTIVE));
            assert_eq!(dispatcher.active_count(), 0);

            // A condition which survives the re-check arms the device.
            let armed = dispatcher.start_if(
                &state,
                || Fuzzy::TransitoryTrue,
                Direction::Read,
                dev.core(),
            );
            assert!(armed);
            assert!(dev.core().flags().test(Flags::R_ACTIVE));
            assert_eq!(dispatcher.active_count(), 1);

            dispatcher.remove(&state, Direction::Read, dev.core());
        }
        unsafe { libc::close(wr) };
        dispatcher.terminate(true);
        drop(dev);
        drop(dispatcher);
        pool.join();
    }
}

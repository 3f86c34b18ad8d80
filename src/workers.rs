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

//! Readiness jobs and the bounded queue feeding them to worker threads.
//!
//! The pool here is deliberately minimal: the contract the dispatcher relies on is only that
//! the queue is bounded, that a full queue blocks the sender, and that each job runs on some
//! worker exactly once.

use std::ptr::NonNull;
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::device::DeviceCore;
use crate::poller;

/// One unit of work for a worker thread: a device plus the readiness kinds to handle.
///
/// A job holds a strong reference on its device, taken by the dispatcher before enqueueing
/// and released after the last handler returns.
pub struct Job {
    device: NonNull<DeviceCore>,
    events: u32,
}

// The device is pinned by the reference taken before enqueue.
unsafe impl Send for Job {}

impl Job {
    pub(crate) fn new(device: &DeviceCore, events: u32) -> Self {
        Job {
            device: NonNull::from(device),
            events,
        }
    }

    /// Runs the handlers for the captured readiness kinds.
    ///
    /// Hang-up closes the device after its handler: leaving a hung-up fd armed would deliver
    /// the same event on every dispatcher pass. Read runs before write when both are due.
    /// Every handled kind has its in-flight bit cleared right after its handler, and the
    /// job's device reference is dropped last.
    pub(crate) fn run(self) {
        let core = unsafe { self.device.as_ref() };
        let device = unsafe { core.this().as_ref() };
        if self.events & !(poller::READ | poller::WRITE) != 0 {
            if self.events & poller::HUP != 0 {
                #[cfg(feature = "log")]
                log::debug!(target: "worker", "Hang-up on fd {}", core.fd());
                device.hup_event();
                device.close();
                core.clear_processed(poller::HUP);
            } else if self.events & poller::ERR != 0 {
                #[cfg(feature = "log")]
                log::debug!(target: "worker", "Error condition on fd {}", core.fd());
                device.exceptional_event();
                core.clear_processed(poller::ERR);
            }
        } else {
            if self.events & poller::READ != 0 {
                device.read_event();
                core.clear_processed(poller::READ);
            }
            if self.events & poller::WRITE != 0 {
                device.write_event();
                core.clear_processed(poller::WRITE);
            }
        }
        core.allow_deletion();
    }
}

/// A fixed set of worker threads draining a bounded job queue.
pub struct WorkerPool {
    sender: chan::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `threads` workers behind a queue of at most `capacity` pending jobs.
    pub fn new(threads: usize, capacity: usize) -> Self {
        let (sender, receiver) = chan::bounded(capacity);
        let workers = (0..threads)
            .map(|no| {
                let receiver: chan::Receiver<Job> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("worker-{no}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job.run();
                        }
                    })
                    .expect("unable to spawn a worker thread")
            })
            .collect();
        WorkerPool { sender, workers }
    }

    /// A handle for pushing jobs; pass it to [`crate::Dispatcher::start`].
    pub fn queue(&self) -> chan::Sender<Job> { self.sender.clone() }

    /// Waits for the workers to finish the queued jobs and exit. Every other queue handle
    /// must be dropped first, or this blocks forever.
    pub fn join(self) {
        drop(self.sender);
        for worker in self.workers {
            worker.join().expect("worker thread panicked");
        }
    }
}

// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
// Worker threads consuming scheduler work. Spawned when the engine is built,
// joined when it is destroyed. Workers report idle while parked so the engine
// can stop cleanly, and long cooperative mixes poll `should_stop` so shutdown
// never waits on a full mix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, info};

use crate::engine::OrganEngine;
use crate::tasks::TaskSet;

/// Priority asked for worker threads; just below typical audio callback
/// priorities so the driver threads always win.
const WORKER_THREAD_PRIORITY: u8 = 60;

/// Shared flags between a worker thread and its owner.
pub struct WorkerSignal {
    stop: AtomicBool,
    idle: Mutex<bool>,
    idle_changed: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            idle: Mutex::new(true),
            idle_changed: Condvar::new(),
        }
    }

    /// Polled inside cooperative mixing loops so long work bails out when the
    /// engine stops.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    fn set_idle(&self, idle: bool) {
        let mut flag = self.idle.lock().expect("Error getting lock");
        *flag = idle;
        self.idle_changed.notify_all();
    }

    fn wait_for_idle(&self) {
        let _unused = self
            .idle_changed
            .wait_while(self.idle.lock().expect("Error getting lock"), |idle| !*idle)
            .expect("Error getting lock");
    }
}

/// One worker thread driving the scheduler.
pub struct SoundThread {
    signal: Arc<WorkerSignal>,
    handle: Option<JoinHandle<()>>,
}

impl SoundThread {
    /// Spawns a worker over the given engine and task set.
    pub fn spawn(engine: Arc<OrganEngine>, tasks: Arc<TaskSet>, index: usize) -> Self {
        let signal = Arc::new(WorkerSignal::new());
        let thread_signal = signal.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sound-worker-{index}"))
            .spawn(move || {
                configure_worker_priority();
                Self::drive(engine, tasks, thread_signal);
            })
            .expect("Error spawning worker thread");
        Self {
            signal,
            handle: Some(handle),
        }
    }

    fn drive(engine: Arc<OrganEngine>, tasks: Arc<TaskSet>, signal: Arc<WorkerSignal>) {
        let scheduler = engine.scheduler();
        let mut epoch = 0;
        loop {
            if signal.should_stop() {
                break;
            }
            let worked = !scheduler.is_paused()
                && scheduler.try_exec_one(&engine, &tasks, Some(signal.as_ref()));
            if !worked {
                signal.set_idle(true);
                epoch = scheduler.wait_for_work(signal.as_ref(), epoch);
                signal.set_idle(false);
            }
        }
        signal.set_idle(true);
        debug!(thread = std::thread::current().name(), "Worker exiting.");
    }

    /// Blocks until the worker has parked (no task in flight).
    pub fn wait_for_idle(&self) {
        self.signal.wait_for_idle();
    }

    /// Stops and joins the worker, waking the scheduler so a parked thread
    /// sees the stop request.
    pub fn delete(mut self, engine: &OrganEngine) {
        self.signal.request_stop();
        engine.scheduler().wakeup();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Error while joining worker thread!");
            }
        }
    }
}

/// Best-effort bump of the current thread's priority; workers keep running at
/// default priority when the platform refuses.
fn configure_worker_priority() {
    match ThreadPriorityValue::try_from(WORKER_THREAD_PRIORITY) {
        Ok(value) => {
            if set_current_thread_priority(ThreadPriority::Crossplatform(value)).is_err() {
                info!(
                    priority = WORKER_THREAD_PRIORITY,
                    "Could not raise worker thread priority; continuing at default."
                );
            }
        }
        Err(_) => debug!("Invalid worker thread priority value."),
    }
}

// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
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
// Processes deferred voice transitions: samplers whose scheduled stop or
// attack switch fired are parked here by the mixing tasks and turned into
// release samplers (or re-attacked) off the critical mixing path. The task
// may be scheduled several times per period so release-heavy moments spread
// over more workers; the queue pop makes concurrent runs safe.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::engine::OrganEngine;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

pub struct ReleaseTask {
    queue: Mutex<VecDeque<usize>>,
}

impl ReleaseTask {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Hands a sampler over for deferred processing. The sampler is no longer
    /// on any mixing task's list.
    pub fn add(&self, sampler: usize) {
        self.queue.lock().expect("Error getting lock").push_back(sampler);
    }

    pub fn exec(&self, engine: &OrganEngine, tasks: &TaskSet, worker: Option<&WorkerSignal>) {
        loop {
            if let Some(worker) = worker {
                if worker.should_stop() {
                    return;
                }
            }
            let sampler = self.queue.lock().expect("Error getting lock").pop_front();
            match sampler {
                Some(sampler) => engine.process_release(tasks, sampler),
                None => return,
            }
        }
    }

    /// Drops all queued samplers; engine start only.
    pub fn clear(&self) {
        self.queue.lock().expect("Error getting lock").clear();
    }
}

impl Default for ReleaseTask {
    fn default() -> Self {
        Self::new()
    }
}

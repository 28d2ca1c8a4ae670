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
// Feeds the configured recorder sink once per period: either the stereo
// downmix or every device output, pulled cooperatively so the recorder never
// reads a half-mixed buffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::OrganEngine;
use crate::recorder::SoundRecorder;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

/// Which buffers the recorder subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderFeed {
    Downmix,
    Outputs,
}

pub struct RecorderTask {
    recorder: Arc<dyn SoundRecorder>,
    feed: RecorderFeed,
    done: AtomicBool,
    lock: Mutex<()>,
}

impl RecorderTask {
    pub fn new(recorder: Arc<dyn SoundRecorder>, feed: RecorderFeed) -> Self {
        Self {
            recorder,
            feed,
            done: AtomicBool::new(false),
            lock: Mutex::new(()),
        }
    }

    pub fn exec(&self, engine: &OrganEngine, tasks: &TaskSet, worker: Option<&WorkerSignal>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Ok(_guard) = self.lock.try_lock() else {
            return;
        };
        if self.done.load(Ordering::Acquire) {
            return;
        }

        match self.feed {
            RecorderFeed::Downmix => {
                if let Some(downmix) = &tasks.downmix {
                    downmix.finish(false, engine, tasks, worker);
                    downmix.with_buffer(|buffer| self.recorder.write(0, buffer.data()));
                }
            }
            RecorderFeed::Outputs => {
                for (i, output) in tasks.outputs.iter().enumerate() {
                    output.finish(false, engine, tasks, worker);
                    output.with_buffer(|buffer| self.recorder.write(i, buffer.data()));
                }
            }
        }
        self.done.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        let _guard = self.lock.lock().expect("Error getting lock");
        self.done.store(false, Ordering::Release);
    }
}

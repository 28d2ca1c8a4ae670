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
// Produces the stereo buffer of one audio group for the period. The task owns
// the pipe samplers routed to its group and mixes each through the volume
// curve of the sampler's windchest. Samplers whose deferred stop or attack
// switch fired are handed to the release task; finished voices go back to
// the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::AudioBuffer;
use crate::defs::MAX_FRAME_SIZE;
use crate::engine::OrganEngine;
use crate::sampler::windchest_task_index;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

struct Inner {
    samplers: Vec<usize>,
    buffer: AudioBuffer,
    curve: [f32; MAX_FRAME_SIZE],
}

pub struct GroupTask {
    done: AtomicBool,
    stop: AtomicBool,
    intake: Mutex<Vec<usize>>,
    inner: Mutex<Inner>,
}

impl GroupTask {
    pub fn new(samples_per_buffer: usize) -> Self {
        Self {
            done: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            intake: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                samplers: Vec::new(),
                buffer: AudioBuffer::new(2, samples_per_buffer),
                curve: [0.0; MAX_FRAME_SIZE],
            }),
        }
    }

    /// Queues a sampler slot on this group.
    pub fn add(&self, sampler: usize) {
        self.intake.lock().expect("Error getting lock").push(sampler);
    }

    fn run(
        &self,
        inner: &mut Inner,
        engine: &OrganEngine,
        tasks: &TaskSet,
        worker: Option<&WorkerSignal>,
    ) {
        {
            let mut intake = self.intake.lock().expect("Error getting lock");
            inner.samplers.append(&mut intake);
        }

        inner.buffer.fill_with_silence();
        let frames = inner.buffer.frames();
        let stop = self.stop.load(Ordering::Acquire);

        let Inner {
            samplers,
            buffer,
            curve,
        } = &mut *inner;
        samplers.retain(|&sampler| {
            let task_id = engine.sampler_task_id(sampler);
            let windchest = &tasks.windchests[windchest_task_index(task_id)];
            windchest.finish(stop, engine, tasks, worker);
            windchest.curve_copy(&mut curve[..frames]);
            engine.process_sampler(
                tasks,
                buffer.data_mut(),
                sampler,
                frames,
                Some(&curve[..frames]),
            )
        });
        self.done.store(true, Ordering::Release);
    }

    pub fn exec(&self, engine: &OrganEngine, tasks: &TaskSet, worker: Option<&WorkerSignal>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.run(&mut inner, engine, tasks, worker);
    }

    pub fn finish(
        &self,
        stop: bool,
        engine: &OrganEngine,
        tasks: &TaskSet,
        worker: Option<&WorkerSignal>,
    ) {
        if stop {
            self.stop.store(true, Ordering::Release);
        }
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut inner = self.inner.lock().expect("Error getting lock");
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.run(&mut inner, engine, tasks, worker);
    }

    /// Adds one side of the finished group buffer into a destination channel.
    pub fn add_into(&self, dst: &mut AudioBuffer, src_channel: usize, dst_channel: usize, factor: f32) {
        let inner = self.inner.lock().expect("Error getting lock");
        dst.add_channel_from(&inner.buffer, src_channel, dst_channel, factor);
    }

    /// Number of samplers currently owned by this group.
    pub fn sampler_count(&self) -> usize {
        let queued = self.intake.lock().expect("Error getting lock").len();
        queued + self.inner.lock().expect("Error getting lock").samplers.len()
    }

    pub fn reset(&self) {
        let _inner = self.inner.lock().expect("Error getting lock");
        self.done.store(false, Ordering::Release);
        self.stop.store(false, Ordering::Release);
    }

    /// Drops all samplers without processing them; engine start only.
    pub fn clear(&self) {
        self.intake.lock().expect("Error getting lock").clear();
        self.inner.lock().expect("Error getting lock").samplers.clear();
    }
}

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
// Mixes the samplers of one tremulant and derives the per-frame amplitude
// modulation curve the windchest tasks apply to their pipes. The tremulant
// wave encodes the relative amplitude deviation around silence, so the factor
// for a frame is 1 + sample, floored at 0. With no sounding sampler the curve
// is flat 1.0.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::AudioBuffer;
use crate::engine::OrganEngine;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

struct Inner {
    samplers: Vec<usize>,
    scratch: AudioBuffer,
    curve: Vec<f32>,
}

pub struct TremulantTask {
    done: AtomicBool,
    stop: AtomicBool,
    intake: Mutex<Vec<usize>>,
    inner: Mutex<Inner>,
}

impl TremulantTask {
    pub fn new(samples_per_buffer: usize) -> Self {
        Self {
            done: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            intake: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner {
                samplers: Vec::new(),
                scratch: AudioBuffer::new(2, samples_per_buffer),
                curve: vec![1.0; samples_per_buffer],
            }),
        }
    }

    /// Queues a sampler slot on this tremulant; it starts contributing the
    /// next time the task runs.
    pub fn add(&self, sampler: usize) {
        self.intake.lock().expect("Error getting lock").push(sampler);
    }

    fn run(&self, inner: &mut Inner, engine: &OrganEngine, tasks: &TaskSet) {
        {
            let mut intake = self.intake.lock().expect("Error getting lock");
            inner.samplers.append(&mut intake);
        }

        inner.scratch.fill_with_silence();
        let frames = inner.scratch.frames();
        let Inner {
            samplers,
            scratch,
            curve,
        } = &mut *inner;
        samplers.retain(|&sampler| {
            engine.process_sampler(tasks, scratch.data_mut(), sampler, frames, None)
        });

        for (frame, factor) in curve.iter_mut().enumerate() {
            *factor = (1.0 + scratch.data()[frame * 2]).max(0.0);
        }
        self.done.store(true, Ordering::Release);
    }

    pub fn exec(&self, engine: &OrganEngine, tasks: &TaskSet, _worker: Option<&WorkerSignal>) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if self.done.load(Ordering::Acquire) {
            return;
        }
        self.run(&mut inner, engine, tasks);
    }

    /// Runs the task to completion; blocks while another thread is running
    /// it so the caller can rely on the curve afterwards.
    pub fn finish(
        &self,
        stop: bool,
        engine: &OrganEngine,
        tasks: &TaskSet,
        _worker: Option<&WorkerSignal>,
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
        self.run(&mut inner, engine, tasks);
    }

    /// Copies the modulation curve of the finished period into `out`.
    pub fn curve_copy(&self, out: &mut [f32]) {
        let inner = self.inner.lock().expect("Error getting lock");
        out.copy_from_slice(&inner.curve);
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

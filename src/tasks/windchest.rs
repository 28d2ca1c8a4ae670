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
// Computes the per-frame volume of one windchest for the current period:
// the model's windchest volume, the engine master amplitude and the
// modulation curves of all tremulants assigned to the chest. Group tasks
// read the curve when mixing the chest's pipes. The detached-release chest
// (index 0) has no model windchest and no tremulants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::engine::OrganEngine;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

struct Inner {
    curve: Vec<f32>,
    /// The model volume of the last finished period, master gain excluded.
    /// Used to carry a pipe's level onto the detached chest.
    model_volume: f32,
    trem_scratch: Vec<f32>,
}

pub struct WindchestTask {
    /// Zero-based model windchest index; `None` for the detached chest.
    windchest_index: Option<usize>,
    /// Tremulant task indices modulating this chest.
    tremulants: Vec<usize>,
    done: AtomicBool,
    stop: AtomicBool,
    inner: Mutex<Inner>,
}

impl WindchestTask {
    pub fn new(
        windchest_index: Option<usize>,
        tremulants: Vec<usize>,
        samples_per_buffer: usize,
    ) -> Self {
        Self {
            windchest_index,
            tremulants,
            done: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                curve: vec![0.0; samples_per_buffer],
                model_volume: 1.0,
                trem_scratch: vec![1.0; samples_per_buffer],
            }),
        }
    }

    fn run(
        &self,
        inner: &mut Inner,
        engine: &OrganEngine,
        tasks: &TaskSet,
        worker: Option<&WorkerSignal>,
    ) {
        let stop = self.stop.load(Ordering::Acquire);
        let model_volume = match self.windchest_index {
            Some(i) => engine.model().windchest_volume(i),
            None => 1.0,
        };
        inner.model_volume = model_volume;

        let base = model_volume * engine.amplitude();
        inner.curve.fill(base);
        for &trem in &self.tremulants {
            let task = &tasks.tremulants[trem];
            task.finish(stop, engine, tasks, worker);
            task.curve_copy(&mut inner.trem_scratch);
            for (value, factor) in inner.curve.iter_mut().zip(inner.trem_scratch.iter()) {
                *value *= factor;
            }
        }
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

    /// Copies the finished period's volume curve into `out`.
    pub fn curve_copy(&self, out: &mut [f32]) {
        let inner = self.inner.lock().expect("Error getting lock");
        out.copy_from_slice(&inner.curve);
    }

    /// Model volume of the last finished period, master gain excluded.
    pub fn model_volume(&self) -> f32 {
        self.inner.lock().expect("Error getting lock").model_volume
    }

    pub fn reset(&self) {
        let _inner = self.inner.lock().expect("Error getting lock");
        self.done.store(false, Ordering::Release);
        self.stop.store(false, Ordering::Release);
    }
}

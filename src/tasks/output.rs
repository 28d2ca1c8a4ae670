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
// Mix-down for one output device: pulls every audio group through the flat
// scale-factor matrix, applies reverb, clamps and tracks the per-channel peak
// meter. The downmix variant (recorder feed) applies neither reverb nor
// clamping so the recorder sees the raw mix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::buffer::AudioBuffer;
use crate::config::ReverbConfig;
use crate::engine::OrganEngine;
use crate::reverb::Reverb;
use crate::scheduler::thread::WorkerSignal;
use crate::tasks::TaskSet;

const CLAMP_MIN: f32 = -1.0;
const CLAMP_MAX: f32 = 1.0;

struct Inner {
    buffer: AudioBuffer,
    reverb: Reverb,
}

pub struct OutputTask {
    channels: usize,
    /// Linear gains, `scale_factors[channel * n_groups * 2 + group * 2 + side]`.
    /// Zero entries are skipped entirely.
    scale_factors: Vec<f32>,
    n_groups: usize,
    /// Downmix tasks skip both clamping and reverb.
    clamp: bool,
    done: AtomicBool,
    stop: AtomicBool,
    meter: Mutex<Vec<f32>>,
    inner: Mutex<Inner>,
}

impl OutputTask {
    /// `scale_factors` are already decoded to linear gains.
    pub fn new(
        channels: usize,
        n_groups: usize,
        scale_factors: Vec<f32>,
        samples_per_buffer: usize,
        clamp: bool,
    ) -> Self {
        debug_assert_eq!(scale_factors.len(), channels * n_groups * 2);
        Self {
            channels,
            scale_factors,
            n_groups,
            clamp,
            done: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            meter: Mutex::new(vec![0.0; channels]),
            inner: Mutex::new(Inner {
                buffer: AudioBuffer::new(channels, samples_per_buffer),
                reverb: Reverb::new(channels),
            }),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Configures the reverb; a no-op for downmix tasks.
    pub fn setup_reverb(&self, config: &ReverbConfig, samples_per_buffer: usize, sample_rate: u32) {
        if !self.clamp {
            return;
        }
        let mut inner = self.inner.lock().expect("Error getting lock");
        inner.reverb.setup(config, samples_per_buffer, sample_rate);
    }

    fn run(
        &self,
        inner: &mut Inner,
        engine: &OrganEngine,
        tasks: &TaskSet,
        worker: Option<&WorkerSignal>,
    ) -> bool {
        inner.buffer.fill_with_silence();

        let stride = self.n_groups * 2;
        for channel in 0..self.channels {
            for j in 0..stride {
                let factor = self.scale_factors[channel * stride + j];
                if factor == 0.0 {
                    continue;
                }
                let group = &tasks.groups[j / 2];
                group.finish(self.stop.load(Ordering::Acquire), engine, tasks, worker);
                if let Some(worker) = worker {
                    if worker.should_stop() {
                        // Bail without marking done; whoever needs this
                        // buffer will finish it.
                        return false;
                    }
                }
                group.add_into(&mut inner.buffer, j % 2, channel, factor);
            }
        }

        if self.clamp {
            inner.reverb.process(&mut inner.buffer);

            let mut meter = self.meter.lock().expect("Error getting lock");
            let channels = self.channels;
            for (i, sample) in inner.buffer.data_mut().iter_mut().enumerate() {
                let clamped = sample.clamp(CLAMP_MIN, CLAMP_MAX);
                if clamped != *sample {
                    *sample = clamped;
                }
                let peak = &mut meter[i % channels];
                if clamped.abs() > *peak {
                    *peak = clamped.abs();
                }
            }
        }

        self.done.store(true, Ordering::Release);
        true
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

    /// Copies the finished buffer into an interleaved output slice.
    pub fn copy_to(&self, out: &mut [f32]) {
        let inner = self.inner.lock().expect("Error getting lock");
        inner.buffer.copy_to(out);
    }

    /// Runs `f` over the finished buffer without copying.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&AudioBuffer) -> R) -> R {
        let inner = self.inner.lock().expect("Error getting lock");
        f(&inner.buffer)
    }

    /// Per-channel peak levels since the last reset.
    pub fn meter_info(&self) -> Vec<f32> {
        self.meter.lock().expect("Error getting lock").clone()
    }

    pub fn reset_meter_info(&self) {
        self.meter.lock().expect("Error getting lock").fill(0.0);
    }

    pub fn reset(&self) {
        let _inner = self.inner.lock().expect("Error getting lock");
        self.done.store(false, Ordering::Release);
        self.stop.store(false, Ordering::Release);
    }

    /// Clears reverb tails and meters at engine start.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("Error getting lock");
        inner.reverb.reset();
        drop(inner);
        self.reset_meter_info();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_starts_at_zero_and_resets() {
        let task = OutputTask::new(2, 1, vec![1.0, 0.0, 0.0, 1.0], 8, true);
        assert_eq!(task.meter_info(), vec![0.0, 0.0]);
        task.meter.lock().unwrap()[0] = 0.9;
        task.reset_meter_info();
        assert_eq!(task.meter_info(), vec![0.0, 0.0]);
    }

    #[test]
    fn copy_to_matches_buffer_layout() {
        let task = OutputTask::new(2, 1, vec![1.0, 0.0, 0.0, 1.0], 4, true);
        let mut out = vec![1.0f32; 8];
        task.copy_to(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }
}

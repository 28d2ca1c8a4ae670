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
// The sound engine for one loaded organ. Owns the sampler pool, the task
// graph, the scheduler and the worker threads, and exposes the two faces of
// the engine: voice control for the organ model (start/stop/switch samples)
// and buffer production for the audio callbacks.
//
// Lifecycle: IDLE -> (build_and_start) -> WORKING -> (connect) -> USED ->
// (disconnect) -> WORKING -> (stop_and_destroy) -> IDLE. Build and start are
// repeatable for a restart with new parameters.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use rand::Rng;
use tracing::{debug, info};

use crate::config::{db_to_gain, AudioOutputConfig, EngineConfig};
use crate::defs::MAX_FRAME_SIZE;
use crate::provider::{OrganModel, SampleMemory};
use crate::recorder::{RecorderSource, SoundRecorder};
use crate::sampler::pool::SamplerPool;
use crate::scheduler::Scheduler;
use crate::scheduler::thread::SoundThread;
use crate::tasks::group::GroupTask;
use crate::tasks::output::OutputTask;
use crate::tasks::recorder::{RecorderFeed, RecorderTask};
use crate::tasks::release::ReleaseTask;
use crate::tasks::touch::TouchTask;
use crate::tasks::tremulant::TremulantTask;
use crate::tasks::windchest::WindchestTask;
use crate::tasks::TaskSet;

pub mod scaling;
#[cfg(test)]
mod tests;
mod voices;

const STATE_IDLE: u8 = 0;
const STATE_BUILT: u8 = 1;
const STATE_WORKING: u8 = 2;
const STATE_USED: u8 = 3;

/// Callback synchronization for one output device: a callback parks on the
/// condition while the previous period is still being closed out.
struct OutputState {
    sync: Mutex<OutputWait>,
    condition: Condvar,
}

struct OutputWait {
    /// This device has delivered its buffer for the current period.
    wait: bool,
    /// The barrier is live; cleared on shutdown so callbacks never park.
    waiting: bool,
}

impl OutputState {
    fn new() -> Self {
        Self {
            sync: Mutex::new(OutputWait {
                wait: false,
                waiting: true,
            }),
            condition: Condvar::new(),
        }
    }
}

pub struct OrganEngine {
    model: Arc<dyn OrganModel>,
    config: EngineConfig,
    memory: Option<Arc<dyn SampleMemory>>,

    pool: SamplerPool,
    polyphony_soft_limit: usize,
    scheduler: Scheduler,

    state: AtomicU8,
    /// Global monotonic sample clock; starts at 1, 0 is "no event".
    current_time: AtomicU64,
    /// High-water mark of used samplers since the last meter read.
    used_polyphony: AtomicUsize,

    /// Master volume in dB and its derived linear amplitude.
    volume_db: AtomicU32,
    amplitude_bits: AtomicU32,

    samples_per_buffer: AtomicUsize,
    sample_rate: AtomicU32,

    tasks: RwLock<Option<Arc<TaskSet>>>,
    threads: Mutex<Vec<SoundThread>>,

    // Callback barrier state.
    output_states: RwLock<Arc<Vec<OutputState>>>,
    calc_count: AtomicUsize,
    wait_count: AtomicUsize,
}

impl OrganEngine {
    pub fn new(model: Arc<dyn OrganModel>, config: EngineConfig) -> Arc<Self> {
        Self::with_sample_memory(model, config, None)
    }

    /// Like [`OrganEngine::new`] with a sample-memory region for the touch
    /// task to keep resident.
    pub fn with_sample_memory(
        model: Arc<dyn OrganModel>,
        config: EngineConfig,
        memory: Option<Arc<dyn SampleMemory>>,
    ) -> Arc<Self> {
        let pool = SamplerPool::new(config.polyphony_limit());
        let polyphony_soft_limit = pool.usage_limit() * 3 / 4;
        let volume = config.volume();
        let engine = Self {
            model,
            config,
            memory,
            pool,
            polyphony_soft_limit,
            scheduler: Scheduler::new(),
            state: AtomicU8::new(STATE_IDLE),
            current_time: AtomicU64::new(1),
            used_polyphony: AtomicUsize::new(0),
            volume_db: AtomicU32::new(volume as u32),
            amplitude_bits: AtomicU32::new(0),
            samples_per_buffer: AtomicUsize::new(1),
            sample_rate: AtomicU32::new(0),
            tasks: RwLock::new(None),
            threads: Mutex::new(Vec::new()),
            output_states: RwLock::new(Arc::new(Vec::new())),
            calc_count: AtomicUsize::new(0),
            wait_count: AtomicUsize::new(0),
        };
        engine.set_volume(volume);
        Arc::new(engine)
    }

    /*
     * Accessors
     */

    pub fn model(&self) -> &Arc<dyn OrganModel> {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &SamplerPool {
        &self.pool
    }

    pub fn current_time(&self) -> u64 {
        self.current_time.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer.load(Ordering::Acquire)
    }

    pub fn hard_polyphony(&self) -> usize {
        self.pool.usage_limit()
    }

    pub(crate) fn polyphony_soft_limit(&self) -> usize {
        self.polyphony_soft_limit
    }

    /// Master volume in dB.
    pub fn volume(&self) -> i32 {
        self.volume_db.load(Ordering::Relaxed) as i32
    }

    /// Sets the master volume in dB and refreshes the linear amplitude.
    pub fn set_volume(&self, volume_db: i32) {
        self.volume_db.store(volume_db as u32, Ordering::Relaxed);
        let amplitude = 10.0f32.powf(volume_db as f32 * 0.05);
        self.amplitude_bits
            .store(amplitude.to_bits(), Ordering::Relaxed);
    }

    /// Linear master amplitude derived from the volume.
    pub fn amplitude(&self) -> f32 {
        f32::from_bits(self.amplitude_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn ms_to_samples(&self, ms: u32) -> u64 {
        self.sample_rate() as u64 * ms as u64 / 1000
    }

    pub(crate) fn samples_diff_to_ms(&self, from: u64, to: u64) -> u32 {
        let rate = self.sample_rate().max(1) as u64;
        (to.saturating_sub(from) * 1000 / rate).min(u32::MAX as u64) as u32
    }

    /// Detune factor of up to one cent, applied to each new voice when
    /// speaking randomization is on.
    pub(crate) fn random_factor(&self) -> f32 {
        if self.config.randomize_speaking() {
            let spread = 2.0f32.powf(1.0 / 1200.0) - 1.0;
            1.0 + rand::rng().random_range(-1.0f32..=1.0) * spread
        } else {
            1.0
        }
    }

    pub(crate) fn tasks(&self) -> Option<Arc<TaskSet>> {
        self.tasks.read().expect("Error getting lock").clone()
    }

    /*
     * Lifecycle state
     */

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_IDLE
    }

    pub fn is_working(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_WORKING
    }

    pub fn is_used(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STATE_USED
    }

    /// Switches between WORKING and USED; called by the sound system around
    /// connect/disconnect.
    pub fn set_used(&self, used: bool) {
        let state = self.state.load(Ordering::Acquire);
        assert!(
            (STATE_WORKING..=STATE_USED).contains(&state),
            "engine must be working to change use state"
        );
        self.state.store(
            if used { STATE_USED } else { STATE_WORKING },
            Ordering::Release,
        );
    }

    /*
     * Lifecycle
     */

    /// Builds the task graph and starts the engine. After return the engine
    /// accepts `process_audio_callback` calls.
    pub fn build_and_start(
        self: &Arc<Self>,
        output_configs: &[AudioOutputConfig],
        samples_per_buffer: usize,
        sample_rate: u32,
        recorder: Arc<dyn SoundRecorder>,
    ) {
        self.build_engine(output_configs, samples_per_buffer, sample_rate, recorder);
        self.start_engine();
    }

    /// Stops the engine and destroys the task graph. Call after the sound
    /// system has disconnected.
    pub fn stop_and_destroy(&self) {
        self.stop_engine();
        self.destroy_engine();
    }

    fn build_engine(
        self: &Arc<Self>,
        output_configs: &[AudioOutputConfig],
        samples_per_buffer: usize,
        sample_rate: u32,
        recorder: Arc<dyn SoundRecorder>,
    ) {
        assert!(self.is_idle(), "build requires an idle engine");
        assert!(!output_configs.is_empty(), "at least one output is required");
        assert!(
            samples_per_buffer > 0 && samples_per_buffer <= MAX_FRAME_SIZE,
            "samples per buffer out of range"
        );

        self.samples_per_buffer
            .store(samples_per_buffer, Ordering::Release);
        self.sample_rate.store(sample_rate, Ordering::Release);

        let n_groups = self.config.audio_groups();

        // [B1] Audio group tasks.
        let groups: Vec<GroupTask> = (0..n_groups)
            .map(|_| GroupTask::new(samples_per_buffer))
            .collect();

        // [B2] Per-device output tasks with decoded scale factors.
        let mut outputs = Vec::with_capacity(output_configs.len());
        for device in output_configs {
            let stride = n_groups * 2;
            let mut factors = vec![0.0f32; device.channels * stride];
            for (channel, row) in device.scale_factors.iter().enumerate().take(device.channels) {
                for (k, &db) in row.iter().enumerate().take(stride) {
                    factors[channel * stride + k] = db_to_gain(db);
                }
            }
            outputs.push(OutputTask::new(
                device.channels,
                n_groups,
                factors,
                samples_per_buffer,
                true,
            ));
        }

        // [B3] Optional stereo downmix for the recorder: unity left-to-left
        // and right-to-right over all groups, no reverb, no clamp.
        let downmix = self.config.record_downmix().then(|| {
            let stride = n_groups * 2;
            let mut factors = vec![0.0f32; 2 * stride];
            for group in 0..n_groups {
                factors[group * 2] = 1.0;
                factors[stride + group * 2 + 1] = 1.0;
            }
            OutputTask::new(2, n_groups, factors, samples_per_buffer, false)
        });

        // [B4] Recorder subscription: the downmix if configured, else every
        // device output.
        let feed = if downmix.is_some() {
            RecorderFeed::Downmix
        } else {
            RecorderFeed::Outputs
        };
        let sources: Vec<RecorderSource> = match feed {
            RecorderFeed::Downmix => vec![RecorderSource { channels: 2 }],
            RecorderFeed::Outputs => outputs
                .iter()
                .map(|o| RecorderSource {
                    channels: o.channels(),
                })
                .collect(),
        };
        recorder.set_outputs(&sources, samples_per_buffer, sample_rate);

        // [B5] Reverb on the device outputs.
        for output in &outputs {
            output.setup_reverb(self.config.reverb(), samples_per_buffer, sample_rate);
        }

        // [B6] Tremulant tasks.
        let tremulants: Vec<TremulantTask> = (0..self.model.tremulant_count())
            .map(|_| TremulantTask::new(samples_per_buffer))
            .collect();

        // [B7] Windchest tasks: the detached-release chest first, then one
        // per model windchest with its tremulant assignments.
        let mut windchests = vec![WindchestTask::new(None, Vec::new(), samples_per_buffer)];
        for i in 0..self.model.windchest_count() {
            windchests.push(WindchestTask::new(
                Some(i),
                self.model.windchest_tremulants(i).to_vec(),
                samples_per_buffer,
            ));
        }

        // [B8] Assemble the task set.
        let tasks = Arc::new(TaskSet {
            tremulants,
            windchests,
            groups,
            downmix,
            outputs,
            recorder: RecorderTask::new(recorder, feed),
            release: ReleaseTask::new(),
            touch: TouchTask::new(self.memory.clone()),
        });

        // [B9] Hand everything to the scheduler.
        self.scheduler
            .set_tasks(tasks.task_ids(self.config.release_concurrency()));

        *self.output_states.write().expect("Error getting lock") =
            Arc::new((0..output_configs.len()).map(|_| OutputState::new()).collect());

        *self.tasks.write().expect("Error getting lock") = Some(tasks.clone());

        // [B10] Worker threads.
        {
            let mut threads = self.threads.lock().expect("Error getting lock");
            for i in 0..self.config.concurrency() {
                threads.push(SoundThread::spawn(self.clone(), tasks.clone(), i));
            }
        }

        info!(
            outputs = output_configs.len(),
            groups = n_groups,
            samples_per_buffer,
            sample_rate,
            workers = self.config.concurrency(),
            polyphony = self.pool.usage_limit(),
            "Engine built."
        );
        self.state.store(STATE_BUILT, Ordering::Release);
    }

    fn destroy_engine(&self) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            STATE_BUILT,
            "destroy requires a stopped engine"
        );

        // [B10] Workers first; they hold the task set.
        let threads: Vec<SoundThread> =
            self.threads.lock().expect("Error getting lock").drain(..).collect();
        for thread in threads {
            thread.delete(self);
        }

        // [B9] .. [B1]
        self.scheduler.clear();
        *self.tasks.write().expect("Error getting lock") = None;
        *self.output_states.write().expect("Error getting lock") = Arc::new(Vec::new());

        debug!("Engine destroyed.");
        self.state.store(STATE_IDLE, Ordering::Release);
    }

    fn reset_counters(&self, tasks: &TaskSet) {
        self.used_polyphony.store(0, Ordering::Release);
        self.pool.return_all();
        self.current_time.store(1, Ordering::Release);
        self.calc_count.store(0, Ordering::Release);
        self.wait_count.store(0, Ordering::Release);
        for state in self.output_states.read().expect("Error getting lock").iter() {
            let mut guard = state.sync.lock().expect("Error getting lock");
            guard.wait = false;
            guard.waiting = true;
        }
        tasks.clear();
        self.scheduler.reset(tasks);
    }

    fn start_engine(&self) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            STATE_BUILT,
            "start requires a built engine"
        );
        let tasks = self.tasks().expect("built engine has tasks");
        self.reset_counters(&tasks);
        self.scheduler.resume_giving_work();
        self.state.store(STATE_WORKING, Ordering::Release);
    }

    fn stop_engine(&self) {
        assert_eq!(
            self.state.load(Ordering::Acquire),
            STATE_WORKING,
            "stop requires a working, disconnected engine"
        );
        self.scheduler.pause_giving_work();
        {
            let threads = self.threads.lock().expect("Error getting lock");
            for thread in threads.iter() {
                thread.wait_for_idle();
            }
        }
        self.state.store(STATE_BUILT, Ordering::Release);
    }

    /*
     * Functions called from the sound system
     */

    /// Fills one device buffer and, when all devices have been filled,
    /// advances to the next period. Returns true when this call closed the
    /// period.
    pub fn process_audio_callback(&self, output_index: usize, out: &mut [f32]) -> bool {
        let states = self.output_states.read().expect("Error getting lock").clone();
        let n_outputs = states.len();
        if output_index >= n_outputs {
            out.fill(0.0);
            return false;
        }
        let device = &states[output_index];

        {
            let mut guard = device.sync.lock().expect("Error getting lock");
            while guard.wait && guard.waiting {
                guard = device.condition.wait(guard).expect("Error getting lock");
            }

            let calc = self.calc_count.fetch_add(1, Ordering::AcqRel) + 1;
            self.get_audio_output(output_index, calc >= n_outputs, out);
            guard.wait = true;
        }

        let waited = self.wait_count.fetch_add(1, Ordering::AcqRel) + 1;
        if waited != n_outputs {
            return false;
        }

        // This callback closes the period.
        if let Some(tasks) = self.tasks() {
            self.next_period(&tasks);
        }
        self.wakeup_threads();
        self.calc_count.store(0, Ordering::Release);
        self.wait_count.store(0, Ordering::Release);
        for state in states.iter() {
            let mut guard = state.sync.lock().expect("Error getting lock");
            guard.wait = false;
            state.condition.notify_one();
        }
        true
    }

    /// Runs the device's output task (cooperatively pulling everything
    /// upstream) and copies its buffer out. Delivers silence unless the
    /// engine is working.
    fn get_audio_output(&self, output_index: usize, is_last: bool, out: &mut [f32]) {
        if self.is_working() {
            if let Some(tasks) = self.tasks() {
                let task = &tasks.outputs[output_index];
                task.finish(is_last, self, &tasks, None);
                task.copy_to(out);
                return;
            }
        }
        out.fill(0.0);
    }

    /// Drains the period's remaining tasks, advances the sample clock by one
    /// buffer and re-arms the task graph.
    fn next_period(&self, tasks: &TaskSet) {
        self.scheduler.exec_remaining(self, tasks);

        self.current_time
            .fetch_add(self.samples_per_buffer() as u64, Ordering::AcqRel);

        let used = self.pool.used_count();
        if used > self.used_polyphony.load(Ordering::Acquire) {
            self.used_polyphony.store(used, Ordering::Release);
        }

        self.scheduler.reset(tasks);
    }

    fn wakeup_threads(&self) {
        self.scheduler.wakeup();
    }

    /*
     * Meters
     */

    /// Meter snapshot: element 0 is the used-polyphony fraction since the
    /// last read, followed by the per-channel output peaks of every device.
    /// Reading resets the meters.
    pub fn meter_info(&self) -> Vec<f64> {
        assert!(self.is_working(), "meters require a working engine");
        let mut info =
            vec![self.used_polyphony.swap(0, Ordering::AcqRel) as f64
                / self.hard_polyphony().max(1) as f64];
        if let Some(tasks) = self.tasks() {
            for output in &tasks.outputs {
                info.extend(output.meter_info().iter().map(|&m| m as f64));
                output.reset_meter_info();
            }
        }
        info
    }
}

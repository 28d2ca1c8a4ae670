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
// Voice control: creating, processing, releasing and switching samplers.
// The organ model drives the start/stop/switch entry points from its own
// thread; they only touch the slot's atomic event fields (or take the body
// lock for non-critical updates), while the render tasks own the body.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::defs::{
    MAX_FRAME_SIZE, MIN_WINDCHEST_LEVEL, RELEASE_DROP_AGE_SAMPLES, RELEASE_DROP_FADE_MS,
};
use crate::provider::SoundProvider;
use crate::sampler::{
    is_windchest_task, tremulant_task_index, windchest_task_index, SamplerHandle,
    DETACHED_RELEASE_TASK_ID,
};
use crate::tasks::TaskSet;

use super::scaling;
use super::OrganEngine;

/// Thin-pointer identity of a provider, used for stale-handle detection.
fn provider_tag(provider: &Arc<dyn SoundProvider>) -> usize {
    Arc::as_ptr(provider) as *const () as usize
}

impl OrganEngine {
    /*
     * Organ-model interface
     */

    /// Starts a pipe voice. Picks the attack or release section by the
    /// interval since the pipe's previous event, allocates a sampler from the
    /// pool and queues it on its audio group. Returns `None` when the pool is
    /// exhausted or the provider has no matching section (note lost).
    pub fn start_pipe_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        windchest_n: usize,
        audio_group: usize,
        velocity: u8,
        delay_ms: u32,
        prev_event_time: u64,
        is_release: bool,
    ) -> Option<SamplerHandle> {
        self.create_task_sample(
            provider,
            windchest_n as i32,
            audio_group,
            velocity,
            delay_ms,
            prev_event_time,
            is_release,
        )
    }

    /// Starts a tremulant voice. `tremulant_n` is 1-based.
    pub fn start_tremulant_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        tremulant_n: usize,
        prev_event_time: u64,
    ) -> Option<SamplerHandle> {
        self.create_task_sample(
            provider,
            -(tremulant_n as i32),
            0,
            0x7f,
            0,
            prev_event_time,
            false,
        )
    }

    /// Schedules a deferred stop for the voice. Returns the scheduled stop
    /// time, or 0 when the handle is stale (safe no-op).
    pub fn stop_sample(&self, provider: &Arc<dyn SoundProvider>, handle: SamplerHandle) -> u64 {
        if !self.pool().is_live(handle) {
            return 0;
        }
        let slot = self.pool().slot(handle.index);
        // The slot may have been reused for another pipe since the handle was
        // taken; in that case the stop must not fire.
        if slot.provider_tag.load(Ordering::Acquire) != provider_tag(provider) {
            return 0;
        }
        let stop = self.current_time() + slot.delay.load(Ordering::Acquire);
        slot.stop.store(stop, Ordering::Release);
        stop
    }

    /// Schedules a deferred attack switch (wave tremulant turned on or off).
    pub fn switch_sample(&self, provider: &Arc<dyn SoundProvider>, handle: SamplerHandle) {
        if !self.pool().is_live(handle) {
            return;
        }
        let slot = self.pool().slot(handle.index);
        if slot.provider_tag.load(Ordering::Acquire) != provider_tag(provider) {
            return;
        }
        let time = self.current_time() + slot.delay.load(Ordering::Acquire);
        slot.new_attack.store(time, Ordering::Release);
    }

    /// Best-effort velocity update; a concurrent switch of the slot to
    /// another pipe is tolerated.
    pub fn update_velocity(
        &self,
        provider: &Arc<dyn SoundProvider>,
        handle: SamplerHandle,
        velocity: u8,
    ) {
        if !self.pool().is_live(handle) {
            return;
        }
        let slot = self.pool().slot(handle.index);
        if slot.provider_tag.load(Ordering::Acquire) != provider_tag(provider) {
            return;
        }
        let mut body = slot.body.lock().expect("Error getting lock");
        body.velocity = velocity;
        body.fader
            .set_velocity_volume(provider.velocity_volume(velocity));
    }

    /// Sets the polyphony eviction counter of a voice. Intended for an
    /// external polyphony-manager pass between periods; values above 1 start
    /// the eviction fade during release processing.
    pub fn set_drop_count(
        &self,
        provider: &Arc<dyn SoundProvider>,
        handle: SamplerHandle,
        count: u32,
    ) {
        if !self.pool().is_live(handle) {
            return;
        }
        let slot = self.pool().slot(handle.index);
        if slot.provider_tag.load(Ordering::Acquire) != provider_tag(provider) {
            return;
        }
        slot.drop_count.store(count, Ordering::Release);
    }

    /*
     * Sampler creation
     */

    fn create_task_sample(
        &self,
        provider: &Arc<dyn SoundProvider>,
        task_id: i32,
        audio_group: usize,
        velocity: u8,
        delay_ms: u32,
        prev_event_time: u64,
        is_release: bool,
    ) -> Option<SamplerHandle> {
        let tasks = self.tasks()?;
        let delay_samples = self.ms_to_samples(delay_ms);
        let start_time = self.current_time() + delay_samples;
        let interval_ms = self.samples_diff_to_ms(prev_event_time, start_time);

        let section = if is_release {
            provider.release(crate::provider::WaveTremulantState::Default, interval_ms)
        } else {
            provider.attack(velocity, interval_ms)
        }?;
        if section.channels() == 0 {
            return None;
        }

        let handle = self.pool().get_sampler()?;
        let slot = self.pool().slot(handle.index);
        {
            let mut body = slot.body.lock().expect("Error getting lock");
            body.provider = Some(Arc::downgrade(provider));
            body.wave_tremulant_state = section.wave_tremulant_state();
            body.velocity = velocity;
            let step = self.random_factor() as f64 * provider.tuning() as f64
                * section.sample_rate() as f64
                / self.sample_rate() as f64;
            body.stream
                .init(section.clone(), self.config().interpolation(), step);
            let playback_gain = provider.gain() * section.norm_gain();
            body.fader
                .setup(playback_gain, provider.velocity_volume(velocity));
            body.delay = delay_samples;
            body.time = start_time;
            body.filter.init(provider.tone_balance());
            body.is_release = is_release;
            body.task_id = task_id;
            body.audio_group = audio_group;
        }
        slot.provider_tag
            .store(provider_tag(provider), Ordering::Release);
        slot.delay.store(delay_samples, Ordering::Release);

        self.pass_sampler(&tasks, handle.index);
        Some(handle)
    }

    /*
     * Render-side processing
     */

    /// Routes a sampler onto the task that owns voices of its kind.
    pub(crate) fn pass_sampler(&self, tasks: &TaskSet, index: usize) {
        let (task_id, audio_group) = {
            let body = self.pool().slot(index).body.lock().expect("Error getting lock");
            (body.task_id, body.audio_group)
        };
        if is_windchest_task(task_id) {
            tasks.groups[audio_group].add(index);
        } else {
            tasks.tremulants[tremulant_task_index(task_id)].add(index);
        }
    }

    pub(crate) fn sampler_task_id(&self, index: usize) -> i32 {
        self.pool()
            .slot(index)
            .body
            .lock()
            .expect("Error getting lock")
            .task_id
    }

    /// Renders one period of a sampler into `output` (interleaved stereo
    /// accumulation). Returns false when the sampler left this task's list:
    /// it was handed to the release task or returned to the pool.
    pub(crate) fn process_sampler(
        &self,
        tasks: &TaskSet,
        output: &mut [f32],
        index: usize,
        frames: usize,
        volume: Option<&[f32]>,
    ) -> bool {
        let slot = self.pool().slot(index);
        let mut body = slot.body.lock().expect("Error getting lock");
        let now = self.current_time();
        let process = body.time <= now;

        if process {
            // Polyphony limiting: old or explicitly dropped release voices
            // start the eviction fade.
            let over_soft_limit = self.config().manage_polyphony()
                && self.pool().used_count() >= self.polyphony_soft_limit();
            if body.is_release
                && ((over_soft_limit && now - body.time > RELEASE_DROP_AGE_SAMPLES)
                    || slot.drop_count.load(Ordering::Acquire) > 1)
            {
                body.fader
                    .start_decreasing_volume(self.ms_to_samples(RELEASE_DROP_FADE_MS));
            }

            let mut temp = [0.0f32; MAX_FRAME_SIZE * 2];
            if !body.stream.read_block(&mut temp, frames) {
                body.provider = None;
                slot.provider_tag.store(0, Ordering::Release);
            }
            body.fader.process(frames, &mut temp, volume);
            body.filter.process(&mut temp[..frames * 2]);
            for (out, sample) in output.iter_mut().zip(temp.iter()).take(frames * 2) {
                *out += sample;
            }

            let stop = slot.stop.load(Ordering::Acquire);
            let new_attack = slot.new_attack.load(Ordering::Acquire);
            if (stop != 0 && stop <= now) || (new_attack != 0 && new_attack <= now) {
                drop(body);
                tasks.release.add(index);
                return false;
            }
        }

        let provider_gone = match &body.provider {
            Some(weak) => weak.upgrade().is_none(),
            None => true,
        };
        if provider_gone || (body.fader.is_silent() && process) {
            drop(body);
            self.pool().return_sampler(index);
            false
        } else {
            true
        }
    }

    /// Handles a deferred transition parked on the release task, then puts
    /// the sampler back on its mixing task.
    pub(crate) fn process_release(&self, tasks: &TaskSet, index: usize) {
        let slot = self.pool().slot(index);
        if slot.stop.swap(0, Ordering::AcqRel) != 0 {
            self.create_release_sampler(tasks, index);
        } else if slot.new_attack.swap(0, Ordering::AcqRel) != 0 {
            self.switch_to_another_attack(tasks, index);
        }
        self.pass_sampler(tasks, index);
    }

    /// Fades the sounding voice out over the release crossfade and starts a
    /// release-tail sampler, routed to the detached-release windchest for
    /// pipes so continuing tremulants no longer affect it.
    fn create_release_sampler(&self, tasks: &TaskSet, index: usize) {
        let now = self.current_time();
        let slot = self.pool().slot(index);
        let mut body = slot.body.lock().expect("Error getting lock");
        let Some(provider) = body.provider.as_ref().and_then(|weak| weak.upgrade()) else {
            return;
        };

        let release_section =
            provider.release(body.wave_tremulant_state, self.samples_diff_to_ms(body.time, now));
        let crossfade_ms = release_section
            .as_ref()
            .map(|s| s.release_crossfade_ms())
            .unwrap_or_else(|| provider.attack_switch_crossfade_ms());
        let crossfade_samples = self.ms_to_samples(crossfade_ms);

        body.fader.start_decreasing_volume(crossfade_samples);
        body.is_release = true;

        let task_id = body.task_id;
        let not_a_tremulant = is_windchest_task(task_id);
        let chest_volume = if not_a_tremulant {
            tasks.windchests[windchest_task_index(task_id)].model_volume()
        } else {
            1.0
        };

        let Some(release_section) = release_section else {
            return;
        };
        // A chest played back at silence gets no tail at all.
        if chest_volume <= MIN_WINDCHEST_LEVEL {
            return;
        }
        let Some(new_handle) = self.pool().get_sampler() else {
            return;
        };

        let mut gain_target = provider.gain() * release_section.norm_gain();
        let mut gain_decay_ms = 0u32;
        if not_a_tremulant {
            // The tail moves to the detached chest, so the current chest
            // volume has to be baked into the fader for continuity.
            gain_target *= chest_volume;
            if self.config().scale_release() {
                let note_ms = self.samples_diff_to_ms(body.time, now);
                gain_target *=
                    scaling::attack_amplitude_factor(provider.midi_key_number(), note_ms);
                gain_decay_ms = scaling::reverb_decay_ramp_ms(
                    note_ms,
                    release_section.length(),
                    release_section.sample_rate(),
                );
            }
        }

        // The configured release tail caps (or supplies) the decay ramp.
        let release_tail_ms = provider.release_tail_ms();
        if release_tail_ms > 0 && (gain_decay_ms == 0 || release_tail_ms < gain_decay_ms) {
            gain_decay_ms = release_tail_ms;
        }

        let new_slot = self.pool().slot(new_handle.index);
        {
            let mut new_body = new_slot.body.lock().expect("Error getting lock");
            new_body.provider = Some(Arc::downgrade(&provider));
            new_body.time = now + 1;
            new_body.wave_tremulant_state = release_section.wave_tremulant_state();
            new_body
                .fader
                .setup_with_ramp(gain_target, body.fader.velocity_volume(), crossfade_samples);
            if gain_decay_ms > 0 {
                new_body
                    .fader
                    .start_decreasing_volume(self.ms_to_samples(gain_decay_ms));
            }

            let fallback_step = provider.tuning() as f64 * release_section.sample_rate() as f64
                / self.sample_rate() as f64;
            if self.config().release_alignment() && release_section.supports_stream_alignment() {
                new_body.stream.init_aligned(
                    release_section,
                    self.config().interpolation(),
                    &body.stream,
                    fallback_step,
                );
            } else {
                new_body.stream.init(
                    release_section,
                    self.config().interpolation(),
                    fallback_step,
                );
            }
            new_body.is_release = true;
            new_body.velocity = body.velocity;
            new_body.task_id = if not_a_tremulant {
                DETACHED_RELEASE_TASK_ID
            } else {
                task_id
            };
            new_body.audio_group = body.audio_group;
            new_body.filter.init(provider.tone_balance());
        }
        new_slot
            .provider_tag
            .store(Arc::as_ptr(&provider) as *const () as usize, Ordering::Release);

        body.time = now;
        drop(body);
        self.pass_sampler(tasks, new_handle.index);
    }

    /// Crossfades the voice onto a freshly selected attack section: a copy of
    /// the sampler decays out while the original slot restarts on the new
    /// attack, phase-aligned with the copy.
    fn switch_to_another_attack(&self, tasks: &TaskSet, index: usize) {
        let now = self.current_time();
        let slot = self.pool().slot(index);
        let mut body = slot.body.lock().expect("Error getting lock");
        let Some(provider) = body.provider.as_ref().and_then(|weak| weak.upgrade()) else {
            return;
        };
        if body.is_release {
            return;
        }
        let Some(section) = provider.attack(body.velocity, 1000) else {
            return;
        };
        let Some(new_handle) = self.pool().get_sampler() else {
            return;
        };

        let gain_target = provider.gain() * section.norm_gain();
        let crossfade_samples = self.ms_to_samples(provider.attack_switch_crossfade_ms());

        let new_slot = self.pool().slot(new_handle.index);
        {
            let mut new_body = new_slot.body.lock().expect("Error getting lock");

            // The copy keeps playing the old section and decays out.
            *new_body = body.clone_voice();
            new_body.is_release = true;
            new_body.time = now;
            new_body.fader.start_decreasing_volume(crossfade_samples);
            new_body.filter.init(provider.tone_balance());

            // The original slot restarts on the new attack, aligned with the
            // copy's stream so the waveform stays continuous.
            let fallback_step = provider.tuning() as f64 * section.sample_rate() as f64
                / self.sample_rate() as f64;
            body.wave_tremulant_state = section.wave_tremulant_state();
            body.stream.init_aligned(
                section,
                self.config().interpolation(),
                &new_body.stream,
                fallback_step,
            );
            body.time = now + 1;
            let velocity_volume = new_body.fader.velocity_volume();
            body.fader
                .setup_with_ramp(gain_target, velocity_volume, crossfade_samples);
            body.is_release = false;
        }
        new_slot
            .provider_tag
            .store(Arc::as_ptr(&provider) as *const () as usize, Ordering::Release);

        drop(body);
        self.pass_sampler(tasks, new_handle.index);
    }
}

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
// One sampler is one polyphonic voice slot: a playback cursor over a single
// audio section with its envelope, filter state and scheduling data. Samplers
// live in fixed pool slots and are never moved while in use; ownership is
// expressed by which task's list currently holds the slot index.

use std::sync::Weak;

use crate::provider::{SoundProvider, WaveTremulantState};

pub mod fader;
pub mod filter;
pub mod pool;
pub mod stream;

use self::fader::Fader;
use self::filter::BiquadState;
use self::stream::SampleStream;

/// Task id routing for a sampler: negative ids address tremulant tasks,
/// 0 is the detached-release windchest, positive ids are windchest numbers.
pub const DETACHED_RELEASE_TASK_ID: i32 = 0;

/// Returns true if the task id addresses a windchest (including the detached
/// release chest).
pub(crate) fn is_windchest_task(task_id: i32) -> bool {
    task_id >= 0
}

pub(crate) fn windchest_task_index(task_id: i32) -> usize {
    task_id as usize
}

pub(crate) fn tremulant_task_index(task_id: i32) -> usize {
    (-task_id - 1) as usize
}

/// Handle to a pool slot handed to the organ model. Stale handles (the slot
/// was recycled for another voice) are detected by the generation counter and
/// make all mutators no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SamplerHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

impl SamplerHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Mutable sampler state, protected by the slot mutex and only ever locked by
/// the task currently owning the slot (plus short-lived handle mutators).
pub(crate) struct Sampler {
    /// Non-owning link to the pipe being played; `None` means the slot is
    /// releasable. A failed upgrade abandons the voice.
    pub provider: Option<Weak<dyn SoundProvider>>,
    pub stream: SampleStream,
    pub fader: Fader,
    pub filter: BiquadState,
    pub velocity: u8,
    /// Global sample index at which this sampler starts contributing.
    pub time: u64,
    /// Start delay in samples; re-applied to deferred stop events.
    pub delay: u64,
    pub is_release: bool,
    pub task_id: i32,
    pub audio_group: usize,
    /// Tremulant phase that was active when the voice started; used to pick a
    /// matching release section.
    pub wave_tremulant_state: WaveTremulantState,
}

impl Sampler {
    /// Duplicates the voice into another slot (attack switching). The copy
    /// continues the same stream, envelope and filter state.
    pub(crate) fn clone_voice(&self) -> Sampler {
        Sampler {
            provider: self.provider.clone(),
            stream: self.stream.clone(),
            fader: self.fader.clone(),
            filter: self.filter.clone(),
            velocity: self.velocity,
            time: self.time,
            delay: self.delay,
            is_release: self.is_release,
            task_id: self.task_id,
            audio_group: self.audio_group,
            wave_tremulant_state: self.wave_tremulant_state,
        }
    }

    pub fn new_idle() -> Self {
        Self {
            provider: None,
            stream: SampleStream::new_idle(),
            fader: Fader::new_idle(),
            filter: BiquadState::new(),
            velocity: 0,
            time: 0,
            delay: 0,
            is_release: false,
            task_id: DETACHED_RELEASE_TASK_ID,
            audio_group: 0,
            wave_tremulant_state: WaveTremulantState::Default,
        }
    }
}

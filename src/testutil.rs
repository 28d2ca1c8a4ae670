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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crate::provider::{AudioSection, OrganModel, SoundProvider, WaveTremulantState};
use crate::sampler::filter::BiquadSpec;

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = SystemTime::now();
    let mut tick = Duration::from_millis(5);
    let timeout = Duration::from_secs(10);
    let max_tick = Duration::from_millis(100);

    loop {
        let elapsed = start.elapsed().expect("System time error");
        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
        tick = std::cmp::min(tick * 2, max_tick);
    }
}

/// A stereo section of constant DC, looped so it sustains forever.
pub fn dc_section(left: f32, right: f32, frames: usize) -> Arc<AudioSection> {
    let mut data = Vec::with_capacity(frames * 2);
    for _ in 0..frames {
        data.push(left);
        data.push(right);
    }
    Arc::new(AudioSection::new(
        2,
        44100,
        data,
        1.0,
        10,
        false,
        WaveTremulantState::Default,
        Some((0, frames)),
    ))
}

/// A mono one-shot section of constant DC (a release tail).
pub fn dc_tail(level: f32, frames: usize, crossfade_ms: u32) -> Arc<AudioSection> {
    Arc::new(AudioSection::new(
        1,
        44100,
        vec![level; frames],
        1.0,
        crossfade_ms,
        false,
        WaveTremulantState::Default,
        None,
    ))
}

/// A provider with fixed attack/release sections and unity everything.
pub struct TestProvider {
    pub attack_section: Option<Arc<AudioSection>>,
    pub release_section: Option<Arc<AudioSection>>,
    pub gain: f32,
    pub tuning: f32,
    pub midi_key: u32,
    pub release_tail: u32,
    pub attack_crossfade_ms: u32,
    pub filter: Option<BiquadSpec>,
}

impl TestProvider {
    /// Sustained stereo DC attack, no release tail.
    pub fn dc(left: f32, right: f32) -> Arc<Self> {
        Arc::new(Self {
            attack_section: Some(dc_section(left, right, 1024)),
            release_section: None,
            gain: 1.0,
            tuning: 1.0,
            midi_key: 60,
            release_tail: 0,
            attack_crossfade_ms: 10,
            filter: None,
        })
    }

    /// Sustained DC attack plus a finite release tail.
    pub fn dc_with_release(level: f32, tail_frames: usize, crossfade_ms: u32) -> Arc<Self> {
        Arc::new(Self {
            attack_section: Some(dc_section(level, level, 1024)),
            release_section: Some(dc_tail(level * 0.5, tail_frames, crossfade_ms)),
            gain: 1.0,
            tuning: 1.0,
            midi_key: 60,
            release_tail: 0,
            attack_crossfade_ms: 10,
            filter: None,
        })
    }
}

impl SoundProvider for TestProvider {
    fn attack(&self, _velocity: u8, _interval_ms: u32) -> Option<Arc<AudioSection>> {
        self.attack_section.clone()
    }

    fn release(&self, _prior: WaveTremulantState, _interval_ms: u32) -> Option<Arc<AudioSection>> {
        self.release_section.clone()
    }

    fn gain(&self) -> f32 {
        self.gain
    }

    fn tuning(&self) -> f32 {
        self.tuning
    }

    fn velocity_volume(&self, _velocity: u8) -> f32 {
        1.0
    }

    fn midi_key_number(&self) -> u32 {
        self.midi_key
    }

    fn release_tail_ms(&self) -> u32 {
        self.release_tail
    }

    fn attack_switch_crossfade_ms(&self) -> u32 {
        self.attack_crossfade_ms
    }

    fn tone_balance(&self) -> Option<BiquadSpec> {
        self.filter
    }
}

/// An organ model with adjustable windchest volumes and static tremulant
/// assignments.
pub struct TestModel {
    tremulant_count: usize,
    windchest_volume_bits: Vec<AtomicU32>,
    windchest_tremulants: Vec<Vec<usize>>,
}

impl TestModel {
    pub fn new(windchests: usize, tremulants: usize) -> Arc<Self> {
        Arc::new(Self {
            tremulant_count: tremulants,
            windchest_volume_bits: (0..windchests)
                .map(|_| AtomicU32::new(1.0f32.to_bits()))
                .collect(),
            windchest_tremulants: vec![Vec::new(); windchests],
        })
    }

    pub fn with_tremulants(
        windchests: usize,
        tremulants: usize,
        assignments: Vec<Vec<usize>>,
    ) -> Arc<Self> {
        assert_eq!(assignments.len(), windchests);
        Arc::new(Self {
            tremulant_count: tremulants,
            windchest_volume_bits: (0..windchests)
                .map(|_| AtomicU32::new(1.0f32.to_bits()))
                .collect(),
            windchest_tremulants: assignments,
        })
    }

    pub fn set_windchest_volume(&self, i: usize, volume: f32) {
        self.windchest_volume_bits[i].store(volume.to_bits(), Ordering::Relaxed);
    }
}

impl OrganModel for TestModel {
    fn tremulant_count(&self) -> usize {
        self.tremulant_count
    }

    fn windchest_count(&self) -> usize {
        self.windchest_volume_bits.len()
    }

    fn windchest_volume(&self, i: usize) -> f32 {
        f32::from_bits(self.windchest_volume_bits[i].load(Ordering::Relaxed))
    }

    fn windchest_tremulants(&self, i: usize) -> &[usize] {
        &self.windchest_tremulants[i]
    }
}

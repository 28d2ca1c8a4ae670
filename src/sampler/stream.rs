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
// Resampling playback cursor over one audio section. The cursor advances by a
// fractional step per output frame (section rate x tuning / engine rate) and
// interpolates either linearly or through a polyphase windowed-sinc bank.
// Streams are restartable: a release or attack switch re-initialises the
// cursor onto a new section, optionally phase-aligned with the old stream.

use std::sync::{Arc, OnceLock};

use crate::config::InterpolationType;
use crate::defs::BLOCK_HISTORY;
use crate::provider::AudioSection;

/// Taps per polyphase subfilter.
const SUBFILTER_TAPS: usize = 8;
/// Center tap of the subfilter window.
const TAP_CENTER: i64 = 3;
/// Number of fractional phases in the polyphase bank.
const PHASES: usize = 64;

/// Windowed-sinc coefficient bank shared by all streams.
pub struct ResampleTable {
    coefs: Vec<[f32; SUBFILTER_TAPS]>,
}

impl ResampleTable {
    fn build() -> Self {
        let mut coefs = Vec::with_capacity(PHASES);
        for phase in 0..PHASES {
            let frac = phase as f64 / PHASES as f64;
            let mut taps = [0.0f32; SUBFILTER_TAPS];
            let mut sum = 0.0f64;
            for (t, tap) in taps.iter_mut().enumerate() {
                let x = t as f64 - TAP_CENTER as f64 - frac;
                let sinc = if x.abs() < 1e-9 {
                    1.0
                } else {
                    let px = std::f64::consts::PI * x;
                    px.sin() / px
                };
                // Blackman window across the tap span.
                let u = (t as f64 - frac + 0.5) / SUBFILTER_TAPS as f64;
                let w = 0.42 - 0.5 * (2.0 * std::f64::consts::PI * u).cos()
                    + 0.08 * (4.0 * std::f64::consts::PI * u).cos();
                let c = sinc * w;
                *tap = c as f32;
                sum += c;
            }
            // Normalize so a DC input passes at unity.
            if sum.abs() > 1e-12 {
                for tap in taps.iter_mut() {
                    *tap = (*tap as f64 / sum) as f32;
                }
            }
            coefs.push(taps);
        }
        Self { coefs }
    }

    /// The process-wide table, built on first use.
    pub fn shared() -> &'static ResampleTable {
        static TABLE: OnceLock<ResampleTable> = OnceLock::new();
        TABLE.get_or_init(ResampleTable::build)
    }
}

#[derive(Clone)]
pub struct SampleStream {
    section: Option<Arc<AudioSection>>,
    /// Fractional frame position within the section.
    pos: f64,
    /// Section frames consumed per output frame.
    step: f64,
    interpolation: InterpolationType,
    /// Last mono output values, newest last; feeds release alignment.
    history: [f32; BLOCK_HISTORY],
    ended: bool,
}

impl SampleStream {
    pub fn new_idle() -> Self {
        Self {
            section: None,
            pos: 0.0,
            step: 0.0,
            interpolation: InterpolationType::Linear,
            history: [0.0; BLOCK_HISTORY],
            ended: true,
        }
    }

    /// Starts the stream at the beginning of `section`. `step` is the number
    /// of section frames per output frame (section rate x tuning / out rate).
    pub fn init(&mut self, section: Arc<AudioSection>, interpolation: InterpolationType, step: f64) {
        self.section = Some(section);
        self.pos = 0.0;
        self.step = step;
        self.interpolation = interpolation;
        self.history = [0.0; BLOCK_HISTORY];
        self.ended = false;
    }

    /// Starts the stream on `section`, phase-matched against `from` so the
    /// waveform stays continuous across the section switch. `fallback_step`
    /// is used when `from` has no active section to derive a rate from.
    pub fn init_aligned(
        &mut self,
        section: Arc<AudioSection>,
        interpolation: InterpolationType,
        from: &SampleStream,
        fallback_step: f64,
    ) {
        let step = match from.section.as_ref() {
            Some(old) => from.step * section.sample_rate() as f64 / old.sample_rate() as f64,
            None => fallback_step,
        };
        let pos = section.align_table().lookup(from.history);
        self.section = Some(section);
        self.pos = pos;
        self.step = step;
        self.interpolation = interpolation;
        self.history = from.history;
        self.ended = false;
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub(crate) fn history(&self) -> [f32; BLOCK_HISTORY] {
        self.history
    }

    /// Reads one mono-summed frame with loop wrapping; out-of-range reads are
    /// silence.
    fn read_frame(section: &AudioSection, idx: i64) -> (f32, f32) {
        if idx < 0 {
            return (0.0, 0.0);
        }
        let mut i = idx as usize;
        if let Some((start, end)) = section.loop_range() {
            let len = end - start;
            while i >= end {
                i -= len;
            }
        }
        if i >= section.length() {
            return (0.0, 0.0);
        }
        let data = section.data();
        if section.channels() == 1 {
            let s = data[i];
            (s, s)
        } else {
            (data[i * 2], data[i * 2 + 1])
        }
    }

    fn interpolate(&self, section: &AudioSection, pos: f64) -> (f32, f32) {
        let idx = pos.floor() as i64;
        let frac = pos - idx as f64;
        match self.interpolation {
            InterpolationType::Linear => {
                let (l0, r0) = Self::read_frame(section, idx);
                let (l1, r1) = Self::read_frame(section, idx + 1);
                let f = frac as f32;
                (l0 + (l1 - l0) * f, r0 + (r1 - r0) * f)
            }
            InterpolationType::Polyphase => {
                let table = ResampleTable::shared();
                let phase = ((frac * PHASES as f64) as usize).min(PHASES - 1);
                let taps = &table.coefs[phase];
                let mut l = 0.0;
                let mut r = 0.0;
                for (t, &c) in taps.iter().enumerate() {
                    let (fl, fr) = Self::read_frame(section, idx + t as i64 - TAP_CENTER);
                    l += fl * c;
                    r += fr * c;
                }
                (l, r)
            }
        }
    }

    /// Fills `frames` interleaved stereo frames. Returns false once the
    /// section has run out (the produced tail is zero-padded); looped
    /// sections never run out.
    pub fn read_block(&mut self, out: &mut [f32], frames: usize) -> bool {
        debug_assert!(out.len() >= frames * 2);
        let Some(section) = self.section.clone() else {
            out[..frames * 2].fill(0.0);
            return false;
        };
        if self.ended {
            out[..frames * 2].fill(0.0);
            return false;
        }

        let length = section.length() as f64;
        let looped = section.loop_range().is_some();
        for frame in 0..frames {
            if !looped && self.pos >= length {
                out[frame * 2..frames * 2].fill(0.0);
                self.ended = true;
                break;
            }
            let (l, r) = self.interpolate(&section, self.pos);
            out[frame * 2] = l;
            out[frame * 2 + 1] = r;
            self.history[0] = self.history[1];
            self.history[1] = (l + r) * 0.5;
            self.pos += self.step;
            if let Some((start, end)) = section.loop_range() {
                let loop_len = (end - start) as f64;
                while self.pos >= end as f64 {
                    self.pos -= loop_len;
                }
            }
        }
        !self.ended
    }
}

/// Maps the recent output of a playing stream to a start offset inside a
/// release section so the waveform stays continuous across the switch. Built
/// once per section by quantizing (level, slope) over the section head.
pub struct ReleaseAlignTable {
    positions: Vec<f64>,
    max_level: f32,
    max_slope: f32,
}

/// Buckets per axis for the (level, slope) quantization.
const ALIGN_DIVISIONS: usize = 32;
/// How many frames of the section head are scanned when building the table.
const ALIGN_SCAN_FRAMES: usize = 4096;

fn align_bucket(value: f32, max_abs: f32) -> usize {
    if max_abs <= 0.0 {
        return ALIGN_DIVISIONS / 2;
    }
    let normalized = (value / max_abs).clamp(-1.0, 1.0);
    let idx = ((normalized + 1.0) * 0.5 * (ALIGN_DIVISIONS - 1) as f32).round() as usize;
    idx.min(ALIGN_DIVISIONS - 1)
}

impl ReleaseAlignTable {
    pub(crate) fn build(section: &AudioSection) -> Self {
        let scan = section.length().saturating_sub(1).min(ALIGN_SCAN_FRAMES);
        let mut max_level = 0.0f32;
        let mut max_slope = 0.0f32;
        for i in 1..=scan {
            let v = section.frame_level(i);
            let d = v - section.frame_level(i - 1);
            max_level = max_level.max(v.abs());
            max_slope = max_slope.max(d.abs());
        }

        let mut positions = vec![f64::NAN; ALIGN_DIVISIONS * ALIGN_DIVISIONS];
        for i in 1..=scan {
            let v = section.frame_level(i);
            let d = v - section.frame_level(i - 1);
            let cell =
                align_bucket(v, max_level) * ALIGN_DIVISIONS + align_bucket(d, max_slope);
            if positions[cell].is_nan() {
                positions[cell] = i as f64;
            }
        }

        // Fill empty cells from the nearest populated one so every lookup
        // lands somewhere sensible.
        let filled: Vec<(usize, usize, f64)> = positions
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_nan())
            .map(|(i, &p)| (i / ALIGN_DIVISIONS, i % ALIGN_DIVISIONS, p))
            .collect();
        for i in 0..positions.len() {
            if positions[i].is_nan() {
                let (row, col) = (i / ALIGN_DIVISIONS, i % ALIGN_DIVISIONS);
                positions[i] = filled
                    .iter()
                    .min_by_key(|(r, c, _)| {
                        let dr = *r as i64 - row as i64;
                        let dc = *c as i64 - col as i64;
                        dr * dr + dc * dc
                    })
                    .map(|&(_, _, p)| p)
                    .unwrap_or(0.0);
            }
        }

        Self {
            positions,
            max_level,
            max_slope,
        }
    }

    /// Returns the start offset for a stream whose last two mono output
    /// values were `history`.
    pub(crate) fn lookup(&self, history: [f32; BLOCK_HISTORY]) -> f64 {
        let value = history[1];
        let slope = history[1] - history[0];
        let cell = align_bucket(value, self.max_level) * ALIGN_DIVISIONS
            + align_bucket(slope, self.max_slope);
        self.positions[cell]
    }
}

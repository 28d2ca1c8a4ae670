// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
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
// Empirical release-scaling heuristics for staccato notes, kept as
// standalone functions so the policy can be swapped without touching the
// release path. Two effects are modeled: a pipe released during its attack
// has not reached full amplitude yet, and room reverberation has not fully
// built up for very short notes.

/// MIDI range of real organ pipes (64 foot to 1 foot); keys outside are
/// treated as an average pipe.
const MIDI_KEY_RANGE: std::ops::RangeInclusive<u32> = 1..=133;
const MIDI_KEY_AVERAGE: u32 = 60;

/// Approximates the amplitude a pipe has reached when released `time_ms`
/// after its start. The attack duration is assumed 50 ms at MIDI 96 and
/// above, 500 ms at MIDI 24 and below, linear in between; within the attack
/// the factor is `0.2 + 0.8 * (2t - t^2)` with `t = time / attack_duration`.
pub fn attack_amplitude_factor(midi_key: u32, time_ms: u32) -> f32 {
    let key = if MIDI_KEY_RANGE.contains(&midi_key) {
        midi_key
    } else {
        MIDI_KEY_AVERAGE
    };

    let attack_duration = if key >= 96 {
        50.0
    } else if key < 24 {
        500.0
    } else {
        500.0 - (key as f32 - 24.0) * 6.25
    };

    let time = time_ms as f32;
    if time < attack_duration {
        let t = time / attack_duration;
        0.2 + 0.8 * (2.0 * t - t * t)
    } else {
        1.0
    }
}

/// Estimated time until room reverberation is fully built up, derived from
/// the release length: `40 + 60 * length / rate` ms, clamped to [100, 350].
pub fn time_to_full_reverb_ms(section_length_frames: usize, section_sample_rate: u32) -> u32 {
    let seconds_based = 40 + 60 * section_length_frames as u64 / section_sample_rate.max(1) as u64;
    seconds_based.clamp(100, 350) as u32
}

/// Length of the extra decay ramp applied to a release when the note was
/// shorter than the reverb build-up time; 0 means no extra ramp.
pub fn reverb_decay_ramp_ms(
    time_ms: u32,
    section_length_frames: usize,
    section_sample_rate: u32,
) -> u32 {
    let full_reverb = time_to_full_reverb_ms(section_length_frames, section_sample_rate);
    if time_ms < full_reverb {
        full_reverb + 6000 * time_ms / full_reverb
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attack_factor_is_one_after_attack() {
        assert_eq!(attack_amplitude_factor(60, 1000), 1.0);
        assert_eq!(attack_amplitude_factor(96, 50), 1.0);
    }

    #[test]
    fn attack_factor_starts_low() {
        let factor = attack_amplitude_factor(60, 0);
        assert!((factor - 0.2).abs() < 1e-6);
    }

    #[test]
    fn attack_duration_interpolates_with_pitch() {
        // High pipes speak fast: at MIDI 96 the attack is over after 50 ms.
        assert_eq!(attack_amplitude_factor(96, 60), 1.0);
        // Low pipes speak slowly: at MIDI 24 a 60 ms note is still rising.
        assert!(attack_amplitude_factor(24, 60) < 1.0);
    }

    #[test]
    fn out_of_range_keys_use_average_pipe() {
        for key in [0, 134, 200] {
            assert_eq!(
                attack_amplitude_factor(key, 100),
                attack_amplitude_factor(MIDI_KEY_AVERAGE, 100)
            );
        }
    }

    #[test]
    fn reverb_time_clamps() {
        // A one-second release: 40 + 60 = 100 ms, the lower clamp.
        assert_eq!(time_to_full_reverb_ms(44100, 44100), 100);
        // Very short release clamps up to 100 ms.
        assert_eq!(time_to_full_reverb_ms(0, 44100), 100);
        // A ten-second release clamps at 350 ms.
        assert_eq!(time_to_full_reverb_ms(441000, 44100), 350);
        // Five seconds: 40 + 300 = 340 ms, inside the clamp.
        assert_eq!(time_to_full_reverb_ms(220500, 44100), 340);
    }

    #[test]
    fn decay_ramp_formula() {
        // 100 ms note, 2-second release at 44.1 kHz: full reverb after
        // 40 + 120 = 160 ms, so the ramp is 160 + 6000 * 100 / 160.
        let ramp = reverb_decay_ramp_ms(100, 88200, 44100);
        assert_eq!(ramp, 160 + 6000 * 100 / 160);
    }

    #[test]
    fn no_ramp_for_long_notes() {
        assert_eq!(reverb_decay_ramp_ms(400, 88200, 44100), 0);
        let full = time_to_full_reverb_ms(88200, 44100);
        assert_eq!(reverb_decay_ramp_ms(full, 88200, 44100), 0);
    }
}

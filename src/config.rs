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
// Engine configuration. Deserialized from the host application's YAML
// settings; every field has a sensible default so a minimal config works.

use std::error::Error;
use std::path::Path;

use serde::Deserialize;

use crate::defs::MUTE_VOLUME;

/// Interpolation used by the per-voice resampling streams.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationType {
    Linear,
    Polyphase,
}

/// Impulse-response reverb settings for the output tasks.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ReverbConfig {
    /// Disabled reverb is a pass-through.
    #[serde(default)]
    pub enabled: bool,
    /// Wet gain applied to the convolved signal.
    #[serde(default = "default_reverb_gain")]
    pub gain: f32,
    /// Pre-delay before the wet signal, in ms.
    #[serde(default)]
    pub delay_ms: u32,
    /// Impulse response samples (mono, applied to each channel). Usually
    /// loaded from a WAV file via [`ReverbConfig::load_impulse_response`].
    #[serde(skip)]
    pub impulse_response: Vec<f32>,
}

fn default_reverb_gain() -> f32 {
    1.0
}

impl ReverbConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Loads the impulse response from a WAV file, mixing all channels down
    /// to mono.
    pub fn load_impulse_response<P: AsRef<Path>>(
        &mut self,
        path: P,
    ) -> Result<(), Box<dyn Error>> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels as usize;
        let mut mono: Vec<f32> = Vec::new();

        match spec.sample_format {
            hound::SampleFormat::Float => {
                for (i, sample) in reader.samples::<f32>().enumerate() {
                    let s = sample?;
                    if i % channels == 0 {
                        mono.push(0.0);
                    }
                    *mono.last_mut().expect("pushed above") += s / channels as f32;
                }
            }
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                for (i, sample) in reader.samples::<i32>().enumerate() {
                    let s = sample? as f32 * scale;
                    if i % channels == 0 {
                        mono.push(0.0);
                    }
                    *mono.last_mut().expect("pushed above") += s / channels as f32;
                }
            }
        }

        self.impulse_response = mono;
        Ok(())
    }
}

/// Per-device output description: channel count plus the dB gains from each
/// audio group's left/right contribution into each device channel.
/// `scale_factors[channel][group * 2 + side]`; [`MUTE_VOLUME`] silences.
#[derive(Deserialize, Clone, Debug)]
pub struct AudioOutputConfig {
    pub channels: usize,
    pub scale_factors: Vec<Vec<f32>>,
}

impl AudioOutputConfig {
    /// A single stereo device mapping every group's left side to channel 0
    /// and right side to channel 1 at 0 dB.
    pub fn default_stereo(n_audio_groups: usize) -> Vec<AudioOutputConfig> {
        let mut left = vec![MUTE_VOLUME; n_audio_groups * 2];
        let mut right = vec![MUTE_VOLUME; n_audio_groups * 2];
        for group in 0..n_audio_groups {
            left[group * 2] = 0.0;
            right[group * 2 + 1] = 0.0;
        }
        vec![AudioOutputConfig {
            channels: 2,
            scale_factors: vec![left, right],
        }]
    }
}

/// Decodes a configured dB scale factor into a linear gain. Values outside
/// [-120, 40) dB (including the mute sentinel) decode to exactly 0.
pub fn db_to_gain(db: f32) -> f32 {
    if (-120.0..40.0).contains(&db) {
        10.0f32.powf(db * 0.05)
    } else {
        0.0
    }
}

/// Top-level engine configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct EngineConfig {
    /// Number of logical output buses.
    #[serde(default = "default_audio_groups")]
    audio_groups: usize,
    /// Worker thread count; 0 runs all work on the audio callback threads.
    #[serde(default)]
    concurrency: usize,
    /// Record the stereo downmix instead of the per-device outputs.
    #[serde(default)]
    record_downmix: bool,
    /// How many times the release task is scheduled per period.
    #[serde(default = "default_release_concurrency")]
    release_concurrency: usize,
    /// Enables the soft polyphony limiter.
    #[serde(default = "default_true")]
    manage_polyphony: bool,
    /// Hard polyphony: the sampler pool capacity.
    #[serde(default = "default_polyphony_limit")]
    polyphony_limit: usize,
    /// Scales release volume for short notes (staccato heuristics).
    #[serde(default = "default_true")]
    scale_release: bool,
    /// Detunes each new voice by up to one cent.
    #[serde(default = "default_true")]
    randomize_speaking: bool,
    /// Phase-aligns releases to the sounding stream when sections allow it.
    #[serde(default = "default_true")]
    release_alignment: bool,
    /// Master volume in dB.
    #[serde(default = "default_volume")]
    volume: i32,
    #[serde(default = "default_interpolation")]
    interpolation: InterpolationType,
    #[serde(default)]
    reverb: ReverbConfig,
}

fn default_audio_groups() -> usize {
    1
}

fn default_release_concurrency() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_polyphony_limit() -> usize {
    2048
}

fn default_volume() -> i32 {
    -15
}

fn default_interpolation() -> InterpolationType {
    InterpolationType::Linear
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }
}

impl EngineConfig {
    /// Parses a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, Box<dyn Error>> {
        let mut config: EngineConfig = serde_yaml::from_str(yaml)?;
        if config.audio_groups == 0 {
            config.audio_groups = 1;
        }
        Ok(config)
    }

    pub fn audio_groups(&self) -> usize {
        self.audio_groups.max(1)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn record_downmix(&self) -> bool {
        self.record_downmix
    }

    pub fn release_concurrency(&self) -> usize {
        self.release_concurrency.max(1)
    }

    pub fn manage_polyphony(&self) -> bool {
        self.manage_polyphony
    }

    pub fn polyphony_limit(&self) -> usize {
        self.polyphony_limit
    }

    pub fn scale_release(&self) -> bool {
        self.scale_release
    }

    pub fn randomize_speaking(&self) -> bool {
        self.randomize_speaking
    }

    pub fn release_alignment(&self) -> bool {
        self.release_alignment
    }

    /// Master volume in dB.
    pub fn volume(&self) -> i32 {
        self.volume
    }

    pub fn interpolation(&self) -> InterpolationType {
        self.interpolation
    }

    pub fn reverb(&self) -> &ReverbConfig {
        &self.reverb
    }

    pub fn set_polyphony_limit(&mut self, limit: usize) {
        self.polyphony_limit = limit;
    }

    pub fn set_concurrency(&mut self, threads: usize) {
        self.concurrency = threads;
    }

    pub fn set_volume(&mut self, volume_db: i32) {
        self.volume = volume_db;
    }

    pub fn set_scale_release(&mut self, enabled: bool) {
        self.scale_release = enabled;
    }

    pub fn set_randomize_speaking(&mut self, enabled: bool) {
        self.randomize_speaking = enabled;
    }

    pub fn set_manage_polyphony(&mut self, enabled: bool) {
        self.manage_polyphony = enabled;
    }

    pub fn set_record_downmix(&mut self, enabled: bool) {
        self.record_downmix = enabled;
    }

    pub fn set_release_concurrency(&mut self, n: usize) {
        self.release_concurrency = n;
    }

    pub fn set_interpolation(&mut self, interpolation: InterpolationType) {
        self.interpolation = interpolation;
    }

    pub fn set_reverb(&mut self, reverb: ReverbConfig) {
        self.reverb = reverb;
    }

    pub fn set_audio_groups(&mut self, n: usize) {
        self.audio_groups = n.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.audio_groups(), 1);
        assert_eq!(config.concurrency(), 0);
        assert_eq!(config.polyphony_limit(), 2048);
        assert_eq!(config.release_concurrency(), 1);
        assert_eq!(config.volume(), -15);
        assert!(config.manage_polyphony());
        assert!(config.scale_release());
        assert!(config.randomize_speaking());
        assert!(!config.record_downmix());
        assert_eq!(config.interpolation(), InterpolationType::Linear);
        assert!(!config.reverb().enabled);
    }

    #[test]
    fn parse_yaml() {
        let config = EngineConfig::from_yaml(
            r#"
audio_groups: 2
concurrency: 3
polyphony_limit: 256
interpolation: polyphase
record_downmix: true
reverb:
  enabled: true
  gain: 0.4
  delay_ms: 20
"#,
        )
        .unwrap();
        assert_eq!(config.audio_groups(), 2);
        assert_eq!(config.concurrency(), 3);
        assert_eq!(config.polyphony_limit(), 256);
        assert_eq!(config.interpolation(), InterpolationType::Polyphase);
        assert!(config.record_downmix());
        assert!(config.reverb().enabled);
        assert!((config.reverb().gain - 0.4).abs() < 1e-6);
        assert_eq!(config.reverb().delay_ms, 20);
    }

    #[test]
    fn db_decode_bounds() {
        assert_eq!(db_to_gain(MUTE_VOLUME), 0.0);
        assert_eq!(db_to_gain(40.0), 0.0);
        assert_eq!(db_to_gain(-120.5), 0.0);
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_gain(-6.0) - 0.501_187).abs() < 1e-4);
        assert!((db_to_gain(20.0) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn default_stereo_mapping() {
        let configs = AudioOutputConfig::default_stereo(2);
        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.channels, 2);
        // Channel 0 takes the left sides, channel 1 the right sides.
        assert_eq!(config.scale_factors[0], vec![0.0, MUTE_VOLUME, 0.0, MUTE_VOLUME]);
        assert_eq!(config.scale_factors[1], vec![MUTE_VOLUME, 0.0, MUTE_VOLUME, 0.0]);
    }
}

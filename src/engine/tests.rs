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
// End-to-end engine scenarios: a built engine driven period by period
// through `process_audio_callback`, with synthetic DC providers so expected
// buffer values are exact. All scenarios run with zero worker threads unless
// stated, so every assertion is deterministic.

use std::sync::Arc;

use crate::config::{AudioOutputConfig, EngineConfig};
use crate::provider::{AudioSection, WaveTremulantState};
use crate::recorder::NullRecorder;
use crate::testutil::{dc_section, eventually, TestModel, TestProvider};

use super::OrganEngine;

const FRAMES: usize = 256;
const RATE: u32 = 44100;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    // Unity master volume and fixed tuning keep expected values exact.
    config.set_volume(0);
    config.set_randomize_speaking(false);
    config
}

fn build_engine(config: EngineConfig, model: Arc<crate::testutil::TestModel>) -> Arc<OrganEngine> {
    let engine = OrganEngine::new(model, config);
    engine.build_and_start(
        &AudioOutputConfig::default_stereo(1),
        FRAMES,
        RATE,
        Arc::new(NullRecorder),
    );
    engine
}

/// Renders `periods` periods on device 0 and returns the last buffer.
fn drive(engine: &Arc<OrganEngine>, periods: usize) -> Vec<f32> {
    let mut buffer = vec![0.0f32; FRAMES * 2];
    for _ in 0..periods {
        buffer.fill(-9.0);
        assert!(engine.process_audio_callback(0, &mut buffer));
    }
    buffer
}

#[test]
fn silence_renders_exact_zeros() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));

    let buffer = drive(&engine, 10);
    assert!(buffer.iter().all(|&s| s == 0.0));
    assert_eq!(engine.current_time(), 1 + 10 * FRAMES as u64);

    let meters = engine.meter_info();
    assert_eq!(meters[0], 0.0);
    assert!(meters[1..].iter().all(|&m| m == 0.0));

    engine.stop_and_destroy();
}

#[test]
fn single_attack_produces_dc_on_left() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    let provider = TestProvider::dc(0.1, 0.0);

    let handle = engine.start_pipe_sample(
        &(provider.clone() as Arc<dyn crate::provider::SoundProvider>),
        1,
        0,
        64,
        0,
        0,
        false,
    );
    assert!(handle.is_some());
    assert_eq!(engine.pool().used_count(), 1);

    let buffer = drive(&engine, 1);
    for frame in 0..FRAMES {
        assert!(
            (buffer[frame * 2] - 0.1).abs() < 1e-5,
            "left frame {frame} = {}",
            buffer[frame * 2]
        );
        assert_eq!(buffer[frame * 2 + 1], 0.0, "right frame {frame}");
    }

    let meters = engine.meter_info();
    assert!(meters[1] >= 0.0999, "left meter {}", meters[1]);
    assert_eq!(meters[2], 0.0);

    engine.stop_and_destroy();
}

#[test]
fn output_is_clamped_and_meter_tracks_peak() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    // A section well above full scale must clamp to 1.0.
    let provider = TestProvider::dc(3.0, 0.0);

    engine
        .start_pipe_sample(
            &(provider.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
            64,
            0,
            0,
            false,
        )
        .unwrap();

    let buffer = drive(&engine, 2);
    for frame in 0..FRAMES {
        assert!(buffer[frame * 2] <= 1.0);
        assert!(buffer[frame * 2] >= -1.0);
    }
    let meters = engine.meter_info();
    assert!(meters[1] <= 1.0);

    engine.stop_and_destroy();
}

#[test]
fn stop_schedules_release_and_recycles_slots() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    let provider = TestProvider::dc_with_release(0.1, 4410, 10);
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    let handle = engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
        .unwrap();

    // Roughly one second of playback.
    drive(&engine, 173);

    let now = engine.current_time();
    let stop_time = engine.stop_sample(&dyn_provider, handle);
    assert!(stop_time >= now && stop_time <= now + FRAMES as u64);

    // The period containing the stop hands the voice to the release task;
    // closing that period creates the release sampler.
    drive(&engine, 1);
    assert_eq!(engine.pool().used_count(), 2);

    // The original fades out over the 10 ms crossfade.
    drive(&engine, 4);
    assert_eq!(engine.pool().used_count(), 1);

    // The 100 ms tail runs dry and the slot goes back to the pool.
    drive(&engine, 25);
    assert_eq!(engine.pool().used_count(), 0);

    // A stale handle is a safe no-op.
    assert_eq!(engine.stop_sample(&dyn_provider, handle), 0);

    engine.stop_and_destroy();
}

#[test]
fn missing_release_section_only_fades() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    // No release section: stopping just fades the attack stream, no tail
    // sampler is allocated.
    let provider = TestProvider::dc(0.1, 0.0);
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    let handle = engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
        .unwrap();
    drive(&engine, 4);
    engine.stop_sample(&dyn_provider, handle);
    drive(&engine, 1);
    // Still only the fading original; the pool never grew.
    assert_eq!(engine.pool().used_count(), 1);

    // The 10 ms attack-switch crossfade runs the voice out.
    drive(&engine, 4);
    assert_eq!(engine.pool().used_count(), 0);
    let buffer = drive(&engine, 1);
    assert!(buffer.iter().all(|&s| s == 0.0));

    engine.stop_and_destroy();
}

#[test]
fn detached_release_carries_windchest_volume() {
    let model = TestModel::new(1, 0);
    model.set_windchest_volume(0, 0.5);
    let engine = build_engine(test_config(), model);
    let provider = TestProvider::dc_with_release(0.1, 44100, 2);
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    let handle = engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
        .unwrap();
    drive(&engine, 173);
    engine.stop_sample(&dyn_provider, handle);
    drive(&engine, 1);

    // Let the crossfade finish, then look at the plateau of the tail. The
    // tail level is 0.05 scaled by the originating chest volume of 0.5; the
    // detached chest itself runs at unity.
    let buffer = drive(&engine, 20);
    let left = buffer[2 * (FRAMES / 2)];
    assert!(
        (left - 0.025).abs() < 2e-3,
        "detached release level {left}"
    );

    engine.stop_and_destroy();
}

#[test]
fn pool_exhaustion_loses_the_note() {
    let mut config = test_config();
    config.set_polyphony_limit(4);
    let engine = build_engine(config, TestModel::new(1, 0));
    let provider = TestProvider::dc(0.1, 0.0);
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    for _ in 0..4 {
        assert!(engine
            .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
            .is_some());
    }
    assert!(engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
        .is_none());
    assert_eq!(engine.pool().used_count(), 4);

    engine.stop_and_destroy();
}

#[test]
fn two_devices_close_the_period_exactly_once() {
    let mut configs = AudioOutputConfig::default_stereo(1);
    configs.extend(AudioOutputConfig::default_stereo(1));

    let engine = OrganEngine::new(TestModel::new(1, 0), test_config());
    engine.build_and_start(&configs, FRAMES, RATE, Arc::new(NullRecorder));

    let mut buffer = vec![0.0f32; FRAMES * 2];
    for period in 0..3 {
        let before = engine.current_time();
        assert!(!engine.process_audio_callback(0, &mut buffer), "period {period}");
        assert_eq!(engine.current_time(), before);
        assert!(engine.process_audio_callback(1, &mut buffer), "period {period}");
        assert_eq!(engine.current_time(), before + FRAMES as u64);
    }

    engine.stop_and_destroy();
}

#[test]
fn build_destroy_roundtrip_is_repeatable() {
    let engine = OrganEngine::new(TestModel::new(1, 0), test_config());
    assert!(engine.is_idle());

    for _ in 0..2 {
        engine.build_and_start(
            &AudioOutputConfig::default_stereo(1),
            FRAMES,
            RATE,
            Arc::new(NullRecorder),
        );
        assert!(engine.is_working());
        drive(&engine, 2);
        engine.stop_and_destroy();
        assert!(engine.is_idle());
        assert_eq!(engine.pool().used_count(), 0);
    }
}

#[test]
fn tremulant_modulates_windchest_output() {
    let model = TestModel::with_tremulants(1, 1, vec![vec![0]]);
    let engine = build_engine(test_config(), model);

    // A tremulant holding a constant -0.5 halves the chest volume.
    let trem_provider = TestProvider::dc(-0.5, -0.5);
    engine
        .start_tremulant_sample(
            &(trem_provider.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
        )
        .unwrap();

    let pipe = TestProvider::dc(0.1, 0.0);
    engine
        .start_pipe_sample(
            &(pipe.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
            64,
            0,
            0,
            false,
        )
        .unwrap();

    let buffer = drive(&engine, 1);
    let left = buffer[2 * (FRAMES - 1)];
    assert!((left - 0.05).abs() < 1e-4, "modulated level {left}");

    engine.stop_and_destroy();
}

#[test]
fn windchest_volume_change_reaches_output() {
    let model = TestModel::new(1, 0);
    let engine = build_engine(test_config(), model.clone());
    let provider = TestProvider::dc(0.1, 0.0);

    engine
        .start_pipe_sample(
            &(provider.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
            64,
            0,
            0,
            false,
        )
        .unwrap();
    drive(&engine, 2);

    model.set_windchest_volume(0, 0.5);
    // The fader smooths external volume over a few ms; give it time to
    // settle.
    let buffer = drive(&engine, 20);
    let left = buffer[2 * (FRAMES - 1)];
    assert!((left - 0.05).abs() < 1e-4, "volume-changed level {left}");

    engine.stop_and_destroy();
}

fn looped_release_provider() -> Arc<TestProvider> {
    // A release that never runs dry, for polyphony tests.
    let frames = 4096;
    let release = Arc::new(AudioSection::new(
        1,
        RATE,
        vec![0.05; frames],
        1.0,
        5,
        false,
        WaveTremulantState::Default,
        Some((0, frames)),
    ));
    Arc::new(TestProvider {
        attack_section: Some(dc_section(0.1, 0.0, 1024)),
        release_section: Some(release),
        gain: 1.0,
        tuning: 1.0,
        midi_key: 60,
        release_tail: 0,
        attack_crossfade_ms: 5,
        filter: None,
    })
}

#[test]
fn old_releases_are_evicted_above_the_soft_limit() {
    let mut config = test_config();
    config.set_polyphony_limit(4); // soft limit 3
    let engine = build_engine(config, TestModel::new(1, 0));
    let provider = looped_release_provider();
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    for _ in 0..3 {
        engine
            .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, true)
            .unwrap();
    }
    assert_eq!(engine.pool().used_count(), 3);

    // Age the releases past the drop threshold (2752 samples), then give the
    // 370 ms eviction ramp room to finish.
    drive(&engine, 12);
    assert_eq!(engine.pool().used_count(), 3);
    drive(&engine, 90);
    assert_eq!(engine.pool().used_count(), 0);

    engine.stop_and_destroy();
}

#[test]
fn releases_survive_without_polyphony_management() {
    let mut config = test_config();
    config.set_polyphony_limit(4);
    config.set_manage_polyphony(false);
    let engine = build_engine(config, TestModel::new(1, 0));
    let provider = looped_release_provider();
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    for _ in 0..3 {
        engine
            .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, true)
            .unwrap();
    }
    drive(&engine, 102);
    assert_eq!(engine.pool().used_count(), 3);

    engine.stop_and_destroy();
}

#[test]
fn drop_counter_evicts_a_release() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    let provider = looped_release_provider();
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;

    let handle = engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, true)
        .unwrap();
    drive(&engine, 5);
    assert_eq!(engine.pool().used_count(), 1);

    engine.set_drop_count(&dyn_provider, handle, 2);
    drive(&engine, 90);
    assert_eq!(engine.pool().used_count(), 0);

    engine.stop_and_destroy();
}

#[test]
fn update_velocity_tolerates_stale_handles() {
    let engine = build_engine(test_config(), TestModel::new(1, 0));
    let provider = TestProvider::dc(0.1, 0.0);
    let other = TestProvider::dc(0.2, 0.0);
    let dyn_provider = provider.clone() as Arc<dyn crate::provider::SoundProvider>;
    let dyn_other = other.clone() as Arc<dyn crate::provider::SoundProvider>;

    let handle = engine
        .start_pipe_sample(&dyn_provider, 1, 0, 64, 0, 0, false)
        .unwrap();
    // Wrong provider: no-op.
    engine.update_velocity(&dyn_other, handle, 100);
    engine.switch_sample(&dyn_other, handle);
    assert_eq!(engine.stop_sample(&dyn_other, handle), 0);
    // Right provider: accepted.
    engine.update_velocity(&dyn_provider, handle, 100);

    engine.stop_and_destroy();
}

#[test]
fn workers_render_the_same_audio() {
    let mut config = test_config();
    config.set_concurrency(2);
    let engine = build_engine(config, TestModel::new(1, 0));
    let provider = TestProvider::dc(0.1, 0.0);

    engine
        .start_pipe_sample(
            &(provider.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
            64,
            0,
            0,
            false,
        )
        .unwrap();

    let buffer = drive(&engine, 8);
    for frame in 0..FRAMES {
        assert!((buffer[frame * 2] - 0.1).abs() < 1e-5);
        assert_eq!(buffer[frame * 2 + 1], 0.0);
    }

    // Destroy must join the workers without hanging.
    engine.stop_and_destroy();
    eventually(|| engine.is_idle(), "engine should be idle after destroy");
}

#[test]
fn downmix_feeds_the_recorder() {
    use crate::recorder::{SampleEncoding, SoundRecorder, WavRecorder};

    let tempdir = tempfile::tempdir().unwrap();
    let path = tempdir.path().join("organ.wav");
    let recorder = Arc::new(WavRecorder::new(SampleEncoding::Float32));

    let mut config = test_config();
    config.set_record_downmix(true);
    let engine = OrganEngine::new(TestModel::new(1, 0), config);
    engine.build_and_start(
        &AudioOutputConfig::default_stereo(1),
        FRAMES,
        RATE,
        recorder.clone() as Arc<dyn SoundRecorder>,
    );
    recorder.start(&path).unwrap();

    let provider = TestProvider::dc(0.1, 0.0);
    engine
        .start_pipe_sample(
            &(provider.clone() as Arc<dyn crate::provider::SoundProvider>),
            1,
            0,
            64,
            0,
            0,
            false,
        )
        .unwrap();
    drive(&engine, 4);

    recorder.stop();
    engine.stop_and_destroy();

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 4 * FRAMES * 2);
    // The recording contains the DC level on the left channel.
    let left_peak = samples.chunks(2).map(|f| f[0]).fold(0.0f32, f32::max);
    assert!((left_peak - 0.1).abs() < 1e-4, "recorded peak {left_peak}");
}

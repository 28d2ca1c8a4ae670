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
// The audio-driver coordinator: binds 1..N output ports to one engine. Every
// device callback lands here; the system tracks how many callbacks are in
// flight so detaching the engine can wait until the render path is fully
// drained, and it silences everything while no engine is attached.

use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use tracing::{error, info};

use crate::driver::{get_ports, OutputPort, PortConfig};
use crate::engine::OrganEngine;

/// Meter updates are pumped roughly 14 times per second at 44.1 kHz.
const METER_INTERVAL_SAMPLES: usize = 6144;

type MeterListener = Box<dyn Fn(&[f64]) + Send + Sync>;
type CloseListener = Box<dyn Fn() + Send + Sync>;

pub struct SoundSystem {
    /// The attached engine; callbacks read this on every invocation.
    engine: RwLock<Option<Arc<OrganEngine>>>,
    is_running: AtomicBool,

    /// Callbacks that have been entered but not yet exited.
    n_callbacks_entered: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,

    samples_per_buffer: AtomicUsize,
    sample_rate: AtomicU32,
    ports: Mutex<Vec<Box<dyn OutputPort>>>,
    open: AtomicBool,

    /// Last user-visible I/O error, readable by the embedder.
    last_error: Mutex<Option<String>>,
    /// A driver buffer-size mismatch is logged once per connect.
    mismatch_logged: AtomicBool,

    meter_counter: AtomicUsize,
    meter_listener: Mutex<Option<MeterListener>>,
    /// Notified before the ports are torn down; expected to drive the
    /// disconnect of anything still attached.
    close_listener: Mutex<Option<CloseListener>>,
}

impl SoundSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: RwLock::new(None),
            is_running: AtomicBool::new(false),
            n_callbacks_entered: AtomicUsize::new(0),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
            samples_per_buffer: AtomicUsize::new(0),
            sample_rate: AtomicU32::new(0),
            ports: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            last_error: Mutex::new(None),
            mismatch_logged: AtomicBool::new(false),
            meter_counter: AtomicUsize::new(0),
            meter_listener: Mutex::new(None),
            close_listener: Mutex::new(None),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer.load(Ordering::Acquire)
    }

    /// The last user-visible I/O error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().expect("Error getting lock").clone()
    }

    /// Installs a callback receiving the engine meter snapshot ~14 times per
    /// second while connected.
    pub fn set_meter_listener(&self, listener: Option<MeterListener>) {
        *self.meter_listener.lock().expect("Error getting lock") = listener;
    }

    /// Installs the listener notified before the audio ports are torn down.
    pub fn set_close_listener(&self, listener: Option<CloseListener>) {
        *self.close_listener.lock().expect("Error getting lock") = listener;
    }

    /*
     * Port lifecycle
     */

    /// Opens the given output ports. On any failure a single user-visible
    /// error is recorded, all already-opened ports are closed again and the
    /// error is returned.
    pub fn open_sound_system(
        self: &Arc<Self>,
        configs: &[PortConfig],
        sample_rate: u32,
        samples_per_buffer: usize,
    ) -> Result<(), Box<dyn Error>> {
        assert!(!self.is_open(), "sound system is already open");
        assert!(
            samples_per_buffer <= crate::defs::MAX_FRAME_SIZE,
            "samples per buffer above the supported maximum"
        );

        *self.last_error.lock().expect("Error getting lock") = None;
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.samples_per_buffer
            .store(samples_per_buffer, Ordering::Release);

        let mut ports = get_ports(configs, sample_rate, samples_per_buffer, self)
            .map_err(|e| self.record_open_error(e))?;

        for i in 0..ports.len() {
            if let Err(e) = ports[i].start() {
                for port in ports[..i].iter_mut().rev() {
                    port.stop();
                }
                return Err(self.record_open_error(e));
            }
        }

        info!(ports = ports.len(), sample_rate, samples_per_buffer, "Sound system open.");
        *self.ports.lock().expect("Error getting lock") = ports;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn record_open_error(&self, e: Box<dyn Error>) -> Box<dyn Error> {
        error!(err = e.to_string(), "Unable to open sound system.");
        *self.last_error.lock().expect("Error getting lock") = Some(e.to_string());
        e
    }

    /// Closes all ports. Fires the close listener first so the embedder can
    /// disconnect the engine; anything still attached afterwards is
    /// disconnected here.
    pub fn assure_sound_is_closed(&self) {
        if !self.is_open() {
            return;
        }
        let listener = self.close_listener.lock().expect("Error getting lock");
        if let Some(listener) = listener.as_ref() {
            listener();
        }
        drop(listener);

        if self.engine.read().expect("Error getting lock").is_some() {
            self.disconnect_from_engine();
        }

        let mut ports = self.ports.lock().expect("Error getting lock");
        for port in ports.iter_mut().rev() {
            port.stop();
        }
        ports.clear();
        drop(ports);
        self.open.store(false, Ordering::Release);
        info!("Sound system closed.");
    }

    /// Access to the opened ports, for embedders that need to introspect.
    pub fn with_ports<R>(&self, f: impl FnOnce(&[Box<dyn OutputPort>]) -> R) -> R {
        let ports = self.ports.lock().expect("Error getting lock");
        f(&ports)
    }

    /*
     * Engine attach / detach
     */

    /// Attaches a working engine; callbacks start rendering with the next
    /// period.
    pub fn connect_to_engine(&self, engine: &Arc<OrganEngine>) {
        assert!(
            engine.is_working() && !engine.is_used(),
            "engine must be working and unattached"
        );
        engine.set_used(true);
        self.n_callbacks_entered.store(0, Ordering::Release);
        self.mismatch_logged.store(false, Ordering::Release);
        self.meter_counter.store(0, Ordering::Release);
        *self.engine.write().expect("Error getting lock") = Some(engine.clone());
        self.is_running.store(true, Ordering::Release);
    }

    /// Detaches the engine: clears the pointer, waits until every callback
    /// that entered the render path has left it, then releases the engine
    /// back to WORKING.
    pub fn disconnect_from_engine(&self) {
        self.is_running.store(false, Ordering::Release);
        let engine = self.engine.write().expect("Error getting lock").take();

        {
            let mut guard = self.drain_lock.lock().expect("Error getting lock");
            while self.n_callbacks_entered.load(Ordering::Acquire) > 0 {
                guard = self.drained.wait(guard).expect("Error getting lock");
            }
        }

        if let Some(engine) = engine {
            engine.set_used(false);
        }
    }

    /*
     * The per-callback contract
     */

    /// Driver entry point for one device buffer. Returns true when this
    /// callback closed the period.
    pub fn audio_callback(&self, device_index: usize, out: &mut [f32], n_frames: usize) -> bool {
        let mut entered = false;
        if self.is_running.load(Ordering::Acquire) {
            if n_frames == self.samples_per_buffer() {
                self.n_callbacks_entered.fetch_add(1, Ordering::AcqRel);
                entered = true;
            } else if !self.mismatch_logged.swap(true, Ordering::AcqRel) {
                error!(
                    expected = self.samples_per_buffer(),
                    got = n_frames,
                    "No sound output will happen; the driver changed the buffer size."
                );
            }
        }

        let mut period_closed = false;
        // Re-check after entering so the drain in disconnect cannot miss us.
        if entered && self.is_running.load(Ordering::Acquire) {
            let engine = self.engine.read().expect("Error getting lock").clone();
            match engine {
                Some(engine) => {
                    period_closed = engine.process_audio_callback(device_index, out);
                    if period_closed {
                        self.update_meter(&engine);
                    }
                }
                None => out.fill(0.0),
            }
        } else {
            out.fill(0.0);
        }

        if entered
            && self.n_callbacks_entered.fetch_sub(1, Ordering::AcqRel) <= 1
            && !self.is_running.load(Ordering::Acquire)
        {
            // Make sure the disconnecting thread is inside the wait.
            let _guard = self.drain_lock.lock().expect("Error getting lock");
            self.drained.notify_all();
        }
        period_closed
    }

    fn update_meter(&self, engine: &Arc<OrganEngine>) {
        let counter = self
            .meter_counter
            .fetch_add(self.samples_per_buffer(), Ordering::AcqRel)
            + self.samples_per_buffer();
        if counter < METER_INTERVAL_SAMPLES {
            return;
        }
        self.meter_counter.store(0, Ordering::Release);
        let listener = self.meter_listener.lock().expect("Error getting lock");
        if let Some(listener) = listener.as_ref() {
            listener(&engine.meter_info());
        }
    }
}

impl Drop for SoundSystem {
    fn drop(&mut self) {
        self.assure_sound_is_closed();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::{AudioOutputConfig, EngineConfig};
    use crate::driver::mock::MockPort;
    use crate::recorder::NullRecorder;
    use crate::testutil::{TestModel, TestProvider};

    const FRAMES: usize = 256;
    const RATE: u32 = 44100;

    fn open_system(devices: usize) -> (Arc<SoundSystem>, Vec<Arc<MockPort>>) {
        let system = SoundSystem::new();
        let configs: Vec<PortConfig> = (0..devices)
            .map(|i| PortConfig {
                device: Some(format!("mock-{i}")),
                channels: 2,
            })
            .collect();
        system
            .open_sound_system(&configs, RATE, FRAMES)
            .expect("mock ports open");
        let mocks = system.with_ports(|ports| {
            ports
                .iter()
                .map(|p| p.to_mock().expect("mock port"))
                .collect()
        });
        (system, mocks)
    }

    fn working_engine(devices: usize) -> Arc<OrganEngine> {
        let mut config = EngineConfig::default();
        config.set_volume(0);
        config.set_randomize_speaking(false);
        let engine = OrganEngine::new(TestModel::new(1, 0), config);
        let mut outputs = Vec::new();
        for _ in 0..devices {
            outputs.extend(AudioOutputConfig::default_stereo(1));
        }
        engine.build_and_start(&outputs, FRAMES, RATE, Arc::new(NullRecorder));
        engine
    }

    #[test]
    fn callbacks_without_engine_deliver_silence() {
        let (system, mocks) = open_system(1);
        assert!(mocks[0].is_started());
        assert!(!mocks[0].pump());
        assert!(mocks[0].last_buffer().iter().all(|&s| s == 0.0));
        system.assure_sound_is_closed();
        assert!(!system.is_open());
    }

    #[test]
    fn connect_disconnect_roundtrip() {
        let (system, mocks) = open_system(1);
        let engine = working_engine(1);

        system.connect_to_engine(&engine);
        assert!(engine.is_used());
        assert!(mocks[0].pump());
        assert_eq!(engine.current_time(), 1 + FRAMES as u64);

        system.disconnect_from_engine();
        assert!(engine.is_working());
        assert!(!engine.is_used());
        assert_eq!(engine.pool().used_count(), 0);

        // A second connect returns to USED and keeps rendering.
        system.connect_to_engine(&engine);
        assert!(engine.is_used());
        assert!(mocks[0].pump());
        system.disconnect_from_engine();
        assert!(engine.is_working());

        engine.stop_and_destroy();
        system.assure_sound_is_closed();
    }

    #[test]
    fn rendered_audio_reaches_the_device_buffer() {
        let (system, mocks) = open_system(1);
        let engine = working_engine(1);
        system.connect_to_engine(&engine);

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

        mocks[0].pump();
        let buffer = mocks[0].last_buffer();
        assert!((buffer[0] - 0.1).abs() < 1e-5);
        assert_eq!(buffer[1], 0.0);

        system.disconnect_from_engine();
        engine.stop_and_destroy();
        system.assure_sound_is_closed();
    }

    #[test]
    fn buffer_size_mismatch_is_silenced() {
        let (system, mocks) = open_system(1);
        let engine = working_engine(1);
        system.connect_to_engine(&engine);

        let before = engine.current_time();
        assert!(!mocks[0].pump_with_frames(128));
        assert!(mocks[0].last_buffer().iter().all(|&s| s == 0.0));
        assert_eq!(engine.current_time(), before);

        // A correctly-sized callback still works afterwards.
        assert!(mocks[0].pump());
        assert_eq!(engine.current_time(), before + FRAMES as u64);

        system.disconnect_from_engine();
        engine.stop_and_destroy();
        system.assure_sound_is_closed();
    }

    #[test]
    fn two_device_periods_advance_once() {
        let (system, mocks) = open_system(2);
        let engine = working_engine(2);
        system.connect_to_engine(&engine);

        for _ in 0..3 {
            let before = engine.current_time();
            assert!(!mocks[0].pump());
            assert!(mocks[1].pump());
            assert_eq!(engine.current_time(), before + FRAMES as u64);
        }

        system.disconnect_from_engine();
        engine.stop_and_destroy();
        system.assure_sound_is_closed();
    }

    #[test]
    fn close_listener_runs_before_teardown() {
        let (system, _mocks) = open_system(1);
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        system.set_close_listener(Some(Box::new(move || {
            fired_clone.store(true, Ordering::Release);
        })));

        system.assure_sound_is_closed();
        assert!(fired.load(Ordering::Acquire));
        assert!(!system.is_open());
    }

    #[test]
    fn meter_listener_pumps_while_connected() {
        let (system, mocks) = open_system(1);
        let engine = working_engine(1);

        let updates = Arc::new(AtomicUsize::new(0));
        let updates_clone = updates.clone();
        system.set_meter_listener(Some(Box::new(move |info| {
            assert!(!info.is_empty());
            updates_clone.fetch_add(1, Ordering::Relaxed);
        })));

        system.connect_to_engine(&engine);
        // 6144 samples is 24 periods of 256; pump a bit more than that.
        for _ in 0..30 {
            mocks[0].pump();
        }
        assert!(updates.load(Ordering::Relaxed) >= 1);

        system.disconnect_from_engine();
        engine.stop_and_destroy();
        system.assure_sound_is_closed();
    }

    #[test]
    fn open_failure_reports_a_single_error() {
        let system = SoundSystem::new();
        let result = system.open_sound_system(
            &[PortConfig {
                device: Some("no-such-device-exists".into()),
                channels: 2,
            }],
            RATE,
            FRAMES,
        );
        assert!(result.is_err());
        assert!(system.last_error().is_some());
        assert!(!system.is_open());
    }
}

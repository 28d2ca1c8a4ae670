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
// A mock output port. Doesn't talk to any driver; tests (or headless hosts)
// pump periods by hand and inspect the produced buffers.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::system::SoundSystem;

struct MockShared {
    name: String,
    channels: usize,
    samples_per_buffer: usize,
    device_index: usize,
    system: Weak<SoundSystem>,
    started: AtomicBool,
    last_buffer: Mutex<Vec<f32>>,
}

/// Cloneable handle around the shared mock state so tests can keep pumping
/// after the port itself moved into the sound system.
pub struct MockPort {
    shared: Arc<MockShared>,
}

impl MockPort {
    pub fn new(
        name: String,
        channels: usize,
        samples_per_buffer: usize,
        device_index: usize,
        system: Weak<SoundSystem>,
    ) -> Self {
        Self {
            shared: Arc::new(MockShared {
                name,
                channels,
                samples_per_buffer,
                device_index,
                system,
                started: AtomicBool::new(false),
                last_buffer: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A second handle to this port, usable after the port moved into the
    /// sound system.
    pub fn handle(&self) -> MockPort {
        MockPort {
            shared: self.shared.clone(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    /// Invokes one audio callback like a driver would and returns true when
    /// this call closed the period.
    pub fn pump(&self) -> bool {
        let shared = &self.shared;
        let mut buffer = vec![0.0f32; shared.channels * shared.samples_per_buffer];
        let closed = match shared.system.upgrade() {
            Some(system) => system.audio_callback(
                shared.device_index,
                &mut buffer,
                shared.samples_per_buffer,
            ),
            None => false,
        };
        *shared.last_buffer.lock().expect("Error getting lock") = buffer;
        closed
    }

    /// Invokes one audio callback with a deliberately wrong frame count.
    pub fn pump_with_frames(&self, frames: usize) -> bool {
        let shared = &self.shared;
        let mut buffer = vec![0.0f32; shared.channels * frames];
        let closed = match shared.system.upgrade() {
            Some(system) => system.audio_callback(shared.device_index, &mut buffer, frames),
            None => false,
        };
        *shared.last_buffer.lock().expect("Error getting lock") = buffer;
        closed
    }

    /// The interleaved buffer produced by the last pump.
    pub fn last_buffer(&self) -> Vec<f32> {
        self.shared.last_buffer.lock().expect("Error getting lock").clone()
    }
}

impl super::OutputPort for MockPort {
    fn channels(&self) -> usize {
        self.shared.channels
    }

    fn start(&mut self) -> Result<(), Box<dyn Error>> {
        self.shared.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.started.store(false, Ordering::Release);
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<MockPort>, Box<dyn Error>> {
        Ok(Arc::new(self.handle()))
    }
}

impl fmt::Display for MockPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.shared.name)
    }
}

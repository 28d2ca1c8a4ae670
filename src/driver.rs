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
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::Deserialize;

use crate::system::SoundSystem;

pub mod cpal;
pub mod mock;

/// One physical (or mock) audio output bound to the sound system. Ports are
/// created closed; `start` opens the stream and begins delivering callbacks
/// into [`SoundSystem::audio_callback`].
pub trait OutputPort: Any + fmt::Display + Send {
    fn channels(&self) -> usize;

    /// Opens the driver-side stream. A failure here is surfaced to the user
    /// once and tears down all already-opened ports.
    fn start(&mut self) -> Result<(), Box<dyn Error>>;

    /// Stops the stream. Idempotent.
    fn stop(&mut self);

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<mock::MockPort>, Box<dyn Error>>;
}

/// Configuration for one output device.
#[derive(Deserialize, Clone, Debug)]
pub struct PortConfig {
    /// Device name; prefix "mock" selects the mock driver, `None` picks the
    /// default cpal output device.
    pub device: Option<String>,
    pub channels: usize,
}

/// Creates one port per config entry. Mock ports are selected by a "mock"
/// device-name prefix, everything else goes through cpal.
pub fn get_ports(
    configs: &[PortConfig],
    sample_rate: u32,
    samples_per_buffer: usize,
    system: &Arc<SoundSystem>,
) -> Result<Vec<Box<dyn OutputPort>>, Box<dyn Error>> {
    let mut ports: Vec<Box<dyn OutputPort>> = Vec::new();
    for (index, config) in configs.iter().enumerate() {
        let system: Weak<SoundSystem> = Arc::downgrade(system);
        if config.device.as_deref().is_some_and(|d| d.starts_with("mock")) {
            ports.push(Box::new(mock::MockPort::new(
                config.device.clone().unwrap_or_default(),
                config.channels,
                samples_per_buffer,
                index,
                system,
            )));
        } else {
            ports.push(Box::new(cpal::CpalPort::new(
                config.clone(),
                sample_rate,
                samples_per_buffer,
                index,
                system,
            )?));
        }
    }
    Ok(ports)
}

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
// cpal-backed output ports. cpal streams are not Send, so each started port
// parks a dedicated thread that owns the stream; the audio callbacks invoke
// the sound system directly from the driver's callback thread.

use std::error::Error;
use std::fmt;
use std::sync::mpsc;
#[cfg(test)]
use std::sync::Arc;
use std::sync::Weak;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{debug, error, info};

use crate::system::SoundSystem;

use super::{OutputPort, PortConfig};

pub struct CpalPort {
    name: String,
    channels: usize,
    sample_rate: u32,
    samples_per_buffer: usize,
    device_index: usize,
    system: Weak<SoundSystem>,
    /// Signals the stream thread to tear down.
    stop_tx: Option<mpsc::Sender<()>>,
    stream_thread: Option<std::thread::JoinHandle<()>>,
}

impl CpalPort {
    pub fn new(
        config: PortConfig,
        sample_rate: u32,
        samples_per_buffer: usize,
        device_index: usize,
        system: Weak<SoundSystem>,
    ) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            name: config.device.unwrap_or_default(),
            channels: config.channels,
            sample_rate,
            samples_per_buffer,
            device_index,
            system,
            stop_tx: None,
            stream_thread: None,
        })
    }

    /// Lists the names of all cpal output devices.
    pub fn list_devices() -> Result<Vec<String>, Box<dyn Error>> {
        let mut names = Vec::new();
        for host_id in cpal::available_hosts() {
            let devices = match cpal::host_from_id(host_id)?.devices() {
                Ok(devices) => devices,
                Err(e) => {
                    error!(
                        err = e.to_string(),
                        host = host_id.name(),
                        "Unable to list devices for host"
                    );
                    continue;
                }
            };
            for device in devices {
                let has_output = device
                    .supported_output_configs()
                    .map(|mut c| c.next().is_some())
                    .unwrap_or(false);
                if has_output {
                    names.push(device.name()?);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn find_device(name: &str) -> Result<cpal::Device, Box<dyn Error>> {
        if name.is_empty() {
            return cpal::default_host()
                .default_output_device()
                .ok_or_else(|| "no default output device".into());
        }
        for host_id in cpal::available_hosts() {
            if let Ok(devices) = cpal::host_from_id(host_id)?.devices() {
                for device in devices {
                    if device.name().map(|n| n.trim() == name).unwrap_or(false) {
                        return Ok(device);
                    }
                }
            }
        }
        Err(format!("no device found with name {}", name).into())
    }
}

impl super::OutputPort for CpalPort {
    fn channels(&self) -> usize {
        self.channels
    }

    fn start(&mut self) -> Result<(), Box<dyn Error>> {
        if self.stop_tx.is_some() {
            return Ok(());
        }

        let name = self.name.clone();
        let channels = self.channels as u16;
        let sample_rate = self.sample_rate;
        let samples_per_buffer = self.samples_per_buffer;
        let device_index = self.device_index;
        let system = self.system.clone();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        // The stream is not Send; it lives and dies on this thread.
        let thread = std::thread::Builder::new()
            .name(format!("cpal-port-{device_index}"))
            .spawn(move || {
                let device = match Self::find_device(&name) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let stream_config = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Fixed(samples_per_buffer as u32),
                };
                let error_callback = |err: cpal::StreamError| {
                    error!(err = err.to_string(), "Error during stream.");
                };
                let data_callback = move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1) as usize;
                    match system.upgrade() {
                        Some(system) => {
                            system.audio_callback(device_index, data, frames);
                        }
                        None => data.fill(0.0),
                    }
                };
                let stream = match device.build_output_stream(
                    &stream_config,
                    data_callback,
                    error_callback,
                    None,
                ) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stopped; dropping the stream closes the port.
                let _ = stop_rx.recv();
                drop(stream);
                debug!(device = device_index, "cpal stream closed.");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    device = self.name,
                    channels = self.channels,
                    sample_rate = self.sample_rate,
                    "Output stream started."
                );
                self.stop_tx = Some(stop_tx);
                self.stream_thread = Some(thread);
                Ok(())
            }
            Ok(Err(msg)) => {
                let _ = thread.join();
                Err(msg.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err("stream thread exited unexpectedly".into())
            }
        }
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.stream_thread.take() {
            if thread.join().is_err() {
                error!("Error while joining cpal stream thread!");
            }
        }
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<super::mock::MockPort>, Box<dyn Error>> {
        Err("not a mock".into())
    }
}

impl fmt::Display for CpalPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Channels={}) (cpal)", self.name, self.channels)
    }
}

impl Drop for CpalPort {
    fn drop(&mut self) {
        self.stop();
    }
}

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
// Recording sink fed by the recorder task once per period. The engine pushes
// the pre-mix buffers of either the downmix task or every device output; the
// WAV implementation assembles them into one multi-channel file and hands the
// interleaved frames to a writer thread so no file I/O happens on the render
// path.

use std::error::Error;
use std::path::Path;
use std::sync::Mutex;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::{error, info};

/// Description of one buffer source feeding the recorder.
#[derive(Clone, Copy, Debug)]
pub struct RecorderSource {
    pub channels: usize,
}

/// Sink for the per-period output buffers.
pub trait SoundRecorder: Send + Sync {
    /// Announces the sources the recorder will receive each period. Called at
    /// engine build, before any `write`.
    fn set_outputs(&self, sources: &[RecorderSource], samples_per_buffer: usize, sample_rate: u32);

    /// Delivers one source's interleaved buffer for the current period. All
    /// sources are delivered before the period advances.
    fn write(&self, source: usize, data: &[f32]);
}

/// A recorder that discards everything.
pub struct NullRecorder;

impl SoundRecorder for NullRecorder {
    fn set_outputs(&self, _: &[RecorderSource], _: usize, _: u32) {}

    fn write(&self, _: usize, _: &[f32]) {}
}

/// Sample encoding of the produced WAV file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleEncoding {
    Int16,
    Int24,
    Int32,
    Float32,
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("WAV file error: {0}")]
    WavError(#[from] hound::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("recorder has not been configured with outputs yet")]
    NotConfigured,
}

struct WavRecorderState {
    sources: Vec<RecorderSource>,
    samples_per_buffer: usize,
    sample_rate: u32,
    /// Per-source buffer for the period being assembled.
    pending: Vec<Option<Vec<f32>>>,
    sender: Option<Sender<Vec<f32>>>,
    writer: Option<JoinHandle<()>>,
}

/// Writes the recorder feed to a WAV file on a dedicated writer thread.
pub struct WavRecorder {
    encoding: SampleEncoding,
    state: Mutex<WavRecorderState>,
}

impl WavRecorder {
    pub fn new(encoding: SampleEncoding) -> Self {
        Self {
            encoding,
            state: Mutex::new(WavRecorderState {
                sources: Vec::new(),
                samples_per_buffer: 0,
                sample_rate: 0,
                pending: Vec::new(),
                sender: None,
                writer: None,
            }),
        }
    }

    /// Starts recording into `path`. The channel count is the sum of all
    /// source channels.
    pub fn start<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let mut state = self.state.lock().expect("Error getting lock");
        if state.sources.is_empty() {
            return Err(Box::new(RecorderError::NotConfigured));
        }
        if state.sender.is_some() {
            return Ok(());
        }

        let total_channels: usize = state.sources.iter().map(|s| s.channels).sum();
        let spec = hound::WavSpec {
            channels: total_channels as u16,
            sample_rate: state.sample_rate,
            bits_per_sample: match self.encoding {
                SampleEncoding::Int16 => 16,
                SampleEncoding::Int24 => 24,
                SampleEncoding::Int32 | SampleEncoding::Float32 => 32,
            },
            sample_format: match self.encoding {
                SampleEncoding::Float32 => hound::SampleFormat::Float,
                _ => hound::SampleFormat::Int,
            },
        };
        let mut writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!(
            path = %path.as_ref().display(),
            channels = total_channels,
            sample_rate = state.sample_rate,
            "Recording started."
        );

        // Keep a couple of periods of slack; the render path must never
        // block on the file system.
        let (tx, rx) = bounded::<Vec<f32>>(32);
        let encoding = self.encoding;
        state.writer = Some(std::thread::spawn(move || {
            for block in rx.iter() {
                let result = write_block(&mut writer, encoding, &block);
                if let Err(e) = result {
                    error!(err = e.to_string(), "Error writing recording; stopping.");
                    return;
                }
            }
            if let Err(e) = writer.finalize() {
                error!(err = e.to_string(), "Error finalizing recording.");
            }
        }));
        state.sender = Some(tx);
        for slot in state.pending.iter_mut() {
            *slot = None;
        }
        Ok(())
    }

    /// Stops recording and finalizes the file.
    pub fn stop(&self) {
        let writer = {
            let mut state = self.state.lock().expect("Error getting lock");
            state.sender = None;
            state.writer.take()
        };
        if let Some(writer) = writer {
            if writer.join().is_err() {
                error!("Error while joining recorder writer thread!");
            }
            info!("Recording stopped.");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().expect("Error getting lock").sender.is_some()
    }
}

fn write_block(
    writer: &mut hound::WavWriter<std::io::BufWriter<std::fs::File>>,
    encoding: SampleEncoding,
    block: &[f32],
) -> Result<(), hound::Error> {
    match encoding {
        SampleEncoding::Float32 => {
            for &sample in block {
                writer.write_sample(sample)?;
            }
        }
        SampleEncoding::Int16 => {
            for &sample in block {
                let s = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(s)?;
            }
        }
        SampleEncoding::Int24 => {
            for &sample in block {
                let s = (sample.clamp(-1.0, 1.0) * 8_388_607.0) as i32;
                writer.write_sample(s)?;
            }
        }
        SampleEncoding::Int32 => {
            for &sample in block {
                let s = (sample.clamp(-1.0, 1.0) * i32::MAX as f32) as i32;
                writer.write_sample(s)?;
            }
        }
    }
    Ok(())
}

impl SoundRecorder for WavRecorder {
    fn set_outputs(&self, sources: &[RecorderSource], samples_per_buffer: usize, sample_rate: u32) {
        let mut state = self.state.lock().expect("Error getting lock");
        state.sources = sources.to_vec();
        state.samples_per_buffer = samples_per_buffer;
        state.sample_rate = sample_rate;
        state.pending = vec![None; sources.len()];
    }

    fn write(&self, source: usize, data: &[f32]) {
        let mut state = self.state.lock().expect("Error getting lock");
        if state.sender.is_none() || source >= state.pending.len() {
            return;
        }
        state.pending[source] = Some(data.to_vec());
        if state.pending.iter().any(|p| p.is_none()) {
            return;
        }

        // Period complete: interleave all sources into one frame-major block.
        let frames = state.samples_per_buffer;
        let total_channels: usize = state.sources.iter().map(|s| s.channels).sum();
        let mut block = vec![0.0f32; frames * total_channels];
        let mut channel_base = 0;
        for (i, src) in state.sources.iter().enumerate() {
            let data = state.pending[i].as_ref().expect("checked above");
            for frame in 0..frames {
                for channel in 0..src.channels {
                    block[frame * total_channels + channel_base + channel] =
                        data[frame * src.channels + channel];
                }
            }
            channel_base += src.channels;
        }
        for slot in state.pending.iter_mut() {
            *slot = None;
        }

        // A full queue means the disk cannot keep up; drop the period rather
        // than stalling the audio callback.
        if let Some(sender) = &state.sender {
            if sender.try_send(block).is_err() {
                error!("Recorder queue full; dropping one period.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::eventually;

    #[test]
    fn null_recorder_accepts_everything() {
        let recorder = NullRecorder;
        recorder.set_outputs(&[RecorderSource { channels: 2 }], 16, 44100);
        recorder.write(0, &[0.0; 32]);
    }

    #[test]
    fn wav_recorder_roundtrip() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("take.wav");

        let recorder = WavRecorder::new(SampleEncoding::Float32);
        recorder.set_outputs(&[RecorderSource { channels: 2 }], 4, 44100);
        recorder.start(&path).unwrap();
        assert!(recorder.is_recording());

        let period: Vec<f32> = vec![0.1, -0.1, 0.2, -0.2, 0.3, -0.3, 0.4, -0.4];
        recorder.write(0, &period);
        recorder.stop();
        assert!(!recorder.is_recording());

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44100);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, period);
    }

    #[test]
    fn wav_recorder_interleaves_two_sources() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("multi.wav");

        let recorder = WavRecorder::new(SampleEncoding::Int16);
        recorder.set_outputs(
            &[RecorderSource { channels: 1 }, RecorderSource { channels: 1 }],
            2,
            48000,
        );
        recorder.start(&path).unwrap();

        // Writing only one source keeps the period pending.
        recorder.write(0, &[0.5, 0.5]);
        recorder.write(1, &[-0.5, -0.5]);
        recorder.stop();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 4);
        assert!(samples[0] > 0 && samples[1] < 0);
    }

    #[test]
    fn start_without_outputs_fails() {
        let recorder = WavRecorder::new(SampleEncoding::Float32);
        let tempdir = tempfile::tempdir().unwrap();
        assert!(recorder.start(tempdir.path().join("x.wav")).is_err());
    }

    #[test]
    fn write_without_recording_is_ignored() {
        let recorder = WavRecorder::new(SampleEncoding::Float32);
        recorder.set_outputs(&[RecorderSource { channels: 2 }], 4, 44100);
        recorder.write(0, &[0.0; 8]);
        eventually(|| !recorder.is_recording(), "recorder should stay stopped");
    }
}

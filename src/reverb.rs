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
// Impulse-response reverb over one output task's buffer. Uniform partitioned
// convolution: the IR is split into period-sized partitions, convolution runs
// in the frequency domain with one FFT per period and an accumulated spectrum
// per partition. All FFT plans and scratch buffers are allocated at setup.

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::buffer::AudioBuffer;
use crate::config::ReverbConfig;

struct ChannelState {
    /// Ring of input spectra, newest at `head`.
    input_spectra: Vec<Vec<Complex<f32>>>,
    head: usize,
    /// Overlap tail carried into the next period.
    overlap: Vec<f32>,
    /// Pre-delay line for the wet signal.
    delay: Vec<f32>,
    delay_pos: usize,
}

pub struct Reverb {
    channels: usize,
    block: usize,
    gain: f32,
    forward: Option<Arc<dyn RealToComplex<f32>>>,
    inverse: Option<Arc<dyn ComplexToReal<f32>>>,
    /// FFT of each IR partition.
    partitions: Vec<Vec<Complex<f32>>>,
    states: Vec<ChannelState>,
    // Scratch buffers reused every period.
    time_scratch: Vec<f32>,
    spectrum_scratch: Vec<Complex<f32>>,
    channel_scratch: Vec<f32>,
}

impl Reverb {
    /// Creates a disabled (pass-through) reverb for `channels` channels.
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            block: 0,
            gain: 1.0,
            forward: None,
            inverse: None,
            partitions: Vec::new(),
            states: Vec::new(),
            time_scratch: Vec::new(),
            spectrum_scratch: Vec::new(),
            channel_scratch: Vec::new(),
        }
    }

    /// Configures the reverb for the given period size. A disabled config or
    /// an empty impulse response leaves the reverb as a pass-through.
    pub fn setup(&mut self, config: &ReverbConfig, samples_per_buffer: usize, sample_rate: u32) {
        self.partitions.clear();
        self.states.clear();
        self.forward = None;
        self.inverse = None;

        if !config.enabled || config.impulse_response.is_empty() || samples_per_buffer == 0 {
            return;
        }

        let block = samples_per_buffer;
        let fft_len = block * 2;
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);
        let bins = fft_len / 2 + 1;

        // Split the IR into block-sized partitions and transform each.
        let ir = &config.impulse_response;
        let mut time = vec![0.0f32; fft_len];
        for chunk in ir.chunks(block) {
            time[..fft_len].fill(0.0);
            time[..chunk.len()].copy_from_slice(chunk);
            let mut spectrum = vec![Complex::new(0.0, 0.0); bins];
            forward
                .process(&mut time, &mut spectrum)
                .expect("FFT sizes match by construction");
            self.partitions.push(spectrum);
        }

        let delay_samples = (config.delay_ms as usize * sample_rate as usize) / 1000;
        for _ in 0..self.channels {
            self.states.push(ChannelState {
                input_spectra: vec![vec![Complex::new(0.0, 0.0); bins]; self.partitions.len()],
                head: 0,
                overlap: vec![0.0; block],
                delay: vec![0.0; delay_samples.max(1)],
                delay_pos: 0,
            });
        }

        self.block = block;
        self.gain = config.gain;
        self.forward = Some(forward);
        self.inverse = Some(inverse);
        self.time_scratch = vec![0.0; fft_len];
        self.spectrum_scratch = vec![Complex::new(0.0, 0.0); bins];
        self.channel_scratch = vec![0.0; block];
    }

    pub fn is_active(&self) -> bool {
        self.forward.is_some()
    }

    /// Clears all convolution state (tails, delay lines).
    pub fn reset(&mut self) {
        for state in &mut self.states {
            for spectrum in &mut state.input_spectra {
                spectrum.fill(Complex::new(0.0, 0.0));
            }
            state.overlap.fill(0.0);
            state.delay.fill(0.0);
            state.delay_pos = 0;
            state.head = 0;
        }
    }

    /// Adds the wet signal to `buffer` in place. A pass-through when not
    /// configured.
    pub fn process(&mut self, buffer: &mut AudioBuffer) {
        let (Some(forward), Some(inverse)) = (self.forward.clone(), self.inverse.clone()) else {
            return;
        };
        debug_assert_eq!(buffer.frames(), self.block);
        let channels = buffer.channels().min(self.channels);
        let block = self.block;
        let fft_len = block * 2;
        let n_partitions = self.partitions.len();

        for channel in 0..channels {
            // Deinterleave this channel.
            let data = buffer.data();
            for frame in 0..block {
                self.channel_scratch[frame] = data[frame * buffer.channels() + channel];
            }

            let state = &mut self.states[channel];

            // Forward transform of the new input block.
            self.time_scratch[..block].copy_from_slice(&self.channel_scratch);
            self.time_scratch[block..].fill(0.0);
            state.head = (state.head + 1) % n_partitions;
            forward
                .process(&mut self.time_scratch, &mut state.input_spectra[state.head])
                .expect("FFT sizes match by construction");

            // Accumulate input[head - p] * ir[p] over all partitions.
            self.spectrum_scratch.fill(Complex::new(0.0, 0.0));
            for (p, partition) in self.partitions.iter().enumerate() {
                let slot = (state.head + n_partitions - p) % n_partitions;
                let input = &state.input_spectra[slot];
                for (acc, (a, b)) in self
                    .spectrum_scratch
                    .iter_mut()
                    .zip(input.iter().zip(partition.iter()))
                {
                    *acc += a * b;
                }
            }

            inverse
                .process(&mut self.spectrum_scratch, &mut self.time_scratch)
                .expect("FFT sizes match by construction");
            let scale = 1.0 / fft_len as f32;

            // Overlap-add, then run the wet signal through the pre-delay and
            // mix it onto the dry buffer.
            let stride = buffer.channels();
            let data = buffer.data_mut();
            for frame in 0..block {
                let wet = self.time_scratch[frame] * scale + state.overlap[frame];
                let delayed = state.delay[state.delay_pos];
                state.delay[state.delay_pos] = wet;
                state.delay_pos = (state.delay_pos + 1) % state.delay.len();
                let wet_out = if state.delay.len() > 1 { delayed } else { wet };
                data[frame * stride + channel] += wet_out * self.gain;
            }
            for frame in 0..block {
                state.overlap[frame] = self.time_scratch[block + frame] * scale;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ir: Vec<f32>, gain: f32, delay_ms: u32) -> ReverbConfig {
        ReverbConfig {
            enabled: true,
            gain,
            delay_ms,
            impulse_response: ir,
        }
    }

    #[test]
    fn disabled_is_passthrough() {
        let mut reverb = Reverb::new(2);
        reverb.setup(&ReverbConfig::disabled(), 64, 44100);
        assert!(!reverb.is_active());
        let mut buf = AudioBuffer::new(2, 64);
        buf.data_mut()[0] = 0.7;
        reverb.process(&mut buf);
        assert_eq!(buf.data()[0], 0.7);
    }

    #[test]
    fn unit_impulse_ir_doubles_signal() {
        // IR = dirac: wet == dry, so output is dry + gain * dry.
        let mut reverb = Reverb::new(1);
        reverb.setup(&config(vec![1.0], 1.0, 0), 32, 44100);
        assert!(reverb.is_active());

        let mut buf = AudioBuffer::new(1, 32);
        for (i, s) in buf.data_mut().iter_mut().enumerate() {
            *s = (i as f32 * 0.4).sin() * 0.3;
        }
        let dry: Vec<f32> = buf.data().to_vec();
        reverb.process(&mut buf);
        for (out, d) in buf.data().iter().zip(dry.iter()) {
            assert!((out - 2.0 * d).abs() < 1e-4, "out={out} dry={d}");
        }
    }

    #[test]
    fn long_ir_spills_into_next_period() {
        // An IR longer than one period means a single-period impulse keeps
        // producing output in the following period.
        let ir = vec![0.5; 48];
        let mut reverb = Reverb::new(1);
        reverb.setup(&config(ir, 1.0, 0), 16, 44100);

        let mut buf = AudioBuffer::new(1, 16);
        buf.data_mut()[0] = 1.0;
        reverb.process(&mut buf);

        let mut silent = AudioBuffer::new(1, 16);
        reverb.process(&mut silent);
        let tail_energy: f32 = silent.data().iter().map(|s| s.abs()).sum();
        assert!(tail_energy > 0.1, "tail energy {tail_energy}");
    }

    #[test]
    fn reset_clears_tail() {
        let ir = vec![0.5; 48];
        let mut reverb = Reverb::new(1);
        reverb.setup(&config(ir, 1.0, 0), 16, 44100);

        let mut buf = AudioBuffer::new(1, 16);
        buf.data_mut()[0] = 1.0;
        reverb.process(&mut buf);
        reverb.reset();

        let mut silent = AudioBuffer::new(1, 16);
        reverb.process(&mut silent);
        let tail_energy: f32 = silent.data().iter().map(|s| s.abs()).sum();
        assert!(tail_energy < 1e-6, "tail energy {tail_energy}");
    }
}

//! Sample-rate / bit-depth / channel-count conversion
//!
//! Sits between the staging buffer and the engine when the player's format
//! differs from the engine's canonical 44100/16/2. Conversion is staged and
//! identity stages are skipped:
//!
//! 1. integer samples of any width -> f32 in [-1, 1] (sign extended)
//! 2. sample-rate conversion, windowed-sinc, stateful across writes
//! 3. mono -> stereo duplication
//! 4. saturating f32 -> i16

use super::OutputSink;
use crate::error::{AudioError, RaopCastError};
use crate::types::OutputFormat;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Frames fed to the resampler per process call.
const RESAMPLE_CHUNK_FRAMES: usize = 1024;

struct ResampleState {
    resampler: SincFixedIn<f32>,
    /// Planar input staged until a full chunk is available
    pending: Vec<Vec<f32>>,
}

struct Stages {
    resample: Option<ResampleState>,
}

/// Format converter that presents the upstream [`OutputSink`] interface and
/// forwards converted audio to the downstream sink.
pub struct Reformatter {
    in_format: OutputFormat,
    out_format: OutputFormat,
    /// out bytes per second / in bytes per second
    reformat_ratio: f64,
    /// out sample rate / in sample rate
    resample_ratio: f64,
    stages: Mutex<Stages>,
    sink: Arc<dyn OutputSink>,
}

impl Reformatter {
    /// Build a converter from `in_format` to `out_format` draining into
    /// `sink`.
    ///
    /// # Errors
    ///
    /// Returns `AudioError::Resampler` when the rate converter cannot be
    /// constructed.
    pub fn new(
        in_format: OutputFormat,
        out_format: OutputFormat,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, RaopCastError> {
        let resample_ratio = f64::from(out_format.sample_rate) / f64::from(in_format.sample_rate);
        let reformat_ratio =
            out_format.bytes_per_second() as f64 / in_format.bytes_per_second() as f64;

        let resample = if in_format.sample_rate != out_format.sample_rate {
            let parameters = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::Blackman2,
            };
            let resampler = SincFixedIn::<f32>::new(
                resample_ratio,
                1.0,
                parameters,
                RESAMPLE_CHUNK_FRAMES,
                in_format.channel_count as usize,
            )
            .map_err(|e| AudioError::Resampler(e.to_string()))?;

            Some(ResampleState {
                resampler,
                pending: vec![Vec::new(); in_format.channel_count as usize],
            })
        } else {
            None
        };

        debug!(%in_format, %out_format, reformat_ratio, "reformatter engaged");

        Ok(Self {
            in_format,
            out_format,
            reformat_ratio,
            resample_ratio,
            stages: Mutex::new(Stages { resample }),
            sink,
        })
    }

    /// Convert interleaved integer PCM of the input width to f32.
    fn int_to_f32(&self, input: &[u8]) -> Vec<f32> {
        let width = self.in_format.sample_size as usize;
        let sign_bit = 1i64 << (width * 8 - 1);
        let scale = sign_bit as f32;

        input
            .chunks_exact(width)
            .map(|bytes| {
                let mut sample = 0i64;
                for (i, b) in bytes.iter().enumerate() {
                    sample |= i64::from(*b) << (i * 8);
                }
                if sample & sign_bit != 0 {
                    sample -= sign_bit << 1;
                }
                sample as f32 / scale
            })
            .collect()
    }

    /// Interleaved -> planar split.
    fn deinterleave(&self, samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
        let frames = samples.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in samples.chunks_exact(channels) {
            for (ch, sample) in frame.iter().enumerate() {
                planar[ch].push(*sample);
            }
        }
        planar
    }

    /// Run the resampler over staged input, draining every complete chunk.
    /// With `end_of_input`, pushes the final partial chunk through too.
    fn resample(
        &self,
        stages: &mut Stages,
        planar: Vec<Vec<f32>>,
        end_of_input: bool,
    ) -> Result<Vec<f32>, RaopCastError> {
        let Some(state) = stages.resample.as_mut() else {
            // interleave back unchanged
            return Ok(interleave(&planar));
        };

        for (pending, incoming) in state.pending.iter_mut().zip(planar) {
            pending.extend(incoming);
        }

        let channels = state.pending.len();
        let mut produced: Vec<Vec<f32>> = vec![Vec::new(); channels];

        while state.pending[0].len() >= RESAMPLE_CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = state
                .pending
                .iter_mut()
                .map(|p| p.drain(..RESAMPLE_CHUNK_FRAMES).collect())
                .collect();

            let generated = state
                .resampler
                .process(&chunk, None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;

            for (out, channel) in produced.iter_mut().zip(generated) {
                out.extend(channel);
            }
        }

        if end_of_input && !state.pending[0].is_empty() {
            let partial: Vec<Vec<f32>> = state.pending.iter_mut().map(std::mem::take).collect();
            let generated = state
                .resampler
                .process_partial(Some(&partial), None)
                .map_err(|e| AudioError::Resampler(e.to_string()))?;

            for (out, channel) in produced.iter_mut().zip(generated) {
                out.extend(channel);
            }
        }

        Ok(interleave(&produced))
    }

    fn convert(&self, buffer: &[u8], end_of_input: bool) -> Result<Vec<u8>, RaopCastError> {
        let mut stages = self.stages.lock().expect("reformatter lock poisoned");

        let needs_float_path = self.in_format.sample_rate != self.out_format.sample_rate
            || self.in_format.sample_size != self.out_format.sample_size;

        let mut out = if needs_float_path {
            let samples = self.int_to_f32(buffer);
            let planar = self.deinterleave(&samples, self.in_format.channel_count as usize);
            let resampled = self.resample(&mut stages, planar, end_of_input)?;

            let mut bytes = Vec::with_capacity(resampled.len() * 2);
            for sample in resampled {
                let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
                bytes.extend_from_slice(&value.to_le_bytes());
            }
            bytes
        } else {
            // neither rate nor depth changes: samples pass through untouched
            buffer.to_vec()
        };

        if self.in_format.channel_count != self.out_format.channel_count {
            out = expand_mono_to_stereo(&out, self.out_format.sample_size as usize);
        }

        Ok(out)
    }
}

/// Duplicate each sample's bytes into two channels.
fn expand_mono_to_stereo(data: &[u8], sample_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for sample in data.chunks_exact(sample_size) {
        out.extend_from_slice(sample);
        out.extend_from_slice(sample);
    }
    out
}

fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let channels = planar.len();
    if channels == 0 {
        return Vec::new();
    }
    let frames = planar[0].len();
    let mut out = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        for channel in planar {
            out.push(channel[i]);
        }
    }
    out
}

impl OutputSink for Reformatter {
    fn latency(&self, format: &OutputFormat) -> Result<i64, RaopCastError> {
        if *format != self.in_format {
            return Err(AudioError::FormatMismatch {
                expected: self.in_format,
                actual: *format,
            }
            .into());
        }
        let downstream = self.sink.latency(&self.out_format)? as f64;
        Ok((downstream * self.resample_ratio) as i64)
    }

    fn buffered(&self) -> usize {
        (self.sink.buffered() as f64 * self.reformat_ratio) as usize
    }

    fn can_write(&self) -> usize {
        let mut can_write = (self.sink.can_write() as f64 / self.reformat_ratio) as usize;
        can_write -= can_write % self.in_format.frame_size();
        can_write
    }

    fn write(&self, buffer: &[u8]) -> Result<(), RaopCastError> {
        if buffer.len() % self.in_format.sample_size as usize != 0 {
            return Err(AudioError::UnalignedWrite(buffer.len()).into());
        }

        let converted = self.convert(buffer, false)?;
        if converted.is_empty() {
            // resampler is still accumulating a chunk
            return Ok(());
        }
        self.sink.write(&converted)
    }

    fn flush(&self) -> Result<(), RaopCastError> {
        let converted = self.convert(&[], true)?;
        if !converted.is_empty() {
            self.sink.write(&converted)?;
        }
        self.sink.flush()
    }

    fn reset(&self) -> Result<(), RaopCastError> {
        let mut stages = self.stages.lock().expect("reformatter lock poisoned");
        if let Some(state) = stages.resample.as_mut() {
            state.resampler.reset();
            for pending in &mut state.pending {
                pending.clear();
            }
        }
        drop(stages);
        self.sink.reset()
    }
}

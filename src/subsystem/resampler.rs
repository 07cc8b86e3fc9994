//! Streaming resampler for the native conversion streams.
//!
//! Wraps rubato's FFT resampler for interleaved multi-channel audio arriving
//! in variable-size chunks from real-time callbacks. Input is accumulated
//! internally until a full chunk is available, so callers can feed whatever
//! the callback delivered and drain whatever is ready.

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

use crate::error::{BackendError, Result};

/// Chunk size in frames for FFT-based resampling.
pub(crate) const CHUNK_FRAMES: usize = 1024;

/// Number of sub-chunks for FFT processing (higher = better quality but more CPU).
const SUB_CHUNKS: usize = 2;

/// Interleaved streaming resampler with internal accumulation.
pub struct StreamResampler {
    resampler: Fft<f32>,
    channels: usize,
    output_frames_max: usize,
    output_buffer: Vec<f32>,
    input_buffer: Vec<f32>,
}

impl StreamResampler {
    /// Create a resampler converting interleaved audio between two rates.
    ///
    /// # Arguments
    /// * `from_rate` - Input sample rate
    /// * `to_rate` - Output sample rate
    /// * `channels` - Interleaved channel count (shared by both sides)
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> Result<Self> {
        let resampler = Fft::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            CHUNK_FRAMES,
            SUB_CHUNKS,
            channels,
            FixedSync::Input,
        )
        .map_err(|e| BackendError::StreamCreate(format!("resampler: {e}")))?;

        let output_frames_max = resampler.output_frames_max();

        Ok(Self {
            resampler,
            channels,
            output_frames_max,
            output_buffer: vec![0.0; output_frames_max * channels],
            input_buffer: Vec::with_capacity(CHUNK_FRAMES * channels * 2),
        })
    }

    /// Feed interleaved samples and collect everything that resamples out.
    ///
    /// Accumulates until at least one full chunk is buffered, then processes
    /// every complete chunk. Returns an empty vector while more input is
    /// needed; a trailing partial chunk stays buffered for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.input_buffer.extend_from_slice(samples);

        let chunk_samples = CHUNK_FRAMES * self.channels;
        let mut out = Vec::new();

        while self.input_buffer.len() >= chunk_samples {
            let chunk: Vec<f32> = self.input_buffer.drain(..chunk_samples).collect();

            let Ok(input_adapter) = InterleavedSlice::new(&chunk, self.channels, CHUNK_FRAMES)
            else {
                break;
            };
            let Ok(mut output_adapter) = InterleavedSlice::new_mut(
                &mut self.output_buffer,
                self.channels,
                self.output_frames_max,
            ) else {
                break;
            };

            match self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, None)
            {
                Ok((_, frames_written)) => {
                    out.extend_from_slice(&self.output_buffer[..frames_written * self.channels]);
                }
                Err(e) => {
                    tracing::error!("Resampling error: {}", e);
                    break;
                }
            }
        }

        out
    }
}

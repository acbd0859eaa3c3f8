use crate::error::{Result, SoundStageError};
use rubato::{FftFixedIn, Resampler};

/// Offline sample-rate converter used when uploading samples to a device.
pub struct AudioResampler {
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: u16,
    chunk_size: usize,
}

impl AudioResampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(SoundStageError::AudioFormat(
                "Sample rates must be greater than 0".to_string(),
            ));
        }

        if channels == 0 {
            return Err(SoundStageError::AudioFormat(
                "Channel count must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_size: chunk_size.unwrap_or(1024),
        })
    }

    /// Resample interleaved PCM, trimming the filter delay and padding tail.
    pub fn resample_interleaved(&self, interleaved: &[f32]) -> Result<Vec<f32>> {
        if self.source_sample_rate == self.target_sample_rate {
            return Ok(interleaved.to_vec());
        }

        let channels = self.channels as usize;
        let frames = interleaved.len() / channels;
        let planar: Vec<Vec<f32>> = (0..channels)
            .map(|ch| {
                interleaved
                    .chunks(channels)
                    .map(|frame| frame.get(ch).copied().unwrap_or(0.0))
                    .collect()
            })
            .collect();

        let mut resampler = FftFixedIn::<f32>::new(
            self.source_sample_rate as usize,
            self.target_sample_rate as usize,
            self.chunk_size,
            2,
            channels,
        )
        .map_err(|e| SoundStageError::AudioFormat(format!("Failed to create resampler: {}", e)))?;

        let delay = resampler.output_delay();
        let expected = (frames as f64 * self.resample_ratio()).round() as usize;
        let mut output: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

        // Keep feeding (zero-padded) chunks until the delayed tail has come out.
        let mut input_index = 0;
        while output[0].len() < expected + delay {
            let chunk: Vec<Vec<f32>> = planar
                .iter()
                .map(|data| {
                    let mut chunk = vec![0.0f32; self.chunk_size];
                    if input_index < data.len() {
                        let end = (input_index + self.chunk_size).min(data.len());
                        chunk[..end - input_index].copy_from_slice(&data[input_index..end]);
                    }
                    chunk
                })
                .collect();
            let waves_out = resampler
                .process(&chunk, None)
                .map_err(|e| SoundStageError::AudioFormat(format!("Resampling error: {}", e)))?;
            for (out, wave) in output.iter_mut().zip(waves_out) {
                out.extend_from_slice(&wave);
            }
            input_index += self.chunk_size;
        }

        let mut result = Vec::with_capacity(expected * channels);
        for frame in delay..delay + expected {
            for out in &output {
                result.push(out[frame]);
            }
        }
        Ok(result)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn resample_ratio(&self) -> f64 {
        self.target_sample_rate as f64 / self.source_sample_rate as f64
    }
}

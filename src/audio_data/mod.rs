mod resampler;
mod symphonia_decoder;

use crate::device::PcmData;
use crate::error::{Result, SoundStageError};
pub use resampler::AudioResampler;
use std::sync::Arc;
use std::time::Duration;

pub use symphonia_decoder::{SymphoniaDecoder, SymphoniaStream};

/// Storage precision of a decoded sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleKind {
    /// 16-bit integer precision
    #[default]
    Short,
    Float,
}

/// How a decoded file is going to be played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MixType {
    /// Downmixed to one channel at decode time
    #[default]
    Mono,
    /// Channels kept; positioned voices are folded to mono by the mixer
    Spatial,
    /// Streamed in chunks rather than decoded whole
    Music,
}

/// Decoded PCM shared between the sample cache and its uploads.
#[derive(Debug, Clone)]
pub struct SoundFile {
    inner: Arc<SoundFileInner>,
}

#[derive(Debug)]
struct SoundFileInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    kind: SampleKind,
    total_frames: usize,
}

impl SoundFile {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, kind: SampleKind) -> Self {
        let samples = match kind {
            SampleKind::Short => samples.into_iter().map(quantize_i16).collect(),
            SampleKind::Float => samples,
        };
        let total_frames = samples.len() / channels.max(1) as usize;
        Self {
            inner: Arc::new(SoundFileInner {
                samples,
                sample_rate,
                channels,
                kind,
                total_frames,
            }),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn kind(&self) -> SampleKind {
        self.inner.kind
    }

    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn total_frames(&self) -> usize {
        self.inner.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.inner.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.inner.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.inner.total_frames as f64 / self.inner.sample_rate as f64)
    }

    /// Downmix all channels to one.
    pub fn to_mono(&self) -> Self {
        if self.inner.channels <= 1 {
            return self.clone();
        }
        let channels = self.inner.channels as usize;
        let mono = self
            .inner
            .samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Self::new(mono, self.inner.sample_rate, 1, self.inner.kind)
    }

    /// Resample to a different rate using rubato.
    pub fn resample(&self, target_sample_rate: u32) -> Result<Self> {
        if target_sample_rate == self.inner.sample_rate {
            return Ok(self.clone());
        }
        let resampler = AudioResampler::new(
            self.inner.sample_rate,
            target_sample_rate,
            self.inner.channels,
            Some(1024),
        )?;
        let resampled = resampler.resample_interleaved(&self.inner.samples)?;
        Ok(Self::new(
            resampled,
            target_sample_rate,
            self.inner.channels,
            self.inner.kind,
        ))
    }

    pub(crate) fn to_pcm(&self) -> PcmData {
        PcmData {
            samples: self.inner.samples.clone(),
            channels: self.inner.channels,
            sample_rate: self.inner.sample_rate,
        }
    }
}

fn quantize_i16(s: f32) -> f32 {
    (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() / i16::MAX as f32
}

/// Descriptive tags read from a music track.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
}

/// Outcome of one [`DecodeStream::fill`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// This many frames were written (possibly fewer than requested at end of track)
    Filled(usize),
    /// No data available yet; try again next tick
    Pending,
    /// End of track, nothing written
    Exhausted,
}

/// A chunked decoder for streamed music.
pub trait DecodeStream {
    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Write up to `out.len() / channels` interleaved frames.
    fn fill(&mut self, out: &mut [f32]) -> FillStatus;

    /// Seek back to the first frame.
    fn rewind(&mut self) -> Result<()>;

    fn tags(&self) -> TrackTags {
        TrackTags::default()
    }
}

/// Turns asset names into PCM.
pub trait AssetDecoder {
    fn decode(&self, name: &str, kind: SampleKind, mix: MixType) -> Result<SoundFile>;

    fn open_stream(&self, name: &str) -> Result<Box<dyn DecodeStream>>;
}

/// Applies the mix policy to freshly decoded PCM.
pub(crate) fn apply_mix(file: SoundFile, mix: MixType) -> SoundFile {
    match mix {
        MixType::Mono => file.to_mono(),
        MixType::Spatial | MixType::Music => file,
    }
}

pub(crate) fn check_layout(name: &str, sample_rate: u32, channels: u16) -> Result<()> {
    if sample_rate == 0 || !(1..=2).contains(&channels) {
        return Err(SoundStageError::decode(
            name,
            format!("unsupported layout: {} channels at {} Hz", channels, sample_rate),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_mono_averages_channels() {
        let file = SoundFile::new(vec![1.0, 0.0, 0.5, 0.5], 100, 2, SampleKind::Float);
        let mono = file.to_mono();
        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.samples(), &[0.5, 0.5]);
        assert_eq!(mono.total_frames(), 2);
    }

    #[test]
    fn test_short_kind_quantizes() {
        let file = SoundFile::new(vec![0.123_456_79, 2.0], 100, 1, SampleKind::Short);
        assert_eq!(file.samples()[1], 1.0);
        let step = 1.0 / i16::MAX as f32;
        assert!((file.samples()[0] - 0.123_456_79).abs() <= step);
    }

    #[test]
    fn test_duration() {
        let file = SoundFile::new(vec![0.0; 200], 100, 2, SampleKind::Float);
        assert_eq!(file.duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_layout_check() {
        assert!(check_layout("x", 44100, 2).is_ok());
        assert!(check_layout("x", 44100, 6).is_err());
        assert!(check_layout("x", 0, 1).is_err());
    }
}

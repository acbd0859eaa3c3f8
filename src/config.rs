//! Configuration for soundstage

use crate::error::{Result, SoundStageError};

/// Default reference distance below which sounds are not attenuated.
pub const SOUND_MIN_DIST: f32 = 16.0;
/// Default distance beyond which sounds stop attenuating further.
pub const SOUND_MAX_DIST: f32 = 10000.0;
/// Speed of sound in world units per second, used for distance delay and Doppler.
pub const SOUND_SPEED: f32 = 13600.0;

/// Configuration descriptor for a [`SoundStage`](crate::SoundStage).
///
/// Volumes and distances here are the global defaults every slot and emit
/// request falls back to. Nothing in this struct is persisted by the crate.
#[derive(Debug, Clone)]
pub struct SoundStageDesc {
    /// Device sample rate requested from the output driver
    pub sample_rate: u32,
    /// Output channel count (the mixer renders stereo and spreads to wider layouts)
    pub channels: u16,
    /// Frames per device callback
    pub block_size: usize,
    /// Preferred audio output device name (None = platform default)
    pub audio_device: Option<String>,
    /// Haptics output device name (None = no haptics)
    pub haptics_device: Option<String>,
    /// Retry with the platform default device when the named one fails to open
    pub fallback: bool,
    /// Fixed capacity of the source pool
    pub max_sources: usize,
    /// Hardware voice limit per device
    pub max_voices: usize,
    /// Hardware effect slot limit per device
    pub max_effect_slots: usize,
    /// Device memory available for sample buffers, in bytes
    pub max_buffer_bytes: usize,
    /// Number of buffers in the music ring
    pub music_buffers: usize,
    /// Frames decoded into each music buffer
    pub music_chunk_frames: usize,
    pub master_volume: f32,
    pub effect_volume: f32,
    pub music_volume: f32,
    /// Global rolloff factor
    pub rolloff: f32,
    /// Global reference distance
    pub refdist: f32,
    /// Global maximum distance
    pub maxdist: f32,
    /// Rate per second at which current gain/pitch approach their targets
    pub gain_smoothing: f32,
    /// Resample decoded samples to the device rate before upload
    pub resample_on_upload: bool,
    /// Track played by `smart_music` when music is wanted
    pub smart_music: Option<String>,
    /// Seed for variant selection (None = entropy)
    pub rng_seed: Option<u64>,
}

impl Default for SoundStageDesc {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            block_size: 1024,
            audio_device: None,
            haptics_device: None,
            fallback: true,
            max_sources: 256,
            max_voices: 256,
            max_effect_slots: 4,
            max_buffer_bytes: 256 * 1024 * 1024,
            music_buffers: 4,
            music_chunk_frames: 8192,
            master_volume: 1.0,
            effect_volume: 1.0,
            music_volume: 0.5,
            rolloff: 1.0,
            refdist: SOUND_MIN_DIST,
            maxdist: SOUND_MAX_DIST,
            gain_smoothing: 20.0,
            resample_on_upload: true,
            smart_music: None,
            rng_seed: None,
        }
    }
}

impl SoundStageDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    pub fn audio_device(mut self, name: impl Into<String>) -> Self {
        self.audio_device = Some(name.into());
        self
    }

    pub fn haptics_device(mut self, name: impl Into<String>) -> Self {
        self.haptics_device = Some(name.into());
        self
    }

    pub fn fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn max_sources(mut self, max: usize) -> Self {
        self.max_sources = max;
        self
    }

    pub fn max_voices(mut self, max: usize) -> Self {
        self.max_voices = max;
        self
    }

    pub fn max_effect_slots(mut self, max: usize) -> Self {
        self.max_effect_slots = max;
        self
    }

    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    pub fn music_ring(mut self, buffers: usize, chunk_frames: usize) -> Self {
        self.music_buffers = buffers;
        self.music_chunk_frames = chunk_frames;
        self
    }

    pub fn volumes(mut self, master: f32, effect: f32, music: f32) -> Self {
        self.master_volume = master;
        self.effect_volume = effect;
        self.music_volume = music;
        self
    }

    pub fn distance_model(mut self, rolloff: f32, refdist: f32, maxdist: f32) -> Self {
        self.rolloff = rolloff;
        self.refdist = refdist;
        self.maxdist = maxdist;
        self
    }

    pub fn gain_smoothing(mut self, rate: f32) -> Self {
        self.gain_smoothing = rate;
        self
    }

    pub fn resample_on_upload(mut self, enable: bool) -> Self {
        self.resample_on_upload = enable;
        self
    }

    pub fn smart_music(mut self, track: impl Into<String>) -> Self {
        self.smart_music = Some(track.into());
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Rejects values the mixer and pools cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(SoundStageError::Configuration(
                "Sample rate must be greater than 0".to_string(),
            ));
        }
        if self.channels == 0 {
            return Err(SoundStageError::Configuration(
                "Channel count must be greater than 0".to_string(),
            ));
        }
        if self.max_sources == 0 {
            return Err(SoundStageError::Configuration(
                "Source pool needs at least one slot".to_string(),
            ));
        }
        if self.music_buffers < 2 || self.music_chunk_frames == 0 {
            return Err(SoundStageError::Configuration(format!(
                "Music ring needs at least 2 non-empty buffers (got {} x {})",
                self.music_buffers, self.music_chunk_frames
            )));
        }
        Ok(())
    }

    pub(crate) fn effect_gain(&self) -> f32 {
        self.master_volume * self.effect_volume
    }

    pub(crate) fn music_gain(&self) -> f32 {
        self.master_volume * self.music_volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(SoundStageDesc::default().validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let desc = SoundStageDesc::new()
            .max_sources(8)
            .music_ring(3, 1024)
            .volumes(0.5, 0.8, 0.25)
            .rng_seed(7);
        assert_eq!(desc.max_sources, 8);
        assert_eq!(desc.music_buffers, 3);
        assert!((desc.effect_gain() - 0.4).abs() < 1e-6);
        assert!((desc.music_gain() - 0.125).abs() < 1e-6);
        assert_eq!(desc.rng_seed, Some(7));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(SoundStageDesc::new().sample_rate(0).validate().is_err());
        assert!(SoundStageDesc::new().max_sources(0).validate().is_err());
        assert!(SoundStageDesc::new().music_ring(1, 1024).validate().is_err());
    }
}

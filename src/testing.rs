//! In-memory collaborators for deterministic tests.

use crate::audio_data::{
    AssetDecoder, DecodeStream, FillStatus, MixType, SampleKind, SoundFile, TrackTags, apply_mix,
};
use crate::error::{Result, SoundStageError};
use crate::math::Vec3;
use crate::world::{EntityId, SoundListener, SoundMaterial, SoundWorld, ZoneEntity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Track {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
    tags: TrackTags,
    /// Fills served before the stalls begin
    stall_after: usize,
    /// Calls to `fill` that report Pending once stalling
    stalls: usize,
}

/// Decoder serving generated tones by name. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDecoder {
    sounds: Arc<Mutex<HashMap<String, (Vec<f32>, u16, u32)>>>,
    tracks: Arc<Mutex<HashMap<String, Track>>>,
    decodes: Arc<Mutex<Vec<String>>>,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mono tone of `frames` frames at `rate`.
    pub fn with_sound(self, name: &str, frames: usize, rate: u32) -> Self {
        self.sounds
            .lock()
            .insert(name.to_string(), (vec![0.25; frames], 1, rate));
        self
    }

    pub fn with_track(self, name: &str, frames: usize, rate: u32) -> Self {
        self.tracks.lock().insert(
            name.to_string(),
            Track {
                samples: vec![0.1; frames * 2],
                channels: 2,
                sample_rate: rate,
                tags: TrackTags {
                    artist: Some("Test Artist".to_string()),
                    title: Some(name.to_string()),
                    album: None,
                },
                stall_after: 0,
                stalls: 0,
            },
        );
        self
    }

    /// Make the named track report Pending `stalls` times once `after` fills were served.
    pub fn with_stalls(self, name: &str, after: usize, stalls: usize) -> Self {
        if let Some(track) = self.tracks.lock().get_mut(name) {
            track.stall_after = after;
            track.stalls = stalls;
        }
        self
    }

    /// Names passed to `decode`, in call order.
    pub fn decodes(&self) -> Vec<String> {
        self.decodes.lock().clone()
    }
}

impl AssetDecoder for MemoryDecoder {
    fn decode(&self, name: &str, kind: SampleKind, mix: MixType) -> Result<SoundFile> {
        self.decodes.lock().push(name.to_string());
        let sounds = self.sounds.lock();
        let (samples, channels, rate) = sounds
            .get(name)
            .ok_or_else(|| SoundStageError::decode(name, "not in memory"))?;
        Ok(apply_mix(
            SoundFile::new(samples.clone(), *rate, *channels, kind),
            mix,
        ))
    }

    fn open_stream(&self, name: &str) -> Result<Box<dyn DecodeStream>> {
        let track = self
            .tracks
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| SoundStageError::decode(name, "not in memory"))?;
        Ok(Box::new(MemoryStream {
            track,
            cursor: 0,
            fills: 0,
        }))
    }
}

struct MemoryStream {
    track: Track,
    cursor: usize,
    fills: usize,
}

impl DecodeStream for MemoryStream {
    fn sample_rate(&self) -> u32 {
        self.track.sample_rate
    }

    fn channels(&self) -> u16 {
        self.track.channels
    }

    fn fill(&mut self, out: &mut [f32]) -> FillStatus {
        self.fills += 1;
        if self.fills > self.track.stall_after && self.track.stalls > 0 {
            self.track.stalls -= 1;
            return FillStatus::Pending;
        }
        let ch = self.track.channels as usize;
        let remaining = self.track.samples.len() - self.cursor;
        let n = remaining.min(out.len() / ch * ch);
        if n == 0 {
            return FillStatus::Exhausted;
        }
        out[..n].copy_from_slice(&self.track.samples[self.cursor..self.cursor + n]);
        self.cursor += n;
        FillStatus::Filled(n / ch)
    }

    fn rewind(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn tags(&self) -> TrackTags {
        self.track.tags.clone()
    }
}

/// Scripted world: a listener, entity positions and zone entities.
#[derive(Debug, Clone, Default)]
pub struct TestWorld {
    pub listener: SoundListener,
    pub entities: HashMap<EntityId, Vec3>,
    pub zones: Vec<ZoneEntity>,
    pub water: Option<crate::math::Bounds>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn place(&mut self, id: EntityId, pos: Vec3) {
        self.entities.insert(id, pos);
    }
}

impl SoundWorld for TestWorld {
    fn listener(&self) -> SoundListener {
        self.listener
    }

    fn entity_position(&self, id: EntityId) -> Option<Vec3> {
        self.entities.get(&id).copied()
    }

    fn zone_entities(&self) -> Vec<ZoneEntity> {
        self.zones.clone()
    }

    fn material_at(&self, pos: Vec3) -> SoundMaterial {
        match self.water {
            Some(b) if b.contains(pos) => SoundMaterial::Water,
            _ => SoundMaterial::Air,
        }
    }
}

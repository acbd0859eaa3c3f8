//! Positional audio core for interactive 3D worlds.
//!
//! A [`SoundStage`] owns the output devices, the sample cache, the named
//! sound slots, a fixed pool of spatial sources, environmental reverb zones
//! and one streamed music track. The host registers sounds, emits them at
//! world positions and calls [`SoundStage::update_sounds`] once per tick with
//! a [`SoundWorld`] that answers listener and entity queries.

pub mod audio_data;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod events;
pub mod math;
pub mod music;
pub mod sample;
pub mod slot;
pub mod source;
mod stage;
pub mod world;

#[cfg(test)]
mod testing;

pub use audio_data::{AssetDecoder, DecodeStream, MixType, SampleKind, SoundFile, SymphoniaDecoder};
pub use config::{SOUND_MAX_DIST, SOUND_MIN_DIST, SOUND_SPEED, SoundStageDesc};
pub use device::{CpalDriver, DeviceDriver, DeviceKind, HeadlessDriver};
pub use env::{EnvProp, SoundEnv, SoundEnvs};
pub use error::{Result, SoundStageError};
pub use events::SoundEvent;
pub use source::{EmitParams, SoundFlags, SourceHandle, SourceState};
pub use slot::{SlotParams, SlotSetKind};
pub use stage::SoundStage;
pub use world::{EntityId, SoundListener, SoundMaterial, SoundWorld, ZoneEntity};

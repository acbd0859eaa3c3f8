//! Environmental reverb: named presets and the world zones that apply them.

mod preset;
mod zone;

pub use preset::{EnvProp, SoundEnv, SoundEnvs};
pub use zone::{EfxSlotPool, EnvZoneSystem, SoundEnvZone};

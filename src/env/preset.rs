use crate::device::ReverbParams;
use crate::error::{Result, SoundStageError};
use crate::math::Vec3;
use std::io::Write;

/// Reverb properties an environment preset carries, in dump order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvProp {
    Density,
    Diffusion,
    Gain,
    GainHf,
    GainLf,
    DecayTime,
    DecayHfRatio,
    DecayLfRatio,
    ReflectionsGain,
    ReflectionsDelay,
    LateReverbGain,
    LateReverbDelay,
    EchoTime,
    EchoDepth,
    ModulationTime,
    ModulationDepth,
    AirAbsorptionGainHf,
    HfReference,
    LfReference,
    RoomRolloffFactor,
    DecayHfLimit,
}

impl EnvProp {
    pub const COUNT: usize = 21;

    pub const ALL: [EnvProp; Self::COUNT] = [
        Self::Density,
        Self::Diffusion,
        Self::Gain,
        Self::GainHf,
        Self::GainLf,
        Self::DecayTime,
        Self::DecayHfRatio,
        Self::DecayLfRatio,
        Self::ReflectionsGain,
        Self::ReflectionsDelay,
        Self::LateReverbGain,
        Self::LateReverbDelay,
        Self::EchoTime,
        Self::EchoDepth,
        Self::ModulationTime,
        Self::ModulationDepth,
        Self::AirAbsorptionGainHf,
        Self::HfReference,
        Self::LfReference,
        Self::RoomRolloffFactor,
        Self::DecayHfLimit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Density => "density",
            Self::Diffusion => "diffusion",
            Self::Gain => "gain",
            Self::GainHf => "gainhf",
            Self::GainLf => "gainlf",
            Self::DecayTime => "decaytime",
            Self::DecayHfRatio => "decayhfratio",
            Self::DecayLfRatio => "decaylfratio",
            Self::ReflectionsGain => "reflectionsgain",
            Self::ReflectionsDelay => "reflectionsdelay",
            Self::LateReverbGain => "latereverbgain",
            Self::LateReverbDelay => "latereverbdelay",
            Self::EchoTime => "echotime",
            Self::EchoDepth => "echodepth",
            Self::ModulationTime => "modulationtime",
            Self::ModulationDepth => "modulationdepth",
            Self::AirAbsorptionGainHf => "airabsorptiongainhf",
            Self::HfReference => "hfreference",
            Self::LfReference => "lfreference",
            Self::RoomRolloffFactor => "roomrollofffactor",
            Self::DecayHfLimit => "decayhflimit",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.name() == name)
    }

    /// Valid range as defined by the EFX reverb effect.
    pub fn range(&self) -> (f32, f32) {
        match self {
            Self::Density | Self::Diffusion | Self::Gain | Self::GainHf | Self::GainLf => {
                (0.0, 1.0)
            }
            Self::DecayTime => (0.1, 20.0),
            Self::DecayHfRatio | Self::DecayLfRatio => (0.1, 2.0),
            Self::ReflectionsGain => (0.0, 3.16),
            Self::ReflectionsDelay => (0.0, 0.3),
            Self::LateReverbGain => (0.0, 10.0),
            Self::LateReverbDelay => (0.0, 0.1),
            Self::EchoTime => (0.075, 0.25),
            Self::EchoDepth | Self::ModulationDepth | Self::DecayHfLimit => (0.0, 1.0),
            Self::ModulationTime => (0.04, 4.0),
            Self::AirAbsorptionGainHf => (0.892, 1.0),
            Self::HfReference => (1000.0, 20000.0),
            Self::LfReference => (20.0, 1000.0),
            Self::RoomRolloffFactor => (0.0, 10.0),
        }
    }

    pub fn default_value(&self) -> f32 {
        match self {
            Self::Density | Self::Diffusion | Self::GainLf | Self::DecayLfRatio => 1.0,
            Self::Gain => 0.32,
            Self::GainHf => 0.89,
            Self::DecayTime => 1.49,
            Self::DecayHfRatio => 0.83,
            Self::ReflectionsGain => 0.05,
            Self::ReflectionsDelay => 0.007,
            Self::LateReverbGain => 1.26,
            Self::LateReverbDelay => 0.011,
            Self::EchoTime | Self::ModulationTime => 0.25,
            Self::EchoDepth | Self::ModulationDepth | Self::RoomRolloffFactor => 0.0,
            Self::AirAbsorptionGainHf => 0.994,
            Self::HfReference => 5000.0,
            Self::LfReference => 250.0,
            Self::DecayHfLimit => 1.0,
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// A named reverb preset.
#[derive(Debug, Clone, PartialEq)]
pub struct SoundEnv {
    name: String,
    props: [f32; EnvProp::COUNT],
    revision: u32,
}

impl SoundEnv {
    pub fn new(name: impl Into<String>) -> Self {
        let mut props = [0.0; EnvProp::COUNT];
        for prop in EnvProp::ALL {
            props[prop.index()] = prop.default_value();
        }
        Self {
            name: name.into(),
            props,
            revision: 0,
        }
    }

    fn with(mut self, values: &[(EnvProp, f32)]) -> Self {
        for (prop, value) in values {
            self.props[prop.index()] = *value;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, prop: EnvProp) -> f32 {
        self.props[prop.index()]
    }

    /// Bumped on every edit so attached effects know to re-upload.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Set one property, clamped to its valid range.
    pub fn set(&mut self, prop: EnvProp, value: f32) {
        let (lo, hi) = prop.range();
        self.props[prop.index()] = value.clamp(lo, hi);
        self.revision = self.revision.wrapping_add(1);
    }

    pub fn reverb_params(&self, pan: Vec3) -> ReverbParams {
        ReverbParams {
            gain: self.get(EnvProp::Gain),
            gain_hf: self.get(EnvProp::GainHf),
            decay_time: self.get(EnvProp::DecayTime),
            reflections_gain: self.get(EnvProp::ReflectionsGain),
            reflections_delay: self.get(EnvProp::ReflectionsDelay),
            late_reverb_gain: self.get(EnvProp::LateReverbGain),
            late_reverb_delay: self.get(EnvProp::LateReverbDelay),
            pan,
        }
    }

    pub fn dump(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(out, "soundenv \"{}\" [", self.name)?;
        for prop in EnvProp::ALL {
            writeln!(out, "    {} = {}", prop.name(), self.get(prop))?;
        }
        writeln!(out, "]")
    }
}

/// The preset table zones resolve their environment names against.
#[derive(Debug, Clone)]
pub struct SoundEnvs {
    envs: Vec<SoundEnv>,
}

impl Default for SoundEnvs {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundEnvs {
    /// A table holding the built-in presets.
    pub fn new() -> Self {
        use EnvProp::*;
        let preset = |name: &str, v: [f32; 10]| {
            SoundEnv::new(name).with(&[
                (Density, v[0]),
                (Diffusion, v[1]),
                (Gain, v[2]),
                (GainHf, v[3]),
                (DecayTime, v[4]),
                (DecayHfRatio, v[5]),
                (ReflectionsGain, v[6]),
                (ReflectionsDelay, v[7]),
                (LateReverbGain, v[8]),
                (LateReverbDelay, v[9]),
            ])
        };
        Self {
            envs: vec![
                SoundEnv::new("generic"),
                preset("underwater", [0.36, 1.0, 0.32, 0.01, 8.0, 0.2, 0.4, 0.02, 1.0, 0.04]),
                preset("cave", [1.0, 1.0, 0.32, 0.59, 3.0, 0.6, 0.14, 0.015, 1.0, 0.022]),
                preset("hallway", [0.36, 1.0, 0.32, 0.89, 1.49, 0.59, 0.25, 0.007, 1.26, 0.011]),
                preset("arena", [1.0, 1.0, 0.32, 0.45, 4.6, 0.5, 0.2, 0.02, 0.8, 0.03]),
                preset("forest", [0.5, 0.6, 0.28, 0.7, 1.8, 0.5, 0.08, 0.03, 0.5, 0.045]),
                preset("cathedral", [1.0, 1.0, 0.32, 0.35, 8.5, 0.4, 0.18, 0.015, 1.4, 0.04]),
                preset("metalroom", [0.9, 0.8, 0.35, 0.95, 1.2, 0.9, 0.35, 0.003, 0.9, 0.008]),
                preset("snow", [0.3, 1.0, 0.2, 0.15, 0.6, 0.3, 0.02, 0.02, 0.3, 0.035]),
                preset("tunnel", [0.8, 0.5, 0.4, 0.7, 2.8, 0.65, 0.3, 0.01, 1.1, 0.018]),
                preset("bathroom", [0.6, 1.0, 0.3, 0.88, 1.5, 0.75, 0.4, 0.005, 0.8, 0.012]),
            ],
        }
    }

    /// A table with no presets at all.
    pub fn empty() -> Self {
        Self { envs: Vec::new() }
    }

    /// Add a preset with default properties, or return the existing one's index.
    pub fn add_env(&mut self, name: &str) -> usize {
        if let Some(index) = self.find(name) {
            return index;
        }
        self.envs.push(SoundEnv::new(name));
        self.envs.len() - 1
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.envs.iter().position(|e| e.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&SoundEnv> {
        self.envs.get(index)
    }

    /// Set a property by name on a named preset.
    pub fn set_prop(&mut self, env: &str, prop: &str, value: f32) -> Result<()> {
        let index = self
            .find(env)
            .ok_or_else(|| SoundStageError::Configuration(format!("unknown soundenv '{}'", env)))?;
        let prop = EnvProp::from_name(prop).ok_or_else(|| {
            SoundStageError::Configuration(format!("unknown soundenv property '{}'", prop))
        })?;
        self.envs[index].set(prop, value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SoundEnv> {
        self.envs.iter()
    }

    /// Write every preset as a `soundenv` block.
    pub fn dump(&self, out: &mut impl Write) -> std::io::Result<()> {
        for env in &self.envs {
            env.dump(out)?;
        }
        Ok(())
    }
}

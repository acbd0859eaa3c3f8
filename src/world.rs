//! World interface for soundstage
//!
//! The entity/world representation lives outside this crate. The sound core only
//! needs the listener transform, entity positions for tracked sources, and the
//! zone-tagged entities when zones are (re)built.

use crate::math::{Bounds, Pose, Vec3};

/// Identifier of a world entity that owns sounds or places a zone.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

/// The "ears" in the world: where sounds are heard from.
///
/// Updated from [`SoundWorld::listener`] once per tick. The velocity feeds the
/// Doppler shift of moving sources.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SoundListener {
    pub pose: Pose,
    pub velocity: Vec3,
}

impl SoundListener {
    pub fn new(pose: Pose) -> Self {
        Self {
            pose,
            velocity: Vec3::ZERO,
        }
    }

    pub fn at(position: Vec3) -> Self {
        Self::new(Pose::from_position(position))
    }

    pub fn position(&self) -> Vec3 {
        self.pose.position
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }
}

/// A zone-tagged entity as placed in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEntity {
    pub id: EntityId,
    pub origin: Vec3,
    /// Half-size of the zone volume along each axis
    pub extent: Vec3,
    /// Name of the environment preset the zone applies
    pub env: String,
}

impl ZoneEntity {
    pub fn new(id: EntityId, origin: Vec3, extent: Vec3, env: impl Into<String>) -> Self {
        Self {
            id,
            origin,
            extent,
            env: env.into(),
        }
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::around(self.origin, self.extent)
    }
}

/// What a point in the world is filled with; liquids muffle sound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SoundMaterial {
    #[default]
    Air,
    Water,
    Lava,
}

impl SoundMaterial {
    /// High-frequency gain applied by the direct-path lowpass
    pub fn gain_hf(&self) -> f32 {
        match self {
            Self::Air => 1.0,
            Self::Water => 0.15,
            Self::Lava => 0.3,
        }
    }
}

/// Queries the sound core makes against the world each tick.
pub trait SoundWorld {
    fn listener(&self) -> SoundListener;

    /// Current position of an entity, or None once it no longer exists.
    fn entity_position(&self, id: EntityId) -> Option<Vec3>;

    /// Every zone-tagged entity; only called when zones are rebuilt.
    fn zone_entities(&self) -> Vec<ZoneEntity>;

    fn material_at(&self, _pos: Vec3) -> SoundMaterial {
        SoundMaterial::Air
    }
}

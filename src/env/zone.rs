use super::SoundEnvs;
use crate::device::{EffectId, EffectSlotId, Mixer};
use crate::error::SoundStageError;
use crate::events::SoundEvent;
use crate::math::{Bounds, Vec3};
use crate::world::{EntityId, SoundListener, SoundWorld, ZoneEntity};

/// A world volume applying a reverb preset to the listener inside it.
#[derive(Debug, Clone)]
pub struct SoundEnvZone {
    entity: EntityId,
    bounds: Bounds,
    env_name: String,
    env: Option<usize>,
    effect: Option<EffectId>,
    slot: Option<usize>,
    /// Preset revision last uploaded to `effect`
    attached: Option<(usize, u32)>,
    pan: Vec3,
}

impl SoundEnvZone {
    fn new(entity: &ZoneEntity, envs: &SoundEnvs) -> Self {
        let env = envs.find(&entity.env);
        if env.is_none() {
            log::warn!(
                "Zone {} references unknown soundenv '{}'",
                entity.id,
                entity.env
            );
        }
        Self {
            entity: entity.id,
            bounds: entity.bounds(),
            env_name: entity.env.clone(),
            env,
            effect: None,
            slot: None,
            attached: None,
            pan: Vec3::ZERO,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn env(&self) -> Option<usize> {
        self.env
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn has_slot(&self) -> bool {
        self.slot.is_some()
    }

    /// Non-degenerate bounds and a resolved preset.
    pub fn is_valid(&self) -> bool {
        !self.bounds.is_degenerate() && self.env.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct EfxSlot {
    id: EffectSlotId,
    owner: Option<usize>,
    last_used: u64,
}

/// Hardware effect slots shared by every zone, evicted least-recently-used.
#[derive(Debug, Default)]
pub struct EfxSlotPool {
    slots: Vec<EfxSlot>,
    clock: u64,
}

impl EfxSlotPool {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn owned(&self) -> usize {
        self.slots.iter().filter(|s| s.owner.is_some()).count()
    }

    /// Owner zone of each pool slot, for consistency checks.
    pub fn owners(&self) -> Vec<Option<usize>> {
        self.slots.iter().map(|s| s.owner).collect()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Lazily give `zone` a slot. Returns the pool index and whether it is newly acquired.
    fn acquire(
        &mut self,
        zone: usize,
        zones: &mut [SoundEnvZone],
        mixer: &mut Mixer,
    ) -> Option<(usize, bool)> {
        let now = self.tick();
        if let Some(index) = zones[zone].slot {
            if self.slots.get(index).is_some_and(|s| s.owner == Some(zone)) {
                self.slots[index].last_used = now;
                return Some((index, false));
            }
            zones[zone].slot = None;
        }

        let index = match self.slots.iter().position(|s| s.owner.is_none()) {
            Some(index) => index,
            None => match mixer.create_effect_slot() {
                Ok(id) => {
                    self.slots.push(EfxSlot {
                        id,
                        owner: None,
                        last_used: now,
                    });
                    self.slots.len() - 1
                }
                Err(SoundStageError::ZoneResourceExhausted(limit)) => {
                    let (index, victim) = self
                        .slots
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.owner.is_some_and(|o| o != zone))
                        .min_by_key(|(_, s)| s.last_used)
                        .and_then(|(i, s)| s.owner.map(|o| (i, o)))?;
                    log::debug!(
                        "Effect slots exhausted ({}), evicting zone {}",
                        limit,
                        zones[victim].entity
                    );
                    zones[victim].slot = None;
                    zones[victim].attached = None;
                    index
                }
                Err(err) => {
                    log::warn!("Cannot create effect slot: {}", err);
                    return None;
                }
            },
        };

        self.slots[index].owner = Some(zone);
        self.slots[index].last_used = now;
        zones[zone].slot = Some(index);
        zones[zone].attached = None;
        Some((index, true))
    }

    fn release(&mut self, zone: &mut SoundEnvZone) {
        if let Some(index) = zone.slot.take() {
            if let Some(slot) = self.slots.get_mut(index) {
                slot.owner = None;
            }
        }
        zone.attached = None;
    }

    fn destroy(&mut self, mixer: Option<&mut Mixer>) {
        if let Some(mixer) = mixer {
            for slot in &self.slots {
                mixer.delete_effect_slot(slot.id);
            }
        }
        self.slots.clear();
    }
}

/// Every zone of the current level plus the listener's active zone.
#[derive(Debug, Default)]
pub struct EnvZoneSystem {
    zones: Vec<SoundEnvZone>,
    pool: EfxSlotPool,
    active: Option<usize>,
}

impl EnvZoneSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zones(&self) -> &[SoundEnvZone] {
        &self.zones
    }

    pub fn pool(&self) -> &EfxSlotPool {
        &self.pool
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Rebuild the zone set from the world's zone entities. Once per level.
    pub fn build_env_zones(
        &mut self,
        world: &dyn SoundWorld,
        envs: &SoundEnvs,
        mixer: Option<&mut Mixer>,
    ) {
        self.clear(mixer);
        self.zones = world
            .zone_entities()
            .iter()
            .map(|e| SoundEnvZone::new(e, envs))
            .collect();
        log::info!(
            "Built {} env zones ({} valid)",
            self.zones.len(),
            self.zones.iter().filter(|z| z.is_valid()).count()
        );
    }

    /// Recompute one zone from its entity, adding it when new.
    pub fn update_env_zone(&mut self, entity: &ZoneEntity, envs: &SoundEnvs) {
        match self.zones.iter().position(|z| z.entity == entity.id) {
            Some(index) => {
                let zone = &mut self.zones[index];
                zone.bounds = entity.bounds();
                // Presets may have been added since the zone was built.
                let env = envs.find(&entity.env);
                if zone.env_name != entity.env || zone.env != env {
                    zone.env_name = entity.env.clone();
                    zone.env = env;
                    zone.attached = None;
                }
            }
            None => self.zones.push(SoundEnvZone::new(entity, envs)),
        }
    }

    /// Forget a zone whose entity was deleted. Indices after it shift down.
    pub fn remove_env_zone(&mut self, entity: EntityId, mixer: Option<&mut Mixer>) {
        let Some(index) = self.zones.iter().position(|z| z.entity == entity) else {
            return;
        };
        let mut zone = self.zones.remove(index);
        self.pool.release(&mut zone);
        if let (Some(effect), Some(mixer)) = (zone.effect, mixer) {
            mixer.delete_effect(effect);
        }
        for slot in &mut self.pool.slots {
            slot.owner = match slot.owner {
                Some(o) if o > index => Some(o - 1),
                other => other,
            };
        }
        self.active = match self.active {
            Some(a) if a == index => None,
            Some(a) if a > index => Some(a - 1),
            other => other,
        };
    }

    /// Innermost valid zone containing `pos`; ties go to the lowest index.
    pub fn find_active(&self, pos: Vec3) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (index, zone) in self.zones.iter().enumerate() {
            if !zone.is_valid() || !zone.bounds.contains(pos) {
                continue;
            }
            let volume = zone.bounds.volume();
            if best.is_none_or(|(_, v)| volume < v) {
                best = Some((index, volume));
            }
        }
        best.map(|(index, _)| index)
    }

    /// Per-tick update: pick the active zone, then make sure its effect is current.
    pub fn update(
        &mut self,
        listener: &SoundListener,
        envs: &SoundEnvs,
        mixer: Option<&mut Mixer>,
        events: &mut Vec<SoundEvent>,
    ) {
        let next = self.find_active(listener.position());
        let changed = next != self.active;
        if changed {
            log::info!("Active env zone {:?} -> {:?}", self.active, next);
            events.push(SoundEvent::ZoneChanged {
                from: self.active,
                to: next,
            });
            self.active = next;
        }

        let (Some(zone), Some(mixer)) = (self.active, mixer) else {
            return;
        };
        if !mixer.supports_effects() {
            return;
        }
        let Some((slot, fresh)) = self.pool.acquire(zone, &mut self.zones, mixer) else {
            return;
        };
        let pan_changed = self.update_pan(zone, listener);
        if changed || fresh || pan_changed || self.needs_upload(zone, envs) {
            self.attach_params(zone, slot, envs, mixer);
        }
    }

    fn needs_upload(&self, zone: usize, envs: &SoundEnvs) -> bool {
        let zone = &self.zones[zone];
        let current = zone
            .env
            .and_then(|e| envs.get(e).map(|env| (e, env.revision())));
        current != zone.attached
    }

    /// Point the reverb toward the zone's centre in listener space. True when it moved.
    fn update_pan(&mut self, zone: usize, listener: &SoundListener) -> bool {
        let zone = &mut self.zones[zone];
        let half = (zone.bounds.size() * 0.5).max(Vec3::splat(1e-3));
        let offset = (zone.bounds.center() - listener.position()) / half;
        let world = offset.clamp_length_max(1.0);
        let pan = Vec3::new(
            world.dot(listener.pose.right()),
            world.dot(listener.pose.up()),
            -world.dot(listener.pose.forward()),
        );
        if pan.distance(zone.pan) < 0.05 {
            return false;
        }
        zone.pan = pan;
        true
    }

    /// Upload the zone preset into its effect and load it into the slot.
    fn attach_params(&mut self, zone: usize, slot: usize, envs: &SoundEnvs, mixer: &mut Mixer) {
        let zone_ref = &mut self.zones[zone];
        let Some((index, env)) = zone_ref.env.and_then(|e| envs.get(e).map(|env| (e, env))) else {
            return;
        };
        let effect = match zone_ref.effect {
            Some(effect) => effect,
            None => match mixer.create_effect() {
                Ok(effect) => {
                    zone_ref.effect = Some(effect);
                    effect
                }
                Err(err) => {
                    log::warn!("Cannot create reverb effect: {}", err);
                    return;
                }
            },
        };
        mixer.set_effect(effect, env.reverb_params(zone_ref.pan));
        mixer.attach_effect(self.pool.slots[slot].id, Some(effect));
        zone_ref.attached = Some((index, env.revision()));
        log::debug!("Attached soundenv '{}' to zone {}", env.name(), zone_ref.entity);
    }

    /// Effect slot the active zone feeds, if it holds one.
    pub fn active_send(&self) -> Option<EffectSlotId> {
        let zone = &self.zones[self.active?];
        zone.attached?;
        Some(self.pool.slots.get(zone.slot?)?.id)
    }

    /// Direct-path high-frequency gain of the active zone's preset.
    pub fn active_gain_hf(&self, envs: &SoundEnvs) -> f32 {
        self.active
            .and_then(|a| self.zones[a].env)
            .and_then(|e| envs.get(e))
            .map_or(1.0, |env| env.get(super::EnvProp::GainHf))
    }

    /// Drop device handles after the device went away, without touching the mixer.
    pub fn forget_device(&mut self) {
        for zone in &mut self.zones {
            zone.effect = None;
            zone.slot = None;
            zone.attached = None;
        }
        self.pool.destroy(None);
    }

    /// Release every slot and effect and drop all zones.
    pub fn clear(&mut self, mut mixer: Option<&mut Mixer>) {
        for zone in &mut self.zones {
            self.pool.release(zone);
            if let (Some(effect), Some(mixer)) = (zone.effect.take(), mixer.as_deref_mut()) {
                mixer.delete_effect(effect);
            }
        }
        self.pool.destroy(mixer);
        self.zones.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MixerLimits;
    use crate::testing::TestWorld;

    fn mixer(slots: usize) -> Mixer {
        Mixer::new(
            "test",
            48000,
            MixerLimits {
                max_voices: 8,
                max_effect_slots: slots,
                max_buffer_bytes: 1 << 20,
            },
        )
    }

    fn zone(id: u32, origin: Vec3, extent: f32, env: &str) -> ZoneEntity {
        ZoneEntity::new(EntityId(id), origin, Vec3::splat(extent), env)
    }

    fn built(zones: Vec<ZoneEntity>, mixer: &mut Mixer) -> EnvZoneSystem {
        let mut world = TestWorld::new();
        world.zones = zones;
        let mut system = EnvZoneSystem::new();
        system.build_env_zones(&world, &SoundEnvs::new(), Some(mixer));
        system
    }

    #[test]
    fn test_nested_zone_wins() {
        let mut m = mixer(4);
        let system = built(
            vec![
                zone(1, Vec3::ZERO, 100.0, "cave"),
                zone(2, Vec3::ZERO, 10.0, "bathroom"),
            ],
            &mut m,
        );
        assert_eq!(system.find_active(Vec3::ONE), Some(1));
        assert_eq!(system.find_active(Vec3::splat(50.0)), Some(0));
        assert_eq!(system.find_active(Vec3::splat(500.0)), None);
    }

    #[test]
    fn test_equal_volume_tie_goes_to_lowest_index() {
        let mut m = mixer(4);
        let system = built(
            vec![
                zone(1, Vec3::ZERO, 10.0, "cave"),
                zone(2, Vec3::ONE, 10.0, "arena"),
            ],
            &mut m,
        );
        assert_eq!(system.find_active(Vec3::splat(0.5)), Some(0));
    }

    #[test]
    fn test_invalid_zones_are_skipped() {
        let mut m = mixer(4);
        let system = built(
            vec![
                zone(1, Vec3::ZERO, 10.0, "nonexistent"),
                ZoneEntity::new(EntityId(2), Vec3::ZERO, Vec3::new(5.0, 0.0, 5.0), "cave"),
            ],
            &mut m,
        );
        assert!(!system.zones()[0].is_valid());
        assert!(!system.zones()[1].is_valid());
        assert_eq!(system.find_active(Vec3::ZERO), None);
    }

    #[test]
    fn test_active_query_is_idempotent_and_uploads_once() {
        let mut m = mixer(4);
        let mut system = built(vec![zone(1, Vec3::ZERO, 10.0, "cave")], &mut m);
        let envs = SoundEnvs::new();
        let listener = SoundListener::at(Vec3::ONE);
        let mut events = Vec::new();

        system.update(&listener, &envs, Some(&mut m), &mut events);
        let uploads = m.stats().effect_uploads;
        assert_eq!(uploads, 1);
        for _ in 0..10 {
            assert_eq!(system.find_active(listener.position()), system.find_active(listener.position()));
            system.update(&listener, &envs, Some(&mut m), &mut events);
        }
        assert_eq!(m.stats().effect_uploads, uploads);
        assert_eq!(events.len(), 1);
        assert!(system.active_send().is_some());
    }

    #[test]
    fn test_preset_edit_triggers_reupload() {
        let mut m = mixer(4);
        let mut system = built(vec![zone(1, Vec3::ZERO, 10.0, "cave")], &mut m);
        let mut envs = SoundEnvs::new();
        let listener = SoundListener::at(Vec3::ONE);
        system.update(&listener, &envs, Some(&mut m), &mut Vec::new());
        envs.set_prop("cave", "decaytime", 5.0).unwrap();
        system.update(&listener, &envs, Some(&mut m), &mut Vec::new());
        assert_eq!(m.stats().effect_uploads, 2);
    }

    #[test]
    fn test_lru_eviction_never_double_acquires() {
        let mut m = mixer(2);
        let mut system = built(
            vec![
                zone(1, Vec3::new(0.0, 0.0, 0.0), 10.0, "cave"),
                zone(2, Vec3::new(100.0, 0.0, 0.0), 10.0, "arena"),
                zone(3, Vec3::new(200.0, 0.0, 0.0), 10.0, "hallway"),
            ],
            &mut m,
        );
        let envs = SoundEnvs::new();
        let visit = |system: &mut EnvZoneSystem, m: &mut Mixer, x: f32| {
            system.update(&SoundListener::at(Vec3::new(x, 0.0, 0.0)), &envs, Some(m), &mut Vec::new());
        };

        visit(&mut system, &mut m, 0.0);
        visit(&mut system, &mut m, 100.0);
        assert_eq!(system.pool().len(), 2);
        visit(&mut system, &mut m, 200.0);
        // Zone 0 was least recently used.
        assert_eq!(system.pool().len(), 2);
        assert!(!system.zones()[0].has_slot());
        assert!(system.zones()[1].has_slot());
        assert!(system.zones()[2].has_slot());

        visit(&mut system, &mut m, 0.0);
        assert!(!system.zones()[1].has_slot());

        let owners: Vec<usize> = system.pool().owners().into_iter().flatten().collect();
        let mut unique = owners.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(owners.len(), unique.len());
        for (index, zone) in system.zones().iter().enumerate() {
            assert_eq!(zone.has_slot(), owners.contains(&index));
        }
        assert_eq!(m.stats().effect_slots, 2);
    }

    #[test]
    fn test_clear_releases_device_resources() {
        let mut m = mixer(2);
        let mut system = built(vec![zone(1, Vec3::ZERO, 10.0, "cave")], &mut m);
        system.update(&SoundListener::at(Vec3::ZERO), &SoundEnvs::new(), Some(&mut m), &mut Vec::new());
        assert_eq!(m.stats().effect_slots, 1);
        assert_eq!(m.stats().effects, 1);
        system.clear(Some(&mut m));
        assert_eq!(m.stats().effect_slots, 0);
        assert_eq!(m.stats().effects, 0);
        assert!(system.zones().is_empty());
    }

    #[test]
    fn test_update_env_zone_moves_bounds() {
        let mut m = mixer(2);
        let mut system = built(vec![zone(1, Vec3::ZERO, 10.0, "cave")], &mut m);
        let envs = SoundEnvs::new();
        system.update_env_zone(&zone(1, Vec3::splat(100.0), 10.0, "cave"), &envs);
        assert_eq!(system.zones().len(), 1);
        assert_eq!(system.find_active(Vec3::ZERO), None);
        assert_eq!(system.find_active(Vec3::splat(100.0)), Some(0));

        system.update_env_zone(&zone(9, Vec3::ZERO, 5.0, "snow"), &envs);
        assert_eq!(system.zones().len(), 2);
        assert_eq!(system.find_active(Vec3::ZERO), Some(1));
    }

    #[test]
    fn test_update_env_zone_picks_up_new_preset() {
        let mut m = mixer(2);
        let mut system = built(vec![zone(1, Vec3::ZERO, 10.0, "custom")], &mut m);
        assert!(!system.zones()[0].is_valid());

        let mut envs = SoundEnvs::new();
        let custom = envs.add_env("custom");
        system.update_env_zone(&zone(1, Vec3::ZERO, 10.0, "custom"), &envs);
        assert!(system.zones()[0].is_valid());
        assert_eq!(system.zones()[0].env(), Some(custom));

        let mut events = Vec::new();
        system.update(&SoundListener::at(Vec3::ONE), &envs, Some(&mut m), &mut events);
        assert_eq!(system.active(), Some(0));
        assert_eq!(m.stats().effect_uploads, 1);
    }

    #[test]
    fn test_remove_env_zone_fixes_owner_indices() {
        let mut m = mixer(2);
        let mut system = built(
            vec![
                zone(1, Vec3::ZERO, 10.0, "cave"),
                zone(2, Vec3::new(100.0, 0.0, 0.0), 10.0, "arena"),
            ],
            &mut m,
        );
        let envs = SoundEnvs::new();
        system.update(&SoundListener::at(Vec3::new(100.0, 0.0, 0.0)), &envs, Some(&mut m), &mut Vec::new());
        system.remove_env_zone(EntityId(1), Some(&mut m));
        assert_eq!(system.active(), Some(0));
        assert_eq!(system.pool().owners(), vec![Some(0)]);
    }
}

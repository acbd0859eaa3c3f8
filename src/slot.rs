//! Named sounds: sample variants plus default playback parameters.
//!
//! Engine-builtin sounds live in the game set and map-authored sounds in the
//! map set, so the two never collide. Map sound indices go through a remap
//! table that is rebuilt on level load.

use crate::audio_data::MixType;
use crate::sample::{SampleId, SampleLoader, SampleStore};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotSetKind {
    #[default]
    Game,
    Map,
}

/// Defaults a slot applies to every source playing it.
///
/// Unset distances fall through to the global distance model.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotParams {
    pub gain: f32,
    pub pitch: f32,
    pub rolloff: Option<f32>,
    pub refdist: Option<f32>,
    pub maxdist: Option<f32>,
    pub variants: usize,
    /// Listener distance at which far variants replace near ones
    pub fardist: Option<f32>,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            pitch: 1.0,
            rolloff: None,
            refdist: None,
            maxdist: None,
            variants: 1,
            fardist: None,
        }
    }
}

impl SlotParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn pitch(mut self, pitch: f32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn rolloff(mut self, rolloff: f32) -> Self {
        self.rolloff = Some(rolloff);
        self
    }

    pub fn refdist(mut self, refdist: f32) -> Self {
        self.refdist = Some(refdist);
        self
    }

    pub fn maxdist(mut self, maxdist: f32) -> Self {
        self.maxdist = Some(maxdist);
        self
    }

    pub fn variants(mut self, variants: usize) -> Self {
        self.variants = variants.max(1);
        self
    }

    pub fn fardist(mut self, fardist: f32) -> Self {
        self.fardist = Some(fardist);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SoundSlot {
    id: String,
    name: String,
    params: SlotParams,
    /// Near variants first, then far variants
    samples: Vec<SampleId>,
    near: usize,
}

impl SoundSlot {
    /// Sample names a slot loads: `name` alone for one variant, `name1..nameN` otherwise.
    pub fn variant_names(name: &str, params: &SlotParams) -> Vec<String> {
        let numbered = |base: &str| -> Vec<String> {
            if params.variants <= 1 {
                vec![base.to_string()]
            } else {
                (1..=params.variants).map(|i| format!("{}{}", base, i)).collect()
            }
        };
        let mut names = numbered(name);
        if params.fardist.is_some() {
            names.extend(numbered(&format!("{}_far", name)));
        }
        names
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &SlotParams {
        &self.params
    }

    pub fn samples(&self) -> &[SampleId] {
        &self.samples
    }

    /// Uniformly pick one valid sample, from the far set when beyond `fardist`.
    pub fn pick_variant(
        &self,
        store: &SampleStore,
        distance: f32,
        rng: &mut impl Rng,
    ) -> Option<SampleId> {
        let (near, far) = self.samples.split_at(self.near.min(self.samples.len()));
        let use_far = self
            .params
            .fardist
            .is_some_and(|d| distance >= d && far.iter().any(|s| store.valid(*s)));
        let pool = if use_far { far } else { near };
        let valid: Vec<SampleId> = pool.iter().copied().filter(|s| store.valid(*s)).collect();
        if valid.is_empty() {
            return None;
        }
        Some(valid[rng.gen_range(0..valid.len())])
    }
}

/// One namespace of slots.
#[derive(Debug, Default)]
pub struct SlotSet {
    slots: Vec<SoundSlot>,
}

impl SlotSet {
    pub fn get(&self, index: usize) -> Option<&SoundSlot> {
        self.slots.get(index)
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SoundSlot> {
        self.slots.iter()
    }
}

#[derive(Debug, Default)]
pub struct SlotRegistry {
    game: SlotSet,
    map: SlotSet,
    remap: Vec<Option<usize>>,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, kind: SlotSetKind) -> &SlotSet {
        match kind {
            SlotSetKind::Game => &self.game,
            SlotSetKind::Map => &self.map,
        }
    }

    fn set_mut(&mut self, kind: SlotSetKind) -> &mut SlotSet {
        match kind {
            SlotSetKind::Game => &mut self.game,
            SlotSetKind::Map => &mut self.map,
        }
    }

    /// Register `id` (or update it in place) and load its variants. Returns its stable index.
    pub fn add_sound(
        &mut self,
        id: &str,
        name: &str,
        params: SlotParams,
        kind: SlotSetKind,
        loader: &mut SampleLoader<'_>,
    ) -> usize {
        let names = SoundSlot::variant_names(name, &params);
        let near = if params.variants <= 1 { 1 } else { params.variants };
        let samples: Vec<SampleId> = names
            .iter()
            .map(|n| loader.load(n, MixType::Spatial))
            .collect();

        let set = self.set_mut(kind);
        let slot = SoundSlot {
            id: id.to_string(),
            name: name.to_string(),
            params,
            samples,
            near,
        };
        match set.find(id) {
            Some(index) => {
                let old = std::mem::replace(&mut set.slots[index], slot);
                // New references were taken first so shared samples survive the swap.
                for sample in old.samples {
                    loader.release(sample);
                }
                index
            }
            None => {
                set.slots.push(slot);
                log::debug!("Registered {:?} sound '{}' ({})", kind, id, name);
                set.slots.len() - 1
            }
        }
    }

    /// Reset the map remap table to the identity over the map set.
    pub fn map_sound_slots(&mut self) {
        self.remap = (0..self.map.len()).map(Some).collect();
    }

    /// Point map-local `index` at the map slot registered as `id`. False if no such slot.
    pub fn map_sound_slot(&mut self, index: usize, id: &str) -> bool {
        let target = self.map.find(id);
        if self.remap.len() <= index {
            self.remap.resize(index + 1, None);
        }
        self.remap[index] = target;
        target.is_some()
    }

    /// Resolve a map-local index to its concrete map slot.
    pub fn get_sound_slot(&self, index: usize) -> Option<usize> {
        self.remap.get(index).copied().flatten()
    }

    /// Slot index resolution as a source sees it.
    pub fn resolve(&self, index: usize, kind: SlotSetKind, unmapped: bool) -> Option<usize> {
        match kind {
            SlotSetKind::Map if !unmapped => self.get_sound_slot(index),
            _ => Some(index).filter(|i| *i < self.set(kind).len()),
        }
    }

    pub fn slot(&self, kind: SlotSetKind, index: usize) -> Option<&SoundSlot> {
        self.set(kind).get(index)
    }

    /// Drop every map slot and its sample references.
    pub fn clear_map_sounds(&mut self, loader: &mut SampleLoader<'_>) {
        for slot in self.map.slots.drain(..) {
            for sample in slot.samples {
                loader.release(sample);
            }
        }
        self.remap.clear();
    }

    pub fn clear(&mut self, loader: &mut SampleLoader<'_>) {
        self.clear_map_sounds(loader);
        for slot in self.game.slots.drain(..) {
            for sample in slot.samples {
                loader.release(sample);
            }
        }
    }
}

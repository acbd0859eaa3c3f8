//! The pool of live, positioned playback instances.
//!
//! Every emit request either refreshes a source already playing the same
//! sound for the same owner, or claims a pool entry (evicting the oldest
//! ordinary source when full). Sources are updated once per tick and return
//! to the pool when their sound ends, their deadline passes, or their owner
//! goes away.

mod flags;

pub use flags::SoundFlags;

use crate::config::{SOUND_SPEED, SoundStageDesc};
use crate::device::{
    BufferId, DeviceKind, DeviceManager, FilterId, LowpassParams, Mixer, VoiceId, VoiceParams,
    VoiceState,
};
use crate::env::{EnvZoneSystem, SoundEnvs};
use crate::error::Result;
use crate::events::SoundEvent;
use crate::math::Vec3;
use crate::sample::{SampleId, SampleStore};
use crate::slot::{SlotRegistry, SlotSetKind};
use crate::world::{EntityId, SoundListener, SoundWorld};
use rand::rngs::StdRng;

/// Stable reference to a pool entry; goes stale once the entry is recycled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    index: u32,
    generation: u32,
}

impl SourceHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Free,
    Playing,
    Stopping,
}

/// Per-request playback overrides. Unset distances fall back to the slot, then the global default.
#[derive(Debug, Clone, PartialEq)]
pub struct EmitParams {
    pub flags: SoundFlags,
    pub gain: f32,
    pub pitch: f32,
    pub rolloff: Option<f32>,
    pub refdist: Option<f32>,
    pub maxdist: Option<f32>,
    /// Stop after this many milliseconds even if the sound has not ended
    pub ends: Option<u64>,
}

impl Default for EmitParams {
    fn default() -> Self {
        Self {
            flags: SoundFlags::default(),
            gain: 1.0,
            pitch: 1.0,
            rolloff: None,
            refdist: None,
            maxdist: None,
            ends: None,
        }
    }
}

impl EmitParams {
    pub fn new(flags: SoundFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
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

    pub fn ends(mut self, millis: u64) -> Self {
        self.ends = Some(millis);
        self
    }
}

/// Shared state a source reads while starting or updating.
pub struct SourceContext<'a> {
    pub desc: &'a SoundStageDesc,
    pub slots: &'a SlotRegistry,
    pub samples: &'a SampleStore,
    pub devices: &'a DeviceManager,
    pub zones: &'a EnvZoneSystem,
    pub envs: &'a SoundEnvs,
    pub listener: SoundListener,
    pub millis: u64,
    pub rng: &'a mut StdRng,
    pub events: &'a mut Vec<SoundEvent>,
}

#[derive(Debug, Clone, Copy)]
struct DevParam {
    device: DeviceKind,
    voice: VoiceId,
    filter: Option<FilterId>,
}

#[derive(Debug, Clone)]
pub struct SoundSource {
    state: SourceState,
    generation: u32,
    seq: u64,
    set: SlotSetKind,
    slot: usize,
    owner: Option<EntityId>,
    pos: Vec3,
    curpos: Vec3,
    vel: Vec3,
    gain: f32,
    curgain: f32,
    pitch: f32,
    curpitch: f32,
    rolloff: Option<f32>,
    refdist: Option<f32>,
    maxdist: Option<f32>,
    final_rolloff: f32,
    final_refdist: f32,
    final_maxdist: f32,
    material_hf: f32,
    flags: SoundFlags,
    millis: u64,
    lastupdate: u64,
    ends: Option<u64>,
    start_at: Option<u64>,
    params: Vec<DevParam>,
    buffer: Vec<SampleId>,
}

impl SoundSource {
    fn free() -> Self {
        Self {
            state: SourceState::Free,
            generation: 0,
            seq: 0,
            set: SlotSetKind::Game,
            slot: 0,
            owner: None,
            pos: Vec3::ZERO,
            curpos: Vec3::ZERO,
            vel: Vec3::ZERO,
            gain: 1.0,
            curgain: 1.0,
            pitch: 1.0,
            curpitch: 1.0,
            rolloff: None,
            refdist: None,
            maxdist: None,
            final_rolloff: 1.0,
            final_refdist: 1.0,
            final_maxdist: f32::MAX,
            material_hf: 1.0,
            flags: SoundFlags::default(),
            millis: 0,
            lastupdate: 0,
            ends: None,
            start_at: None,
            params: Vec::new(),
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Still holds a pool entry (possibly awaiting cleanup).
    pub fn active(&self) -> bool {
        self.state != SourceState::Free
    }

    pub fn slot(&self) -> (SlotSetKind, usize) {
        (self.set, self.slot)
    }

    pub fn owner(&self) -> Option<EntityId> {
        self.owner
    }

    pub fn pos(&self) -> Vec3 {
        self.pos
    }

    pub fn curpos(&self) -> Vec3 {
        self.curpos
    }

    pub fn velocity(&self) -> Vec3 {
        self.vel
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn curgain(&self) -> f32 {
        self.curgain
    }

    pub fn pitch(&self) -> f32 {
        self.pitch
    }

    pub fn curpitch(&self) -> f32 {
        self.curpitch
    }

    pub fn flags(&self) -> &SoundFlags {
        &self.flags
    }

    pub fn final_rolloff(&self) -> f32 {
        self.final_rolloff
    }

    pub fn final_refdist(&self) -> f32 {
        self.final_refdist
    }

    pub fn final_maxdist(&self) -> f32 {
        self.final_maxdist
    }

    pub fn started_at(&self) -> u64 {
        self.millis
    }

    pub fn ends(&self) -> Option<u64> {
        self.ends
    }

    /// Waiting out its distance delay.
    pub fn is_delayed(&self) -> bool {
        self.start_at.is_some()
    }

    pub fn voice(&self, device: DeviceKind) -> Option<VoiceId> {
        self.params
            .iter()
            .find_map(|p| (p.device == device).then_some(p.voice))
    }

    pub fn devices(&self) -> impl Iterator<Item = DeviceKind> + '_ {
        self.params.iter().map(|p| p.device)
    }

    /// Variants appended to a buffer source so far.
    pub fn queued(&self) -> &[SampleId] {
        &self.buffer
    }

    /// Has a live hardware voice (or one about to start).
    pub fn playing(&self, devices: &DeviceManager) -> bool {
        if self.state != SourceState::Playing {
            return false;
        }
        if self.start_at.is_some() {
            return true;
        }
        self.params.iter().any(|p| {
            devices
                .device(p.device)
                .and_then(|d| d.with_mixer(|m| m.voice_state(p.voice)))
                == Some(VoiceState::Playing)
        })
    }

    fn voice_params(&self, ctx: &SourceContext<'_>) -> (VoiceParams, LowpassParams) {
        let gain = self.curgain * ctx.desc.effect_gain();
        let listener = ctx.listener.position();
        let (position, relative) = if self.flags.no_atten {
            (Vec3::ZERO, true)
        } else if self.flags.no_pan {
            (Vec3::new(0.0, 0.0, -self.curpos.distance(listener)), true)
        } else {
            (self.curpos, false)
        };
        let rolloff = if self.flags.no_atten || self.flags.no_dist {
            0.0
        } else {
            self.final_rolloff
        };
        let voice = VoiceParams {
            position,
            velocity: if relative { Vec3::ZERO } else { self.vel },
            relative,
            gain,
            min_gain: if self.flags.clamped { gain.min(1.0) } else { 0.0 },
            max_gain: 1.0,
            pitch: self.curpitch,
            rolloff,
            refdist: self.final_refdist,
            maxdist: self.final_maxdist,
            looping: self.flags.looping,
            send: if self.flags.no_env {
                None
            } else {
                ctx.zones.active_send()
            },
            filter: None,
        };
        let env_hf = if self.flags.no_env {
            1.0
        } else {
            ctx.zones.active_gain_hf(ctx.envs)
        };
        let lowpass = LowpassParams {
            gain: 1.0,
            gain_hf: env_hf * self.material_hf,
        };
        (voice, lowpass)
    }

    fn apply(&self, mixer: &mut Mixer, param: &DevParam, voice: VoiceParams, lowpass: LowpassParams) {
        mixer.set_voice(
            param.voice,
            VoiceParams {
                filter: param.filter,
                ..voice
            },
        );
        if let Some(filter) = param.filter {
            mixer.set_filter(filter, lowpass);
        }
    }
}

fn approach(current: f32, target: f32, rate: f32, dt: f32) -> f32 {
    if rate <= 0.0 {
        return target;
    }
    let step = rate * dt;
    if (target - current).abs() <= step {
        target
    } else {
        current + step.copysign(target - current)
    }
}

/// Create a voice (and filter) with `buffer` queued, cleaning up on failure.
fn start_voice(mixer: &mut Mixer, buffer: BufferId, filtered: bool) -> Result<(VoiceId, Option<FilterId>)> {
    let voice = mixer.create_voice()?;
    if let Err(err) = mixer.queue_buffer(voice, buffer) {
        mixer.delete_voice(voice);
        return Err(err);
    }
    let filter = if filtered {
        match mixer.create_filter() {
            Ok(filter) => Some(filter),
            Err(err) => {
                mixer.delete_voice(voice);
                return Err(err);
            }
        }
    } else {
        None
    };
    Ok((voice, filter))
}

/// Fixed-capacity pool of sources.
#[derive(Debug)]
pub struct SourceManager {
    sources: Vec<SoundSource>,
    seq: u64,
}

impl SourceManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            sources: (0..capacity).map(|_| SoundSource::free()).collect(),
            seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.sources.len()
    }

    pub fn active_count(&self) -> usize {
        self.sources.iter().filter(|s| s.active()).count()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (SourceHandle, &SoundSource)> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active())
            .map(|(n, s)| (Self::handle_of(n, s), s))
    }

    fn handle_of(n: usize, source: &SoundSource) -> SourceHandle {
        SourceHandle {
            index: n as u32,
            generation: source.generation,
        }
    }

    fn resolve(&self, handle: SourceHandle) -> Option<usize> {
        debug_assert!(
            handle.index() < self.sources.len(),
            "source handle {:?} outside pool of {}",
            handle,
            self.sources.len()
        );
        let source = self.sources.get(handle.index())?;
        (source.generation == handle.generation && source.active()).then_some(handle.index())
    }

    /// The source a handle refers to, or None once it has been recycled.
    pub fn get(&self, handle: SourceHandle) -> Option<&SoundSource> {
        self.resolve(handle).map(|n| &self.sources[n])
    }

    /// Start (or refresh) slot `index` at `pos`, optionally owned by an entity.
    pub fn emit(
        &mut self,
        ctx: &mut SourceContext<'_>,
        index: usize,
        pos: Vec3,
        owner: Option<EntityId>,
        hook: Option<SourceHandle>,
        params: EmitParams,
    ) -> Option<SourceHandle> {
        if let Err(err) = params.flags.validate() {
            log::warn!("Dropping sound {}: {}", index, err);
            return None;
        }
        let set = if params.flags.map {
            SlotSetKind::Map
        } else {
            SlotSetKind::Game
        };
        let Some(slot) = ctx.slots.resolve(index, set, params.flags.unmapped) else {
            log::debug!("Sound {} has no {:?} slot", index, set);
            return None;
        };

        if !params.flags.unmapped {
            let found =
                self.find_duplicate(ctx.devices, set, slot, pos, owner, hook, params.flags.buffer);
            if let Some(n) = found {
                return Some(self.reuse(n, ctx, pos, &params));
            }
        }

        let (gain, pitch, sample) = {
            let slot_def = ctx.slots.slot(set, slot)?;
            let distance = pos.distance(ctx.listener.position());
            let Some(sample) = slot_def.pick_variant(ctx.samples, distance, &mut *ctx.rng) else {
                log::debug!("Sound '{}' has no playable variant", slot_def.id());
                return None;
            };
            (slot_def.params().gain, slot_def.params().pitch, sample)
        };

        let n = self.allocate(ctx, params.flags.priority)?;
        let seq = self.next_seq();
        let source = &mut self.sources[n];
        let generation = source.generation;
        *source = SoundSource {
            state: SourceState::Playing,
            generation,
            seq,
            set,
            slot,
            owner,
            pos,
            curpos: pos,
            gain: gain * params.gain,
            curgain: gain * params.gain,
            pitch: pitch * params.pitch,
            curpitch: pitch * params.pitch,
            rolloff: params.rolloff,
            refdist: params.refdist,
            maxdist: params.maxdist,
            flags: params.flags,
            millis: ctx.millis,
            lastupdate: ctx.millis,
            ends: params.ends.map(|e| ctx.millis.saturating_add(e)),
            ..SoundSource::free()
        };

        if !self.play(n, sample, ctx) {
            self.cleanup(n, ctx.devices);
            return None;
        }
        let handle = Self::handle_of(n, &self.sources[n]);
        ctx.events.push(SoundEvent::SourceStarted { source: handle });
        log::debug!("Started source {} for sound {:?}/{}", n, set, slot);
        Some(handle)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// A live source already playing this sound. Sources whose voices ran
    /// out since the last tick never match; they are retired instead.
    fn find_duplicate(
        &self,
        devices: &DeviceManager,
        set: SlotSetKind,
        slot: usize,
        pos: Vec3,
        owner: Option<EntityId>,
        hook: Option<SourceHandle>,
        buffer: bool,
    ) -> Option<usize> {
        let same_sound = |s: &SoundSource| {
            s.set == set && s.slot == slot && s.owner == owner && s.playing(devices)
        };
        if let Some(n) = hook.and_then(|h| self.resolve(h)) {
            if same_sound(&self.sources[n]) {
                return Some(n);
            }
        }
        self.sources.iter().position(|s| {
            same_sound(s)
                && s.flags.buffer == buffer
                && (owner.is_some() || s.pos.distance_squared(pos) < 1e-6)
        })
    }

    fn reuse(
        &mut self,
        n: usize,
        ctx: &mut SourceContext<'_>,
        pos: Vec3,
        params: &EmitParams,
    ) -> SourceHandle {
        let source = &mut self.sources[n];
        if let Some(slot) = ctx.slots.slot(source.set, source.slot) {
            source.gain = slot.params().gain * params.gain;
            source.pitch = slot.params().pitch * params.pitch;
        }
        if !source.flags.tracked {
            source.pos = pos;
        }
        source.flags.merge(&params.flags);
        if let (Some(old), Some(extra)) = (source.ends, params.ends) {
            source.ends = Some(old.max(ctx.millis.saturating_add(extra)));
        }
        if source.flags.buffer {
            self.push_variant(n, ctx);
        }
        Self::handle_of(n, &self.sources[n])
    }

    /// Append another variant to a buffer source's voices.
    fn push_variant(&mut self, n: usize, ctx: &mut SourceContext<'_>) {
        let source = &mut self.sources[n];
        let Some(slot) = ctx.slots.slot(source.set, source.slot) else {
            return;
        };
        let distance = source.pos.distance(ctx.listener.position());
        let Some(sample) = slot.pick_variant(ctx.samples, distance, &mut *ctx.rng) else {
            return;
        };
        for param in &source.params {
            let (Some(device), Some(buffer)) = (
                ctx.devices.device(param.device),
                ctx.samples.buffer(sample, param.device),
            ) else {
                continue;
            };
            let delayed = source.start_at.is_some();
            device.with_mixer(|m| {
                if let Err(err) = m.queue_buffer(param.voice, buffer) {
                    log::warn!("Failed to queue buffered variant: {}", err);
                    return;
                }
                if !delayed && m.voice_state(param.voice) != VoiceState::Playing {
                    m.play_voice(param.voice);
                }
            });
        }
        source.buffer.push(sample);
    }

    fn allocate(&mut self, ctx: &mut SourceContext<'_>, priority: bool) -> Option<usize> {
        if let Some(n) = self.sources.iter().position(|s| !s.active()) {
            return Some(n);
        }
        let victim = self
            .oldest(|s| !s.flags.priority)
            .or_else(|| if priority { self.oldest(|s| s.flags.priority) } else { None });
        let Some(victim) = victim else {
            log::debug!("Source pool full of priority sounds, dropping request");
            return None;
        };
        let handle = Self::handle_of(victim, &self.sources[victim]);
        self.cleanup(victim, ctx.devices);
        ctx.events.push(SoundEvent::SourceEvicted { source: handle });
        log::debug!("Evicted source {}", victim);
        Some(victim)
    }

    fn oldest(&self, pred: impl Fn(&SoundSource) -> bool) -> Option<usize> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active() && pred(s))
            .min_by_key(|(_, s)| s.seq)
            .map(|(n, _)| n)
    }

    /// Bind a fresh source to its devices with an already picked variant.
    /// False when no audio voice could be started.
    fn play(&mut self, n: usize, sample: SampleId, ctx: &mut SourceContext<'_>) -> bool {
        let source = &mut self.sources[n];
        let Some(slot) = ctx.slots.slot(source.set, source.slot) else {
            return false;
        };
        let distance = source.pos.distance(ctx.listener.position());

        let defaults = slot.params();
        source.final_rolloff = source
            .rolloff
            .or(defaults.rolloff)
            .unwrap_or(ctx.desc.rolloff);
        source.final_refdist = source
            .refdist
            .or(defaults.refdist)
            .unwrap_or(ctx.desc.refdist);
        source.final_maxdist = source
            .maxdist
            .or(defaults.maxdist)
            .unwrap_or(ctx.desc.maxdist);

        if !source.flags.no_delay && !source.flags.no_atten {
            let delay = (distance / SOUND_SPEED * 1000.0) as u64;
            if delay > 0 {
                source.start_at = Some(ctx.millis.saturating_add(delay));
            }
        }

        let mut kinds = vec![DeviceKind::Audio];
        if source.flags.haptics && ctx.devices.haptics().is_some() {
            kinds.push(DeviceKind::Haptics);
        }
        let (voice, lowpass) = source.voice_params(ctx);
        for kind in kinds {
            let (Some(device), Some(buffer)) =
                (ctx.devices.device(kind), ctx.samples.buffer(sample, kind))
            else {
                continue;
            };
            let filtered = !source.flags.no_filter;
            let started = device.with_mixer(|m| -> Result<DevParam> {
                let (id, filter) = start_voice(m, buffer, filtered)?;
                let param = DevParam {
                    device: kind,
                    voice: id,
                    filter,
                };
                source.apply(m, &param, voice, lowpass);
                if source.start_at.is_none() {
                    m.play_voice(id);
                }
                Ok(param)
            });
            match started {
                Some(Ok(param)) => source.params.push(param),
                Some(Err(err)) => log::warn!("Cannot start {} voice: {}", kind, err),
                None => {}
            }
        }
        if source.voice(DeviceKind::Audio).is_none() {
            return false;
        }
        if source.flags.buffer {
            source.buffer.push(sample);
        }
        true
    }

    /// Advance every playing source one tick, then recycle the finished ones.
    pub fn update(&mut self, ctx: &mut SourceContext<'_>, world: &dyn SoundWorld) {
        for n in 0..self.sources.len() {
            if self.sources[n].state == SourceState::Playing {
                self.update_source(n, ctx, world);
            }
        }
        for n in 0..self.sources.len() {
            if self.sources[n].state == SourceState::Stopping {
                self.cleanup(n, ctx.devices);
            }
        }
    }

    fn update_source(&mut self, n: usize, ctx: &mut SourceContext<'_>, world: &dyn SoundWorld) {
        let handle = Self::handle_of(n, &self.sources[n]);
        let source = &mut self.sources[n];
        let dt = ctx.millis.saturating_sub(source.lastupdate) as f32 / 1000.0;

        if source.flags.tracked {
            if let Some(pos) = source.owner.and_then(|id| world.entity_position(id)) {
                source.pos = pos;
            }
        }
        if source.flags.vel_est && dt > 0.0 {
            source.vel = (source.pos - source.curpos) / dt;
        }
        source.curpos = source.pos;
        let rate = ctx.desc.gain_smoothing;
        source.curgain = approach(source.curgain, source.gain, rate, dt);
        source.curpitch = approach(source.curpitch, source.pitch, rate, dt);
        source.lastupdate = ctx.millis;
        source.material_hf = world.material_at(source.curpos).gain_hf()
            * world.material_at(ctx.listener.position()).gain_hf();

        if source.ends.is_some_and(|e| ctx.millis >= e) {
            source.state = SourceState::Stopping;
            ctx.events.push(SoundEvent::SourceFinished { source: handle });
            return;
        }

        let start = source.start_at.is_some_and(|t| ctx.millis >= t);
        if start {
            source.start_at = None;
        } else if source.start_at.is_none() && !source.playing(ctx.devices) {
            source.state = SourceState::Stopping;
            ctx.events.push(SoundEvent::SourceFinished { source: handle });
            return;
        }

        let (voice, lowpass) = source.voice_params(ctx);
        for param in &source.params {
            let Some(device) = ctx.devices.device(param.device) else {
                continue;
            };
            device.with_mixer(|m| {
                source.apply(m, param, voice, lowpass);
                if start {
                    m.play_voice(param.voice);
                }
                m.unqueue_processed(param.voice);
            });
        }
    }

    /// Release a source's voices and return it to the pool.
    fn cleanup(&mut self, n: usize, devices: &DeviceManager) {
        let source = &mut self.sources[n];
        for param in source.params.drain(..) {
            if let Some(device) = devices.device(param.device) {
                device.with_mixer(|m| {
                    m.stop_voice(param.voice);
                    m.delete_voice(param.voice);
                    if let Some(filter) = param.filter {
                        m.delete_filter(filter);
                    }
                });
            }
        }
        let generation = source.generation.wrapping_add(1);
        *source = SoundSource {
            generation,
            ..SoundSource::free()
        };
    }

    /// Stop one source now. False if the handle is stale.
    pub fn stop_source(&mut self, handle: SourceHandle, devices: &DeviceManager) -> bool {
        let Some(n) = self.resolve(handle) else {
            return false;
        };
        self.cleanup(n, devices);
        true
    }

    fn stop_where(&mut self, devices: &DeviceManager, pred: impl Fn(&SoundSource) -> bool) -> usize {
        let mut stopped = 0;
        for n in 0..self.sources.len() {
            if self.sources[n].active() && pred(&self.sources[n]) {
                self.cleanup(n, devices);
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every source owned by `entity`.
    pub fn remove_tracked_sounds(&mut self, entity: EntityId, devices: &DeviceManager) -> usize {
        self.stop_where(devices, |s| s.owner == Some(entity))
    }

    /// Stop every source playing a map sound.
    pub fn remove_map_sounds(&mut self, devices: &DeviceManager) -> usize {
        self.stop_where(devices, |s| s.set == SlotSetKind::Map)
    }

    pub fn stop_all(&mut self, devices: &DeviceManager) -> usize {
        self.stop_where(devices, |_| true)
    }
}

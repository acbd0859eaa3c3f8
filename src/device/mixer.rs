//! Software mixer backing every sound device.
//!
//! The mixer owns what a hardware audio API would: PCM buffers, voices that play
//! queues of buffers, auxiliary effect slots running a small feedback reverb,
//! and one-pole lowpass filters. The main thread drives it through the methods
//! below; the output stream (if any) calls [`Mixer::render`] from the audio
//! callback thread, which is why it lives behind a [`SharedMixer`].

use crate::config::SOUND_SPEED;
use crate::error::{Result, SoundStageError};
use crate::math::Vec3;
use crate::world::SoundListener;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub type SharedMixer = Arc<Mutex<Mixer>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoiceId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EffectSlotId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EffectId(u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(u32);

/// Interleaved f32 PCM handed to the device for upload.
#[derive(Debug, Clone)]
pub struct PcmData {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl PcmData {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    Initial,
    Playing,
    Stopped,
}

/// Per-voice playback parameters, applied as one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceParams {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Position is relative to the listener instead of world space
    pub relative: bool,
    pub gain: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    pub pitch: f32,
    pub rolloff: f32,
    pub refdist: f32,
    pub maxdist: f32,
    pub looping: bool,
    /// Auxiliary send to an effect slot
    pub send: Option<EffectSlotId>,
    /// Direct-path filter
    pub filter: Option<FilterId>,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            relative: false,
            gain: 1.0,
            min_gain: 0.0,
            max_gain: 1.0,
            pitch: 1.0,
            rolloff: 1.0,
            refdist: 1.0,
            maxdist: f32::MAX,
            looping: false,
            send: None,
            filter: None,
        }
    }
}

impl VoiceParams {
    /// Listener-relative, unattenuated, centred playback (music, UI).
    pub fn ambient(gain: f32) -> Self {
        Self {
            relative: true,
            gain,
            rolloff: 0.0,
            ..Default::default()
        }
    }

    /// Distance attenuation under the inverse-distance-clamped model.
    pub fn attenuation(&self, distance: f32) -> f32 {
        if self.rolloff <= 0.0 || self.refdist <= 0.0 {
            return 1.0;
        }
        let d = distance.clamp(self.refdist, self.maxdist.max(self.refdist));
        self.refdist / (self.refdist + self.rolloff * (d - self.refdist))
    }
}

/// Reverb properties understood by the fixed-function effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReverbParams {
    pub gain: f32,
    pub gain_hf: f32,
    pub decay_time: f32,
    pub reflections_gain: f32,
    pub reflections_delay: f32,
    pub late_reverb_gain: f32,
    pub late_reverb_delay: f32,
    /// Direction the reverb tail is panned toward, listener space
    pub pan: Vec3,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            gain: 0.32,
            gain_hf: 0.89,
            decay_time: 1.49,
            reflections_gain: 0.05,
            reflections_delay: 0.007,
            late_reverb_gain: 1.26,
            late_reverb_delay: 0.011,
            pan: Vec3::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LowpassParams {
    pub gain: f32,
    pub gain_hf: f32,
}

impl Default for LowpassParams {
    fn default() -> Self {
        Self {
            gain: 1.0,
            gain_hf: 1.0,
        }
    }
}

/// Resource counts, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MixerStats {
    pub voices: usize,
    pub buffers: usize,
    pub buffer_bytes: usize,
    pub effect_slots: usize,
    pub effects: usize,
    pub filters: usize,
    pub effect_uploads: usize,
    pub frames_rendered: u64,
}

/// Resource limits of the simulated hardware.
#[derive(Debug, Clone, Copy)]
pub struct MixerLimits {
    pub max_voices: usize,
    pub max_effect_slots: usize,
    pub max_buffer_bytes: usize,
}

#[derive(Debug)]
struct Slab<T> {
    entries: Vec<Option<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Slab<T> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(value);
                index
            }
            None => {
                self.entries.push(Some(value));
                (self.entries.len() - 1) as u32
            }
        }
    }

    fn remove(&mut self, index: u32) -> Option<T> {
        let value = self.entries.get_mut(index as usize)?.take()?;
        self.free.push(index);
        self.live -= 1;
        Some(value)
    }

    fn get(&self, index: u32) -> Option<&T> {
        self.entries.get(index as usize)?.as_ref()
    }

    fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        self.entries.get_mut(index as usize)?.as_mut()
    }

    fn len(&self) -> usize {
        self.live
    }

    fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (i as u32, v)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|v| (i as u32, v)))
    }
}

#[derive(Debug)]
struct Buffer {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
    frames: usize,
}

#[derive(Debug)]
struct Voice {
    queue: VecDeque<BufferId>,
    processed: Vec<BufferId>,
    cursor: f64,
    state: VoiceState,
    params: VoiceParams,
    lowpass: [f32; 2],
}

impl Voice {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            processed: Vec::new(),
            cursor: 0.0,
            state: VoiceState::Initial,
            params: VoiceParams::default(),
            lowpass: [0.0; 2],
        }
    }

    /// Spatial voices are mixed down to mono before panning.
    fn is_spatial(&self) -> bool {
        !self.params.relative || self.params.position.length_squared() > 1e-8
    }
}

#[derive(Debug)]
struct EffectSlot {
    effect: Option<EffectId>,
    line: Vec<f32>,
    write: usize,
    damp: f32,
    input: Vec<f32>,
}

#[derive(Debug)]
pub struct Mixer {
    name: String,
    sample_rate: u32,
    supports_effects: bool,
    limits: MixerLimits,
    listener: SoundListener,
    buffers: Slab<Buffer>,
    voices: Slab<Voice>,
    slots: Slab<EffectSlot>,
    effects: Slab<ReverbParams>,
    filters: Slab<LowpassParams>,
    buffer_bytes: usize,
    deferred: bool,
    pending: HashMap<VoiceId, VoiceParams>,
    effect_uploads: usize,
    frames_rendered: u64,
}

impl Mixer {
    pub fn new(name: impl Into<String>, sample_rate: u32, limits: MixerLimits) -> Self {
        Self {
            name: name.into(),
            sample_rate,
            supports_effects: limits.max_effect_slots > 0,
            limits,
            listener: SoundListener::default(),
            buffers: Slab::new(),
            voices: Slab::new(),
            slots: Slab::new(),
            effects: Slab::new(),
            filters: Slab::new(),
            buffer_bytes: 0,
            deferred: false,
            pending: HashMap::new(),
            effect_uploads: 0,
            frames_rendered: 0,
        }
    }

    pub fn shared(self) -> SharedMixer {
        Arc::new(Mutex::new(self))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn supports_effects(&self) -> bool {
        self.supports_effects
    }

    pub fn stats(&self) -> MixerStats {
        MixerStats {
            voices: self.voices.len(),
            buffers: self.buffers.len(),
            buffer_bytes: self.buffer_bytes,
            effect_slots: self.slots.len(),
            effects: self.effects.len(),
            filters: self.filters.len(),
            effect_uploads: self.effect_uploads,
            frames_rendered: self.frames_rendered,
        }
    }

    pub fn set_listener(&mut self, listener: &SoundListener) {
        self.listener = *listener;
    }

    /// Defer voice parameter changes until [`Mixer::process`].
    pub fn suspend(&mut self) {
        self.deferred = true;
    }

    /// Apply every deferred parameter change at once.
    pub fn process(&mut self) {
        self.deferred = false;
        for (id, params) in self.pending.drain() {
            if let Some(voice) = self.voices.get_mut(id.0) {
                voice.params = params;
            }
        }
    }

    pub fn create_buffer(&mut self, pcm: PcmData) -> Result<BufferId> {
        Self::check_layout(&pcm)?;
        let bytes = pcm.byte_len();
        if self.buffer_bytes + bytes > self.limits.max_buffer_bytes {
            return Err(SoundStageError::BufferUpload(format!(
                "{}: out of device memory ({} + {} > {} bytes)",
                self.name, self.buffer_bytes, bytes, self.limits.max_buffer_bytes
            )));
        }
        self.buffer_bytes += bytes;
        let id = self.buffers.insert(Buffer {
            frames: pcm.frames(),
            channels: pcm.channels,
            sample_rate: pcm.sample_rate,
            samples: pcm.samples.into(),
        });
        Ok(BufferId(id))
    }

    /// Replace a buffer's contents. Refused while the buffer is queued on a voice.
    pub fn buffer_data(&mut self, id: BufferId, pcm: PcmData) -> Result<()> {
        Self::check_layout(&pcm)?;
        if self.is_buffer_queued(id) {
            return Err(SoundStageError::BufferUpload(format!(
                "{}: buffer {:?} is still queued",
                self.name, id
            )));
        }
        let Some(buffer) = self.buffers.get_mut(id.0) else {
            return Err(SoundStageError::BufferUpload(format!(
                "{}: unknown buffer {:?}",
                self.name, id
            )));
        };
        let old = buffer.samples.len() * std::mem::size_of::<f32>();
        let new = pcm.byte_len();
        if self.buffer_bytes - old + new > self.limits.max_buffer_bytes {
            return Err(SoundStageError::BufferUpload(format!(
                "{}: out of device memory refilling {:?}",
                self.name, id
            )));
        }
        self.buffer_bytes = self.buffer_bytes - old + new;
        buffer.frames = pcm.frames();
        buffer.channels = pcm.channels;
        buffer.sample_rate = pcm.sample_rate;
        buffer.samples = pcm.samples.into();
        Ok(())
    }

    /// Frees a buffer, pulling it out of any voice still playing it.
    pub fn delete_buffer(&mut self, id: BufferId) {
        let Some(buffer) = self.buffers.remove(id.0) else {
            return;
        };
        self.buffer_bytes -= buffer.samples.len() * std::mem::size_of::<f32>();
        for (_, voice) in self.voices.iter_mut() {
            let front = voice.queue.front().copied();
            voice.queue.retain(|b| *b != id);
            voice.processed.retain(|b| *b != id);
            if front == Some(id) {
                voice.cursor = 0.0;
            }
            if voice.queue.is_empty() && voice.state == VoiceState::Playing {
                voice.state = VoiceState::Stopped;
            }
        }
    }

    fn check_layout(pcm: &PcmData) -> Result<()> {
        if !(1..=2).contains(&pcm.channels) || pcm.sample_rate == 0 {
            return Err(SoundStageError::BufferUpload(format!(
                "unsupported layout: {} channels at {} Hz",
                pcm.channels, pcm.sample_rate
            )));
        }
        Ok(())
    }

    fn is_buffer_queued(&self, id: BufferId) -> bool {
        self.voices.iter().any(|(_, v)| v.queue.contains(&id))
    }

    pub fn create_voice(&mut self) -> Result<VoiceId> {
        if self.voices.len() >= self.limits.max_voices {
            return Err(SoundStageError::DeviceResource(format!(
                "{}: all {} voices in use",
                self.name, self.limits.max_voices
            )));
        }
        Ok(VoiceId(self.voices.insert(Voice::new())))
    }

    pub fn delete_voice(&mut self, id: VoiceId) {
        self.pending.remove(&id);
        self.voices.remove(id.0);
    }

    pub fn set_voice(&mut self, id: VoiceId, params: VoiceParams) {
        if self.deferred {
            if self.voices.get(id.0).is_some() {
                self.pending.insert(id, params);
            }
            return;
        }
        if let Some(voice) = self.voices.get_mut(id.0) {
            voice.params = params;
        }
    }

    pub fn voice_params(&self, id: VoiceId) -> Option<VoiceParams> {
        self.voices.get(id.0).map(|v| v.params)
    }

    /// Queue a buffer at the back of a voice.
    pub fn queue_buffer(&mut self, id: VoiceId, buffer: BufferId) -> Result<()> {
        if self.buffers.get(buffer.0).is_none() {
            return Err(SoundStageError::BufferUpload(format!(
                "{}: unknown buffer {:?}",
                self.name, buffer
            )));
        }
        let Some(voice) = self.voices.get_mut(id.0) else {
            return Err(SoundStageError::InvalidSource(format!("unknown voice {:?}", id)));
        };
        voice.queue.push_back(buffer);
        Ok(())
    }

    /// Buffers still pending on a voice, front first.
    pub fn queued_buffers(&self, id: VoiceId) -> Vec<BufferId> {
        self.voices
            .get(id.0)
            .map(|v| v.queue.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Buffers the voice has finished playing since the last call.
    pub fn unqueue_processed(&mut self, id: VoiceId) -> Vec<BufferId> {
        self.voices
            .get_mut(id.0)
            .map(|v| std::mem::take(&mut v.processed))
            .unwrap_or_default()
    }

    pub fn queued(&self, id: VoiceId) -> usize {
        self.voices.get(id.0).map_or(0, |v| v.queue.len())
    }

    /// Drop every queued and processed buffer from a stopped voice.
    pub fn clear_queue(&mut self, id: VoiceId) {
        if let Some(voice) = self.voices.get_mut(id.0) {
            voice.queue.clear();
            voice.processed.clear();
            voice.cursor = 0.0;
            voice.state = VoiceState::Initial;
        }
    }

    pub fn play_voice(&mut self, id: VoiceId) {
        if let Some(params) = self.pending.remove(&id) {
            if let Some(voice) = self.voices.get_mut(id.0) {
                voice.params = params;
            }
        }
        if let Some(voice) = self.voices.get_mut(id.0) {
            if voice.queue.is_empty() {
                voice.state = VoiceState::Stopped;
            } else {
                if voice.state != VoiceState::Playing {
                    voice.lowpass = [0.0; 2];
                }
                voice.state = VoiceState::Playing;
            }
        }
    }

    pub fn stop_voice(&mut self, id: VoiceId) {
        if let Some(voice) = self.voices.get_mut(id.0) {
            voice.state = VoiceState::Stopped;
            voice.processed.extend(voice.queue.drain(..));
            voice.cursor = 0.0;
        }
    }

    pub fn voice_state(&self, id: VoiceId) -> VoiceState {
        self.voices
            .get(id.0)
            .map_or(VoiceState::Stopped, |v| v.state)
    }

    pub fn create_effect_slot(&mut self) -> Result<EffectSlotId> {
        if self.slots.len() >= self.limits.max_effect_slots {
            return Err(SoundStageError::ZoneResourceExhausted(
                self.limits.max_effect_slots,
            ));
        }
        Ok(EffectSlotId(self.slots.insert(EffectSlot {
            effect: None,
            line: Vec::new(),
            write: 0,
            damp: 0.0,
            input: Vec::new(),
        })))
    }

    pub fn delete_effect_slot(&mut self, id: EffectSlotId) {
        self.slots.remove(id.0);
        for (_, voice) in self.voices.iter_mut() {
            if voice.params.send == Some(id) {
                voice.params.send = None;
            }
        }
        for params in self.pending.values_mut() {
            if params.send == Some(id) {
                params.send = None;
            }
        }
    }

    pub fn create_effect(&mut self) -> Result<EffectId> {
        if !self.supports_effects {
            return Err(SoundStageError::DeviceResource(format!(
                "{}: effects unsupported",
                self.name
            )));
        }
        Ok(EffectId(self.effects.insert(ReverbParams::default())))
    }

    pub fn delete_effect(&mut self, id: EffectId) {
        self.effects.remove(id.0);
        for (_, slot) in self.slots.iter_mut() {
            if slot.effect == Some(id) {
                slot.effect = None;
            }
        }
    }

    pub fn set_effect(&mut self, id: EffectId, params: ReverbParams) {
        if let Some(effect) = self.effects.get_mut(id.0) {
            *effect = params;
            self.effect_uploads += 1;
        }
    }

    /// Load an effect into a slot, resizing the slot's delay line to match.
    pub fn attach_effect(&mut self, slot: EffectSlotId, effect: Option<EffectId>) {
        let params = effect.and_then(|e| self.effects.get(e.0).copied());
        let rate = self.sample_rate as f32;
        if let Some(s) = self.slots.get_mut(slot.0) {
            s.effect = effect.filter(|_| params.is_some());
            if let Some(p) = params {
                let len = (((p.reflections_delay + p.late_reverb_delay) * rate) as usize).max(1);
                if s.line.len() != len {
                    s.line = vec![0.0; len];
                    s.write = 0;
                }
            }
        }
    }

    pub fn create_filter(&mut self) -> Result<FilterId> {
        Ok(FilterId(self.filters.insert(LowpassParams::default())))
    }

    pub fn delete_filter(&mut self, id: FilterId) {
        self.filters.remove(id.0);
    }

    pub fn set_filter(&mut self, id: FilterId, params: LowpassParams) {
        if let Some(filter) = self.filters.get_mut(id.0) {
            *filter = params;
        }
    }

    /// Mix every playing voice into interleaved stereo `out`.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = out.len() / 2;
        if frames == 0 {
            return;
        }
        let device_rate = self.sample_rate as f64;
        let listener = self.listener;

        let Mixer {
            buffers,
            voices,
            slots,
            effects,
            filters,
            ..
        } = self;

        for (_, slot) in slots.iter_mut() {
            slot.input.clear();
            slot.input.resize(frames, 0.0);
        }

        for (_, voice) in voices.iter_mut() {
            if voice.state != VoiceState::Playing {
                continue;
            }
            let mix = spatialize(&voice.params, &listener, voice.is_spatial());
            let filter = voice
                .params
                .filter
                .and_then(|f| filters.get(f.0).copied())
                .unwrap_or_default();
            let alpha = filter.gain_hf.clamp(0.01, 1.0);
            let send = voice.params.send.filter(|s| slots.get(s.0).is_some());
            let spatial = voice.is_spatial();

            for f in 0..frames {
                let Some((l, r)) = next_frame(voice, buffers, mix.step, device_rate, spatial)
                else {
                    break;
                };
                voice.lowpass[0] += alpha * (l - voice.lowpass[0]);
                voice.lowpass[1] += alpha * (r - voice.lowpass[1]);
                let (l, r) = (voice.lowpass[0] * filter.gain, voice.lowpass[1] * filter.gain);
                out[f * 2] += l * mix.left;
                out[f * 2 + 1] += r * mix.right;
                if let Some(slot) = send.and_then(|s| slots.get_mut(s.0)) {
                    slot.input[f] += (l + r) * 0.5 * mix.send;
                }
            }
        }

        for (_, slot) in slots.iter_mut() {
            let Some(params) = slot.effect.and_then(|e| effects.get(e.0).copied()) else {
                continue;
            };
            if slot.line.is_empty() {
                continue;
            }
            let delay = slot.line.len() as f32 / device_rate as f32;
            let feedback = if params.decay_time > 0.0 {
                10f32.powf(-3.0 * delay / params.decay_time).min(0.98)
            } else {
                0.0
            };
            let out_gain = params.gain * params.late_reverb_gain;
            let early = params.reflections_gain;
            let (pl, pr) = pan_gains(params.pan.x.clamp(-1.0, 1.0));
            let damp = params.gain_hf.clamp(0.01, 1.0);
            for f in 0..frames {
                let tail = slot.line[slot.write];
                slot.damp += damp * (tail - slot.damp);
                slot.line[slot.write] = slot.input[f] + slot.damp * feedback;
                slot.write = (slot.write + 1) % slot.line.len();
                let wet = tail * out_gain + slot.input[f] * early;
                out[f * 2] += wet * pl;
                out[f * 2 + 1] += wet * pr;
            }
        }

        self.frames_rendered += frames as u64;
    }

    /// Render and discard `frames` frames; advances playback without an output stream.
    pub fn advance(&mut self, frames: usize) {
        let mut scratch = vec![0.0f32; frames * 2];
        self.render(&mut scratch);
    }
}

struct VoiceMix {
    left: f32,
    right: f32,
    send: f32,
    step: f64,
}

fn pan_gains(x: f32) -> (f32, f32) {
    (((1.0 - x) * 0.5).sqrt(), ((1.0 + x) * 0.5).sqrt())
}

fn spatialize(params: &VoiceParams, listener: &SoundListener, spatial: bool) -> VoiceMix {
    let rel = if params.relative {
        params.position
    } else {
        params.position - listener.pose.position
    };
    let distance = rel.length();
    let gain = (params.gain * params.attenuation(distance)).clamp(params.min_gain, params.max_gain);

    let (mut left, mut right) = (gain, gain);
    let mut doppler = 1.0f32;
    if spatial && distance > 1e-4 {
        let dir = rel / distance;
        let x = if params.relative {
            dir.x
        } else {
            dir.dot(listener.pose.right())
        };
        let (pl, pr) = pan_gains(x.clamp(-1.0, 1.0));
        left = gain * pl;
        right = gain * pr;

        if !params.relative {
            let limit = SOUND_SPEED * 0.99;
            let vl = listener.velocity.dot(dir).clamp(-limit, limit);
            let vs = params.velocity.dot(dir).clamp(-limit, limit);
            // `dir` runs listener to source.
            doppler = (SOUND_SPEED + vl) / (SOUND_SPEED + vs);
        }
    }

    VoiceMix {
        left,
        right,
        send: gain,
        step: (params.pitch.max(0.0) * doppler) as f64,
    }
}

/// Pull one frame from the voice's queue, advancing across buffer boundaries.
fn next_frame(
    voice: &mut Voice,
    buffers: &Slab<Buffer>,
    step: f64,
    device_rate: f64,
    spatial: bool,
) -> Option<(f32, f32)> {
    loop {
        let front = *voice.queue.front()?;
        let Some(buffer) = buffers.get(front.0) else {
            voice.queue.pop_front();
            continue;
        };
        if buffer.frames == 0 || voice.cursor >= buffer.frames as f64 {
            voice.cursor = (voice.cursor - buffer.frames as f64).max(0.0);
            if voice.params.looping && voice.queue.len() == 1 && buffer.frames > 0 {
                continue;
            }
            voice.queue.pop_front();
            voice.processed.push(front);
            if voice.queue.is_empty() {
                voice.state = VoiceState::Stopped;
                voice.cursor = 0.0;
                return None;
            }
            continue;
        }

        let index = voice.cursor as usize;
        let frac = (voice.cursor - index as f64) as f32;
        let next = (index + 1).min(buffer.frames - 1);
        let ch = buffer.channels as usize;
        let read = |i: usize, c: usize| buffer.samples[i * ch + c.min(ch - 1)];
        let l = read(index, 0) + (read(next, 0) - read(index, 0)) * frac;
        let r = read(index, 1) + (read(next, 1) - read(index, 1)) * frac;
        voice.cursor += step * buffer.sample_rate as f64 / device_rate;

        return Some(if spatial && ch > 1 {
            let m = (l + r) * 0.5;
            (m, m)
        } else {
            (l, r)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> MixerLimits {
        MixerLimits {
            max_voices: 4,
            max_effect_slots: 2,
            max_buffer_bytes: 1024,
        }
    }

    fn pcm(frames: usize) -> PcmData {
        PcmData {
            samples: vec![0.5; frames],
            channels: 1,
            sample_rate: 100,
        }
    }

    #[test]
    fn test_voice_plays_to_end() {
        let mut mixer = Mixer::new("test", 100, limits());
        let buffer = mixer.create_buffer(pcm(10)).unwrap();
        let voice = mixer.create_voice().unwrap();
        mixer.queue_buffer(voice, buffer).unwrap();
        mixer.set_voice(voice, VoiceParams::ambient(1.0));
        mixer.play_voice(voice);
        assert_eq!(mixer.voice_state(voice), VoiceState::Playing);

        mixer.advance(5);
        assert_eq!(mixer.voice_state(voice), VoiceState::Playing);
        mixer.advance(10);
        assert_eq!(mixer.voice_state(voice), VoiceState::Stopped);
        assert_eq!(mixer.unqueue_processed(voice), vec![buffer]);
        assert!(mixer.unqueue_processed(voice).is_empty());
    }

    #[test]
    fn test_looping_voice_keeps_playing() {
        let mut mixer = Mixer::new("test", 100, limits());
        let buffer = mixer.create_buffer(pcm(10)).unwrap();
        let voice = mixer.create_voice().unwrap();
        mixer.queue_buffer(voice, buffer).unwrap();
        mixer.set_voice(
            voice,
            VoiceParams {
                looping: true,
                ..VoiceParams::ambient(1.0)
            },
        );
        mixer.play_voice(voice);
        mixer.advance(95);
        assert_eq!(mixer.voice_state(voice), VoiceState::Playing);
        assert!(mixer.unqueue_processed(voice).is_empty());
    }

    #[test]
    fn test_ambient_voice_output() {
        let mut mixer = Mixer::new("test", 100, limits());
        let buffer = mixer.create_buffer(pcm(4)).unwrap();
        let voice = mixer.create_voice().unwrap();
        mixer.queue_buffer(voice, buffer).unwrap();
        mixer.set_voice(voice, VoiceParams::ambient(1.0));
        mixer.play_voice(voice);
        let mut out = vec![0.0; 8];
        mixer.render(&mut out);
        // One-pole filter at full gain_hf passes the signal straight through.
        assert!(out.iter().all(|s| (*s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_deferred_params_apply_on_process() {
        let mut mixer = Mixer::new("test", 100, limits());
        let voice = mixer.create_voice().unwrap();
        mixer.suspend();
        mixer.set_voice(voice, VoiceParams::ambient(0.25));
        assert_eq!(mixer.voice_params(voice).unwrap().gain, 1.0);
        mixer.process();
        assert_eq!(mixer.voice_params(voice).unwrap().gain, 0.25);
    }

    #[test]
    fn test_resource_limits() {
        let mut mixer = Mixer::new("test", 100, limits());
        assert!(mixer.create_buffer(pcm(200)).is_ok());
        assert!(matches!(
            mixer.create_buffer(pcm(100)),
            Err(SoundStageError::BufferUpload(_))
        ));
        mixer.create_effect_slot().unwrap();
        mixer.create_effect_slot().unwrap();
        assert!(matches!(
            mixer.create_effect_slot(),
            Err(SoundStageError::ZoneResourceExhausted(2))
        ));
        for _ in 0..4 {
            mixer.create_voice().unwrap();
        }
        assert!(mixer.create_voice().is_err());
    }

    #[test]
    fn test_queued_buffer_cannot_be_refilled() {
        let mut mixer = Mixer::new("test", 100, limits());
        let buffer = mixer.create_buffer(pcm(10)).unwrap();
        let voice = mixer.create_voice().unwrap();
        mixer.queue_buffer(voice, buffer).unwrap();
        assert_eq!(mixer.queued_buffers(voice), vec![buffer]);
        assert!(mixer.buffer_data(buffer, pcm(10)).is_err());
        mixer.play_voice(voice);
        mixer.advance(20);
        assert_eq!(mixer.unqueue_processed(voice), vec![buffer]);
        assert!(mixer.buffer_data(buffer, pcm(10)).is_ok());
    }

    #[test]
    fn test_delete_buffer_stops_voice() {
        let mut mixer = Mixer::new("test", 100, limits());
        let buffer = mixer.create_buffer(pcm(10)).unwrap();
        let voice = mixer.create_voice().unwrap();
        mixer.queue_buffer(voice, buffer).unwrap();
        mixer.play_voice(voice);
        mixer.delete_buffer(buffer);
        assert_eq!(mixer.voice_state(voice), VoiceState::Stopped);
        assert_eq!(mixer.stats().buffer_bytes, 0);
    }

    #[test]
    fn test_inverse_distance_clamped() {
        let params = VoiceParams {
            rolloff: 1.0,
            refdist: 10.0,
            maxdist: 100.0,
            ..Default::default()
        };
        assert_eq!(params.attenuation(5.0), 1.0);
        assert!((params.attenuation(20.0) - 0.5).abs() < 1e-6);
        assert_eq!(params.attenuation(1000.0), params.attenuation(100.0));
        let flat = VoiceParams {
            rolloff: 0.0,
            ..params
        };
        assert_eq!(flat.attenuation(1000.0), 1.0);
    }

    #[test]
    fn test_panning_follows_listener_right() {
        let listener = SoundListener::default();
        let params = VoiceParams {
            position: Vec3::new(10.0, 0.0, 0.0),
            rolloff: 0.0,
            ..Default::default()
        };
        let mix = spatialize(&params, &listener, true);
        assert!(mix.right > mix.left);
        assert!(mix.left.abs() < 1e-3);
    }

    #[test]
    fn test_doppler_follows_closing_speed() {
        let mut listener = SoundListener::default();
        let mut params = VoiceParams {
            position: Vec3::new(0.0, 0.0, -100.0),
            velocity: Vec3::new(0.0, 0.0, 1000.0),
            ..Default::default()
        };
        let approaching = spatialize(&params, &listener, true).step;
        assert!(approaching > 1.0);

        params.velocity = Vec3::new(0.0, 0.0, -1000.0);
        let receding = spatialize(&params, &listener, true).step;
        assert!(receding < 1.0);

        // A listener walking toward a still source hears it higher too.
        params.velocity = Vec3::ZERO;
        listener.velocity = Vec3::new(0.0, 0.0, -1000.0);
        assert!(spatialize(&params, &listener, true).step > 1.0);
        listener.velocity = Vec3::new(0.0, 0.0, 1000.0);
        assert!(spatialize(&params, &listener, true).step < 1.0);
    }
}

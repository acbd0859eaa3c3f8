use crate::audio_data::{AssetDecoder, SampleKind, SymphoniaDecoder};
use crate::config::SoundStageDesc;
use crate::device::{CpalDriver, DeviceDriver, DeviceManager, Mixer};
use crate::env::{EnvZoneSystem, SoundEnvs};
use crate::error::{Result, SoundStageError};
use crate::events::SoundEvent;
use crate::math::Vec3;
use crate::music::{MusicAction, MusicStatus, MusicStream, SmartMusic};
use crate::sample::{SampleLoader, SampleStore};
use crate::slot::{SlotParams, SlotRegistry, SlotSetKind};
use crate::source::{EmitParams, SoundFlags, SoundSource, SourceContext, SourceHandle, SourceManager};
use crate::world::{EntityId, SoundListener, SoundWorld, ZoneEntity};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::Write;
use std::path::PathBuf;

/// Events older than this are dropped when nobody polls.
const MAX_PENDING_EVENTS: usize = 4096;

/// The sound subsystem: devices, assets, sources, reverb zones and music.
///
/// `SoundStage` runs entirely on the caller's thread. Commands take effect
/// immediately; everything that evolves over time (source positions and
/// envelopes, zone selection, music refill, device loss) advances in
/// [`SoundStage::update_sounds`], which the caller invokes once per simulation
/// tick. The only other thread is the output driver's callback, which renders
/// the device mixers.
///
/// # Failure model
///
/// Missing devices, undecodable assets and decoder stalls never fail a
/// command. They are logged, reported through [`SoundStage::poll_events`]
/// and leave the affected sounds silent.
pub struct SoundStage {
    desc: SoundStageDesc,
    decoder: Box<dyn AssetDecoder>,
    devices: DeviceManager,
    samples: SampleStore,
    slots: SlotRegistry,
    envs: SoundEnvs,
    zones: EnvZoneSystem,
    sources: SourceManager,
    music: Option<MusicStream>,
    smart: SmartMusic,
    listener: SoundListener,
    millis: u64,
    rng: StdRng,
    events: Vec<SoundEvent>,
    last_error: Option<String>,
}

impl std::fmt::Debug for SoundStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundStage")
            .field("devices", &self.devices.devices().collect::<Vec<_>>())
            .field("sources", &self.sources.active_count())
            .field("samples", &self.samples.len())
            .field("music", &self.music)
            .field("millis", &self.millis)
            .finish()
    }
}

/// Run `f` against the audio device's mixer, or with `None` when audio is off.
fn with_audio_mixer<R>(devices: &DeviceManager, f: impl FnOnce(Option<&mut Mixer>) -> R) -> R {
    match devices.audio().and_then(|d| d.mixer()) {
        Some(mixer) => f(Some(&mut *mixer.lock())),
        None => f(None),
    }
}

fn error_message(event: &SoundEvent) -> Option<String> {
    match event {
        SoundEvent::DeviceOpenFailed { error, .. } => Some(error.clone()),
        SoundEvent::DeviceLost { kind } => Some(format!("{} device lost", kind)),
        SoundEvent::AssetFailed { error, .. } => Some(error.clone()),
        SoundEvent::StreamUnderrun { track } => Some(format!("music '{}' underrun", track)),
        _ => None,
    }
}

impl SoundStage {
    /// Create a stage with explicit collaborators. No device is opened until [`SoundStage::init_sound`].
    ///
    /// # Errors
    ///
    /// Returns [`SoundStageError::Configuration`] if `desc` fails validation.
    pub fn new(
        desc: SoundStageDesc,
        driver: Box<dyn DeviceDriver>,
        decoder: Box<dyn AssetDecoder>,
    ) -> Result<Self> {
        desc.validate()?;
        let rng = match desc.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            devices: DeviceManager::new(driver),
            samples: SampleStore::new(SampleKind::Short, desc.resample_on_upload),
            slots: SlotRegistry::new(),
            envs: SoundEnvs::new(),
            zones: EnvZoneSystem::new(),
            sources: SourceManager::new(desc.max_sources),
            music: None,
            smart: SmartMusic::new(),
            listener: SoundListener::default(),
            millis: 0,
            rng,
            events: Vec::new(),
            last_error: None,
            decoder,
            desc,
        })
    }

    /// Stage playing through cpal with assets decoded by symphonia from `asset_root`.
    pub fn with_cpal(desc: SoundStageDesc, asset_root: impl Into<PathBuf>) -> Result<Self> {
        Self::new(
            desc,
            Box::new(CpalDriver::new()),
            Box::new(SymphoniaDecoder::new(asset_root)),
        )
    }

    pub fn desc(&self) -> &SoundStageDesc {
        &self.desc
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.devices
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn slots(&self) -> &SlotRegistry {
        &self.slots
    }

    pub fn zones(&self) -> &EnvZoneSystem {
        &self.zones
    }

    pub fn envs(&self) -> &SoundEnvs {
        &self.envs
    }

    pub fn listener(&self) -> SoundListener {
        self.listener
    }

    /// Simulation time of the last [`SoundStage::update_sounds`], in milliseconds.
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// True while an audio device is open.
    pub fn enabled(&self) -> bool {
        self.devices.audio().is_some()
    }

    /// Open the configured devices.
    ///
    /// Never fails: without an audio device the stage keeps running with
    /// sound disabled and every emit is a no-op. Returns whether audio is on.
    pub fn init_sound(&mut self) -> bool {
        let start = self.events.len();
        self.stop_music();
        self.sources.stop_all(&self.devices);
        self.zones.forget_device();
        let ok = self.devices.open(&self.desc, &mut self.events);
        if ok {
            self.samples.reupload(&self.devices, &mut self.events);
            log::info!(
                "Sound initialised on '{}'",
                self.devices.audio().map_or("", |d| d.name())
            );
        } else {
            log::error!("No audio device, sound disabled");
        }
        self.note_errors(start);
        ok
    }

    /// Stop everything and close the devices. Loaded sounds stay registered.
    pub fn stop_sound(&mut self) {
        self.stop_music();
        self.sources.stop_all(&self.devices);
        self.zones.forget_device();
        self.devices.destroy();
        log::info!("Sound stopped");
    }

    /// Forget every sound, zone and sample, keeping devices open.
    pub fn clear_sound(&mut self) {
        self.stop_music();
        self.sources.stop_all(&self.devices);
        let mut loader = SampleLoader {
            samples: &mut self.samples,
            decoder: self.decoder.as_ref(),
            devices: &self.devices,
            events: &mut self.events,
        };
        self.slots.clear(&mut loader);
        self.samples.clear(&self.devices);
        with_audio_mixer(&self.devices, |m| self.zones.clear(m));
    }

    /// Per-tick update. Call once per simulation frame with the current time.
    pub fn update_sounds(&mut self, world: &dyn SoundWorld, millis: u64) {
        let start = self.events.len();
        self.millis = millis;

        let lost = self.devices.check(&mut self.events);
        if !lost.is_empty() {
            self.recover_devices();
        }

        self.listener = world.listener();
        for device in self.devices.devices() {
            device.with_mixer(|m| m.set_listener(&self.listener));
        }

        with_audio_mixer(&self.devices, |m| {
            self.zones
                .update(&self.listener, &self.envs, m, &mut self.events)
        });

        self.devices.suspend_all();
        let mut ctx = SourceContext {
            desc: &self.desc,
            slots: &self.slots,
            samples: &self.samples,
            devices: &self.devices,
            zones: &self.zones,
            envs: &self.envs,
            listener: self.listener,
            millis,
            rng: &mut self.rng,
            events: &mut self.events,
        };
        self.sources.update(&mut ctx, world);
        self.devices.push_all();

        self.update_music();
        self.note_errors(start);
        if self.events.len() > MAX_PENDING_EVENTS {
            let excess = self.events.len() - MAX_PENDING_EVENTS;
            self.events.drain(..excess);
        }
    }

    /// Cancel what the lost devices were playing and reopen them.
    fn recover_devices(&mut self) {
        self.sources.stop_all(&self.devices);
        if let Some(music) = self.music.take() {
            with_audio_mixer(&self.devices, |m| {
                if let Some(m) = m {
                    music.cleanup(m);
                }
            });
        }
        self.zones.forget_device();
        if self.devices.reopen(&self.desc, &mut self.events) {
            self.samples.reupload(&self.devices, &mut self.events);
        } else {
            log::error!("Could not reopen audio after device loss, sound disabled");
        }
    }

    fn update_music(&mut self) {
        let Some(music) = self.music.as_mut() else {
            return;
        };
        let gain = self.desc.music_gain();
        let status = with_audio_mixer(&self.devices, |m| {
            m.map(|m| {
                if music.gain() != gain {
                    music.set_gain(gain, m);
                }
                music.update(m, &mut self.events)
            })
        });
        match status {
            Some(MusicStatus::Finished) | None => {
                if let Some(music) = self.music.take() {
                    self.events.push(SoundEvent::MusicFinished {
                        track: music.name().to_string(),
                    });
                    with_audio_mixer(&self.devices, |m| {
                        if let Some(m) = m {
                            music.cleanup(m);
                        }
                    });
                }
            }
            Some(MusicStatus::Playing | MusicStatus::Starved) => {}
        }
    }

    fn note_errors(&mut self, start: usize) {
        if let Some(message) = self.events[start.min(self.events.len())..]
            .iter()
            .rev()
            .find_map(error_message)
        {
            self.last_error = Some(message);
        }
    }

    fn record_error(&mut self, err: &SoundStageError) {
        self.last_error = Some(err.to_string());
    }

    /// The last error message, cleared by reading it.
    pub fn sound_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Drain the events raised since the previous call.
    pub fn poll_events(&mut self) -> Vec<SoundEvent> {
        std::mem::take(&mut self.events)
    }

    /// Change the mix volumes. Playing sources pick them up next tick.
    pub fn set_volumes(&mut self, master: f32, effect: f32, music: f32) {
        self.desc.master_volume = master;
        self.desc.effect_volume = effect;
        self.desc.music_volume = music;
    }

    /// Start streaming `name`, replacing any current track.
    ///
    /// Returns false if there is no audio device or the track cannot be
    /// opened; the reason is left in [`SoundStage::sound_error`].
    pub fn play_music(&mut self, name: &str, looping: bool) -> bool {
        self.stop_music();
        if !self.enabled() {
            return false;
        }
        let stream = match self.decoder.open_stream(name) {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("Cannot open music '{}': {}", name, err);
                self.events.push(SoundEvent::AssetFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                });
                self.record_error(&err);
                return false;
            }
        };
        let (buffers, frames, gain) = (
            self.desc.music_buffers,
            self.desc.music_chunk_frames,
            self.desc.music_gain(),
        );
        let started = with_audio_mixer(&self.devices, |m| {
            let m = m.ok_or_else(|| SoundStageError::DeviceOpen("no audio device".to_string()))?;
            let mut music = MusicStream::setup(name, stream, buffers, frames, looping, m)?;
            if let Err(err) = music.play(gain, m) {
                music.cleanup(m);
                return Err(err);
            }
            Ok(music)
        });
        match started {
            Ok(music) => {
                self.events.push(SoundEvent::MusicStarted {
                    track: name.to_string(),
                });
                self.music = Some(music);
                true
            }
            Err(err) => {
                log::warn!("Cannot play music '{}': {}", name, err);
                self.record_error(&err);
                false
            }
        }
    }

    pub fn stop_music(&mut self) {
        let Some(music) = self.music.take() else {
            return;
        };
        log::info!("Stopping music '{}'", music.name());
        with_audio_mixer(&self.devices, |m| {
            if let Some(m) = m {
                music.cleanup(m);
            }
        });
    }

    pub fn playing_music(&self) -> bool {
        self.music.is_some()
    }

    pub fn music(&self) -> Option<&MusicStream> {
        self.music.as_ref()
    }

    /// Switch between the configured smart-music track and silence as `cond` toggles.
    ///
    /// `init` forces a decision even if the condition did not change.
    pub fn smart_music(&mut self, cond: bool, init: bool) {
        if !self.enabled() || self.desc.music_gain() <= 0.0 {
            return;
        }
        let playing = self.music.as_ref().map(|m| m.name().to_string());
        let action = self.smart.decide(
            cond,
            init,
            self.desc.smart_music.as_deref(),
            playing.as_deref(),
        );
        match action {
            MusicAction::Keep => {}
            MusicAction::Play(track) => {
                self.play_music(&track, true);
            }
            MusicAction::Stop => self.stop_music(),
        }
    }

    /// Register a sound under `id`, loading its variants. Returns its stable index.
    ///
    /// Re-adding an existing `id` updates it in place.
    pub fn add_sound(&mut self, id: &str, name: &str, params: SlotParams, set: SlotSetKind) -> usize {
        let start = self.events.len();
        let mut loader = SampleLoader {
            samples: &mut self.samples,
            decoder: self.decoder.as_ref(),
            devices: &self.devices,
            events: &mut self.events,
        };
        let index = self.slots.add_sound(id, name, params, set, &mut loader);
        self.note_errors(start);
        index
    }

    pub fn map_sound_slots(&mut self) {
        self.slots.map_sound_slots();
    }

    pub fn map_sound_slot(&mut self, index: usize, id: &str) -> bool {
        self.slots.map_sound_slot(index, id)
    }

    pub fn get_sound_slot(&self, index: usize) -> Option<usize> {
        self.slots.get_sound_slot(index)
    }

    /// Play slot `n` at `pos`, owned by `owner` when given.
    ///
    /// # Arguments
    ///
    /// * `n` - Slot index (map-local when `params.flags.map` is set)
    /// * `pos` - World position, ignored each tick for tracked sources
    /// * `owner` - Entity the sound belongs to; drives de-duplication and tracking
    /// * `hook` - Handle from a previous emit, to refresh that source instead
    /// * `params` - Flags and per-request overrides
    ///
    /// # Returns
    ///
    /// The handle of the playing source, or `None` if nothing is playing
    /// (sound disabled, unknown slot, no valid variant, pool full of priority sounds).
    pub fn emit_sound(
        &mut self,
        n: usize,
        pos: Vec3,
        owner: Option<EntityId>,
        hook: Option<SourceHandle>,
        params: EmitParams,
    ) -> Option<SourceHandle> {
        if !self.enabled() {
            return None;
        }
        let mut ctx = SourceContext {
            desc: &self.desc,
            slots: &self.slots,
            samples: &self.samples,
            devices: &self.devices,
            zones: &self.zones,
            envs: &self.envs,
            listener: self.listener,
            millis: self.millis,
            rng: &mut self.rng,
            events: &mut self.events,
        };
        self.sources.emit(&mut ctx, n, pos, owner, hook, params)
    }

    pub fn emit_sound_pos(
        &mut self,
        n: usize,
        pos: Vec3,
        hook: Option<SourceHandle>,
        params: EmitParams,
    ) -> Option<SourceHandle> {
        self.emit_sound(n, pos, None, hook, params)
    }

    /// Shorthand trigger: volume 0..=255 and optional radii.
    ///
    /// Without a position the sound plays unattenuated on the listener.
    /// `minrad` and `maxrad` become the reference and maximum distance.
    pub fn play_sound(
        &mut self,
        n: usize,
        pos: Option<Vec3>,
        vol: u8,
        minrad: Option<f32>,
        maxrad: Option<f32>,
        flags: SoundFlags,
    ) -> Option<SourceHandle> {
        if vol == 0 {
            return None;
        }
        let mut params = EmitParams::new(flags).gain(vol as f32 / 255.0);
        params.refdist = minrad;
        params.maxdist = maxrad;
        let pos = match pos {
            Some(pos) => pos,
            None => {
                params.flags.no_atten = true;
                params.flags.no_pan = false;
                params.flags.no_dist = false;
                self.listener.position()
            }
        };
        self.emit_sound(n, pos, None, None, params)
    }

    pub fn source(&self, handle: SourceHandle) -> Option<&SoundSource> {
        self.sources.get(handle)
    }

    pub fn sources(&self) -> &SourceManager {
        &self.sources
    }

    pub fn stop_source(&mut self, handle: SourceHandle) -> bool {
        self.sources.stop_source(handle, &self.devices)
    }

    /// Stop every sound owned by `entity`; call when the entity is destroyed.
    pub fn remove_tracked_sounds(&mut self, entity: EntityId) -> usize {
        self.sources.remove_tracked_sounds(entity, &self.devices)
    }

    pub fn remove_map_sounds(&mut self) -> usize {
        self.sources.remove_map_sounds(&self.devices)
    }

    /// Stop map sounds and unregister every map slot, ahead of loading another level.
    pub fn clear_map_sounds(&mut self) {
        self.remove_map_sounds();
        let mut loader = SampleLoader {
            samples: &mut self.samples,
            decoder: self.decoder.as_ref(),
            devices: &self.devices,
            events: &mut self.events,
        };
        self.slots.clear_map_sounds(&mut loader);
    }

    /// Rebuild every reverb zone from the world. Once per level load.
    pub fn build_env_zones(&mut self, world: &dyn SoundWorld) {
        with_audio_mixer(&self.devices, |m| {
            self.zones.build_env_zones(world, &self.envs, m)
        });
    }

    pub fn update_env_zone(&mut self, entity: &ZoneEntity) {
        self.zones.update_env_zone(entity, &self.envs);
    }

    pub fn remove_env_zone(&mut self, entity: EntityId) {
        with_audio_mixer(&self.devices, |m| self.zones.remove_env_zone(entity, m));
    }

    /// Define a new preset (a copy of the defaults) or return the existing one.
    pub fn add_env(&mut self, name: &str) -> usize {
        self.envs.add_env(name)
    }

    /// Edit one preset property; zones using it re-upload on the next tick.
    pub fn set_env_prop(&mut self, env: &str, prop: &str, value: f32) -> Result<()> {
        self.envs.set_prop(env, prop, value)
    }

    /// Write every preset, then the zones, in a stable human-readable form.
    pub fn dump_sound_envs(&self, out: &mut impl Write) -> std::io::Result<()> {
        self.envs.dump(out)?;
        for (index, zone) in self.zones.zones().iter().enumerate() {
            writeln!(
                out,
                "// zone {} {} env \"{}\"{}{}",
                index,
                zone.entity(),
                zone.env_name(),
                if zone.is_valid() { "" } else { " invalid" },
                if self.zones.active() == Some(index) {
                    " active"
                } else {
                    ""
                }
            )?;
        }
        Ok(())
    }
}

impl Drop for SoundStage {
    fn drop(&mut self) {
        self.stop_sound();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, HeadlessDriver, VoiceState};
    use crate::testing::{MemoryDecoder, TestWorld};

    fn decoder() -> MemoryDecoder {
        MemoryDecoder::new()
            .with_sound("door", 4800, 48000)
            .with_sound("hum", 48000, 48000)
            .with_track("title", 48000, 48000)
            .with_track("level", 48000, 48000)
    }

    fn stage_with(driver: HeadlessDriver, desc: SoundStageDesc) -> SoundStage {
        let desc = desc.rng_seed(7).music_ring(4, 512);
        SoundStage::new(desc, Box::new(driver), Box::new(decoder())).unwrap()
    }

    fn stage() -> SoundStage {
        let mut stage = stage_with(HeadlessDriver::new(), SoundStageDesc::default());
        assert!(stage.init_sound());
        stage
    }

    fn advance(stage: &SoundStage, frames: usize) {
        stage
            .devices()
            .audio()
            .unwrap()
            .with_mixer(|m| m.advance(frames))
            .unwrap();
    }

    #[test]
    fn test_init_without_device_disables_sound() {
        let driver = HeadlessDriver::new().fail_named(true).fail_default(true);
        let mut stage = stage_with(driver, SoundStageDesc::default());
        assert!(!stage.init_sound());
        assert!(!stage.enabled());
        assert!(stage.sound_error().is_some());
        assert!(stage.sound_error().is_none());

        let door = stage.add_sound("door", "door", SlotParams::new(), SlotSetKind::Game);
        assert!(stage.emit_sound(door, Vec3::ZERO, None, None, EmitParams::default()).is_none());
        assert!(!stage.play_music("title", true));
        stage.update_sounds(&TestWorld::new(), 16);
    }

    #[test]
    fn test_fallback_then_emit() {
        let driver = HeadlessDriver::new().fail_named(true);
        let mut stage = stage_with(driver.clone(), SoundStageDesc::default().audio_device("Speakers"));
        assert!(stage.init_sound());
        assert_eq!(driver.attempts(), vec![Some("Speakers".to_string()), None]);
        let door = stage.add_sound("door", "door", SlotParams::new(), SlotSetKind::Game);
        let h = stage.emit_sound(door, Vec3::ZERO, None, None, EmitParams::default());
        assert!(h.is_some());
    }

    #[test]
    fn test_sounds_loaded_before_init_are_uploaded() {
        let mut stage = stage_with(HeadlessDriver::new(), SoundStageDesc::default());
        let door = stage.add_sound("door", "door", SlotParams::new(), SlotSetKind::Game);
        assert!(stage.init_sound());
        let h = stage.emit_sound(door, Vec3::ZERO, None, None, EmitParams::default());
        assert!(h.is_some());
    }

    #[test]
    fn test_tick_plays_and_retires_sources() {
        let mut stage = stage();
        let door = stage.add_sound("door", "door", SlotParams::new(), SlotSetKind::Game);
        let mut world = TestWorld::new();
        world.place(EntityId(1), Vec3::new(100.0, 0.0, 0.0));

        let h = stage
            .emit_sound(door, Vec3::new(100.0, 0.0, 0.0), Some(EntityId(1)), None, EmitParams::default())
            .unwrap();
        stage.update_sounds(&world, 16);
        assert!(stage.source(h).unwrap().playing(stage.devices()));

        advance(&stage, 48000);
        stage.update_sounds(&world, 1016);
        assert!(stage.source(h).is_none());
        let events = stage.poll_events();
        assert!(events.contains(&SoundEvent::SourceStarted { source: h }));
        assert!(events.contains(&SoundEvent::SourceFinished { source: h }));
        assert!(stage.poll_events().is_empty());
    }

    #[test]
    fn test_play_sound_shorthand() {
        let mut stage = stage();
        let door = stage.add_sound("door", "door", SlotParams::new(), SlotSetKind::Game);
        assert!(stage.play_sound(door, None, 0, None, None, SoundFlags::new()).is_none());

        let h = stage
            .play_sound(door, Some(Vec3::new(0.0, 0.0, -40.0)), 255, Some(8.0), Some(400.0), SoundFlags::new())
            .unwrap();
        let source = stage.source(h).unwrap();
        assert_eq!(source.gain(), 1.0);
        assert_eq!((source.final_refdist(), source.final_maxdist()), (8.0, 400.0));

        let ui = stage.play_sound(door, None, 51, None, None, SoundFlags::new()).unwrap();
        let source = stage.source(ui).unwrap();
        assert!(source.flags().no_atten);
        assert!((source.gain() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_music_commands() {
        let mut stage = stage();
        assert!(!stage.play_music("missing", false));
        assert!(stage.sound_error().is_some());

        assert!(stage.play_music("title", true));
        assert!(stage.playing_music());
        assert_eq!(stage.music().unwrap().queued(), 4);
        for tick in 1..50 {
            advance(&stage, 700);
            stage.update_sounds(&TestWorld::new(), tick * 16);
        }
        assert!(stage.playing_music());
        stage.stop_music();
        assert!(!stage.playing_music());
        let stats = stage.devices().audio().unwrap().with_mixer(|m| m.stats()).unwrap();
        assert_eq!((stats.voices, stats.buffers), (0, 0));
    }

    #[test]
    fn test_music_finishes_and_reports() {
        let mut stage = stage();
        assert!(stage.play_music("title", false));
        // 48000 frames through a 2048-frame ring drain in about two dozen ticks.
        for tick in 1..40 {
            advance(&stage, 4096);
            stage.update_sounds(&TestWorld::new(), tick * 100);
        }
        assert!(!stage.playing_music());
        let events = stage.poll_events();
        assert!(events.contains(&SoundEvent::MusicFinished {
            track: "title".to_string()
        }));
    }

    #[test]
    fn test_smart_music_switches_tracks() {
        let mut stage = stage_with(HeadlessDriver::new(), SoundStageDesc::default().smart_music("title"));
        stage.init_sound();
        stage.smart_music(true, true);
        assert_eq!(stage.music().unwrap().name(), "title");
        stage.smart_music(true, false);
        assert_eq!(stage.music().unwrap().name(), "title");
        stage.smart_music(false, false);
        assert!(!stage.playing_music());
        assert!(stage.play_music("level", true));
        stage.smart_music(false, false);
        assert_eq!(stage.music().unwrap().name(), "level");
    }

    #[test]
    fn test_device_loss_cancels_and_reopens() {
        let driver = HeadlessDriver::new();
        let mut stage = stage_with(driver.clone(), SoundStageDesc::default());
        stage.init_sound();
        let hum = stage.add_sound("hum", "hum", SlotParams::new(), SlotSetKind::Game);
        let flags = SoundFlags::new().looping();
        let h = stage
            .emit_sound(hum, Vec3::ZERO, Some(EntityId(2)), None, EmitParams::new(flags))
            .unwrap();
        assert!(stage.play_music("title", true));

        driver.lose_all();
        stage.update_sounds(&TestWorld::new(), 16);
        assert!(stage.source(h).is_none());
        assert!(!stage.playing_music());
        assert!(stage.enabled());
        let events = stage.poll_events();
        assert!(events.contains(&SoundEvent::DeviceLost {
            kind: DeviceKind::Audio
        }));
        assert_eq!(stage.sound_error().as_deref(), Some("audio device lost"));

        // Samples were uploaded to the new device.
        let h = stage
            .emit_sound(hum, Vec3::ZERO, Some(EntityId(2)), None, EmitParams::new(flags))
            .unwrap();
        let voice = stage.source(h).unwrap().voice(DeviceKind::Audio).unwrap();
        let state = stage
            .devices()
            .audio()
            .unwrap()
            .with_mixer(|m| m.voice_state(voice))
            .unwrap();
        assert_eq!(state, VoiceState::Playing);
    }

    #[test]
    fn test_zone_reverb_reaches_sources() {
        let mut stage = stage();
        let hum = stage.add_sound("hum", "hum", SlotParams::new(), SlotSetKind::Game);
        let mut world = TestWorld::new();
        world.zones.push(ZoneEntity::new(
            EntityId(50),
            Vec3::ZERO,
            Vec3::splat(256.0),
            "cave",
        ));
        stage.build_env_zones(&world);

        let flags = SoundFlags::new().looping().no_delay();
        let wet = stage
            .emit_sound(hum, Vec3::X, Some(EntityId(1)), None, EmitParams::new(flags))
            .unwrap();
        let dry = stage
            .emit_sound(hum, Vec3::X, Some(EntityId(2)), None, EmitParams::new(flags.no_env()))
            .unwrap();
        stage.update_sounds(&world, 16);
        assert_eq!(stage.zones().active(), Some(0));

        let send = |stage: &SoundStage, h: SourceHandle| {
            let voice = stage.source(h).unwrap().voice(DeviceKind::Audio).unwrap();
            stage
                .devices()
                .audio()
                .unwrap()
                .with_mixer(|m| m.voice_params(voice).unwrap().send)
                .unwrap()
        };
        assert!(send(&stage, wet).is_some());
        assert!(send(&stage, dry).is_none());
    }

    #[test]
    fn test_map_sounds_lifecycle() {
        let mut stage = stage();
        stage.add_sound("door", "door", SlotParams::new().gain(0.5), SlotSetKind::Map);
        stage.map_sound_slots();
        assert_eq!(stage.get_sound_slot(0), Some(0));
        assert!(stage.map_sound_slot(3, "door"));
        assert!(!stage.map_sound_slot(4, "window"));
        assert_eq!(stage.get_sound_slot(4), None);

        let flags = SoundFlags::new().map();
        assert!(stage.emit_sound_pos(3, Vec3::ZERO, None, EmitParams::new(flags)).is_some());
        stage.clear_map_sounds();
        assert_eq!(stage.sources().active_count(), 0);
        assert_eq!(stage.get_sound_slot(0), None);
        assert!(stage.samples().is_empty());
    }

    #[test]
    fn test_dump_sound_envs_is_stable() {
        let mut stage = stage();
        stage.add_env("a");
        stage.add_env("b");
        stage.set_env_prop("a", "decaytime", 3.0).unwrap();
        stage.set_env_prop("b", "decaytime", 3.0).unwrap();
        assert!(stage.set_env_prop("a", "nonsense", 1.0).is_err());

        let mut first = Vec::new();
        stage.dump_sound_envs(&mut first).unwrap();
        let mut second = Vec::new();
        stage.dump_sound_envs(&mut second).unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        let block = |name: &str| {
            let start = text.find(&format!("soundenv \"{}\" [", name)).unwrap();
            let body = &text[start..];
            let end = body.find(']').unwrap();
            body[body.find('\n').unwrap()..end].to_string()
        };
        assert_eq!(block("a"), block("b"));
    }

    #[test]
    fn test_clear_sound_releases_everything() {
        let mut stage = stage();
        let hum = stage.add_sound("hum", "hum", SlotParams::new(), SlotSetKind::Game);
        stage.emit_sound(hum, Vec3::ZERO, None, None, EmitParams::default());
        stage.play_music("title", true);
        stage.clear_sound();
        assert!(stage.samples().is_empty());
        assert_eq!(stage.sources().active_count(), 0);
        let stats = stage.devices().audio().unwrap().with_mixer(|m| m.stats()).unwrap();
        assert_eq!((stats.voices, stats.buffers, stats.filters), (0, 0, 0));
    }
}

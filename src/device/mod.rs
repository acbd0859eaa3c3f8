//! Audio and haptics output devices.
//!
//! A [`SoundDevice`] pairs a software [`Mixer`] with whatever output the
//! [`DeviceDriver`] attached to it. The [`DeviceManager`] owns the audio device
//! and the optional haptics device, and reopens them when the driver reports
//! that the hardware went away.

mod cpal_driver;
mod headless;
pub mod mixer;

pub use cpal_driver::CpalDriver;
pub use headless::HeadlessDriver;
pub use mixer::{
    BufferId, EffectId, EffectSlotId, FilterId, LowpassParams, Mixer, MixerLimits, MixerStats,
    PcmData, ReverbParams, SharedMixer, VoiceId, VoiceParams, VoiceState,
};

use crate::config::SoundStageDesc;
use crate::error::{Result, SoundStageError};
use crate::events::SoundEvent;
use crossbeam_channel::Receiver;
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Audio,
    Haptics,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Haptics => write!(f, "haptics"),
        }
    }
}

/// Output format and hardware limits a driver opens devices with.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_size: usize,
    pub limits: MixerLimits,
}

impl DeviceConfig {
    pub fn from_desc(desc: &SoundStageDesc, kind: DeviceKind) -> Self {
        Self {
            sample_rate: desc.sample_rate,
            channels: desc.channels,
            block_size: desc.block_size,
            limits: MixerLimits {
                max_voices: desc.max_voices,
                // Haptics devices carry no reverb.
                max_effect_slots: match kind {
                    DeviceKind::Audio => desc.max_effect_slots,
                    DeviceKind::Haptics => 0,
                },
                max_buffer_bytes: desc.max_buffer_bytes,
            },
        }
    }
}

/// A device a driver managed to open.
pub struct OpenedDevice {
    pub name: String,
    pub mixer: SharedMixer,
    /// Keeps the output stream alive; dropping it stops output
    pub stream: Option<Box<dyn Any>>,
    /// Fires when the driver notices the hardware disappeared
    pub lost: Option<Receiver<()>>,
}

/// Opens output devices. `name == None` targets the platform default.
pub trait DeviceDriver {
    fn open(&self, name: Option<&str>, kind: DeviceKind, config: &DeviceConfig)
    -> Result<OpenedDevice>;
}

pub struct SoundDevice {
    kind: DeviceKind,
    name: String,
    mixer: Option<SharedMixer>,
    stream: Option<Box<dyn Any>>,
    lost: Option<Receiver<()>>,
}

impl std::fmt::Debug for SoundDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundDevice")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("open", &self.mixer.is_some())
            .finish()
    }
}

impl SoundDevice {
    /// Open a device, retrying once with the platform default when `fallback` is set.
    pub fn setup(
        driver: &dyn DeviceDriver,
        name: Option<&str>,
        kind: DeviceKind,
        config: &DeviceConfig,
        fallback: bool,
    ) -> Result<Self> {
        let opened = match driver.open(name, kind, config) {
            Ok(opened) => opened,
            Err(err) if fallback && name.is_some() => {
                log::warn!(
                    "Failed to open {} device {:?} ({}), trying default",
                    kind,
                    name,
                    err
                );
                driver.open(None, kind, config)?
            }
            Err(err) => return Err(err),
        };
        log::info!("Opened {} device '{}'", kind, opened.name);
        Ok(Self {
            kind,
            name: opened.name,
            mixer: Some(opened.mixer),
            stream: opened.stream,
            lost: opened.lost,
        })
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.mixer.is_some()
    }

    pub fn mixer(&self) -> Option<&SharedMixer> {
        self.mixer.as_ref()
    }

    /// Run `f` against the locked mixer, or return None once destroyed.
    pub fn with_mixer<R>(&self, f: impl FnOnce(&mut Mixer) -> R) -> Option<R> {
        self.mixer.as_ref().map(|m| f(&mut m.lock()))
    }

    /// Hold voice parameter changes until [`SoundDevice::push`].
    pub fn suspend(&self) {
        self.with_mixer(|m| m.suspend());
    }

    pub fn push(&self) {
        self.with_mixer(|m| m.process());
    }

    /// True once the driver has reported the hardware gone.
    pub fn is_lost(&self) -> bool {
        self.lost.as_ref().is_some_and(|rx| rx.try_recv().is_ok())
    }

    pub fn destroy(&mut self) {
        if self.mixer.is_none() {
            return;
        }
        self.stream = None;
        self.mixer = None;
        self.lost = None;
        log::info!("Closed {} device '{}'", self.kind, self.name);
    }
}

impl Drop for SoundDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Owns the devices a [`SoundStage`](crate::SoundStage) renders to.
pub struct DeviceManager {
    driver: Box<dyn DeviceDriver>,
    audio: Option<SoundDevice>,
    haptics: Option<SoundDevice>,
    current: Option<DeviceKind>,
}

impl DeviceManager {
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            driver,
            audio: None,
            haptics: None,
            current: None,
        }
    }

    /// Open the configured devices. Returns false when no audio device could be opened.
    pub fn open(&mut self, desc: &SoundStageDesc, events: &mut Vec<SoundEvent>) -> bool {
        self.destroy();
        self.audio = self.open_one(
            desc.audio_device.as_deref(),
            DeviceKind::Audio,
            desc,
            events,
        );
        if let Some(name) = desc.haptics_device.as_deref() {
            self.haptics = self.open_one(Some(name), DeviceKind::Haptics, desc, events);
        }
        self.audio.is_some()
    }

    fn open_one(
        &self,
        name: Option<&str>,
        kind: DeviceKind,
        desc: &SoundStageDesc,
        events: &mut Vec<SoundEvent>,
    ) -> Option<SoundDevice> {
        let config = DeviceConfig::from_desc(desc, kind);
        // Haptics never fall back to the default output.
        let fallback = desc.fallback && kind == DeviceKind::Audio;
        match SoundDevice::setup(self.driver.as_ref(), name, kind, &config, fallback) {
            Ok(device) => {
                events.push(SoundEvent::DeviceOpened {
                    kind,
                    name: device.name().to_string(),
                });
                Some(device)
            }
            Err(err) => {
                log::error!("Could not open {} device: {}", kind, err);
                events.push(SoundEvent::DeviceOpenFailed {
                    kind,
                    error: err.to_string(),
                });
                None
            }
        }
    }

    pub fn device(&self, kind: DeviceKind) -> Option<&SoundDevice> {
        match kind {
            DeviceKind::Audio => self.audio.as_ref(),
            DeviceKind::Haptics => self.haptics.as_ref(),
        }
    }

    /// Make `kind` the device subsequent calls target.
    pub fn current(&mut self, kind: DeviceKind) -> Option<&SoundDevice> {
        if self.current != Some(kind) {
            self.current = Some(kind);
        }
        self.device(kind)
    }

    pub fn current_kind(&self) -> Option<DeviceKind> {
        self.current
    }

    pub fn audio(&self) -> Option<&SoundDevice> {
        self.audio.as_ref()
    }

    pub fn haptics(&self) -> Option<&SoundDevice> {
        self.haptics.as_ref()
    }

    pub fn devices(&self) -> impl Iterator<Item = &SoundDevice> {
        self.audio.iter().chain(self.haptics.iter())
    }

    pub fn suspend_all(&self) {
        for device in self.devices() {
            device.suspend();
        }
    }

    pub fn push_all(&self) {
        for device in self.devices() {
            device.push();
        }
    }

    /// Poll for lost devices; returns every kind that was lost this tick.
    pub fn check(&mut self, events: &mut Vec<SoundEvent>) -> Vec<DeviceKind> {
        let mut lost = Vec::new();
        for slot in [&mut self.audio, &mut self.haptics] {
            if let Some(device) = slot {
                if device.is_lost() {
                    log::error!("{} device '{}' lost", device.kind(), device.name());
                    events.push(SoundEvent::DeviceLost {
                        kind: device.kind(),
                    });
                    lost.push(device.kind());
                    *slot = None;
                }
            }
        }
        lost
    }

    /// Reopen devices after loss.
    pub fn reopen(&mut self, desc: &SoundStageDesc, events: &mut Vec<SoundEvent>) -> bool {
        log::info!("Reopening sound devices");
        self.open(desc, events)
    }

    pub fn destroy(&mut self) {
        self.audio = None;
        self.haptics = None;
        self.current = None;
    }
}

pub(crate) fn open_error(kind: DeviceKind, name: Option<&str>, reason: impl std::fmt::Display) -> SoundStageError {
    SoundStageError::DeviceOpen(format!(
        "{} device {}: {}",
        kind,
        name.unwrap_or("<default>"),
        reason
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig::from_desc(&SoundStageDesc::default(), DeviceKind::Audio)
    }

    #[test]
    fn test_fallback_tries_default_before_failing() {
        let driver = HeadlessDriver::new().fail_named(true);
        let device =
            SoundDevice::setup(&driver, Some("Speakers"), DeviceKind::Audio, &config(), true)
                .unwrap();
        assert_eq!(
            driver.attempts(),
            vec![Some("Speakers".to_string()), None]
        );
        assert!(device.is_open());
    }

    #[test]
    fn test_open_failure_without_fallback() {
        let driver = HeadlessDriver::new().fail_named(true);
        let result = SoundDevice::setup(&driver, Some("Speakers"), DeviceKind::Audio, &config(), false);
        assert!(matches!(result, Err(SoundStageError::DeviceOpen(_))));
        assert_eq!(driver.attempts().len(), 1);
    }

    #[test]
    fn test_fallback_exhausted_reports_device_open() {
        let driver = HeadlessDriver::new().fail_named(true).fail_default(true);
        let result = SoundDevice::setup(&driver, Some("Speakers"), DeviceKind::Audio, &config(), true);
        assert!(matches!(result, Err(SoundStageError::DeviceOpen(_))));
        assert_eq!(driver.attempts().len(), 2);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let driver = HeadlessDriver::new();
        let mut device =
            SoundDevice::setup(&driver, None, DeviceKind::Audio, &config(), true).unwrap();
        device.destroy();
        device.destroy();
        assert!(!device.is_open());
        assert!(device.with_mixer(|m| m.stats()).is_none());
    }

    #[test]
    fn test_manager_detects_lost_device() {
        let driver = HeadlessDriver::new();
        let handle = driver.clone();
        let mut manager = DeviceManager::new(Box::new(driver));
        let mut events = Vec::new();
        assert!(manager.open(&SoundStageDesc::default(), &mut events));
        assert!(manager.check(&mut events).is_empty());

        handle.lose_all();
        assert_eq!(manager.check(&mut events), vec![DeviceKind::Audio]);
        assert!(manager.audio().is_none());
        assert!(events.contains(&SoundEvent::DeviceLost {
            kind: DeviceKind::Audio
        }));
    }

    #[test]
    fn test_missing_haptics_leaves_audio_running() {
        let driver = HeadlessDriver::new().fail_named(true);
        let mut manager = DeviceManager::new(Box::new(driver));
        let mut events = Vec::new();
        let desc = SoundStageDesc::default().haptics_device("Pad");
        assert!(manager.open(&desc, &mut events));
        assert!(manager.haptics().is_none());
        assert_eq!(manager.devices().count(), 1);
        assert!(manager.current(DeviceKind::Audio).is_some());
        assert_eq!(manager.current_kind(), Some(DeviceKind::Audio));
    }
}

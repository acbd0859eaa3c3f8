//! Decoded sound samples and the name-keyed cache that owns them.

use crate::audio_data::{AssetDecoder, MixType, SampleKind, SoundFile};
use crate::device::{BufferId, DeviceKind, DeviceManager, Mixer};
use crate::error::{Result, SoundStageError};
use crate::events::SoundEvent;
use std::collections::HashMap;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SampleId(usize);

impl SampleId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleState {
    Ready,
    DecodeFailed,
    UploadFailed,
}

#[derive(Debug)]
pub struct SoundSample {
    name: String,
    state: SampleState,
    file: Option<SoundFile>,
    buffers: Vec<(DeviceKind, BufferId)>,
    refs: usize,
}

impl SoundSample {
    /// Upload decoded PCM into a device buffer, converting to the device rate if asked.
    pub fn setup(file: &SoundFile, mixer: &mut Mixer, resample: bool) -> Result<BufferId> {
        let converted;
        let file = if resample && file.sample_rate() != mixer.sample_rate() {
            converted = file
                .resample(mixer.sample_rate())
                .map_err(|e| SoundStageError::BufferUpload(e.to_string()))?;
            &converted
        } else {
            file
        };
        mixer.create_buffer(file.to_pcm())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SampleState {
        self.state
    }

    pub fn valid(&self) -> bool {
        self.state == SampleState::Ready
    }

    pub fn file(&self) -> Option<&SoundFile> {
        self.file.as_ref()
    }

    pub fn buffer(&self, kind: DeviceKind) -> Option<BufferId> {
        self.buffers
            .iter()
            .find_map(|(k, b)| (*k == kind).then_some(*b))
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    fn cleanup(&mut self, devices: &DeviceManager) {
        for (kind, buffer) in self.buffers.drain(..) {
            if let Some(device) = devices.device(kind) {
                device.with_mixer(|m| m.delete_buffer(buffer));
            }
        }
    }
}

/// Cache of samples by name, reference counted by the slots using them.
///
/// Failed samples stay cached so the same bad asset is never decoded twice.
#[derive(Debug)]
pub struct SampleStore {
    kind: SampleKind,
    resample: bool,
    samples: Vec<Option<SoundSample>>,
    by_name: HashMap<String, SampleId>,
}

impl SampleStore {
    pub fn new(kind: SampleKind, resample: bool) -> Self {
        Self {
            kind,
            resample,
            samples: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Find or decode `name`, taking one reference on it.
    pub fn load(
        &mut self,
        name: &str,
        mix: MixType,
        decoder: &dyn AssetDecoder,
        devices: &DeviceManager,
        events: &mut Vec<SoundEvent>,
    ) -> SampleId {
        if let Some(&id) = self.by_name.get(name) {
            if let Some(sample) = self.samples[id.0].as_mut() {
                sample.refs += 1;
            }
            return id;
        }

        let mut sample = SoundSample {
            name: name.to_string(),
            state: SampleState::Ready,
            file: None,
            buffers: Vec::new(),
            refs: 1,
        };
        match decoder.decode(name, self.kind, mix) {
            Ok(file) => {
                sample.file = Some(file);
                if let Err(err) = self.upload(&mut sample, devices) {
                    log::warn!("Failed to upload sound '{}': {}", name, err);
                    events.push(SoundEvent::AssetFailed {
                        name: name.to_string(),
                        error: err.to_string(),
                    });
                    sample.cleanup(devices);
                    sample.state = SampleState::UploadFailed;
                }
            }
            Err(err) => {
                log::warn!("Failed to decode sound '{}': {}", name, err);
                events.push(SoundEvent::AssetFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                });
                sample.state = SampleState::DecodeFailed;
            }
        }

        let id = match self.samples.iter().position(Option::is_none) {
            Some(index) => {
                self.samples[index] = Some(sample);
                SampleId(index)
            }
            None => {
                self.samples.push(Some(sample));
                SampleId(self.samples.len() - 1)
            }
        };
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Only an audio failure fails the sample; haptics just goes without it.
    fn upload(&self, sample: &mut SoundSample, devices: &DeviceManager) -> Result<()> {
        let Some(file) = sample.file.as_ref() else {
            return Ok(());
        };
        for device in devices.devices() {
            let Some(result) =
                device.with_mixer(|m| SoundSample::setup(file, m, self.resample))
            else {
                continue;
            };
            match result {
                Ok(buffer) => sample.buffers.push((device.kind(), buffer)),
                Err(err) if device.kind() == DeviceKind::Haptics => {
                    log::warn!("Skipping haptics buffer for '{}': {}", sample.name, err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Drop one reference; the device buffers go with the last one.
    pub fn release(&mut self, id: SampleId, devices: &DeviceManager) {
        let Some(sample) = self.samples.get_mut(id.0).and_then(Option::as_mut) else {
            return;
        };
        sample.refs = sample.refs.saturating_sub(1);
        if sample.refs > 0 || !sample.valid() {
            return;
        }
        sample.cleanup(devices);
        log::debug!("Freed sound '{}'", sample.name);
        self.by_name.remove(&sample.name);
        self.samples[id.0] = None;
    }

    pub fn get(&self, id: SampleId) -> Option<&SoundSample> {
        self.samples.get(id.0)?.as_ref()
    }

    pub fn find(&self, name: &str) -> Option<SampleId> {
        self.by_name.get(name).copied()
    }

    pub fn valid(&self, id: SampleId) -> bool {
        self.get(id).is_some_and(SoundSample::valid)
    }

    pub fn buffer(&self, id: SampleId, kind: DeviceKind) -> Option<BufferId> {
        self.get(id).filter(|s| s.valid())?.buffer(kind)
    }

    pub fn len(&self) -> usize {
        self.samples.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upload every ready sample again after devices were reopened.
    pub fn reupload(&mut self, devices: &DeviceManager, events: &mut Vec<SoundEvent>) {
        let mut samples = std::mem::take(&mut self.samples);
        for sample in samples.iter_mut().flatten() {
            sample.buffers.clear();
            if !sample.valid() {
                continue;
            }
            if let Err(err) = self.upload(sample, devices) {
                log::warn!("Failed to re-upload sound '{}': {}", sample.name, err);
                events.push(SoundEvent::AssetFailed {
                    name: sample.name.clone(),
                    error: err.to_string(),
                });
                sample.cleanup(devices);
                sample.state = SampleState::UploadFailed;
            }
        }
        self.samples = samples;
    }

    /// Free every sample regardless of references.
    pub fn clear(&mut self, devices: &DeviceManager) {
        for sample in self.samples.iter_mut().flatten() {
            sample.cleanup(devices);
        }
        self.samples.clear();
        self.by_name.clear();
    }
}

/// Everything a sample load touches, borrowed together.
pub struct SampleLoader<'a> {
    pub samples: &'a mut SampleStore,
    pub decoder: &'a dyn AssetDecoder,
    pub devices: &'a DeviceManager,
    pub events: &'a mut Vec<SoundEvent>,
}

impl SampleLoader<'_> {
    pub fn load(&mut self, name: &str, mix: MixType) -> SampleId {
        self.samples
            .load(name, mix, self.decoder, self.devices, self.events)
    }

    pub fn release(&mut self, id: SampleId) {
        self.samples.release(id, self.devices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoundStageDesc;
    use crate::device::{HeadlessDriver, PcmData};
    use crate::testing::MemoryDecoder;

    fn devices(desc: &SoundStageDesc) -> DeviceManager {
        let mut manager = DeviceManager::new(Box::new(HeadlessDriver::new()));
        manager.open(desc, &mut Vec::new());
        manager
    }

    #[test]
    fn test_cache_and_refcount() {
        let desc = SoundStageDesc::default();
        let devices = devices(&desc);
        let decoder = MemoryDecoder::new().with_sound("boom", 480, 48000);
        let mut store = SampleStore::new(SampleKind::Short, false);
        let mut events = Vec::new();

        let a = store.load("boom", MixType::Mono, &decoder, &devices, &mut events);
        let b = store.load("boom", MixType::Mono, &decoder, &devices, &mut events);
        assert_eq!(a, b);
        assert_eq!(decoder.decodes().len(), 1);
        assert_eq!(store.get(a).unwrap().refs(), 2);
        assert!(store.buffer(a, DeviceKind::Audio).is_some());

        store.release(a, &devices);
        assert!(store.valid(a));
        store.release(a, &devices);
        assert!(store.get(a).is_none());
        let stats = devices.audio().unwrap().with_mixer(|m| m.stats()).unwrap();
        assert_eq!(stats.buffers, 0);
    }

    #[test]
    fn test_decode_failure_not_retried() {
        let desc = SoundStageDesc::default();
        let devices = devices(&desc);
        let decoder = MemoryDecoder::new();
        let mut store = SampleStore::new(SampleKind::Short, false);
        let mut events = Vec::new();

        let id = store.load("missing", MixType::Mono, &decoder, &devices, &mut events);
        assert_eq!(store.get(id).unwrap().state(), SampleState::DecodeFailed);
        assert!(store.buffer(id, DeviceKind::Audio).is_none());
        store.load("missing", MixType::Mono, &decoder, &devices, &mut events);
        assert_eq!(decoder.decodes().len(), 1);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_upload_failure_is_distinct() {
        let desc = SoundStageDesc::default().max_buffer_bytes(64);
        let devices = devices(&desc);
        let decoder = MemoryDecoder::new().with_sound("huge", 4800, 48000);
        let mut store = SampleStore::new(SampleKind::Float, false);
        let mut events = Vec::new();

        let id = store.load("huge", MixType::Mono, &decoder, &devices, &mut events);
        assert_eq!(store.get(id).unwrap().state(), SampleState::UploadFailed);
        assert!(matches!(events[0], SoundEvent::AssetFailed { .. }));
    }

    #[test]
    fn test_haptics_upload_failure_keeps_audio() {
        let desc = SoundStageDesc::default()
            .max_buffer_bytes(4800 * 4)
            .haptics_device("pad");
        let devices = devices(&desc);
        let haptics = devices.haptics().unwrap();
        haptics
            .with_mixer(|m| {
                m.create_buffer(PcmData {
                    samples: vec![0.0; 16],
                    channels: 1,
                    sample_rate: 48000,
                })
            })
            .unwrap()
            .unwrap();

        let decoder = MemoryDecoder::new().with_sound("rumble", 4800, 48000);
        let mut store = SampleStore::new(SampleKind::Float, false);
        let mut events = Vec::new();
        let id = store.load("rumble", MixType::Mono, &decoder, &devices, &mut events);

        assert!(store.valid(id));
        assert!(store.buffer(id, DeviceKind::Audio).is_some());
        assert!(store.buffer(id, DeviceKind::Haptics).is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn test_upload_resamples_to_device_rate() {
        let desc = SoundStageDesc::default();
        let devices = devices(&desc);
        let decoder = MemoryDecoder::new().with_sound("hum", 2205, 22050);
        let mut store = SampleStore::new(SampleKind::Float, true);
        let id = store.load("hum", MixType::Mono, &decoder, &devices, &mut Vec::new());
        assert!(store.valid(id));
        let bytes = devices
            .audio()
            .unwrap()
            .with_mixer(|m| m.stats().buffer_bytes)
            .unwrap();
        // 0.1s of mono audio at 48kHz
        assert_eq!(bytes, 4800 * 4);
    }
}

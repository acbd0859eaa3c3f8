//! Streamed background music.
//!
//! A track is decoded a chunk at a time into a small ring of device buffers
//! queued on one listener-relative voice. Only buffers the mixer reports as
//! processed are refilled, so a buffer is never rewritten while it can still
//! be heard.

use crate::audio_data::{DecodeStream, FillStatus, TrackTags, check_layout};
use crate::device::{BufferId, Mixer, PcmData, VoiceId, VoiceParams, VoiceState};
use crate::error::{Result, SoundStageError};
use crate::events::SoundEvent;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingState {
    Free,
    Queued,
}

/// What a tick of the streamer left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicStatus {
    Playing,
    /// Waiting on the decoder with nothing left queued
    Starved,
    Finished,
}

pub struct MusicStream {
    name: String,
    tags: TrackTags,
    stream: Box<dyn DecodeStream>,
    voice: VoiceId,
    ring: Vec<(BufferId, RingState)>,
    /// Ring indices waiting for data, oldest first
    free: VecDeque<usize>,
    chunk_frames: usize,
    scratch: Vec<f32>,
    gain: f32,
    looping: bool,
    exhausted: bool,
}

impl std::fmt::Debug for MusicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MusicStream")
            .field("name", &self.name)
            .field("voice", &self.voice)
            .field("queued", &self.queued())
            .field("looping", &self.looping)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl MusicStream {
    /// Allocate the voice and buffer ring for `stream`. Nothing is decoded yet.
    pub fn setup(
        name: &str,
        stream: Box<dyn DecodeStream>,
        buffers: usize,
        chunk_frames: usize,
        looping: bool,
        mixer: &mut Mixer,
    ) -> Result<Self> {
        check_layout(name, stream.sample_rate(), stream.channels())?;
        let voice = mixer.create_voice()?;
        let mut ring = Vec::with_capacity(buffers);
        for _ in 0..buffers {
            let empty = PcmData {
                samples: Vec::new(),
                channels: stream.channels(),
                sample_rate: stream.sample_rate(),
            };
            match mixer.create_buffer(empty) {
                Ok(id) => ring.push((id, RingState::Free)),
                Err(err) => {
                    for (id, _) in ring {
                        mixer.delete_buffer(id);
                    }
                    mixer.delete_voice(voice);
                    return Err(err);
                }
            }
        }
        let scratch = vec![0.0; chunk_frames * stream.channels() as usize];
        Ok(Self {
            name: name.to_string(),
            tags: stream.tags(),
            stream,
            voice,
            free: (0..ring.len()).collect(),
            ring,
            chunk_frames,
            scratch,
            gain: 1.0,
            looping,
            exhausted: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &TrackTags {
        &self.tags
    }

    pub fn looping(&self) -> bool {
        self.looping
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Ring buffers currently handed to the mixer.
    pub fn queued(&self) -> usize {
        self.ring
            .iter()
            .filter(|(_, s)| *s == RingState::Queued)
            .count()
    }

    pub fn playing(&self, mixer: &Mixer) -> bool {
        mixer.voice_state(self.voice) == VoiceState::Playing
    }

    pub fn set_gain(&mut self, gain: f32, mixer: &mut Mixer) {
        self.gain = gain;
        mixer.set_voice(self.voice, VoiceParams::ambient(gain));
    }

    /// Prime every ring buffer, then start the voice.
    pub fn play(&mut self, gain: f32, mixer: &mut Mixer) -> Result<()> {
        self.set_gain(gain, mixer);
        self.refill(mixer, None);
        if self.queued() == 0 {
            return Err(SoundStageError::StreamUnderrun(format!(
                "{}: no audio decoded",
                self.name
            )));
        }
        mixer.play_voice(self.voice);
        log::info!("Playing music '{}'", self.name);
        Ok(())
    }

    /// Recycle processed buffers and keep the voice fed.
    pub fn update(&mut self, mixer: &mut Mixer, events: &mut Vec<SoundEvent>) -> MusicStatus {
        for id in mixer.unqueue_processed(self.voice) {
            let Some(index) = self.ring.iter().position(|(b, _)| *b == id) else {
                continue;
            };
            if self.ring[index].1 == RingState::Queued {
                self.ring[index].1 = RingState::Free;
                self.free.push_back(index);
            }
        }

        let stalled = self.refill(mixer, Some(events));
        let queued = self.queued();
        if queued == 0 {
            if self.exhausted {
                log::info!("Music '{}' finished", self.name);
                return MusicStatus::Finished;
            }
            if stalled {
                return MusicStatus::Starved;
            }
        }
        if queued > 0 && !self.playing(mixer) {
            log::debug!("Restarting starved music voice for '{}'", self.name);
            mixer.play_voice(self.voice);
        }
        MusicStatus::Playing
    }

    /// Fill free buffers in release order. True if the decoder had nothing ready.
    fn refill(&mut self, mixer: &mut Mixer, mut events: Option<&mut Vec<SoundEvent>>) -> bool {
        while let Some(&index) = self.free.front() {
            if self.exhausted {
                break;
            }
            match self.fill(index, mixer) {
                Ok(FillStatus::Filled(_)) => {
                    self.free.pop_front();
                }
                Ok(FillStatus::Pending) => {
                    log::warn!("Music '{}' underrun", self.name);
                    if let Some(events) = events.as_deref_mut() {
                        events.push(SoundEvent::StreamUnderrun {
                            track: self.name.clone(),
                        });
                    }
                    return true;
                }
                Ok(FillStatus::Exhausted) => {
                    self.exhausted = true;
                }
                Err(err) => {
                    log::warn!("Music '{}' stopped decoding: {}", self.name, err);
                    self.exhausted = true;
                }
            }
        }
        false
    }

    /// Decode one chunk into ring buffer `index` and queue it.
    fn fill(&mut self, index: usize, mixer: &mut Mixer) -> Result<FillStatus> {
        let mut status = self.stream.fill(&mut self.scratch);
        if status == FillStatus::Exhausted && self.looping {
            self.stream.rewind()?;
            status = self.stream.fill(&mut self.scratch);
        }
        let FillStatus::Filled(frames) = status else {
            return Ok(status);
        };
        let channels = self.stream.channels();
        let (id, _) = self.ring[index];
        mixer.buffer_data(
            id,
            PcmData {
                samples: self.scratch[..frames * channels as usize].to_vec(),
                channels,
                sample_rate: self.stream.sample_rate(),
            },
        )?;
        mixer.queue_buffer(self.voice, id)?;
        self.ring[index].1 = RingState::Queued;
        Ok(status)
    }

    /// Stop playback and free the voice and ring.
    pub fn cleanup(self, mixer: &mut Mixer) {
        mixer.stop_voice(self.voice);
        mixer.delete_voice(self.voice);
        for (id, _) in self.ring {
            mixer.delete_buffer(id);
        }
    }
}

/// What the music policy wants done this call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicAction {
    Keep,
    Play(String),
    Stop,
}

/// Switches between a designated track and silence as a condition toggles.
///
/// Repeating the same condition never restarts or stops music, so a track
/// started some other way survives until the condition actually flips.
#[derive(Debug, Clone, Default)]
pub struct SmartMusic {
    last: Option<bool>,
}

impl SmartMusic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(
        &mut self,
        cond: bool,
        init: bool,
        track: Option<&str>,
        playing: Option<&str>,
    ) -> MusicAction {
        let changed = init || self.last != Some(cond);
        self.last = Some(cond);
        match (cond, track) {
            (true, Some(track)) => {
                if playing == Some(track) || (!changed && playing.is_some()) {
                    MusicAction::Keep
                } else {
                    MusicAction::Play(track.to_string())
                }
            }
            (true, None) => MusicAction::Keep,
            (false, _) if changed && playing.is_some() => MusicAction::Stop,
            (false, _) => MusicAction::Keep,
        }
    }
}

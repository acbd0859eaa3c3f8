use super::{
    AssetDecoder, DecodeStream, FillStatus, MixType, SampleKind, SoundFile, TrackTags, apply_mix,
    check_layout,
};
use crate::error::{Result, SoundStageError};
use std::fs::File;
use std::path::{Path, PathBuf};
use symphonia::{
    core::{
        audio::SampleBuffer,
        codecs::{Decoder, DecoderOptions},
        errors::Error,
        formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
        io::MediaSourceStream,
        meta::{MetadataOptions, MetadataRevision, StandardTagKey},
        probe::Hint,
    },
    default::{get_codecs, get_probe},
};

const EXTENSIONS: [&str; 4] = ["ogg", "wav", "flac", "mp3"];

/// Decodes assets from files under a root directory.
///
/// Names are relative to the root; without an extension each of `ogg`, `wav`,
/// `flac` and `mp3` is tried in turn.
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    root: PathBuf,
}

impl SymphoniaDecoder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        if path.extension().is_some() && path.is_file() {
            return Ok(path);
        }
        EXTENSIONS
            .iter()
            .map(|ext| PathBuf::from(format!("{}.{}", path.display(), ext)))
            .find(|p| p.is_file())
            .ok_or_else(|| SoundStageError::decode(name, "file not found"))
    }
}

impl AssetDecoder for SymphoniaDecoder {
    fn decode(&self, name: &str, kind: SampleKind, mix: MixType) -> Result<SoundFile> {
        let mut stream = SymphoniaStream::open(name, &self.resolve(name)?)?;
        let channels = stream.channels as usize;
        let mut samples = Vec::new();
        let mut chunk = vec![0.0f32; 4096 * channels];
        loop {
            match stream.fill(&mut chunk) {
                FillStatus::Filled(frames) => {
                    samples.extend_from_slice(&chunk[..frames * channels]);
                }
                FillStatus::Pending => continue,
                FillStatus::Exhausted => break,
            }
        }
        if let Some(err) = stream.error.take() {
            return Err(SoundStageError::decode(name, err));
        }
        if samples.is_empty() {
            return Err(SoundStageError::decode(name, "no audio frames"));
        }
        let file = SoundFile::new(samples, stream.sample_rate, stream.channels, kind);
        Ok(apply_mix(file, mix))
    }

    fn open_stream(&self, name: &str) -> Result<Box<dyn DecodeStream>> {
        Ok(Box::new(SymphoniaStream::open(name, &self.resolve(name)?)?))
    }
}

/// Incremental packet decoder over one audio file.
pub struct SymphoniaStream {
    name: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    pending: Vec<f32>,
    cursor: usize,
    tags: TrackTags,
    finished: bool,
    error: Option<String>,
}

impl SymphoniaStream {
    pub fn open(name: &str, path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| SoundStageError::decode(name, format!("failed to probe format: {}", e)))?;

        let mut format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| SoundStageError::decode(name, "no default audio track"))?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| SoundStageError::decode(name, "sample rate not found"))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| SoundStageError::decode(name, "channel count not found"))?
            .count() as u16;
        check_layout(name, sample_rate, channels)?;

        let decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| SoundStageError::decode(name, format!("failed to create decoder: {}", e)))?;

        // Container tags win over tags found while probing (e.g. ID3 ahead of the stream).
        let mut tags = TrackTags::default();
        if let Some(rev) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            read_tags(rev, &mut tags);
        }
        if let Some(rev) = format.metadata().current() {
            read_tags(rev, &mut tags);
        }

        Ok(Self {
            name: name.to_string(),
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            pending: Vec::new(),
            cursor: 0,
            tags,
            finished: false,
            error: None,
        })
    }

    /// Decode the next packet of our track into `pending`. False at end of stream.
    fn decode_packet(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => return false,
                Err(e) => {
                    self.error = Some(format!("error reading packet: {}", e));
                    return false;
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => return false,
                Err(Error::DecodeError(e)) => {
                    log::warn!("{}: skipping corrupt packet: {}", self.name, e);
                    continue;
                }
                Err(e) => {
                    self.error = Some(format!("error decoding packet: {}", e));
                    return false;
                }
            };

            let spec = *decoded.spec();
            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buffer.copy_interleaved_ref(decoded);
            self.pending.clear();
            self.pending.extend_from_slice(buffer.samples());
            self.cursor = 0;
            return true;
        }
    }
}

impl DecodeStream for SymphoniaStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn fill(&mut self, out: &mut [f32]) -> FillStatus {
        let channels = self.channels as usize;
        let wanted = out.len() / channels * channels;
        let mut written = 0;
        while written < wanted {
            if self.cursor >= self.pending.len() {
                if self.finished || !self.decode_packet() {
                    self.finished = true;
                    break;
                }
                continue;
            }
            let n = (self.pending.len() - self.cursor).min(wanted - written);
            out[written..written + n]
                .copy_from_slice(&self.pending[self.cursor..self.cursor + n]);
            self.cursor += n;
            written += n;
        }
        match written / channels {
            0 => FillStatus::Exhausted,
            frames => FillStatus::Filled(frames),
        }
    }

    fn rewind(&mut self) -> Result<()> {
        self.format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: 0,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| SoundStageError::decode(&self.name, format!("seek failed: {}", e)))?;
        self.decoder.reset();
        self.pending.clear();
        self.cursor = 0;
        self.finished = false;
        Ok(())
    }

    fn tags(&self) -> TrackTags {
        self.tags.clone()
    }
}

fn read_tags(rev: &MetadataRevision, tags: &mut TrackTags) {
    for tag in rev.tags() {
        let slot = match tag.std_key {
            Some(StandardTagKey::Artist) => &mut tags.artist,
            Some(StandardTagKey::TrackTitle) => &mut tags.title,
            Some(StandardTagKey::Album) => &mut tags.album,
            _ => continue,
        };
        *slot = Some(tag.value.to_string());
    }
}

//! Error types for soundstage

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SoundStageError {
    #[error("Device open error: {0}")]
    DeviceOpen(String),

    #[error("Asset decode error: {name}: {reason}")]
    AssetDecode { name: String, reason: String },

    #[error("Buffer upload error: {0}")]
    BufferUpload(String),

    #[error("Device resource exhausted: {0}")]
    DeviceResource(String),

    #[error("Stream underrun: {0}")]
    StreamUnderrun(String),

    #[error("Effect slot pool exhausted ({0} slots)")]
    ZoneResourceExhausted(usize),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SoundStageError {
    pub(crate) fn decode(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::AssetDecode {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Device and asset failures degrade to silence; everything else is a caller mistake.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidSource(_) | Self::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, SoundStageError>;

//! Event types for soundstage
//!
//! Everything the tick handles locally (device loss, decode failures, underruns)
//! is reported here instead of being returned as an error.

use crate::device::DeviceKind;
use crate::source::SourceHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum SoundEvent {
    DeviceOpened {
        kind: DeviceKind,
        name: String,
    },
    DeviceOpenFailed {
        kind: DeviceKind,
        error: String,
    },
    DeviceLost {
        kind: DeviceKind,
    },
    SourceStarted {
        source: SourceHandle,
    },
    SourceFinished {
        source: SourceHandle,
    },
    SourceEvicted {
        source: SourceHandle,
    },
    AssetFailed {
        name: String,
        error: String,
    },
    StreamUnderrun {
        track: String,
    },
    MusicStarted {
        track: String,
    },
    MusicFinished {
        track: String,
    },
    ZoneChanged {
        from: Option<usize>,
        to: Option<usize>,
    },
}

impl SoundEvent {
    pub fn source(&self) -> Option<SourceHandle> {
        match self {
            Self::SourceStarted { source }
            | Self::SourceFinished { source }
            | Self::SourceEvicted { source } => Some(*source),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::DeviceOpenFailed { .. }
                | Self::DeviceLost { .. }
                | Self::AssetFailed { .. }
                | Self::StreamUnderrun { .. }
        )
    }
}

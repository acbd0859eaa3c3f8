use crate::error::{Result, SoundStageError};

/// Per-emit behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoundFlags {
    /// Play at full volume regardless of distance, centred on the listener
    pub no_atten: bool,
    /// Start immediately instead of after the sound's travel time
    pub no_delay: bool,
    /// May evict other priority sounds when the pool is full; never evicted by normal ones
    pub priority: bool,
    /// Distance attenuation only, heard straight ahead
    pub no_pan: bool,
    /// Panning only, no distance attenuation
    pub no_dist: bool,
    /// Ignore the active reverb zone
    pub no_env: bool,
    /// The emit gain is the minimum the voice is clamped to
    pub clamped: bool,
    pub looping: bool,
    /// Repeat emits queue further variants on the same source
    pub buffer: bool,
    /// Slot index refers to the map namespace
    pub map: bool,
    /// Skip map index remapping and de-duplication
    pub unmapped: bool,
    /// Follow the owner's position every tick
    pub tracked: bool,
    /// Estimate velocity from position changes
    pub vel_est: bool,
    /// No direct-path lowpass
    pub no_filter: bool,
    /// Also play on the haptics device
    pub haptics: bool,
}

impl SoundFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_atten(mut self) -> Self {
        self.no_atten = true;
        self
    }

    pub fn no_delay(mut self) -> Self {
        self.no_delay = true;
        self
    }

    pub fn priority(mut self) -> Self {
        self.priority = true;
        self
    }

    pub fn no_pan(mut self) -> Self {
        self.no_pan = true;
        self
    }

    pub fn no_dist(mut self) -> Self {
        self.no_dist = true;
        self
    }

    pub fn no_env(mut self) -> Self {
        self.no_env = true;
        self
    }

    pub fn clamped(mut self) -> Self {
        self.clamped = true;
        self
    }

    pub fn looping(mut self) -> Self {
        self.looping = true;
        self
    }

    pub fn buffer(mut self) -> Self {
        self.buffer = true;
        self
    }

    pub fn map(mut self) -> Self {
        self.map = true;
        self
    }

    pub fn unmapped(mut self) -> Self {
        self.unmapped = true;
        self
    }

    pub fn tracked(mut self) -> Self {
        self.tracked = true;
        self
    }

    pub fn vel_est(mut self) -> Self {
        self.vel_est = true;
        self
    }

    pub fn no_filter(mut self) -> Self {
        self.no_filter = true;
        self
    }

    pub fn haptics(mut self) -> Self {
        self.haptics = true;
        self
    }

    /// Reject combinations a source cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.buffer && self.looping {
            return Err(SoundStageError::InvalidSource(
                "buffer sources cannot loop".to_string(),
            ));
        }
        if self.no_atten && (self.no_pan || self.no_dist) {
            return Err(SoundStageError::InvalidSource(
                "no_atten already disables panning and distance".to_string(),
            ));
        }
        Ok(())
    }

    /// Fold a repeat emit's flags into a reused source.
    pub(crate) fn merge(&mut self, other: &SoundFlags) {
        self.priority |= other.priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let flags = SoundFlags::new().priority().tracked().no_env();
        assert!(flags.priority && flags.tracked && flags.no_env);
        assert!(!flags.looping);
        assert!(flags.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_conflicts() {
        assert!(SoundFlags::new().buffer().looping().validate().is_err());
        assert!(SoundFlags::new().no_atten().no_pan().validate().is_err());
        assert!(SoundFlags::new().no_pan().no_dist().validate().is_ok());
    }

    #[test]
    fn test_merge_upgrades_priority_only() {
        let mut flags = SoundFlags::new().looping();
        flags.merge(&SoundFlags::new().priority().no_env());
        assert!(flags.priority);
        assert!(flags.looping);
        assert!(!flags.no_env);
    }
}

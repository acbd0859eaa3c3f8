use super::{DeviceConfig, DeviceDriver, DeviceKind, Mixer, OpenedDevice, open_error};
use crate::error::Result;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;

/// Driver that opens mixers with no audio output.
///
/// Playback only advances when the owner calls [`Mixer::advance`] or renders
/// manually. Clones share the attempt log and loss senders, so a test can keep
/// one clone while the [`DeviceManager`](super::DeviceManager) owns the other.
#[derive(Debug, Clone, Default)]
pub struct HeadlessDriver {
    fail_named: bool,
    fail_default: bool,
    attempts: Arc<Mutex<Vec<Option<String>>>>,
    senders: Arc<Mutex<Vec<Sender<()>>>>,
}

impl HeadlessDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every open that names a device.
    pub fn fail_named(mut self, fail: bool) -> Self {
        self.fail_named = fail;
        self
    }

    /// Refuse opens of the default device.
    pub fn fail_default(mut self, fail: bool) -> Self {
        self.fail_default = fail;
        self
    }

    /// Every name `open` was called with, in order.
    pub fn attempts(&self) -> Vec<Option<String>> {
        self.attempts.lock().clone()
    }

    /// Report every device opened so far as gone.
    pub fn lose_all(&self) {
        for tx in self.senders.lock().drain(..) {
            let _ = tx.send(());
        }
    }
}

impl DeviceDriver for HeadlessDriver {
    fn open(
        &self,
        name: Option<&str>,
        kind: DeviceKind,
        config: &DeviceConfig,
    ) -> Result<OpenedDevice> {
        self.attempts.lock().push(name.map(str::to_string));
        let refused = match name {
            Some(_) => self.fail_named,
            None => self.fail_default,
        };
        if refused {
            return Err(open_error(kind, name, "refused by headless driver"));
        }

        let name = name.unwrap_or("headless").to_string();
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.senders.lock().push(tx);
        Ok(OpenedDevice {
            mixer: Mixer::new(name.clone(), config.sample_rate, config.limits).shared(),
            name,
            stream: None,
            lost: Some(rx),
        })
    }
}

use super::{
    DeviceConfig, DeviceDriver, DeviceKind, Mixer, OpenedDevice, SharedMixer, open_error,
};
use crate::error::{Result, SoundStageError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::Sender;

/// Driver that renders each device's mixer through a cpal output stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDriver;

impl CpalDriver {
    pub fn new() -> Self {
        Self
    }

    fn find_device(host: &cpal::Host, name: Option<&str>) -> Option<cpal::Device> {
        match name {
            None => host.default_output_device(),
            Some(wanted) => host
                .output_devices()
                .ok()?
                .find(|d| d.name().is_ok_and(|n| n == wanted)),
        }
    }
}

impl DeviceDriver for CpalDriver {
    fn open(
        &self,
        name: Option<&str>,
        kind: DeviceKind,
        config: &DeviceConfig,
    ) -> Result<OpenedDevice> {
        let host = cpal::default_host();
        let device = Self::find_device(&host, name)
            .ok_or_else(|| open_error(kind, name, "no such output device"))?;
        let device_name = device
            .name()
            .unwrap_or_else(|_| name.unwrap_or("default").to_string());

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.block_size as u32),
        };

        let default_config = device
            .default_output_config()
            .map_err(|e| open_error(kind, name, format!("failed to get default config: {}", e)))?;

        let mixer = Mixer::new(device_name.clone(), config.sample_rate, config.limits).shared();
        let (lost_tx, lost_rx) = crossbeam_channel::bounded(1);

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => {
                create_stream::<f32>(&device, &stream_config, mixer.clone(), lost_tx)
            }
            cpal::SampleFormat::I16 => {
                create_stream::<i16>(&device, &stream_config, mixer.clone(), lost_tx)
            }
            cpal::SampleFormat::U16 => {
                create_stream::<u16>(&device, &stream_config, mixer.clone(), lost_tx)
            }
            other => {
                return Err(SoundStageError::AudioFormat(format!(
                    "Unsupported sample format {:?}",
                    other
                )));
            }
        }
        .map_err(|e| open_error(kind, name, e))?;

        stream
            .play()
            .map_err(|e| open_error(kind, name, format!("failed to start stream: {}", e)))?;

        Ok(OpenedDevice {
            name: device_name,
            mixer,
            stream: Some(Box::new(stream)),
            lost: Some(lost_rx),
        })
    }
}

fn create_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mixer: SharedMixer,
    lost: Sender<()>,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut stereo = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            stereo.resize(frames * 2, 0.0f32);
            mixer.lock().render(&mut stereo);

            for (frame, out) in data.chunks_mut(channels).enumerate() {
                let (l, r) = (stereo[frame * 2], stereo[frame * 2 + 1]);
                for (ch, sample) in out.iter_mut().enumerate() {
                    let value = match (channels, ch) {
                        (1, _) => (l + r) * 0.5,
                        (_, 0) => l,
                        (_, 1) => r,
                        _ => 0.0,
                    };
                    *sample = T::from_sample(value.clamp(-1.0, 1.0));
                }
            }
        },
        move |err| {
            log::error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                let _ = lost.try_send(());
            }
        },
        None,
    )
}

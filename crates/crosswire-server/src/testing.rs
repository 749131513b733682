//! An in-memory device backend driven explicitly by tests: no hardware,
//! no threads, deterministic callback timing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crosswire_rt::AudioBuffer;

use crate::device::{
    DeviceBackend, DeviceCallback, DeviceCaps, DeviceDescriptor, DeviceError, DeviceKind,
    DeviceSetup, OpenDevice,
};
use crate::subscription::device_key;

struct ManualDeviceSpec {
    descriptor: DeviceDescriptor,
    caps: DeviceCaps,
    default_rate: f64,
    default_block: usize,
}

struct ActiveStream {
    callback: Arc<dyn DeviceCallback>,
    sample_rate: f64,
    buffer_size: usize,
    input_channels: usize,
    output_channels: usize,
}

#[derive(Default)]
struct BackendState {
    devices: HashMap<String, ManualDeviceSpec>,
    streams: HashMap<String, ActiveStream>,
    open_counts: HashMap<String, usize>,
}

/// Test backend: register devices, open them through the server, then
/// push blocks through their callbacks with [`ManualBackend::drive_block`].
pub struct ManualBackend {
    state: Arc<Mutex<BackendState>>,
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState::default())),
        }
    }

    pub fn add_device(&self, type_tag: &str, name: &str, channels: usize, rate: f64, block: usize) {
        let descriptor = DeviceDescriptor {
            type_tag: type_tag.to_string(),
            name: name.to_string(),
            kind: DeviceKind::Physical,
            input_channels: channels,
            output_channels: channels,
        };
        let caps = DeviceCaps {
            input_channel_names: (0..channels).map(|c| format!("in {c}")).collect(),
            output_channel_names: (0..channels).map(|c| format!("out {c}")).collect(),
            sample_rates: vec![44_100.0, 48_000.0, 96_000.0],
            buffer_sizes: vec![64, 128, 256, 480, 512, 1024],
        };
        self.state.lock().devices.insert(
            descriptor.key(),
            ManualDeviceSpec {
                descriptor,
                caps,
                default_rate: rate,
                default_block: block,
            },
        );
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.state.lock().streams.contains_key(key)
    }

    pub fn open_count(&self, key: &str) -> usize {
        self.state.lock().open_counts.get(key).copied().unwrap_or(0)
    }

    pub fn stream_sample_rate(&self, key: &str) -> Option<f64> {
        self.state.lock().streams.get(key).map(|s| s.sample_rate)
    }

    /// Runs one device callback with `input`, collecting into `output`.
    /// Returns false when the device is not open.
    pub fn drive_block(
        &self,
        key: &str,
        input: &AudioBuffer,
        output: &mut AudioBuffer,
        frames: usize,
    ) -> bool {
        let (callback, in_ch, out_ch) = {
            let state = self.state.lock();
            let Some(stream) = state.streams.get(key) else {
                return false;
            };
            (
                Arc::clone(&stream.callback),
                stream.input_channels,
                stream.output_channels,
            )
        };
        callback.process(input, in_ch, output, out_ch, frames);
        true
    }
}

struct ManualOpenDevice {
    state: Arc<Mutex<BackendState>>,
    key: String,
    sample_rate: f64,
    buffer_size: usize,
    input_channels: usize,
    output_channels: usize,
}

impl OpenDevice for ManualOpenDevice {
    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn input_channels(&self) -> usize {
        self.input_channels
    }

    fn output_channels(&self) -> usize {
        self.output_channels
    }
}

impl Drop for ManualOpenDevice {
    fn drop(&mut self) {
        let callback = {
            let mut state = self.state.lock();
            state.streams.remove(&self.key).map(|s| s.callback)
        };
        if let Some(callback) = callback {
            callback.stopped();
        }
    }
}

impl DeviceBackend for ManualBackend {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.state
            .lock()
            .devices
            .values()
            .map(|spec| spec.descriptor.clone())
            .collect()
    }

    fn probe(&self, type_tag: &str, name: &str) -> Option<DeviceCaps> {
        self.state
            .lock()
            .devices
            .get(&device_key(type_tag, name))
            .map(|spec| spec.caps.clone())
    }

    fn open(
        &self,
        type_tag: &str,
        name: &str,
        setup: &DeviceSetup,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Box<dyn OpenDevice>, DeviceError> {
        let key = device_key(type_tag, name);
        let (rate, block, channels) = {
            let state = self.state.lock();
            let Some(spec) = state.devices.get(&key) else {
                return Err(DeviceError::NotFound(key));
            };
            let rate = if setup.sample_rate > 0.0 {
                if !spec.caps.sample_rates.contains(&setup.sample_rate) {
                    return Err(DeviceError::UnsupportedSampleRate(setup.sample_rate));
                }
                setup.sample_rate
            } else {
                spec.default_rate
            };
            let block = if setup.buffer_size > 0 {
                if !spec.caps.buffer_sizes.contains(&setup.buffer_size) {
                    return Err(DeviceError::UnsupportedBufferSize(setup.buffer_size));
                }
                setup.buffer_size
            } else {
                spec.default_block
            };
            (rate, block, spec.descriptor.input_channels)
        };

        callback.about_to_start(rate, block, channels, channels);

        let mut state = self.state.lock();
        state.streams.insert(
            key.clone(),
            ActiveStream {
                callback,
                sample_rate: rate,
                buffer_size: block,
                input_channels: channels,
                output_channels: channels,
            },
        );
        *state.open_counts.entry(key.clone()).or_insert(0) += 1;

        Ok(Box::new(ManualOpenDevice {
            state: Arc::clone(&self.state),
            key,
            sample_rate: rate,
            buffer_size: block,
            input_channels: channels,
            output_channels: channels,
        }))
    }
}

//! Native device backend over cpal. Streams are owned by a dedicated
//! thread because cpal stream handles cannot cross threads; the backend
//! talks to it through channels. Input and output callbacks are bridged
//! with a lock-free ring so the device callback sees planar full-duplex
//! audio.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, FromSample, SampleFormat, SampleRate, SizedSample};

use crosswire_rt::{AudioBuffer, LockFreeRing};

use crate::device::{
    DeviceBackend, DeviceCallback, DeviceCaps, DeviceDescriptor, DeviceError, DeviceKind,
    DeviceSetup, OpenDevice,
};

const STANDARD_RATES: [f64; 6] = [44_100.0, 48_000.0, 88_200.0, 96_000.0, 176_400.0, 192_000.0];
const STANDARD_BUFFERS: [usize; 8] = [64, 128, 256, 480, 512, 1024, 2048, 4096];
const INPUT_RING_BLOCKS: usize = 8;

/// Devices of the platform's default cpal host, tagged with the host name.
pub struct CpalBackend;

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// The type tag this backend reports for all of its devices.
    pub fn host_tag() -> String {
        cpal::default_host().id().name().to_string()
    }

    fn find_devices(name: &str) -> (Option<cpal::Device>, Option<cpal::Device>) {
        let host = cpal::default_host();
        let input = host
            .input_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)));
        let output = host
            .output_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == name).unwrap_or(false)));
        (input, output)
    }
}

impl DeviceBackend for CpalBackend {
    fn list_devices(&self) -> Vec<DeviceDescriptor> {
        let host = cpal::default_host();
        let tag = host.id().name().to_string();
        let mut merged: Vec<DeviceDescriptor> = Vec::new();

        if let Ok(devices) = host.input_devices() {
            for device in devices {
                let Ok(name) = device.name() else { continue };
                let channels = device
                    .default_input_config()
                    .map(|c| c.channels() as usize)
                    .unwrap_or(0);
                merged.push(DeviceDescriptor {
                    type_tag: tag.clone(),
                    name,
                    kind: DeviceKind::Physical,
                    input_channels: channels,
                    output_channels: 0,
                });
            }
        }
        if let Ok(devices) = host.output_devices() {
            for device in devices {
                let Ok(name) = device.name() else { continue };
                let channels = device
                    .default_output_config()
                    .map(|c| c.channels() as usize)
                    .unwrap_or(0);
                if let Some(existing) = merged.iter_mut().find(|d| d.name == name) {
                    existing.output_channels = channels;
                } else {
                    merged.push(DeviceDescriptor {
                        type_tag: tag.clone(),
                        name,
                        kind: DeviceKind::Physical,
                        input_channels: 0,
                        output_channels: channels,
                    });
                }
            }
        }
        merged
    }

    fn probe(&self, _type_tag: &str, name: &str) -> Option<DeviceCaps> {
        let (input, output) = Self::find_devices(name);
        if input.is_none() && output.is_none() {
            return None;
        }

        let mut caps = DeviceCaps {
            buffer_sizes: STANDARD_BUFFERS.to_vec(),
            ..DeviceCaps::default()
        };

        let mut rates: Vec<f64> = Vec::new();
        let mut add_rates = |min: u32, max: u32, rates: &mut Vec<f64>| {
            for rate in STANDARD_RATES {
                if rate >= min as f64 && rate <= max as f64 && !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
        };
        if let Some(device) = &input {
            if let Ok(configs) = device.supported_input_configs() {
                for range in configs {
                    add_rates(range.min_sample_rate().0, range.max_sample_rate().0, &mut rates);
                }
            }
            let channels = device
                .default_input_config()
                .map(|c| c.channels() as usize)
                .unwrap_or(0);
            caps.input_channel_names = (1..=channels).map(|c| format!("Input {c}")).collect();
        }
        if let Some(device) = &output {
            if let Ok(configs) = device.supported_output_configs() {
                for range in configs {
                    add_rates(range.min_sample_rate().0, range.max_sample_rate().0, &mut rates);
                }
            }
            let channels = device
                .default_output_config()
                .map(|c| c.channels() as usize)
                .unwrap_or(0);
            caps.output_channel_names = (1..=channels).map(|c| format!("Output {c}")).collect();
        }
        rates.sort_by(f64::total_cmp);
        caps.sample_rates = rates;
        Some(caps)
    }

    fn open(
        &self,
        type_tag: &str,
        name: &str,
        setup: &DeviceSetup,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Box<dyn OpenDevice>, DeviceError> {
        let key = crate::subscription::device_key(type_tag, name);
        let (result_tx, result_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let name = name.to_string();
        let setup = *setup;

        let join = std::thread::Builder::new()
            .name("cw-cpal".into())
            .spawn(move || stream_thread(name, setup, callback, result_tx, stop_rx))
            .map_err(|err| DeviceError::OpenFailed(key.clone(), err.to_string()))?;

        match result_rx.recv() {
            Ok(Ok(params)) => Ok(Box::new(CpalOpenDevice {
                params,
                stop: Some(stop_tx),
                join: Some(join),
            })),
            Ok(Err(err)) => {
                let _ = join.join();
                Err(err)
            }
            Err(_) => {
                let _ = join.join();
                Err(DeviceError::OpenFailed(key, "stream thread died".into()))
            }
        }
    }
}

#[derive(Clone, Copy)]
struct StreamParams {
    sample_rate: f64,
    buffer_size: usize,
    input_channels: usize,
    output_channels: usize,
}

struct CpalOpenDevice {
    params: StreamParams,
    stop: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl OpenDevice for CpalOpenDevice {
    fn sample_rate(&self) -> f64 {
        self.params.sample_rate
    }

    fn buffer_size(&self) -> usize {
        self.params.buffer_size
    }

    fn input_channels(&self) -> usize {
        self.params.input_channels
    }

    fn output_channels(&self) -> usize {
        self.params.output_channels
    }
}

impl Drop for CpalOpenDevice {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Owns the cpal streams for one open device until the stop channel drops.
fn stream_thread(
    name: String,
    setup: DeviceSetup,
    callback: Arc<dyn DeviceCallback>,
    result_tx: mpsc::Sender<Result<StreamParams, DeviceError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let (input_device, output_device) = CpalBackend::find_devices(&name);
    if input_device.is_none() && output_device.is_none() {
        let _ = result_tx.send(Err(DeviceError::NotFound(name)));
        return;
    }

    let rate = if setup.sample_rate > 0.0 {
        setup.sample_rate as u32
    } else {
        output_device
            .as_ref()
            .and_then(|d| d.default_output_config().ok())
            .or_else(|| input_device.as_ref().and_then(|d| d.default_input_config().ok()))
            .map(|c| c.sample_rate().0)
            .unwrap_or(48_000)
    };
    let block = if setup.buffer_size > 0 {
        setup.buffer_size
    } else {
        480
    };

    let input_channels = input_device
        .as_ref()
        .and_then(|d| d.default_input_config().ok())
        .map(|c| c.channels() as usize)
        .unwrap_or(0);
    let output_channels = output_device
        .as_ref()
        .and_then(|d| d.default_output_config().ok())
        .map(|c| c.channels() as usize)
        .unwrap_or(0);

    let params = StreamParams {
        sample_rate: rate as f64,
        buffer_size: block,
        input_channels,
        output_channels,
    };
    callback.about_to_start(params.sample_rate, block, input_channels, output_channels);

    let input_ring = Arc::new(LockFreeRing::new(
        input_channels.max(1),
        block * INPUT_RING_BLOCKS,
    ));

    // Input stream: deinterleave into the ring. With no output device the
    // input stream drives the device callback itself (capture-only device).
    let input_sink = if output_device.is_some() {
        InputSink::Ring(Arc::clone(&input_ring))
    } else {
        InputSink::Drive(Arc::clone(&callback))
    };
    let input_stream = input_device.as_ref().and_then(|device| {
        let format = device.default_input_config().ok()?.sample_format();
        let config = cpal::StreamConfig {
            channels: input_channels as u16,
            sample_rate: SampleRate(rate),
            buffer_size: BufferSize::Fixed(block as u32),
        };
        let result = match format {
            SampleFormat::F32 => build_input_stream::<f32>(device, &config, input_channels, input_sink),
            SampleFormat::I16 => build_input_stream::<i16>(device, &config, input_channels, input_sink),
            SampleFormat::U16 => build_input_stream::<u16>(device, &config, input_channels, input_sink),
            other => {
                tracing::warn!(?other, "unsupported input sample format");
                return None;
            }
        };
        match result {
            Ok(stream) => Some(stream),
            Err(err) => {
                tracing::warn!(?err, "failed to build input stream");
                None
            }
        }
    });

    // Output stream drives the device callback; with no output device the
    // input stream drives it instead.
    let output_stream = if let Some(device) = &output_device {
        let format = match device.default_output_config() {
            Ok(config) => config.sample_format(),
            Err(err) => {
                let _ = result_tx.send(Err(DeviceError::OpenFailed(name, err.to_string())));
                return;
            }
        };
        let config = cpal::StreamConfig {
            channels: output_channels as u16,
            sample_rate: SampleRate(rate),
            buffer_size: BufferSize::Fixed(block as u32),
        };
        let bridge = DuplexBridge::new(
            Arc::clone(&callback),
            Arc::clone(&input_ring),
            params,
            input_device.is_some(),
        );
        let result = match format {
            SampleFormat::F32 => build_output_stream::<f32>(device, &config, bridge),
            SampleFormat::I16 => build_output_stream::<i16>(device, &config, bridge),
            SampleFormat::U16 => build_output_stream::<u16>(device, &config, bridge),
            other => {
                let _ = result_tx.send(Err(DeviceError::OpenFailed(
                    name,
                    format!("unsupported sample format {other:?}"),
                )));
                return;
            }
        };
        match result {
            Ok(stream) => Some(stream),
            Err(err) => {
                let _ = result_tx.send(Err(DeviceError::OpenFailed(name, err.to_string())));
                return;
            }
        }
    } else {
        None
    };

    for stream in input_stream.iter().chain(output_stream.iter()) {
        if let Err(err) = stream.play() {
            let _ = result_tx.send(Err(DeviceError::OpenFailed(name.clone(), err.to_string())));
            return;
        }
    }

    let _ = result_tx.send(Ok(params));

    // Park until the handle drops its sender.
    let _ = stop_rx.recv();
    drop(output_stream);
    drop(input_stream);
    callback.stopped();
}

/// Where deinterleaved input frames go: a ring toward the output stream,
/// or straight into the device callback for capture-only devices.
enum InputSink {
    Ring(Arc<LockFreeRing>),
    Drive(Arc<dyn DeviceCallback>),
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    sink: InputSink,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut staging = AudioBuffer::new(channels.max(1), 4096);
    let mut output_stub = AudioBuffer::new(1, 4096);
    device.build_input_stream(
        config,
        move |data: &[T], _info| {
            let frames = if channels > 0 { data.len() / channels } else { 0 };
            let frames = frames.min(staging.len());
            for ch in 0..channels {
                let plane = staging.channel_mut(ch);
                for frame in 0..frames {
                    plane[frame] = f32::from_sample(data[frame * channels + ch]);
                }
            }
            match &sink {
                InputSink::Ring(ring) => {
                    ring.write(&staging, channels, frames);
                }
                InputSink::Drive(callback) => {
                    callback.process(&staging, channels, &mut output_stub, 0, frames);
                }
            }
        },
        move |err| {
            tracing::error!(?err, "cpal input stream error");
        },
        None,
    )
}

/// Per-callback state for the output stream: pulls buffered input, runs
/// the device callback, interleaves the result.
struct DuplexBridge {
    callback: Arc<dyn DeviceCallback>,
    input_ring: Arc<LockFreeRing>,
    input: AudioBuffer,
    output: AudioBuffer,
    params: StreamParams,
    has_input: bool,
}

impl DuplexBridge {
    fn new(
        callback: Arc<dyn DeviceCallback>,
        input_ring: Arc<LockFreeRing>,
        params: StreamParams,
        has_input: bool,
    ) -> Self {
        Self {
            callback,
            input_ring,
            input: AudioBuffer::new(params.input_channels.max(1), 4096),
            output: AudioBuffer::new(params.output_channels.max(1), 4096),
            params,
            has_input,
        }
    }

    fn run<T>(&mut self, data: &mut [T])
    where
        T: SizedSample + FromSample<f32>,
    {
        let channels = self.params.output_channels.max(1);
        let frames = (data.len() / channels).min(self.output.len());

        self.input.clear_range(frames);
        if self.has_input {
            self.input_ring
                .read(&mut self.input, self.params.input_channels, frames, true);
        }
        self.output.clear_range(frames);
        self.callback.process(
            &self.input,
            self.params.input_channels,
            &mut self.output,
            self.params.output_channels,
            frames,
        );

        for frame in 0..frames {
            for ch in 0..channels {
                let value = if ch < self.output.channel_count() {
                    self.output.channel(ch)[frame]
                } else {
                    0.0
                };
                data[frame * channels + ch] = T::from_sample(value);
            }
        }
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut bridge: DuplexBridge,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _info| {
            bridge.run(data);
        },
        move |err| {
            tracing::error!(?err, "cpal output stream error");
        },
        None,
    )
}

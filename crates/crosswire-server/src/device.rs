use std::sync::Arc;

use thiserror::Error;

use crosswire_rt::AudioBuffer;

/// What kind of endpoint a device handle is, replacing downcast chains on
/// the host device object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Real hardware exposed by the platform host.
    Physical,
    /// A software endpoint (module bridge, loopback) served in-process.
    Virtual,
}

/// One enumerable device. The type tag is the backend's own name for its
/// family (WASAPI, ASIO, CoreAudio, ALSA, ...); the core does not
/// constrain the tag set.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub type_tag: String,
    pub name: String,
    pub kind: DeviceKind,
    pub input_channels: usize,
    pub output_channels: usize,
}

impl DeviceDescriptor {
    pub fn key(&self) -> String {
        crate::subscription::device_key(&self.type_tag, &self.name)
    }
}

/// Capabilities reported by a probe, cached by the server.
#[derive(Debug, Clone, Default)]
pub struct DeviceCaps {
    pub input_channel_names: Vec<String>,
    pub output_channel_names: Vec<String>,
    pub sample_rates: Vec<f64>,
    pub buffer_sizes: Vec<usize>,
}

/// Requested stream parameters; zero fields mean "device default".
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceSetup {
    pub sample_rate: f64,
    pub buffer_size: usize,
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} not found")]
    NotFound(String),
    #[error("device {0} failed to open: {1}")]
    OpenFailed(String, String),
    #[error("sample rate {0} not supported")]
    UnsupportedSampleRate(f64),
    #[error("buffer size {0} not supported")]
    UnsupportedBufferSize(usize),
    #[error("device {0} is not open")]
    NotOpen(String),
}

/// Receives the realtime callback of an open device.
///
/// `process` runs on the backend's audio thread; implementations must be
/// realtime-safe. Lifecycle notifications run on control threads.
pub trait DeviceCallback: Send + Sync {
    fn about_to_start(
        &self,
        sample_rate: f64,
        buffer_size: usize,
        input_channels: usize,
        output_channels: usize,
    );

    fn process(
        &self,
        input: &AudioBuffer,
        input_channels: usize,
        output: &mut AudioBuffer,
        output_channels: usize,
        frames: usize,
    );

    fn stopped(&self);
}

/// An open device stream. Dropping the handle closes the stream.
pub trait OpenDevice: Send {
    fn sample_rate(&self) -> f64;
    fn buffer_size(&self) -> usize;
    fn input_channels(&self) -> usize;
    fn output_channels(&self) -> usize;
}

/// A family of enumerable, openable audio devices. The server only ever
/// talks to devices through this seam, which keeps the core testable
/// without hardware.
pub trait DeviceBackend: Send + Sync {
    fn list_devices(&self) -> Vec<DeviceDescriptor>;

    /// Capability query without opening the device for streaming.
    fn probe(&self, type_tag: &str, name: &str) -> Option<DeviceCaps>;

    fn open(
        &self,
        type_tag: &str,
        name: &str,
        setup: &DeviceSetup,
        callback: Arc<dyn DeviceCallback>,
    ) -> Result<Box<dyn OpenDevice>, DeviceError>;
}

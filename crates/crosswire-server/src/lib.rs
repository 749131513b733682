//! Crosswire server
//! ================
//! Multiplexes physical audio devices between many software clients. Each
//! client subscribes to arbitrary device channels; the server owns one
//! handler per device, couples every device/client pair through a
//! sample-rate-converting SyncBuffer, and publishes immutable routing
//! snapshots so the realtime callbacks never lock or allocate. A small
//! MIDI registry rides the same publication pattern.

pub mod client;
pub mod device;
pub mod handler;
pub mod midi;
pub mod server;
pub mod subscription;
pub mod testing;

#[cfg(feature = "native")]
pub mod cpal_backend;

pub use client::AudioClient;
pub use device::{
    DeviceBackend, DeviceCallback, DeviceCaps, DeviceDescriptor, DeviceError, DeviceKind,
    DeviceSetup, OpenDevice,
};
pub use handler::{ChannelMapping, ClientId, DeviceHandler};
pub use midi::{MidiClient, MidiClientState, MidiMessageQueue, MidiServer};
pub use server::AudioServer;
pub use subscription::{device_key, ChannelSubscription, ClientState, Direction};

#[cfg(feature = "native")]
pub use cpal_backend::CpalBackend;

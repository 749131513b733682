use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crosswire_rt::{AudioBuffer, SyncBuffer};

use crate::handler::ClientId;
use crate::server::AudioServer;
use crate::subscription::ClientState;

/// All per-device channels of one SyncBuffer, grouped so the realtime
/// path touches the buffer once per block.
pub(crate) struct BufferGroup {
    pub buffer: Arc<SyncBuffer>,
    pub max_device_channel: usize,
    /// (subscription index, device channel) pairs.
    pub channel_map: Vec<(usize, usize)>,
}

/// Immutable routing view published to the client after every
/// subscription change.
#[derive(Default)]
pub(crate) struct BufferSnapshot {
    pub state: ClientState,
    pub input_groups: Vec<BufferGroup>,
    pub output_groups: Vec<BufferGroup>,
}

pub(crate) struct ClientScratch {
    pub input: AudioBuffer,
    pub output: AudioBuffer,
}

/// State shared between the server (writer) and the client facade
/// (realtime reader).
pub(crate) struct ClientShared {
    pub snapshot: ArcSwap<BufferSnapshot>,
    pub scratch: Mutex<ClientScratch>,
}

impl ClientShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: ArcSwap::from_pointee(BufferSnapshot::default()),
            scratch: Mutex::new(ClientScratch {
                input: AudioBuffer::default(),
                output: AudioBuffer::default(),
            }),
        })
    }
}

/// Per-consumer facade over the audio server: pull subscribed inputs,
/// push subscribed outputs, edit subscriptions. Pull and push are
/// realtime-safe; they only read the client's own immutable snapshot.
pub struct AudioClient {
    id: ClientId,
    server: Weak<AudioServer>,
    shared: Arc<ClientShared>,
}

impl AudioClient {
    pub(crate) fn new(id: ClientId, server: Weak<AudioServer>, shared: Arc<ClientShared>) -> Self {
        Self { id, server, shared }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Fills `out` with one channel per input subscription, in
    /// subscription order. Channels without data stay silent.
    pub fn pull_subscribed_inputs(&self, out: &mut AudioBuffer, frames: usize, sample_rate: f64) {
        out.clear_range(frames);
        let snapshot = self.shared.snapshot.load();
        if snapshot.input_groups.is_empty() {
            return;
        }
        // Contended only while the server resizes scratch after a
        // subscription change; silence for that block is fine.
        let Some(mut scratch) = self.shared.scratch.try_lock() else {
            return;
        };

        for group in &snapshot.input_groups {
            let device_channels = group.max_device_channel + 1;
            if device_channels > scratch.input.channel_count() || frames > scratch.input.len() {
                continue;
            }
            if group
                .buffer
                .read(&mut scratch.input, device_channels, frames, sample_rate)
                == 0
            {
                continue;
            }
            for &(sub_index, device_channel) in &group.channel_map {
                if sub_index < out.channel_count() && device_channel < device_channels {
                    out.copy_channel_from(sub_index, &scratch.input, device_channel, frames);
                }
            }
        }
    }

    /// Writes one channel per output subscription from `input`, in
    /// subscription order, into the owning devices.
    pub fn push_subscribed_outputs(&self, input: &AudioBuffer, frames: usize, sample_rate: f64) {
        let snapshot = self.shared.snapshot.load();
        if snapshot.output_groups.is_empty() {
            return;
        }
        let Some(mut scratch) = self.shared.scratch.try_lock() else {
            return;
        };

        for group in &snapshot.output_groups {
            let device_channels = group.max_device_channel + 1;
            if device_channels > scratch.output.channel_count() || frames > scratch.output.len() {
                continue;
            }
            scratch.output.clear_range(frames);
            for &(sub_index, device_channel) in &group.channel_map {
                if sub_index < input.channel_count() && device_channel < device_channels {
                    scratch
                        .output
                        .copy_channel_from(device_channel, input, sub_index, frames);
                }
            }
            group
                .buffer
                .write(&scratch.output, device_channels, frames, sample_rate);
        }
    }

    /// Replaces this client's subscription set. Control-path call.
    pub fn set_subscriptions(&self, state: ClientState) {
        if let Some(server) = self.server.upgrade() {
            server.update_client_subscriptions(self.id, state);
        }
    }

    /// The subscription state behind the currently published snapshot.
    pub fn subscriptions(&self) -> ClientState {
        self.shared.snapshot.load().state.clone()
    }

    pub fn input_subscription_count(&self) -> usize {
        self.shared.snapshot.load().state.inputs.len()
    }

    pub fn output_subscription_count(&self) -> usize {
        self.shared.snapshot.load().state.outputs.len()
    }

    /// Drops any audio buffered toward or from this client.
    pub fn clear_buffers(&self) {
        let snapshot = self.shared.snapshot.load();
        for group in snapshot.input_groups.iter().chain(&snapshot.output_groups) {
            group.buffer.reset();
        }
    }
}

impl Drop for AudioClient {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.unregister_client(self.id);
        }
    }
}

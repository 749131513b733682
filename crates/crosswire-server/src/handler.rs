use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use atomic_float::AtomicF64;
use parking_lot::Mutex;

use crosswire_rt::{AudioBuffer, MetricsCollector, SyncBuffer};

use crate::device::{DeviceBackend, DeviceCallback, DeviceError, DeviceSetup, OpenDevice};
use crate::subscription::ChannelSubscription;

/// Typical host-side stream shape, used to pre-seed the far end of a fresh
/// SyncBuffer so preparation can complete before the client's first call.
pub(crate) const CLIENT_SEED_RATE: f64 = 48_000.0;
pub(crate) const CLIENT_SEED_BLOCK: usize = 480;

/// Stable opaque client identity.
pub type ClientId = u64;

/// Maps one subscription to its position in the client's per-device list.
#[derive(Debug, Clone)]
pub struct ChannelMapping {
    pub subscription: ChannelSubscription,
    pub client_channel: usize,
}

/// Mutable per-client routing owned by the handler, edited on control
/// threads under the client-buffers lock.
struct ClientBuffers {
    input: Option<Arc<SyncBuffer>>,
    output: Option<Arc<SyncBuffer>>,
    input_mappings: Vec<ChannelMapping>,
    output_mappings: Vec<ChannelMapping>,
}

/// Immutable view of one client's routing for the realtime callback.
struct ClientEntry {
    client: ClientId,
    input: Option<Arc<SyncBuffer>>,
    output: Option<Arc<SyncBuffer>>,
    max_input_channel: usize,
    max_output_channel: usize,
}

#[derive(Default)]
struct DeviceSnapshot {
    clients: Vec<ClientEntry>,
}

struct DirectEntry {
    token: u64,
    callback: Arc<dyn DeviceCallback>,
    scratch: Mutex<AudioBuffer>,
}

struct RtScratch {
    temp: AudioBuffer,
}

/// Owns one physical device: the host callback, the per-client SyncBuffer
/// pairs, and the atomically published routing snapshot.
///
/// The realtime callback never takes the client-buffers mutex; it loads
/// the snapshot pointer with acquire ordering. The only lock it touches is
/// a try-lock on its own scratch, which fails (to silence) exactly while a
/// reopen is reconfiguring the device.
pub struct DeviceHandler {
    key: String,
    type_tag: String,
    name: String,
    backend: Arc<dyn DeviceBackend>,

    open: Mutex<Option<Box<dyn OpenDevice>>>,
    clients: Mutex<std::collections::HashMap<ClientId, ClientBuffers>>,
    snapshot: ArcSwap<DeviceSnapshot>,

    direct: Mutex<Vec<Arc<DirectEntry>>>,
    direct_snapshot: ArcSwap<Vec<Arc<DirectEntry>>>,
    next_direct_token: AtomicU64,

    rt: Mutex<RtScratch>,
    running: AtomicBool,

    sample_rate: AtomicF64,
    buffer_size: AtomicUsize,
    input_channels: AtomicUsize,
    output_channels: AtomicUsize,

    metrics: MetricsCollector,
}

impl DeviceHandler {
    pub fn new(type_tag: &str, name: &str, backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            key: crate::subscription::device_key(type_tag, name),
            type_tag: type_tag.to_string(),
            name: name.to_string(),
            backend,
            open: Mutex::new(None),
            clients: Mutex::new(std::collections::HashMap::new()),
            snapshot: ArcSwap::from_pointee(DeviceSnapshot::default()),
            direct: Mutex::new(Vec::new()),
            direct_snapshot: ArcSwap::from_pointee(Vec::new()),
            next_direct_token: AtomicU64::new(1),
            rt: Mutex::new(RtScratch {
                temp: AudioBuffer::default(),
            }),
            running: AtomicBool::new(false),
            sample_rate: AtomicF64::new(0.0),
            buffer_size: AtomicUsize::new(0),
            input_channels: AtomicUsize::new(0),
            output_channels: AtomicUsize::new(0),
            metrics: MetricsCollector::new(64),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn device_name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn is_open(&self) -> bool {
        self.open.lock().is_some()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate.load(Ordering::Acquire)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Acquire)
    }

    /// Max of active input and output channels, the full-duplex width.
    pub fn channel_count(&self) -> usize {
        self.input_channels
            .load(Ordering::Acquire)
            .max(self.output_channels.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn open_device(self: &Arc<Self>, setup: &DeviceSetup) -> Result<(), DeviceError> {
        let mut open = self.open.lock();
        if open.is_some() {
            return Ok(());
        }
        let callback: Arc<dyn DeviceCallback> = Arc::clone(self) as Arc<dyn DeviceCallback>;
        let handle = self
            .backend
            .open(&self.type_tag, &self.name, setup, callback)?;
        *open = Some(handle);
        drop(open);

        self.running.store(true, Ordering::Release);
        tracing::info!(device = %self.key, "device opened");
        Ok(())
    }

    pub fn close_device(&self) {
        self.running.store(false, Ordering::Release);
        let handle = self.open.lock().take();
        if handle.is_some() {
            tracing::info!(device = %self.key, "device closed");
        }
        drop(handle);
    }

    /// Closes and reopens the device with new stream parameters. The
    /// scratch lock is held across the close so a realtime callback still
    /// in flight falls through to silence instead of racing the teardown;
    /// it is released before the open because stream start re-enters
    /// `about_to_start`.
    pub fn reopen_device(self: &Arc<Self>, setup: &DeviceSetup) -> Result<(), DeviceError> {
        {
            let _scratch = self.rt.lock();
            self.close_device();
        }
        self.open_device(setup)
    }

    /// Replaces this client's subscriptions on this device. Empty mapping
    /// lists remove the corresponding buffer; a client with neither side
    /// left is dropped entirely. Returns the (input, output) SyncBuffers
    /// now in place.
    pub(crate) fn replace_client(
        &self,
        client: ClientId,
        inputs: Vec<ChannelMapping>,
        outputs: Vec<ChannelMapping>,
    ) -> (Option<Arc<SyncBuffer>>, Option<Arc<SyncBuffer>>) {
        let mut clients = self.clients.lock();

        if inputs.is_empty() && outputs.is_empty() {
            if clients.remove(&client).is_some() {
                self.rebuild_snapshot_locked(&clients);
            }
            return (None, None);
        }

        let entry = clients.entry(client).or_insert_with(|| ClientBuffers {
            input: None,
            output: None,
            input_mappings: Vec::new(),
            output_mappings: Vec::new(),
        });

        if inputs.is_empty() {
            entry.input = None;
            entry.input_mappings.clear();
        } else {
            let buffer = Arc::new(SyncBuffer::new());
            // Seed the client (reader) side so the device writer can
            // prepare before the client's first pull.
            let channels = self
                .input_channels
                .load(Ordering::Acquire)
                .max(mapping_span(&inputs));
            let mut seed = AudioBuffer::new(channels, CLIENT_SEED_BLOCK);
            buffer.read(&mut seed, channels, CLIENT_SEED_BLOCK, CLIENT_SEED_RATE);
            entry.input = Some(buffer);
            entry.input_mappings = inputs;
        }

        if outputs.is_empty() {
            entry.output = None;
            entry.output_mappings.clear();
        } else {
            let buffer = Arc::new(SyncBuffer::new());
            let channels = self
                .output_channels
                .load(Ordering::Acquire)
                .max(mapping_span(&outputs));
            let seed = AudioBuffer::new(channels, CLIENT_SEED_BLOCK);
            buffer.write(&seed, channels, CLIENT_SEED_BLOCK, CLIENT_SEED_RATE);
            entry.output = Some(buffer);
            entry.output_mappings = outputs;
        }

        let result = (entry.input.clone(), entry.output.clone());
        self.rebuild_snapshot_locked(&clients);
        result
    }

    pub(crate) fn remove_client(&self, client: ClientId) {
        let mut clients = self.clients.lock();
        if clients.remove(&client).is_some() {
            self.rebuild_snapshot_locked(&clients);
        }
    }

    pub(crate) fn client_buffers(
        &self,
        client: ClientId,
    ) -> (Option<Arc<SyncBuffer>>, Option<Arc<SyncBuffer>>) {
        let clients = self.clients.lock();
        clients
            .get(&client)
            .map(|entry| (entry.input.clone(), entry.output.clone()))
            .unwrap_or((None, None))
    }

    pub(crate) fn has_client(&self, client: ClientId) -> bool {
        self.clients.lock().contains_key(&client)
    }

    pub fn has_active_subscriptions(&self) -> bool {
        !self.clients.lock().is_empty() || self.has_direct_callback()
    }

    pub fn has_direct_callback(&self) -> bool {
        !self.direct.lock().is_empty()
    }

    /// Registers a callback that runs inside the device callback, additive
    /// with subscription routing. Returns a token for unregistration.
    pub fn register_direct_callback(&self, callback: Arc<dyn DeviceCallback>) -> u64 {
        let token = self.next_direct_token.fetch_add(1, Ordering::AcqRel);
        let channels = self.channel_count().max(2);
        let block = self.buffer_size.load(Ordering::Acquire).max(CLIENT_SEED_BLOCK);
        let entry = Arc::new(DirectEntry {
            token,
            callback,
            scratch: Mutex::new(AudioBuffer::new(channels, block)),
        });
        let mut direct = self.direct.lock();
        direct.push(entry);
        self.direct_snapshot.store(Arc::new(direct.clone()));
        token
    }

    pub fn unregister_direct_callback(&self, token: u64) {
        let mut direct = self.direct.lock();
        direct.retain(|entry| entry.token != token);
        self.direct_snapshot.store(Arc::new(direct.clone()));
    }

    /// Flags any of this device's SyncBuffers that want re-preparation.
    pub(crate) fn collect_unprepared(&self, out: &mut Vec<Arc<SyncBuffer>>) {
        let clients = self.clients.lock();
        for entry in clients.values() {
            for buffer in [&entry.input, &entry.output].into_iter().flatten() {
                if buffer.needs_prepare() {
                    out.push(Arc::clone(buffer));
                }
            }
        }
    }

    fn rebuild_snapshot_locked(
        &self,
        clients: &std::collections::HashMap<ClientId, ClientBuffers>,
    ) {
        let mut entries: Vec<ClientEntry> = clients
            .iter()
            .map(|(client, buffers)| ClientEntry {
                client: *client,
                input: buffers.input.clone(),
                output: buffers.output.clone(),
                max_input_channel: mapping_span(&buffers.input_mappings).saturating_sub(1),
                max_output_channel: mapping_span(&buffers.output_mappings).saturating_sub(1),
            })
            .collect();
        entries.sort_by_key(|entry| entry.client);
        self.snapshot.store(Arc::new(DeviceSnapshot { clients: entries }));
    }
}

/// Highest referenced device channel + 1; zero for an empty mapping list.
fn mapping_span(mappings: &[ChannelMapping]) -> usize {
    mappings
        .iter()
        .map(|m| m.subscription.channel + 1)
        .max()
        .unwrap_or(0)
}

impl DeviceCallback for DeviceHandler {
    fn about_to_start(
        &self,
        sample_rate: f64,
        buffer_size: usize,
        input_channels: usize,
        output_channels: usize,
    ) {
        self.sample_rate.store(sample_rate, Ordering::Release);
        self.buffer_size.store(buffer_size, Ordering::Release);
        self.input_channels.store(input_channels, Ordering::Release);
        self.output_channels.store(output_channels, Ordering::Release);

        let channels = input_channels.max(output_channels).max(1);
        {
            let mut rt = self.rt.lock();
            rt.temp.resize(channels, buffer_size.max(1));
        }
        {
            let direct = self.direct.lock();
            for entry in direct.iter() {
                entry.scratch.lock().resize(channels, buffer_size.max(1));
                entry
                    .callback
                    .about_to_start(sample_rate, buffer_size, input_channels, output_channels);
            }
        }
        tracing::debug!(
            device = %self.key,
            sample_rate,
            buffer_size,
            input_channels,
            output_channels,
            "device stream starting"
        );
    }

    fn process(
        &self,
        input: &AudioBuffer,
        input_channels: usize,
        output: &mut AudioBuffer,
        output_channels: usize,
        frames: usize,
    ) {
        let started = Instant::now();
        output.clear_range(frames);

        if !self.running.load(Ordering::Acquire) {
            return;
        }
        // Held by reopen while the device is being reconfigured.
        let Some(mut scratch) = self.rt.try_lock() else {
            return;
        };

        let sample_rate = self.sample_rate.load(Ordering::Acquire);
        let snapshot = self.snapshot.load();
        let scratch_frames_ok = frames <= scratch.temp.len();

        for entry in &snapshot.clients {
            if let Some(sync) = &entry.input {
                let channels = (entry.max_input_channel + 1).min(input_channels);
                if channels > 0 {
                    sync.write(input, channels, frames, sample_rate);
                }
            }
            if let Some(sync) = &entry.output {
                let channels = (entry.max_output_channel + 1)
                    .min(output_channels)
                    .min(scratch.temp.channel_count());
                if channels > 0
                    && scratch_frames_ok
                    && sync.read(&mut scratch.temp, channels, frames, sample_rate) > 0
                {
                    for ch in 0..channels {
                        output.add_channel_from(ch, &scratch.temp, ch, frames);
                    }
                }
            }
        }

        let direct = self.direct_snapshot.load();
        for entry in direct.iter() {
            let Some(mut direct_scratch) = entry.scratch.try_lock() else {
                continue;
            };
            if frames > direct_scratch.len() {
                continue;
            }
            direct_scratch.clear_range(frames);
            entry
                .callback
                .process(input, input_channels, &mut direct_scratch, output_channels, frames);
            let channels = output_channels
                .min(direct_scratch.channel_count())
                .min(output.channel_count());
            for ch in 0..channels {
                output.add_channel_from(ch, &direct_scratch, ch, frames);
            }
        }

        let period_ns = if sample_rate > 0.0 {
            (frames as f64 / sample_rate * 1e9) as u64
        } else {
            0
        };
        self.metrics.record_block(started.elapsed(), period_ns);
    }

    fn stopped(&self) {
        self.running.store(false, Ordering::Release);
        let direct = self.direct.lock();
        for entry in direct.iter() {
            entry.callback.stopped();
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crosswire_rt::SyncBuffer;

use crate::client::{AudioClient, BufferGroup, BufferSnapshot, ClientShared};
use crate::device::{DeviceBackend, DeviceCallback, DeviceCaps, DeviceError, DeviceSetup};
use crate::handler::{ChannelMapping, ClientId, DeviceHandler};
use crate::subscription::{device_key, ChannelSubscription, ClientState, Direction};

/// Grace period before an unused device is actually closed.
const DEVICE_CLOSE_DELAY: Duration = Duration::from_millis(2000);

/// Default scratch depth for client temp buffers, in frames.
const CLIENT_SCRATCH_FRAMES: usize = 2048;

struct ClientInfo {
    state: ClientState,
    shared: Arc<ClientShared>,
    buffer_size: usize,
}

struct PendingClose {
    key: String,
    close_at: Instant,
}

#[derive(Default)]
struct DeviceRegistry {
    handlers: HashMap<String, Arc<DeviceHandler>>,
    pending_closes: Vec<PendingClose>,
}

#[derive(Default)]
struct DeviceInfoCache {
    caps: HashMap<String, DeviceCaps>,
}

struct MaintenanceState {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Process-wide device registry and subscription broker.
///
/// Owns one [`DeviceHandler`] per physical device in use, maps channel
/// subscriptions onto per-client SyncBuffers inside those handlers, and
/// publishes immutable routing snapshots for the realtime side.
///
/// Lock order, outermost first: `clients` -> `devices` -> a handler's
/// internal client-buffers lock. The caches use a disjoint mutex and are
/// never touched from realtime threads.
pub struct AudioServer {
    backend: Arc<dyn DeviceBackend>,
    clients: Mutex<HashMap<ClientId, ClientInfo>>,
    devices: Mutex<DeviceRegistry>,
    cache: Mutex<DeviceInfoCache>,
    next_client_id: AtomicU64,
    close_grace: Mutex<Duration>,
    maintenance: Mutex<Option<MaintenanceState>>,
}

impl AudioServer {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            clients: Mutex::new(HashMap::new()),
            devices: Mutex::new(DeviceRegistry::default()),
            cache: Mutex::new(DeviceInfoCache::default()),
            next_client_id: AtomicU64::new(1),
            close_grace: Mutex::new(DEVICE_CLOSE_DELAY),
            maintenance: Mutex::new(None),
        })
    }

    /// Spawns the low-frequency control thread that finalises deferred
    /// device closes and completes SyncBuffer preparation flagged by the
    /// realtime side.
    pub fn start_maintenance(self: &Arc<Self>) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let weak: Weak<AudioServer> = Arc::downgrade(self);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("cw-maint".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    let Some(server) = weak.upgrade() else { break };
                    server.run_maintenance_once();
                    drop(server);
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
            .expect("failed to spawn maintenance thread");
        *slot = Some(MaintenanceState {
            stop,
            handle: Some(handle),
        });
    }

    /// One pass of the maintenance work; tests call this directly instead
    /// of running the timer thread.
    pub fn run_maintenance_once(&self) {
        let mut unprepared: Vec<Arc<SyncBuffer>> = Vec::new();
        {
            let mut devices = self.devices.lock();
            self.process_device_cleanup(&mut devices);
            for handler in devices.handlers.values() {
                handler.collect_unprepared(&mut unprepared);
            }
        }
        for buffer in unprepared {
            buffer.prepare();
        }
    }

    /// Overrides the close grace period (tests shorten it).
    pub fn set_close_grace(&self, grace: Duration) {
        *self.close_grace.lock() = grace;
    }

    /// Registers a new client. `buffer_size` bounds the frames one pull or
    /// push may move and sizes the client's scratch accordingly.
    pub fn register_client(self: &Arc<Self>, state: ClientState, buffer_size: usize) -> AudioClient {
        let id = self.next_client_id.fetch_add(1, Ordering::AcqRel);
        let shared = ClientShared::new();
        self.clients.lock().insert(
            id,
            ClientInfo {
                state: ClientState::default(),
                shared: Arc::clone(&shared),
                buffer_size: buffer_size.max(CLIENT_SCRATCH_FRAMES),
            },
        );
        let client = AudioClient::new(id, Arc::downgrade(self), shared);
        if !state.is_empty() {
            self.update_client_subscriptions(id, state);
        }
        client
    }

    pub(crate) fn unregister_client(&self, id: ClientId) {
        let existed = self.clients.lock().remove(&id).is_some();
        if !existed {
            return;
        }
        let grace = *self.close_grace.lock();
        let mut devices = self.devices.lock();
        for handler in devices.handlers.values() {
            handler.remove_client(id);
        }
        schedule_unused_closes(&mut devices, grace);
    }

    /// Atomic diff of a client's subscriptions: cancels pending closes for
    /// devices still needed, swaps SyncBuffers under each handler's lock,
    /// then rebuilds and publishes the client's snapshot.
    pub fn update_client_subscriptions(&self, id: ClientId, state: ClientState) {
        let (shared, scratch_frames) = {
            let mut clients = self.clients.lock();
            let Some(info) = clients.get_mut(&id) else {
                return;
            };
            if info.state == state {
                tracing::debug!(client = id, "subscriptions unchanged; skipping update");
                return;
            }
            info.state = state.clone();
            (Arc::clone(&info.shared), info.buffer_size)
        };

        let grace = *self.close_grace.lock();
        let mut devices = self.devices.lock();
        self.process_device_cleanup(&mut devices);

        // Group the new subscriptions per device key, keeping per-device
        // order (the mapping index is the per-device position).
        let mut new_inputs: HashMap<String, Vec<ChannelMapping>> = HashMap::new();
        let mut new_outputs: HashMap<String, Vec<ChannelMapping>> = HashMap::new();
        for sub in &state.inputs {
            let list = new_inputs.entry(sub.device_key()).or_default();
            let index = list.len();
            list.push(ChannelMapping {
                subscription: sub.clone(),
                client_channel: index,
            });
        }
        for sub in &state.outputs {
            let list = new_outputs.entry(sub.device_key()).or_default();
            let index = list.len();
            list.push(ChannelMapping {
                subscription: sub.clone(),
                client_channel: index,
            });
        }

        let mut all_keys: Vec<String> = new_inputs
            .keys()
            .chain(new_outputs.keys())
            .cloned()
            .collect();
        for (key, handler) in &devices.handlers {
            if handler.has_client(id) && !all_keys.contains(key) {
                all_keys.push(key.clone());
            }
        }
        all_keys.sort();
        all_keys.dedup();

        for key in all_keys {
            cancel_pending_close(&mut devices, &key);

            let inputs = new_inputs.remove(&key).unwrap_or_default();
            let outputs = new_outputs.remove(&key).unwrap_or_default();
            let wanted = !inputs.is_empty() || !outputs.is_empty();

            let existing = devices.handlers.get(&key).cloned();
            let handler = match existing {
                Some(handler) => handler,
                None if wanted => {
                    let Some((type_tag, name)) = split_device_key(&key) else {
                        continue;
                    };
                    let handler =
                        DeviceHandler::new(type_tag, name, Arc::clone(&self.backend));
                    devices.handlers.insert(key.clone(), Arc::clone(&handler));
                    handler
                }
                None => continue,
            };

            if wanted && !handler.is_open() {
                if let Err(err) = handler.open_device(&DeviceSetup::default()) {
                    // Subscriptions stay recorded in the client state; a
                    // later successful open reattaches them.
                    tracing::warn!(device = %key, %err, "device open failed");
                    continue;
                }
            }

            handler.replace_client(id, inputs, outputs);
        }

        schedule_unused_closes(&mut devices, grace);
        self.rebuild_client_snapshot(&devices, id, &shared, &state, scratch_frames);

        tracing::debug!(
            client = id,
            inputs = state.inputs.len(),
            outputs = state.outputs.len(),
            "client subscriptions updated"
        );
    }

    /// Builds and publishes the client's realtime view: SyncBuffer refs
    /// grouped per device, channel maps in subscription order, scratch
    /// sized to the widest open device.
    fn rebuild_client_snapshot(
        &self,
        devices: &DeviceRegistry,
        id: ClientId,
        shared: &Arc<ClientShared>,
        state: &ClientState,
        scratch_frames: usize,
    ) {
        let mut snapshot = BufferSnapshot {
            state: state.clone(),
            ..BufferSnapshot::default()
        };

        snapshot.input_groups = build_groups(devices, id, &state.inputs, |handler, id| {
            handler.client_buffers(id).0
        });
        snapshot.output_groups = build_groups(devices, id, &state.outputs, |handler, id| {
            handler.client_buffers(id).1
        });

        let mut max_channels = 1usize;
        for handler in devices.handlers.values() {
            if handler.is_open() {
                max_channels = max_channels.max(handler.channel_count());
            }
        }
        {
            let mut scratch = shared.scratch.lock();
            scratch.input.ensure_capacity(max_channels, scratch_frames);
            scratch.output.ensure_capacity(max_channels, scratch_frames);
        }

        shared.snapshot.store(Arc::new(snapshot));
    }

    /// Enumerable devices exposing inputs.
    pub fn available_input_devices(&self) -> Vec<(String, String)> {
        self.backend
            .list_devices()
            .into_iter()
            .filter(|d| d.input_channels > 0)
            .map(|d| (d.type_tag, d.name))
            .collect()
    }

    /// Enumerable devices exposing outputs.
    pub fn available_output_devices(&self) -> Vec<(String, String)> {
        self.backend
            .list_devices()
            .into_iter()
            .filter(|d| d.output_channels > 0)
            .map(|d| (d.type_tag, d.name))
            .collect()
    }

    pub fn device_channel_names(
        &self,
        type_tag: &str,
        name: &str,
        direction: Direction,
    ) -> Vec<String> {
        self.cached_caps(type_tag, name)
            .map(|caps| match direction {
                Direction::Input => caps.input_channel_names,
                Direction::Output => caps.output_channel_names,
            })
            .unwrap_or_default()
    }

    pub fn available_sample_rates(&self, type_tag: &str, name: &str) -> Vec<f64> {
        self.cached_caps(type_tag, name)
            .map(|caps| caps.sample_rates)
            .unwrap_or_default()
    }

    pub fn available_buffer_sizes(&self, type_tag: &str, name: &str) -> Vec<usize> {
        self.cached_caps(type_tag, name)
            .map(|caps| caps.buffer_sizes)
            .unwrap_or_default()
    }

    /// Drops cached capability info, forcing a re-probe. Driven by backend
    /// change notifications.
    pub fn invalidate_device_cache(&self, type_tag: &str, name: &str) {
        self.cache.lock().caps.remove(&device_key(type_tag, name));
    }

    pub fn current_sample_rate(&self, type_tag: &str, name: &str) -> f64 {
        self.open_handler(type_tag, name)
            .map(|h| h.sample_rate())
            .unwrap_or(0.0)
    }

    pub fn current_buffer_size(&self, type_tag: &str, name: &str) -> usize {
        self.open_handler(type_tag, name)
            .map(|h| h.buffer_size())
            .unwrap_or(0)
    }

    /// Drives a close/reopen cycle at the new rate. The realtime callback
    /// produces silence for the duration; every attached SyncBuffer sees
    /// the new rate on its next device-side call.
    pub fn set_device_sample_rate(
        &self,
        type_tag: &str,
        name: &str,
        sample_rate: f64,
    ) -> Result<(), DeviceError> {
        let handler = self
            .open_handler(type_tag, name)
            .ok_or_else(|| DeviceError::NotOpen(device_key(type_tag, name)))?;
        if !self
            .available_sample_rates(type_tag, name)
            .contains(&sample_rate)
        {
            return Err(DeviceError::UnsupportedSampleRate(sample_rate));
        }
        let setup = DeviceSetup {
            sample_rate,
            buffer_size: handler.buffer_size(),
        };
        handler.reopen_device(&setup)
    }

    pub fn set_device_buffer_size(
        &self,
        type_tag: &str,
        name: &str,
        buffer_size: usize,
    ) -> Result<(), DeviceError> {
        let handler = self
            .open_handler(type_tag, name)
            .ok_or_else(|| DeviceError::NotOpen(device_key(type_tag, name)))?;
        if !self
            .available_buffer_sizes(type_tag, name)
            .contains(&buffer_size)
        {
            return Err(DeviceError::UnsupportedBufferSize(buffer_size));
        }
        let setup = DeviceSetup {
            sample_rate: handler.sample_rate(),
            buffer_size,
        };
        handler.reopen_device(&setup)
    }

    /// Registers a callback that runs inside the device's own callback,
    /// additively with subscription routing. Opens the device if needed.
    pub fn register_direct_callback(
        &self,
        type_tag: &str,
        name: &str,
        callback: Arc<dyn DeviceCallback>,
        preferred: &DeviceSetup,
    ) -> Result<u64, DeviceError> {
        let key = device_key(type_tag, name);
        let mut devices = self.devices.lock();
        cancel_pending_close(&mut devices, &key);
        let handler = devices
            .handlers
            .entry(key.clone())
            .or_insert_with(|| DeviceHandler::new(type_tag, name, Arc::clone(&self.backend)));
        let handler = Arc::clone(handler);
        if !handler.is_open() {
            handler.open_device(preferred)?;
        }
        Ok(handler.register_direct_callback(callback))
    }

    pub fn unregister_direct_callback(&self, type_tag: &str, name: &str, token: u64) {
        let grace = *self.close_grace.lock();
        let mut devices = self.devices.lock();
        let key = device_key(type_tag, name);
        if let Some(handler) = devices.handlers.get(&key) {
            handler.unregister_direct_callback(token);
        }
        schedule_unused_closes(&mut devices, grace);
    }

    pub fn has_direct_callback(&self, type_tag: &str, name: &str) -> bool {
        self.devices
            .lock()
            .handlers
            .get(&device_key(type_tag, name))
            .map(|h| h.has_direct_callback())
            .unwrap_or(false)
    }

    /// True while the device has subscriptions or direct callbacks, or is
    /// still inside its close grace period with the device open.
    pub fn has_active_subscriptions(&self, type_tag: &str, name: &str) -> bool {
        self.devices
            .lock()
            .handlers
            .get(&device_key(type_tag, name))
            .map(|h| h.has_active_subscriptions())
            .unwrap_or(false)
    }

    pub fn device_handler(&self, type_tag: &str, name: &str) -> Option<Arc<DeviceHandler>> {
        self.devices
            .lock()
            .handlers
            .get(&device_key(type_tag, name))
            .cloned()
    }

    fn open_handler(&self, type_tag: &str, name: &str) -> Option<Arc<DeviceHandler>> {
        self.device_handler(type_tag, name).filter(|h| h.is_open())
    }

    fn cached_caps(&self, type_tag: &str, name: &str) -> Option<DeviceCaps> {
        let key = device_key(type_tag, name);
        {
            let cache = self.cache.lock();
            if let Some(caps) = cache.caps.get(&key) {
                return Some(caps.clone());
            }
        }
        let caps = self.backend.probe(type_tag, name)?;
        self.cache.lock().caps.insert(key, caps.clone());
        Some(caps)
    }

    /// Finalises deferred closes whose grace expired and whose devices are
    /// still unused.
    fn process_device_cleanup(&self, devices: &mut DeviceRegistry) {
        let now = Instant::now();
        let mut expired: Vec<String> = Vec::new();
        devices.pending_closes.retain(|pending| {
            if now >= pending.close_at {
                expired.push(pending.key.clone());
                false
            } else {
                true
            }
        });
        for key in expired {
            let Some(handler) = devices.handlers.get(&key) else {
                continue;
            };
            if handler.has_active_subscriptions() {
                continue;
            }
            tracing::info!(device = %key, "closing device after grace period");
            handler.close_device();
            devices.handlers.remove(&key);
        }
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        if let Some(mut state) = self.maintenance.lock().take() {
            state.stop.store(true, Ordering::Release);
            if let Some(handle) = state.handle.take() {
                let _ = handle.join();
            }
        }
        let mut devices = self.devices.lock();
        for handler in devices.handlers.values() {
            handler.close_device();
        }
        devices.handlers.clear();
    }
}

fn cancel_pending_close(devices: &mut DeviceRegistry, key: &str) {
    devices.pending_closes.retain(|pending| pending.key != key);
}

/// Schedules a deferred close for every handler with nothing attached.
fn schedule_unused_closes(devices: &mut DeviceRegistry, grace: Duration) {
    let mut unused: Vec<String> = Vec::new();
    for (key, handler) in &devices.handlers {
        if !handler.has_active_subscriptions() {
            unused.push(key.clone());
        }
    }
    for key in unused {
        if devices.pending_closes.iter().any(|p| p.key == key) {
            continue;
        }
        tracing::debug!(device = %key, "scheduling deferred device close");
        devices.pending_closes.push(PendingClose {
            key,
            close_at: Instant::now() + grace,
        });
    }
}

fn split_device_key(key: &str) -> Option<(&str, &str)> {
    key.split_once('|')
}

fn build_groups(
    devices: &DeviceRegistry,
    id: ClientId,
    subscriptions: &[ChannelSubscription],
    select: impl Fn(&DeviceHandler, ClientId) -> Option<Arc<SyncBuffer>>,
) -> Vec<BufferGroup> {
    let mut groups: Vec<BufferGroup> = Vec::new();
    for (index, sub) in subscriptions.iter().enumerate() {
        let Some(handler) = devices.handlers.get(&sub.device_key()) else {
            continue;
        };
        let Some(buffer) = select(handler, id) else {
            continue;
        };
        let existing = groups
            .iter_mut()
            .find(|group| Arc::ptr_eq(&group.buffer, &buffer));
        match existing {
            Some(group) => {
                group.max_device_channel = group.max_device_channel.max(sub.channel);
                group.channel_map.push((index, sub.channel));
            }
            None => groups.push(BufferGroup {
                buffer,
                max_device_channel: sub.channel,
                channel_map: vec![(index, sub.channel)],
            }),
        }
    }
    groups
}

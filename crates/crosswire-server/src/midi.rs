//! MIDI routing on the same lock-free publication pattern as the audio
//! server, structurally simpler: per-client bounded message queues and an
//! atomically swapped routing snapshot. Hardware I/O stays with the host
//! backend; this module only moves timestamped messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;

use crosswire_rt::MidiMessage;

pub const DEFAULT_MIDI_QUEUE: usize = 4096;

/// Bounded lock-free queue of timestamped messages. Multiple producers,
/// single consumer; overflow drops the newest message.
pub struct MidiMessageQueue {
    queue: ArrayQueue<MidiMessage>,
    auto_position: AtomicU32,
}

impl MidiMessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(16)),
            auto_position: AtomicU32::new(0),
        }
    }

    /// Pushes one message. Messages with frame 0 get an auto-incremented
    /// position so relative order survives the queue.
    pub fn push(&self, mut message: MidiMessage) -> bool {
        if message.frame == 0 {
            message.frame = self.auto_position.fetch_add(1, Ordering::Relaxed);
        }
        self.queue.push(message).is_ok()
    }

    /// Drains up to `max` messages into `out` (which must have capacity;
    /// callers on realtime threads pre-reserve).
    pub fn drain_into(&self, out: &mut Vec<MidiMessage>, max: usize) {
        for _ in 0..max {
            match self.queue.pop() {
                Some(message) => out.push(message),
                None => break,
            }
        }
        self.auto_position.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// A client's MIDI device subscriptions, by device name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidiClientState {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl MidiClientState {
    pub fn serialize(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.inputs.len() + self.outputs.len());
        parts.push(format!("IN:{}", self.inputs.len()));
        parts.extend(self.inputs.iter().cloned());
        parts.push(format!("OUT:{}", self.outputs.len()));
        parts.extend(self.outputs.iter().cloned());
        parts.join(";")
    }

    pub fn deserialize(data: &str) -> Self {
        let mut state = MidiClientState::default();
        let parts: Vec<&str> = data.split(';').collect();
        let mut index = 0;
        while index < parts.len() {
            if let Some(count) = parts[index].strip_prefix("IN:").and_then(|n| n.parse::<usize>().ok()) {
                index += 1;
                for _ in 0..count.min(parts.len().saturating_sub(index)) {
                    if !parts[index].is_empty() {
                        state.inputs.push(parts[index].to_string());
                    }
                    index += 1;
                }
            } else if let Some(count) = parts[index].strip_prefix("OUT:").and_then(|n| n.parse::<usize>().ok()) {
                index += 1;
                for _ in 0..count.min(parts.len().saturating_sub(index)) {
                    if !parts[index].is_empty() {
                        state.outputs.push(parts[index].to_string());
                    }
                    index += 1;
                }
            } else {
                index += 1;
            }
        }
        state
    }
}

struct MidiRouteEntry {
    incoming: Arc<MidiMessageQueue>,
    outgoing: Arc<MidiMessageQueue>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

#[derive(Default)]
struct MidiRoutingSnapshot {
    entries: Vec<Arc<MidiRouteEntry>>,
}

struct MidiClientInfo {
    state: MidiClientState,
    entry: Arc<MidiRouteEntry>,
}

/// Registry of MIDI clients with an atomically published routing snapshot
/// for the device-facing realtime paths.
pub struct MidiServer {
    clients: Mutex<HashMap<u64, MidiClientInfo>>,
    snapshot: ArcSwap<MidiRoutingSnapshot>,
    next_client_id: AtomicU64,
    queue_capacity: usize,
}

impl MidiServer {
    pub fn new() -> Arc<Self> {
        Self::with_queue_capacity(DEFAULT_MIDI_QUEUE)
    }

    pub fn with_queue_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(MidiRoutingSnapshot::default()),
            next_client_id: AtomicU64::new(1),
            queue_capacity: capacity,
        })
    }

    pub fn register_client(self: &Arc<Self>, state: MidiClientState) -> MidiClient {
        let id = self.next_client_id.fetch_add(1, Ordering::AcqRel);
        let entry = Arc::new(MidiRouteEntry {
            incoming: Arc::new(MidiMessageQueue::new(self.queue_capacity)),
            outgoing: Arc::new(MidiMessageQueue::new(self.queue_capacity)),
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
        });
        let client = MidiClient {
            id,
            server: Arc::downgrade(self),
            incoming: Arc::clone(&entry.incoming),
            outgoing: Arc::clone(&entry.outgoing),
        };
        self.clients.lock().insert(id, MidiClientInfo { state, entry });
        self.rebuild_snapshot();
        client
    }

    fn unregister_client(&self, id: u64) {
        if self.clients.lock().remove(&id).is_some() {
            self.rebuild_snapshot();
        }
    }

    pub fn update_client_subscriptions(&self, id: u64, state: MidiClientState) {
        {
            let mut clients = self.clients.lock();
            let Some(info) = clients.get_mut(&id) else { return };
            if info.state == state {
                return;
            }
            // Queues survive resubscription; only the routing changes.
            info.entry = Arc::new(MidiRouteEntry {
                incoming: Arc::clone(&info.entry.incoming),
                outgoing: Arc::clone(&info.entry.outgoing),
                inputs: state.inputs.clone(),
                outputs: state.outputs.clone(),
            });
            info.state = state;
        }
        self.rebuild_snapshot();
    }

    pub fn client_state(&self, id: u64) -> MidiClientState {
        self.clients
            .lock()
            .get(&id)
            .map(|info| info.state.clone())
            .unwrap_or_default()
    }

    /// Realtime: fans messages arriving from `device` out to every client
    /// subscribed to it.
    pub fn deliver_from_device(&self, device: &str, messages: &[MidiMessage]) {
        let snapshot = self.snapshot.load();
        for entry in &snapshot.entries {
            if entry.inputs.iter().any(|name| name == device) {
                for message in messages {
                    entry.incoming.push(*message);
                }
            }
        }
    }

    /// Realtime: collects messages queued by clients for `device`.
    pub fn collect_for_device(&self, device: &str, out: &mut Vec<MidiMessage>, max: usize) {
        let snapshot = self.snapshot.load();
        for entry in &snapshot.entries {
            if entry.outputs.iter().any(|name| name == device) {
                entry.outgoing.drain_into(out, max);
            }
        }
    }

    fn rebuild_snapshot(&self) {
        let clients = self.clients.lock();
        let mut entries: Vec<Arc<MidiRouteEntry>> =
            clients.values().map(|info| Arc::clone(&info.entry)).collect();
        entries.sort_by_key(|entry| Arc::as_ptr(entry) as usize);
        drop(clients);
        self.snapshot.store(Arc::new(MidiRoutingSnapshot { entries }));
    }
}

/// Per-consumer MIDI facade: drain pending input, send output, inject
/// loopback messages.
pub struct MidiClient {
    id: u64,
    server: Weak<MidiServer>,
    incoming: Arc<MidiMessageQueue>,
    outgoing: Arc<MidiMessageQueue>,
}

impl MidiClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drains messages routed to this client since the last call.
    pub fn drain_pending(&self, out: &mut Vec<MidiMessage>, max: usize) {
        self.incoming.drain_into(out, max);
    }

    /// Queues messages toward this client's output subscriptions.
    pub fn send(&self, messages: &[MidiMessage]) {
        for message in messages {
            self.outgoing.push(*message);
        }
    }

    /// Feeds messages straight into this client's own pending queue.
    pub fn inject(&self, messages: &[MidiMessage]) {
        for message in messages {
            self.incoming.push(*message);
        }
    }

    pub fn set_subscriptions(&self, state: MidiClientState) {
        if let Some(server) = self.server.upgrade() {
            server.update_client_subscriptions(self.id, state);
        }
    }

    pub fn subscriptions(&self) -> MidiClientState {
        self.server
            .upgrade()
            .map(|server| server.client_state(self.id))
            .unwrap_or_default()
    }
}

impl Drop for MidiClient {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.unregister_client(self.id);
        }
    }
}

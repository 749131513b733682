use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crosswire_rt::{AdaptiveSpinWait, AudioBuffer, MidiMessage, PoolTopology, StreamConfig};

use crate::extractor::SubgraphExtractor;
use crate::partitioner::NodeId;
use crate::pool::{BlockWork, RealtimeThreadPool};
use crate::processor::Processor;
use crate::task_graph::DependencyTaskGraph;

/// Maximum MIDI messages staged per block.
const MIDI_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Audio,
    Midi,
}

/// A channel-level edge between two nodes. Multiple connections per node
/// pair are fine; they carry different channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub source: (NodeId, usize),
    pub destination: (NodeId, usize),
    pub kind: ConnectionKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("connection already exists")]
    DuplicateConnection,
    #[error("no such connection")]
    MissingConnection,
    #[error("i/o boundary nodes cannot be removed")]
    IoNode,
    #[error("connections cannot target the input node or originate at the output node")]
    InvalidEndpoint,
}

type SharedProcessor = Arc<Mutex<Box<dyn Processor>>>;

struct NodeEntry {
    processor: SharedProcessor,
    name: String,
    latency: usize,
}

struct ControlState {
    nodes: BTreeMap<NodeId, NodeEntry>,
    connections: Vec<Connection>,
    next_node_id: NodeId,
    extractor: SubgraphExtractor,
    channels: usize,
}

/// The multithreaded processor graph.
///
/// Edits land on control threads and flip a dirty flag; `prepare` (also
/// control-side) recompiles the schedule and publishes it atomically.
/// `process` is the realtime entry point: it only loads the published
/// schedule, dispatches the worker pool, and copies host I/O.
pub struct AudioGraph {
    control: Mutex<ControlState>,
    schedule: ArcSwapOption<CompiledSchedule>,
    pool: RealtimeThreadPool,
    dirty: AtomicBool,
    io_in: NodeId,
    io_out: NodeId,
    midi_in: NodeId,
}

impl AudioGraph {
    /// `channels` is the host-facing channel count; chain buffers may grow
    /// wider if connections reference higher channel indices.
    pub fn new(channels: usize, topology: &PoolTopology) -> Self {
        Self {
            control: Mutex::new(ControlState {
                nodes: BTreeMap::new(),
                connections: Vec::new(),
                next_node_id: 3,
                extractor: SubgraphExtractor::new(),
                channels: channels.max(1),
            }),
            schedule: ArcSwapOption::const_empty(),
            pool: RealtimeThreadPool::new(topology),
            dirty: AtomicBool::new(false),
            io_in: 0,
            io_out: 1,
            midi_in: 2,
        }
    }

    pub fn input_node(&self) -> NodeId {
        self.io_in
    }

    pub fn output_node(&self) -> NodeId {
        self.io_out
    }

    pub fn midi_input_node(&self) -> NodeId {
        self.midi_in
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn add_node(&self, processor: Box<dyn Processor>) -> NodeId {
        let mut control = self.control.lock();
        let id = control.next_node_id;
        control.next_node_id += 1;
        let name = processor.name().to_string();
        let latency = processor.latency_samples();
        control.nodes.insert(
            id,
            NodeEntry {
                processor: Arc::new(Mutex::new(processor)),
                name,
                latency,
            },
        );
        self.dirty.store(true, Ordering::Release);
        id
    }

    /// Removes the node and every connection touching it.
    pub fn remove_node(&self, id: NodeId) -> Result<(), GraphError> {
        if self.is_io_node(id) {
            return Err(GraphError::IoNode);
        }
        let mut control = self.control.lock();
        if control.nodes.remove(&id).is_none() {
            return Err(GraphError::UnknownNode(id));
        }
        control
            .connections
            .retain(|conn| conn.source.0 != id && conn.destination.0 != id);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn add_connection(&self, connection: Connection) -> Result<(), GraphError> {
        if connection.destination.0 == self.io_in
            || connection.destination.0 == self.midi_in
            || connection.source.0 == self.io_out
        {
            return Err(GraphError::InvalidEndpoint);
        }
        let mut control = self.control.lock();
        for endpoint in [connection.source.0, connection.destination.0] {
            if !self.is_io_node(endpoint) && !control.nodes.contains_key(&endpoint) {
                return Err(GraphError::UnknownNode(endpoint));
            }
        }
        if control.connections.contains(&connection) {
            return Err(GraphError::DuplicateConnection);
        }
        control.connections.push(connection);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn remove_connection(&self, connection: &Connection) -> Result<(), GraphError> {
        let mut control = self.control.lock();
        let before = control.connections.len();
        control.connections.retain(|c| c != connection);
        if control.connections.len() == before {
            return Err(GraphError::MissingConnection);
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.control.lock().nodes.keys().copied().collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.control.lock().connections.clone()
    }

    pub fn node_name(&self, id: NodeId) -> Option<String> {
        self.control.lock().nodes.get(&id).map(|n| n.name.clone())
    }

    pub fn node_latency(&self, id: NodeId) -> Option<usize> {
        self.control.lock().nodes.get(&id).map(|n| n.latency)
    }

    fn is_io_node(&self, id: NodeId) -> bool {
        id == self.io_in || id == self.io_out || id == self.midi_in
    }

    /// Recompiles the schedule for the given stream parameters and
    /// publishes it. Control-thread only; consumes the dirty flag.
    pub fn prepare(&self, sample_rate: f64, block_size: usize) {
        let mut control = self.control.lock();
        self.dirty.store(false, Ordering::Release);

        let mut channels = control.channels;
        for conn in &control.connections {
            if conn.kind == ConnectionKind::Audio {
                channels = channels.max(conn.source.1 + 1).max(conn.destination.1 + 1);
            }
        }

        for entry in control.nodes.values() {
            entry.processor.lock().prepare(sample_rate, block_size);
        }

        let node_ids: Vec<NodeId> = control.nodes.keys().copied().collect();
        let io_nodes = [self.io_in, self.io_out, self.midi_in];
        let connections = control.connections.clone();
        let control = &mut *control;
        let mut chains = control.extractor.extract(&node_ids, &connections, &io_nodes);
        let workers = self.pool.worker_count() + 1;
        control.extractor.schedule(&mut chains, Some(workers));

        let owner: HashMap<NodeId, usize> = chains
            .iter()
            .enumerate()
            .flat_map(|(index, chain)| chain.node_ids.iter().map(move |id| (*id, index)))
            .collect();

        let mut tasks: Vec<Task> = chains
            .iter()
            .map(|chain| Task {
                links: chain
                    .node_ids
                    .iter()
                    .map(|id| ChainLink {
                        processor: Arc::clone(&control.nodes[id].processor),
                        shuffle: None,
                        taps: Vec::new(),
                    })
                    .collect(),
                inputs: Vec::new(),
                state: Mutex::new(TaskState {
                    buffer: AudioBuffer::new(channels, block_size),
                    scratch: AudioBuffer::new(channels, block_size),
                    tap: AudioBuffer::new(channels, block_size),
                }),
                has_taps: false,
            })
            .collect();

        let mut host_passthrough = Vec::new();
        let mut in_chain_maps: HashMap<(usize, usize), Vec<(usize, usize)>> = HashMap::new();
        for conn in &connections {
            if conn.kind != ConnectionKind::Audio {
                continue;
            }
            let (src_node, src_ch) = conn.source;
            let (dst_node, dst_ch) = conn.destination;

            if src_node == self.io_in && dst_node == self.io_out {
                host_passthrough.push((src_ch, dst_ch));
                continue;
            }
            if dst_node == self.io_out {
                // Tap: after the source link runs, its channel is summed
                // into the host output at block end.
                if let Some(&task) = owner.get(&src_node) {
                    let position = chains[task]
                        .node_ids
                        .iter()
                        .position(|id| *id == src_node)
                        .expect("owner map is consistent");
                    tasks[task].links[position].taps.push((src_ch, dst_ch));
                    tasks[task].has_taps = true;
                }
                continue;
            }
            if src_node == self.io_in {
                if let Some(&task) = owner.get(&dst_node) {
                    tasks[task].inputs.push(BoundaryInput::FromHost {
                        src: src_ch,
                        dst: dst_ch,
                    });
                }
                continue;
            }
            let (Some(&from), Some(&to)) = (owner.get(&src_node), owner.get(&dst_node)) else {
                continue;
            };
            if from == to {
                // In-chain edge; collect the channel map for the link.
                let position = chains[to]
                    .node_ids
                    .iter()
                    .position(|id| *id == dst_node)
                    .expect("owner map is consistent");
                in_chain_maps
                    .entry((to, position))
                    .or_insert_with(Vec::new)
                    .push((src_ch, dst_ch));
                continue;
            }
            if !chains[to].depends_on.contains(&from) {
                // Back-edge dropped by cycle breaking: the feedback path
                // contributes silence. Keeping the data edge would let two
                // running tasks lock each other's buffers.
                continue;
            }
            tasks[to].inputs.push(BoundaryInput::FromTask {
                task: from,
                src: src_ch,
                dst: dst_ch,
            });
        }

        // A link only needs a shuffle when some in-chain edge crosses
        // channels; identity-only maps stay in place. When a shuffle is
        // applied it must carry the straight channels too, because the
        // permutation pass starts from a cleared scratch buffer.
        for ((task, position), mut map) in in_chain_maps {
            if map.iter().all(|(src, dst)| src == dst) {
                continue;
            }
            map.sort_unstable();
            map.dedup();
            tasks[task].links[position].shuffle = Some(map);
        }

        let task_graph = DependencyTaskGraph::build(&chains);
        let mut spin = AdaptiveSpinWait::default();
        spin.configure(block_size, sample_rate);

        let schedule = Arc::new(CompiledSchedule {
            tasks,
            task_graph,
            host_passthrough,
            io: RwLock::new(IoBuffers {
                input: AudioBuffer::new(channels, block_size),
            }),
            midi: RwLock::new(Vec::with_capacity(MIDI_CAPACITY)),
            frames: AtomicUsize::new(0),
            config: StreamConfig::new(sample_rate, block_size, channels),
            spin,
        });

        tracing::debug!(
            chains = schedule.tasks.len(),
            workers = self.pool.worker_count(),
            channels,
            block_size,
            "compiled processor graph schedule"
        );

        self.pool.install(Arc::clone(&schedule) as Arc<dyn BlockWork>);
        self.schedule.store(Some(schedule));
    }

    /// Stream parameters of the currently published schedule.
    pub fn current_config(&self) -> Option<StreamConfig> {
        self.schedule.load().as_ref().map(|s| s.config.clone())
    }

    /// One realtime block, in place on `buffer`. Never recomputes the
    /// schedule; edits made since the last `prepare` are not yet audible.
    pub fn process(&self, buffer: &mut AudioBuffer, frames: usize, midi: &[MidiMessage]) {
        let guard = self.schedule.load();
        let Some(schedule) = guard.as_ref() else {
            buffer.clear_range(frames);
            return;
        };
        let frames = frames.min(schedule.config.block_size);
        schedule.begin_block(buffer, frames, midi);
        self.pool.run_block(&schedule.spin);
        schedule.finish_block(buffer, frames);
    }
}

enum BoundaryInput {
    /// Host input channel `src` sums into chain channel `dst`.
    FromHost { src: usize, dst: usize },
    /// Channel `src` of a completed dependency's buffer sums into `dst`.
    FromTask { task: usize, src: usize, dst: usize },
}

struct ChainLink {
    processor: SharedProcessor,
    /// Channel permutation applied before this link runs, built from
    /// in-chain connections whose source and destination channels differ.
    shuffle: Option<Vec<(usize, usize)>>,
    /// (chain channel, host output channel) pairs captured right after
    /// this link runs.
    taps: Vec<(usize, usize)>,
}

struct TaskState {
    buffer: AudioBuffer,
    scratch: AudioBuffer,
    tap: AudioBuffer,
}

struct Task {
    links: Vec<ChainLink>,
    inputs: Vec<BoundaryInput>,
    state: Mutex<TaskState>,
    has_taps: bool,
}

struct IoBuffers {
    input: AudioBuffer,
}

/// The immutable per-prepare execution plan plus its per-block scratch.
struct CompiledSchedule {
    tasks: Vec<Task>,
    task_graph: DependencyTaskGraph,
    host_passthrough: Vec<(usize, usize)>,
    io: RwLock<IoBuffers>,
    midi: RwLock<Vec<MidiMessage>>,
    frames: AtomicUsize,
    config: StreamConfig,
    spin: AdaptiveSpinWait,
}

impl CompiledSchedule {
    fn begin_block(&self, host: &AudioBuffer, frames: usize, midi: &[MidiMessage]) {
        self.frames.store(frames, Ordering::Release);
        {
            let mut io = self.io.write();
            let channels = io.input.channel_count().min(host.channel_count());
            io.input.clear_range(frames);
            for ch in 0..channels {
                io.input.copy_channel_from(ch, host, ch, frames);
            }
        }
        {
            let mut staged = self.midi.write();
            staged.clear();
            for message in midi.iter().take(MIDI_CAPACITY) {
                staged.push(*message);
            }
        }
    }

    fn finish_block(&self, host: &mut AudioBuffer, frames: usize) {
        host.clear_range(frames);
        {
            let io = self.io.read();
            for &(src, dst) in &self.host_passthrough {
                if src < io.input.channel_count() && dst < host.channel_count() {
                    host.add_channel_from(dst, &io.input, src, frames);
                }
            }
        }
        for task in &self.tasks {
            if !task.has_taps {
                continue;
            }
            let state = task.state.lock();
            let channels = state.tap.channel_count().min(host.channel_count());
            for ch in 0..channels {
                host.add_channel_from(ch, &state.tap, ch, frames);
            }
        }
    }
}

impl BlockWork for CompiledSchedule {
    fn task_graph(&self) -> &DependencyTaskGraph {
        &self.task_graph
    }

    fn run_task(&self, index: usize) {
        let task = &self.tasks[index];
        let frames = self.frames.load(Ordering::Acquire);
        let mut state = task.state.lock();
        let state = &mut *state;

        state.buffer.clear_range(frames);
        if task.has_taps {
            state.tap.clear_range(frames);
        }

        for input in &task.inputs {
            match *input {
                BoundaryInput::FromHost { src, dst } => {
                    let io = self.io.read();
                    if src < io.input.channel_count() && dst < state.buffer.channel_count() {
                        state.buffer.add_channel_from(dst, &io.input, src, frames);
                    }
                }
                BoundaryInput::FromTask { task: source, src, dst } => {
                    // The dependency completed before this task became
                    // claimable; its buffer is stable for the block.
                    let source_state = self.tasks[source].state.lock();
                    if src < source_state.buffer.channel_count()
                        && dst < state.buffer.channel_count()
                    {
                        state.buffer.add_channel_from(dst, &source_state.buffer, src, frames);
                    }
                }
            }
        }

        let midi = self.midi.read();
        for link in &task.links {
            if let Some(shuffle) = &link.shuffle {
                state.scratch.clear_range(frames);
                for &(src, dst) in shuffle {
                    if src < state.buffer.channel_count() && dst < state.scratch.channel_count() {
                        state.scratch.add_channel_from(dst, &state.buffer, src, frames);
                    }
                }
                std::mem::swap(&mut state.buffer, &mut state.scratch);
            }
            link.processor
                .lock()
                .process(&mut state.buffer, frames, self.config.sample_rate, &midi);
            for &(src, dst) in &link.taps {
                if src < state.buffer.channel_count() && dst < state.tap.channel_count() {
                    state.tap.add_channel_from(dst, &state.buffer, src, frames);
                }
            }
        }
    }
}

//! Crosswire RT
//! ============
//! Realtime-safe building blocks shared by the Crosswire audio graph and the
//! device server: bounded spin-waiting, lock-free sample transport, the
//! sample-rate-coupling buffer, and thread/CPU hygiene helpers. Nothing in
//! this crate allocates or blocks on the paths marked realtime.

pub mod alloc_guard;
pub mod buffer;
pub mod cpu;
pub mod interp;
pub mod metrics;
pub mod midi;
pub mod ring;
pub mod spin;
pub mod sync_buffer;

pub use buffer::{AudioBuffer, StreamConfig};
pub use cpu::PoolTopology;
pub use interp::LagrangeResampler;
pub use metrics::{CallbackMetrics, MetricsCollector};
pub use midi::MidiMessage;
pub use ring::LockFreeRing;
pub use spin::{AdaptiveSpinWait, SpinMode};
pub use sync_buffer::SyncBuffer;

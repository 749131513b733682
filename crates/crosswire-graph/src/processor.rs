use crosswire_rt::{AudioBuffer, MidiMessage};

/// A black-box audio processor scheduled by the graph.
///
/// Processors run in-place on a pre-allocated chain buffer. One dynamic
/// call per node per block; the graph never inspects what happens inside.
pub trait Processor: Send {
    fn name(&self) -> &str;

    /// Latency this processor introduces, in samples.
    fn latency_samples(&self) -> usize {
        0
    }

    /// Called off the realtime thread whenever the stream configuration
    /// changes. Allocate everything needed for `max_block` here.
    fn prepare(&mut self, sample_rate: f64, max_block: usize);

    /// One realtime block, in-place on `buffer`.
    fn process(&mut self, buffer: &mut AudioBuffer, frames: usize, sample_rate: f64, midi: &[MidiMessage]);

    fn reset(&mut self) {}
}

/// Copies input to output unchanged.
pub struct PassThrough;

impl Processor for PassThrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    fn process(&mut self, _buffer: &mut AudioBuffer, _frames: usize, _sample_rate: f64, _midi: &[MidiMessage]) {}
}

/// Applies a fixed linear gain.
pub struct Gain {
    gain: f32,
}

impl Gain {
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }
}

impl Processor for Gain {
    fn name(&self) -> &str {
        "gain"
    }

    fn prepare(&mut self, _sample_rate: f64, _max_block: usize) {}

    fn process(&mut self, buffer: &mut AudioBuffer, frames: usize, _sample_rate: f64, _midi: &[MidiMessage]) {
        for channel in buffer.channels_mut() {
            let end = frames.min(channel.len());
            for sample in &mut channel[..end] {
                *sample *= self.gain;
            }
        }
    }
}

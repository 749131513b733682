use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use atomic_float::AtomicF64;
use parking_lot::Mutex;

use crate::buffer::AudioBuffer;
use crate::interp::LagrangeResampler;
use crate::ring::LockFreeRing;

/// Drift correction strength. Occupancy below target slows the reader by
/// this factor; occupancy above twice the target speeds it up.
const RATE_FACTOR: f64 = 1.001;

/// One-pole coefficient for the rate factor, time constant of one reader
/// block per step: 1 - e^-1.
const SMOOTH_COEFF: f64 = 0.632_120_558_828_557_7;

/// Couples two realtime endpoints running at independent, drifting sample
/// rates and block sizes.
///
/// The writer pushes blocks straight into a lock-free ring; the reader
/// peeks a rate-scaled window, resamples it with a per-channel Lagrange
/// interpolator, and advances by what the interpolator consumed. A smoothed
/// correction factor nudges the resampling ratio so ring occupancy stays
/// near its target instead of drifting into chronic under- or overrun.
///
/// Both endpoints observe block size, channel count, and sample rate on
/// every call; whenever an observation exceeds the prepared configuration
/// the `prepared` flag drops and the endpoints fall back to silence/drop
/// until a non-realtime caller runs [`SyncBuffer::prepare`].
pub struct SyncBuffer {
    prepared: AtomicBool,
    ring: LockFreeRing,

    reader_rate: AtomicF64,
    writer_rate: AtomicF64,
    reader_frames: AtomicUsize,
    writer_frames: AtomicUsize,
    reader_channels: AtomicUsize,
    writer_channels: AtomicUsize,

    /// Smoothed correction factor, published for diagnostics and tests.
    rate_scale: AtomicF64,

    reader: Mutex<ReaderState>,
    writer: Mutex<()>,
}

struct ReaderState {
    interpolators: Vec<LagrangeResampler>,
    scratch: AudioBuffer,
    smoothed: f64,
}

impl Default for SyncBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncBuffer {
    pub fn new() -> Self {
        Self {
            prepared: AtomicBool::new(false),
            ring: LockFreeRing::new(2, 0),
            reader_rate: AtomicF64::new(0.0),
            writer_rate: AtomicF64::new(0.0),
            reader_frames: AtomicUsize::new(0),
            writer_frames: AtomicUsize::new(0),
            reader_channels: AtomicUsize::new(0),
            writer_channels: AtomicUsize::new(0),
            rate_scale: AtomicF64::new(1.0),
            reader: Mutex::new(ReaderState {
                interpolators: Vec::new(),
                scratch: AudioBuffer::default(),
                smoothed: 1.0,
            }),
            writer: Mutex::new(()),
        }
    }

    /// Realtime write. Returns frames accepted; frames beyond the ring's
    /// free space are dropped.
    pub fn write(&self, src: &AudioBuffer, channels: usize, frames: usize, sample_rate: f64) -> usize {
        self.writer_rate.store(sample_rate, Ordering::Release);
        if self.writer_channels.load(Ordering::Acquire) < channels
            || self.writer_frames.load(Ordering::Acquire) < frames
        {
            self.prepared.store(false, Ordering::Release);
            self.writer_channels.fetch_max(channels, Ordering::AcqRel);
            self.writer_frames.fetch_max(frames, Ordering::AcqRel);
        }

        if !self.prepared.load(Ordering::Acquire) {
            return 0;
        }

        // Contended only while prepare() reallocates; dropping the block
        // then is the correct realtime behaviour.
        let Some(_guard) = self.writer.try_lock() else {
            return 0;
        };
        if !self.prepared.load(Ordering::Acquire) {
            return 0;
        }

        self.ring.write(src, channels, frames)
    }

    /// Realtime read of exactly `frames` frames into `dst`. Returns the
    /// frames delivered: `frames` when prepared, `0` (silence already
    /// written) while the buffer is reconfiguring.
    pub fn read(&self, dst: &mut AudioBuffer, channels: usize, frames: usize, sample_rate: f64) -> usize {
        self.reader_rate.store(sample_rate, Ordering::Release);
        if self.reader_channels.load(Ordering::Acquire) < channels
            || self.reader_frames.load(Ordering::Acquire) < frames
        {
            self.prepared.store(false, Ordering::Release);
            self.reader_channels.fetch_max(channels, Ordering::AcqRel);
            self.reader_frames.fetch_max(frames, Ordering::AcqRel);
        }

        for ch in 0..channels.min(dst.channel_count()) {
            dst.channel_mut(ch)[..frames].fill(0.0);
        }

        if !self.prepared.load(Ordering::Acquire) {
            return 0;
        }
        let Some(mut state) = self.reader.try_lock() else {
            return 0;
        };
        if !self.prepared.load(Ordering::Acquire) {
            return 0;
        }

        let writer_rate = self.writer_rate.load(Ordering::Acquire);
        if writer_rate <= 0.0 || sample_rate <= 0.0 {
            return 0;
        }

        let ready = self.ring.num_ready();
        let target_min = occupancy_target(frames, writer_rate, sample_rate);
        let upper = 2 * target_min.max(self.writer_frames.load(Ordering::Acquire));

        let target = if ready < target_min {
            1.0 / RATE_FACTOR
        } else if ready > upper {
            RATE_FACTOR
        } else {
            1.0
        };
        state.smoothed += (target - state.smoothed) * SMOOTH_COEFF;
        self.rate_scale.store(state.smoothed, Ordering::Release);

        let ratio = writer_rate / sample_rate * state.smoothed;
        let needed = (frames as f64 * ratio).ceil() as usize;
        if needed > state.scratch.len() || channels > state.scratch.channel_count() {
            // Rate jumped past the prepared window; reconfigure off-thread.
            self.prepared.store(false, Ordering::Release);
            return 0;
        }

        let got = self.ring.read(&mut state.scratch, channels, needed, false);
        let state = &mut *state;
        let mut consumed = 0usize;
        let channels = channels
            .min(state.interpolators.len())
            .min(dst.channel_count());
        for ch in 0..channels {
            let input = &state.scratch.channel(ch)[..got];
            let output = &mut dst.channel_mut(ch)[..frames];
            consumed = state.interpolators[ch].process(ratio, input, output);
        }
        self.ring.advance_read(consumed.min(ready));

        frames
    }

    /// True once both endpoints have reported their parameters and the last
    /// [`SyncBuffer::prepare`] matched them.
    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    /// True when a maintenance pass should call [`SyncBuffer::prepare`]:
    /// the buffer is unprepared and both endpoints have been observed.
    pub fn needs_prepare(&self) -> bool {
        !self.is_prepared()
            && self.reader_frames.load(Ordering::Acquire) > 0
            && self.writer_frames.load(Ordering::Acquire) > 0
            && self.reader_rate.load(Ordering::Acquire) > 0.0
            && self.writer_rate.load(Ordering::Acquire) > 0.0
    }

    /// Reallocates ring, scratch, and interpolators for the currently
    /// observed endpoint parameters. Must run off the realtime threads; the
    /// endpoint locks fence out concurrent realtime access.
    pub fn prepare(&self) {
        if !self.needs_prepare() {
            return;
        }

        self.prepared.store(false, Ordering::Release);
        let _writer = self.writer.lock();
        let mut state = self.reader.lock();

        let reader_rate = self.reader_rate.load(Ordering::Acquire);
        let writer_rate = self.writer_rate.load(Ordering::Acquire);
        let reader_frames = self.reader_frames.load(Ordering::Acquire);
        let writer_frames = self.writer_frames.load(Ordering::Acquire);
        let channels = self
            .reader_channels
            .load(Ordering::Acquire)
            .max(self.writer_channels.load(Ordering::Acquire))
            .max(1);

        let target_min = occupancy_target(reader_frames, writer_rate, reader_rate);
        let capacity = 3 * target_min.max(writer_frames);

        self.ring.resize(channels, capacity);
        state.scratch.resize(channels, 2 * capacity);
        state.interpolators.clear();
        state
            .interpolators
            .resize_with(channels, LagrangeResampler::new);
        state.smoothed = 1.0;
        self.rate_scale.store(1.0, Ordering::Release);

        // Seed the ring at the target occupancy so steady state starts
        // centred instead of climbing out of an underrun.
        state.scratch.clear();
        self.ring.write(&state.scratch, channels, target_min);

        tracing::debug!(
            reader_rate,
            writer_rate,
            reader_frames,
            writer_frames,
            channels,
            capacity,
            "sync buffer prepared"
        );

        self.prepared.store(true, Ordering::Release);
    }

    /// Drops any buffered audio without reconfiguring.
    pub fn reset(&self) {
        self.ring.reset();
    }

    pub fn num_ready(&self) -> usize {
        self.ring.num_ready()
    }

    pub fn free_space(&self) -> usize {
        self.ring.free_space()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Current smoothed drift-correction factor.
    pub fn rate_scale(&self) -> f64 {
        self.rate_scale.load(Ordering::Acquire)
    }

    pub fn reader_sample_rate(&self) -> f64 {
        self.reader_rate.load(Ordering::Acquire)
    }

    pub fn writer_sample_rate(&self) -> f64 {
        self.writer_rate.load(Ordering::Acquire)
    }
}

/// `ceil(RATE_FACTOR * frames * writer_rate / reader_rate)` in writer-domain
/// samples; the occupancy the drift controller defends.
fn occupancy_target(reader_frames: usize, writer_rate: f64, reader_rate: f64) -> usize {
    if reader_rate <= 0.0 || writer_rate <= 0.0 {
        return reader_frames;
    }
    (RATE_FACTOR * reader_frames as f64 * writer_rate / reader_rate).ceil() as usize
}

use std::cell::UnsafeCell;
use std::sync::atomic::{
    AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::buffer::AudioBuffer;

/// Single-producer/single-consumer multichannel float ring.
///
/// `head` (read index) and `tail` (write index) are published with
/// release/acquire ordering; one slot is reserved so a full ring is
/// distinguishable from an empty one. Capacity never changes on the
/// realtime path: [`LockFreeRing::resize`] must only run while both the
/// producer and the consumer are locked out (the `SyncBuffer` `prepared`
/// gate enforces this).
pub struct LockFreeRing {
    storage: UnsafeCell<Vec<Vec<f32>>>,
    head: AtomicUsize,
    tail: AtomicUsize,
    total: AtomicUsize,
}

// Safety: the storage is only touched by the single producer (write side)
// and single consumer (read side); index ownership keeps their regions
// disjoint, and `resize` is excluded from concurrent access by contract.
unsafe impl Send for LockFreeRing {}
unsafe impl Sync for LockFreeRing {}

impl LockFreeRing {
    /// Creates a ring holding `capacity` frames per channel.
    pub fn new(channels: usize, capacity: usize) -> Self {
        let total = capacity + 1;
        let storage = (0..channels.max(1)).map(|_| vec![0.0; total]).collect();
        Self {
            storage: UnsafeCell::new(storage),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            total: AtomicUsize::new(total),
        }
    }

    /// Frames currently readable.
    pub fn num_ready(&self) -> usize {
        let total = self.total.load(Acquire);
        let head = self.head.load(Acquire);
        let tail = self.tail.load(Acquire);
        (tail + total - head) % total
    }

    /// Frames currently writable. One slot stays reserved.
    pub fn free_space(&self) -> usize {
        let total = self.total.load(Acquire);
        total - 1 - self.num_ready()
    }

    pub fn capacity(&self) -> usize {
        self.total.load(Acquire) - 1
    }

    pub fn channel_count(&self) -> usize {
        // Safety: channel count only changes inside `resize`, which the
        // caller serialises against both endpoints.
        unsafe { (*self.storage.get()).len() }
    }

    /// Copies up to `frames` frames from `src` into the ring. Returns the
    /// number of frames written; excess frames are dropped.
    pub fn write(&self, src: &AudioBuffer, channels: usize, frames: usize) -> usize {
        let total = self.total.load(Acquire);
        let tail = self.tail.load(Relaxed);
        let writable = self.free_space().min(frames);
        if writable == 0 {
            return 0;
        }

        // Safety: producer-exclusive region [tail, tail + writable).
        let storage = unsafe { &mut *self.storage.get() };
        let channels = channels.min(storage.len()).min(src.channel_count());

        let first = writable.min(total - tail);
        let second = writable - first;
        for ch in 0..channels {
            let src_ch = src.channel(ch);
            let dst = &mut storage[ch];
            dst[tail..tail + first].copy_from_slice(&src_ch[..first]);
            if second > 0 {
                dst[..second].copy_from_slice(&src_ch[first..first + second]);
            }
        }

        self.tail.store((tail + writable) % total, Release);
        writable
    }

    /// Copies up to `frames` frames into `dst`. With `advance == false` the
    /// read index stays put (peek).
    pub fn read(&self, dst: &mut AudioBuffer, channels: usize, frames: usize, advance: bool) -> usize {
        let total = self.total.load(Acquire);
        let head = self.head.load(Relaxed);
        let readable = self.num_ready().min(frames);
        if readable == 0 {
            return 0;
        }

        // Safety: consumer-exclusive region [head, head + readable).
        let storage = unsafe { &*self.storage.get() };
        let channels = channels.min(storage.len()).min(dst.channel_count());

        let first = readable.min(total - head);
        let second = readable - first;
        for ch in 0..channels {
            let src = &storage[ch];
            let dst_ch = dst.channel_mut(ch);
            dst_ch[..first].copy_from_slice(&src[head..head + first]);
            if second > 0 {
                dst_ch[first..first + second].copy_from_slice(&src[..second]);
            }
        }

        if advance {
            self.head.store((head + readable) % total, Release);
        }
        readable
    }

    /// Advances the read index by up to `frames` already-peeked frames.
    pub fn advance_read(&self, frames: usize) {
        let total = self.total.load(Acquire);
        let step = frames.min(self.num_ready());
        let head = self.head.load(Relaxed);
        self.head.store((head + step) % total, Release);
    }

    /// Empties the ring without touching sample storage.
    pub fn reset(&self) {
        self.head.store(0, Release);
        self.tail.store(0, Release);
    }

    /// Reallocates the ring to `capacity` frames across `channels`.
    ///
    /// Not realtime-safe; the caller must keep both endpoints out (the
    /// sync-buffer preparation path does this behind its `prepared` flag
    /// and endpoint locks).
    pub fn resize(&self, channels: usize, capacity: usize) {
        let total = capacity + 1;
        // Safety: exclusive access guaranteed by the caller's contract.
        let storage = unsafe { &mut *self.storage.get() };
        storage.resize_with(channels.max(1), Vec::new);
        for channel in storage.iter_mut() {
            channel.clear();
            channel.resize(total, 0.0);
        }
        self.head.store(0, Release);
        self.tail.store(0, Release);
        self.total.store(total, Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(channels: usize, frames: usize, value: f32) -> AudioBuffer {
        let mut buffer = AudioBuffer::new(channels, frames);
        for channel in buffer.channels_mut() {
            channel.fill(value);
        }
        buffer
    }

    #[test]
    fn write_then_read_round_trip() {
        let ring = LockFreeRing::new(2, 128);
        let src = filled(2, 100, 0.5);
        assert_eq!(ring.write(&src, 2, 100), 100);
        assert_eq!(ring.num_ready(), 100);

        let mut dst = AudioBuffer::new(2, 100);
        assert_eq!(ring.read(&mut dst, 2, 100, true), 100);
        assert!(dst.channel(0).iter().all(|s| (*s - 0.5).abs() < f32::EPSILON));
        assert_eq!(ring.num_ready(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let ring = LockFreeRing::new(1, 64);
        let src = filled(1, 32, 1.0);
        ring.write(&src, 1, 32);

        let mut dst = AudioBuffer::new(1, 32);
        assert_eq!(ring.read(&mut dst, 1, 32, false), 32);
        assert_eq!(ring.num_ready(), 32);
        ring.advance_read(16);
        assert_eq!(ring.num_ready(), 16);
    }

    #[test]
    fn full_ring_drops_excess() {
        let ring = LockFreeRing::new(1, 16);
        let src = filled(1, 32, 1.0);
        assert_eq!(ring.write(&src, 1, 32), 16);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(ring.write(&src, 1, 1), 0);
    }

    #[test]
    fn wraparound_preserves_order() {
        let ring = LockFreeRing::new(1, 8);
        let mut src = AudioBuffer::new(1, 6);
        for (i, s) in src.channel_mut(0).iter_mut().enumerate() {
            *s = i as f32;
        }
        ring.write(&src, 1, 6);
        let mut dst = AudioBuffer::new(1, 6);
        ring.read(&mut dst, 1, 4, true);

        // Second write wraps around the end of storage.
        ring.write(&src, 1, 6);
        let mut tail = AudioBuffer::new(1, 8);
        let got = ring.read(&mut tail, 1, 8, true);
        assert_eq!(got, 8);
        let expect = [4.0, 5.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(&tail.channel(0)[..8], &expect);
    }

    #[test]
    fn concurrent_producer_consumer_sees_all_frames() {
        use std::sync::Arc;

        let ring = Arc::new(LockFreeRing::new(1, 1024));
        let total_frames = 50_000usize;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut src = AudioBuffer::new(1, 64);
                let mut sent = 0usize;
                while sent < total_frames {
                    let n = 64.min(total_frames - sent);
                    for (i, s) in src.channel_mut(0)[..n].iter_mut().enumerate() {
                        *s = (sent + i) as f32;
                    }
                    // Only the committed prefix counts; retry the rest.
                    let wrote = ring.write(&src, 1, n);
                    sent += wrote;
                    if wrote < n {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = 0usize;
        let mut next = 0f32;
        let mut dst = AudioBuffer::new(1, 128);
        while received < total_frames {
            let got = ring.read(&mut dst, 1, 128, true);
            for s in &dst.channel(0)[..got] {
                assert_eq!(*s, next);
                next += 1.0;
            }
            received += got;
            if got == 0 {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}

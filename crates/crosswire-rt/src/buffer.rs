use serde::{Deserialize, Serialize};

/// Stream parameters shared between a host callback and the processing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    pub channels: usize,
}

impl StreamConfig {
    pub fn new(sample_rate: f64, block_size: usize, channels: usize) -> Self {
        Self {
            sample_rate,
            block_size,
            channels,
        }
    }
}

/// Non-interleaved audio buffer for processing.
#[derive(Debug, Clone, Default)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(num_channels: usize, frames: usize) -> Self {
        let channels = (0..num_channels).map(|_| vec![0.0; frames]).collect();
        Self { channels }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.channels, config.block_size)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames per channel.
    pub fn len(&self) -> usize {
        self.channels
            .first()
            .map(|channel| channel.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the buffer if necessary. Shrinking is never performed so a
    /// buffer sized once outside the realtime path stays allocation-free.
    pub fn ensure_capacity(&mut self, num_channels: usize, frames: usize) {
        let frames = frames.max(self.len());
        for channel in &mut self.channels {
            if channel.len() < frames {
                channel.resize(frames, 0.0);
            }
        }
        while self.channels.len() < num_channels {
            self.channels.push(vec![0.0; frames]);
        }
    }

    pub fn resize(&mut self, num_channels: usize, frames: usize) {
        self.channels.resize_with(num_channels, Vec::new);
        for channel in &mut self.channels {
            channel.resize(frames, 0.0);
        }
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.fill(0.0);
        }
    }

    pub fn clear_range(&mut self, frames: usize) {
        for channel in &mut self.channels {
            let end = frames.min(channel.len());
            channel[..end].fill(0.0);
        }
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        &mut self.channels[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &Vec<f32>> {
        self.channels.iter()
    }

    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Vec<f32>> {
        self.channels.iter_mut()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut f32> {
        self.channels
            .iter_mut()
            .flat_map(|channel| channel.iter_mut())
    }

    /// Copies `frames` samples of `src_channel` into `dst_channel`.
    pub fn copy_channel_from(
        &mut self,
        dst_channel: usize,
        src: &AudioBuffer,
        src_channel: usize,
        frames: usize,
    ) {
        let src = src.channel(src_channel);
        let dst = self.channel_mut(dst_channel);
        let len = frames.min(src.len()).min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
    }

    /// Sums `frames` samples of `src_channel` into `dst_channel`.
    pub fn add_channel_from(
        &mut self,
        dst_channel: usize,
        src: &AudioBuffer,
        src_channel: usize,
        frames: usize,
    ) {
        let src = src.channel(src_channel);
        let dst = self.channel_mut(dst_channel);
        let len = frames.min(src.len()).min(dst.len());
        for (d, s) in dst[..len].iter_mut().zip(&src[..len]) {
            *d += *s;
        }
    }

    /// Sums every channel of `src` into this buffer with a linear gain.
    pub fn add_from_with_gain(&mut self, src: &AudioBuffer, frames: usize, gain: f32) {
        let channels = self.channel_count().min(src.channel_count());
        for ch in 0..channels {
            let src_ch = src.channel(ch);
            let dst_ch = self.channel_mut(ch);
            let len = frames.min(src_ch.len()).min(dst_ch.len());
            for (d, s) in dst_ch[..len].iter_mut().zip(&src_ch[..len]) {
                *d += *s * gain;
            }
        }
    }
}

//! Block Audio Buffers
//!
//! Fixed-size sample storage for one processing block. Buffers are allocated
//! once when a module joins the graph and are only cleared, summed and
//! scaled on the audio thread.

/// One mono channel of block audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    samples: Vec<f64>,
}

impl AudioBlock {
    /// Create a silent block with the given size
    pub fn new(size: usize) -> Self {
        Self {
            samples: vec![0.0; size],
        }
    }

    /// Create a block from existing samples
    pub fn from_samples(samples: Vec<f64>) -> Self {
        Self { samples }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `index`, or silence past the end
    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        self.samples.get(index).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.samples
    }

    pub fn fill(&mut self, value: f64) {
        self.samples.fill(value);
    }

    pub fn clear(&mut self) {
        self.fill(0.0);
    }

    pub fn mul_scalar(&mut self, value: f64) {
        for sample in &mut self.samples {
            *sample *= value;
        }
    }

    /// Sum another block into this one
    pub fn add_block(&mut self, other: &AudioBlock) {
        self.add_slice(other.as_slice());
    }

    /// Sum a slice into this block; the shorter length wins
    pub fn add_slice(&mut self, other: &[f64]) {
        for (dst, src) in self.samples.iter_mut().zip(other) {
            *dst += *src;
        }
    }

    /// Copy from a slice; missing samples are zeroed
    pub fn copy_from(&mut self, other: &[f64]) {
        for (i, dst) in self.samples.iter_mut().enumerate() {
            *dst = other.get(i).copied().unwrap_or(0.0);
        }
    }

    /// Peak absolute sample value
    pub fn peak(&self) -> f64 {
        self.samples.iter().fold(0.0_f64, |acc, s| acc.max(s.abs()))
    }
}

/// A multichannel block (one [`AudioBlock`] per channel)
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBuffer {
    channels: Vec<AudioBlock>,
    active: usize,
    block_size: usize,
}

impl ChannelBuffer {
    /// Maximum channels a buffer can carry
    pub const MAX_CHANNELS: usize = 2;

    /// Create a buffer with `channels` active channels (clamped to `1..=MAX_CHANNELS`)
    pub fn new(block_size: usize, channels: usize) -> Self {
        Self {
            channels: (0..Self::MAX_CHANNELS)
                .map(|_| AudioBlock::new(block_size))
                .collect(),
            active: channels.clamp(1, Self::MAX_CHANNELS),
            block_size,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn num_active_channels(&self) -> usize {
        self.active
    }

    pub fn set_num_active_channels(&mut self, channels: usize) {
        self.active = channels.clamp(1, Self::MAX_CHANNELS);
    }

    pub fn channel(&self, ch: usize) -> &AudioBlock {
        &self.channels[ch.min(Self::MAX_CHANNELS - 1)]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut AudioBlock {
        &mut self.channels[ch.min(Self::MAX_CHANNELS - 1)]
    }

    pub fn clear(&mut self) {
        for channel in &mut self.channels {
            channel.clear();
        }
    }

    /// Sum `other` into this buffer, widening the active channel count if needed.
    ///
    /// A mono source is summed into every active channel.
    pub fn add(&mut self, other: &ChannelBuffer) {
        self.active = self.active.max(other.active);
        for ch in 0..self.active {
            let src = if other.active == 1 { 0 } else { ch };
            if src < other.active {
                self.channels[ch].add_block(&other.channels[src]);
            }
        }
    }

    /// Downmix the active channels into a single mono slice
    pub fn mix_to(&self, out: &mut [f64]) {
        let scale = 1.0 / self.active as f64;
        for (i, dst) in out.iter_mut().enumerate() {
            *dst = (0..self.active)
                .map(|ch| self.channels[ch].get(i))
                .sum::<f64>()
                * scale;
        }
    }
}

//! Engine Context
//!
//! The sample rate and block size are fixed for the lifetime of a graph and
//! are passed explicitly to every component at construction, so independent
//! engines (and tests) never share global audio state.

use serde::{Deserialize, Serialize};

/// Default processing block size in samples
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: f64 = 44100.0;

/// Audio constants shared by every component of one engine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineContext {
    /// Sample rate in Hz
    pub sample_rate: f64,
    /// Samples per processing block
    pub block_size: usize,
}

impl EngineContext {
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
        }
    }

    /// Duration of one sample in milliseconds
    #[inline]
    pub fn ms_per_sample(&self) -> f64 {
        1000.0 / self.sample_rate
    }

    /// Duration of one block in milliseconds
    #[inline]
    pub fn block_duration_ms(&self) -> f64 {
        self.block_size as f64 * self.ms_per_sample()
    }

    /// The block window starting at `start_ms`
    pub fn frame_at(&self, start_ms: f64) -> Frame {
        Frame::new(start_ms, self.block_duration_ms())
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_BLOCK_SIZE)
    }
}

/// The half-open time window `[start, start + duration)` covered by one block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    /// Absolute block start time in milliseconds
    pub start: f64,
    /// Block duration in milliseconds
    pub duration: f64,
}

impl Frame {
    pub fn new(start: f64, duration: f64) -> Self {
        Self { start, duration }
    }

    /// Absolute end of the window (exclusive)
    #[inline]
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Whether `time` falls inside `[start, start + duration)`
    #[inline]
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end()
    }

    /// The window that immediately follows this one
    pub fn next(&self) -> Frame {
        Frame::new(self.end(), self.duration)
    }
}

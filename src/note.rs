//! Note Messages
//!
//! Discrete note events travel over note cables with a sub-block timestamp.
//! A velocity of zero is a note-off.

use crate::io::AtomicF64;
use crate::port::PortId;
use std::sync::Arc;

/// Number of note events a module may emit per block before events are dropped
pub const NOTE_OUTPUT_CAPACITY: usize = 256;

/// Per-note modulation sources.
///
/// The continuous sources are shared cells written by a controller (for
/// example a MIDI thread handling pitch bend) and read by the voice while it
/// sounds, so a held note follows the controller after it started.
#[derive(Debug, Clone, Default)]
pub struct Modulation {
    /// Pitch bend in semitones
    pub pitch_bend: Option<Arc<AtomicF64>>,
    /// Mod wheel, 0–1
    pub mod_wheel: Option<Arc<AtomicF64>>,
    /// Channel or polyphonic pressure, 0–1
    pub pressure: Option<Arc<AtomicF64>>,
    /// Stereo position, -1 (left) to 1 (right)
    pub pan: f64,
}

impl Modulation {
    pub fn with_pan(mut self, pan: f64) -> Self {
        self.pan = pan.clamp(-1.0, 1.0);
        self
    }

    pub fn pitch_bend_value(&self) -> f64 {
        self.pitch_bend.as_ref().map_or(0.0, |v| v.get())
    }

    pub fn mod_wheel_value(&self) -> f64 {
        self.mod_wheel.as_ref().map_or(0.0, |v| v.get())
    }

    pub fn pressure_value(&self) -> f64 {
        self.pressure.as_ref().map_or(0.0, |v| v.get())
    }
}

/// A timestamped note event
#[derive(Debug, Clone)]
pub struct NoteMessage {
    /// Absolute time in milliseconds
    pub time: f64,
    /// MIDI pitch
    pub pitch: i32,
    /// MIDI velocity, 0 = note off
    pub velocity: i32,
    /// Voice binding; `None` lets the receiver pick a voice
    pub voice_idx: Option<usize>,
    pub modulation: Modulation,
}

impl NoteMessage {
    pub fn new(time: f64, pitch: i32, velocity: i32) -> Self {
        Self {
            time,
            pitch,
            velocity,
            voice_idx: None,
            modulation: Modulation::default(),
        }
    }

    pub fn on(time: f64, pitch: i32, velocity: i32) -> Self {
        Self::new(time, pitch, velocity.max(1))
    }

    pub fn off(time: f64, pitch: i32) -> Self {
        Self::new(time, pitch, 0)
    }

    pub fn with_voice(mut self, voice_idx: usize) -> Self {
        self.voice_idx = Some(voice_idx);
        self
    }

    pub fn with_modulation(mut self, modulation: Modulation) -> Self {
        self.modulation = modulation;
        self
    }

    #[inline]
    pub fn is_note_on(&self) -> bool {
        self.velocity > 0
    }

    /// Velocity normalized to 0–1
    #[inline]
    pub fn normalized_velocity(&self) -> f64 {
        (self.velocity as f64 / 127.0).clamp(0.0, 1.0)
    }
}

/// Preallocated outbox for notes a module emits during one call
#[derive(Debug)]
pub struct NoteOutput {
    notes: Vec<(PortId, NoteMessage)>,
    capacity: usize,
    dropped: usize,
}

impl NoteOutput {
    pub fn new() -> Self {
        Self::with_capacity(NOTE_OUTPUT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            notes: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Emit a note on output port `port`; dropped when the outbox is full
    pub fn send(&mut self, port: PortId, note: NoteMessage) -> bool {
        if self.notes.len() >= self.capacity {
            self.dropped += 1;
            return false;
        }
        self.notes.push((port, note));
        true
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Notes dropped since the last [`take_dropped`](Self::take_dropped)
    pub fn take_dropped(&mut self) -> usize {
        std::mem::take(&mut self.dropped)
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, (PortId, NoteMessage)> {
        self.notes.drain(..)
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }
}

impl Default for NoteOutput {
    fn default() -> Self {
        Self::new()
    }
}

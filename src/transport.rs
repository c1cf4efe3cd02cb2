//! Transport
//!
//! The single source of musical time for one engine. The transport tracks
//! tempo, time signature and the fractional measure position at its current
//! clock time, answers quantization queries, and fires interval listeners as
//! each block advances the clock.
//!
//! # Listener timing
//!
//! [`Transport::advance`] covers the window `(now, now + ms]`. For every
//! listener (in registration order) it compares the grid step at the start and
//! at the end of the window and emits one [`TimeEvent`] per crossed boundary,
//! stamped with the exact boundary time rather than the block start. Because
//! the end of one window is bit-for-bit the start of the next, each grid line
//! is crossed exactly once regardless of block size, jitter or tempo changes.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::fmt;

new_key_type! {
    /// Handle to a registered transport listener
    pub struct ListenerId;
}

/// A time signature such as 4/4 or 7/8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    /// Beats per measure
    pub top: u32,
    /// Note value of one beat
    pub bottom: u32,
}

impl TimeSignature {
    pub fn new(top: u32, bottom: u32) -> Self {
        Self { top, bottom }
    }

    pub fn is_valid(&self) -> bool {
        self.top > 0 && matches!(self.bottom, 1 | 2 | 4 | 8 | 16 | 32)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

impl fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.top, self.bottom)
    }
}

/// Musical subdivision a listener fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteInterval {
    Whole,
    Half,
    HalfTriplet,
    Quarter,
    QuarterTriplet,
    Eighth,
    EighthTriplet,
    Sixteenth,
    SixteenthTriplet,
    ThirtySecond,
    ThirtySecondTriplet,
    SixtyFourth,
    DottedQuarter,
    DottedEighth,
    DottedSixteenth,
    /// Every `n` measures
    Bars(u32),
    /// `n` equal steps per measure
    CustomDivisor(u32),
    /// Free-running; never fires
    Free,
    /// Disabled; never fires
    None,
}

impl NoteInterval {
    /// Whether listeners on this interval receive time events
    pub fn fires(&self) -> bool {
        match self {
            NoteInterval::Free | NoteInterval::None => false,
            NoteInterval::Bars(n) | NoteInterval::CustomDivisor(n) => *n > 0,
            _ => true,
        }
    }

    /// Whether this is a triplet subdivision
    pub fn is_triplet(&self) -> bool {
        matches!(
            self,
            NoteInterval::HalfTriplet
                | NoteInterval::QuarterTriplet
                | NoteInterval::EighthTriplet
                | NoteInterval::SixteenthTriplet
                | NoteInterval::ThirtySecondTriplet
        )
    }
}

/// Phase offset applied to a listener's grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Offset {
    /// Offset in milliseconds (at the current tempo)
    Ms(f64),
    /// Offset as a fraction of a measure
    Measures(f64),
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Measures(0.0)
    }
}

/// Registration data for one listener
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub interval: NoteInterval,
    pub offset: Offset,
    /// Unregister automatically after the first event
    pub fire_once: bool,
}

impl ListenerConfig {
    pub fn new(interval: NoteInterval) -> Self {
        Self {
            interval,
            offset: Offset::default(),
            fire_once: false,
        }
    }

    pub fn with_offset(mut self, offset: Offset) -> Self {
        self.offset = offset;
        self
    }

    pub fn once(mut self) -> Self {
        self.fire_once = true;
        self
    }
}

/// A grid boundary crossed during [`Transport::advance`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeEvent {
    pub listener: ListenerId,
    /// Exact boundary time in milliseconds
    pub time: f64,
}

/// Tempo, meter and measure position
#[derive(Debug)]
pub struct Transport {
    tempo: f64,
    time_signature: TimeSignature,
    /// Fractional measure position at `now`
    measure_time: f64,
    /// Clock time in milliseconds
    now: f64,
    listeners: SlotMap<ListenerId, ListenerConfig>,
    /// Registration order; also the firing order within a block
    order: Vec<ListenerId>,
    expired: Vec<ListenerId>,
}

impl Transport {
    pub fn new(tempo: f64, time_signature: TimeSignature) -> Self {
        let mut transport = Self {
            tempo: 120.0,
            time_signature: TimeSignature::default(),
            measure_time: 0.0,
            now: 0.0,
            listeners: SlotMap::with_key(),
            order: Vec::new(),
            expired: Vec::new(),
        };
        let _ = transport.set_tempo(tempo);
        let _ = transport.set_time_signature(time_signature);
        transport
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    /// Set the tempo in BPM; non-positive or non-finite tempos are rejected
    /// and the previous tempo is kept.
    pub fn set_tempo(&mut self, tempo: f64) -> Result<(), TransportError> {
        if !(tempo.is_finite() && tempo > 0.0) {
            tracing::warn!(tempo, kept = self.tempo, "rejected invalid tempo");
            return Err(TransportError::InvalidParameter {
                name: "tempo",
                value: tempo,
            });
        }
        self.tempo = tempo;
        Ok(())
    }

    pub fn time_signature(&self) -> TimeSignature {
        self.time_signature
    }

    pub fn set_time_signature(
        &mut self,
        time_signature: TimeSignature,
    ) -> Result<(), TransportError> {
        if !time_signature.is_valid() {
            tracing::warn!(%time_signature, "rejected invalid time signature");
            return Err(TransportError::InvalidParameter {
                name: "time signature",
                value: time_signature.top as f64 / time_signature.bottom.max(1) as f64,
            });
        }
        self.time_signature = time_signature;
        Ok(())
    }

    /// Current clock time in milliseconds
    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn ms_per_bar(&self) -> f64 {
        60.0 / self.tempo * 1000.0 * self.time_signature.top as f64 * 4.0
            / self.time_signature.bottom as f64
    }

    /// Fractional measure position at absolute `time`
    pub fn measure_time(&self, time: f64) -> f64 {
        self.measure_time + (time - self.now) / self.ms_per_bar()
    }

    /// Measure index containing `time`
    pub fn measure(&self, time: f64) -> i64 {
        self.measure_time(time).floor() as i64
    }

    /// Position within the measure containing `time`, in `[0, 1)`
    pub fn measure_pos(&self, time: f64) -> f64 {
        self.measure_time(time).rem_euclid(1.0)
    }

    pub fn set_measure_time(&mut self, measure_time: f64) {
        self.measure_time = measure_time;
    }

    /// Jump to measure `count`, keeping the position within the measure
    pub fn set_measure(&mut self, count: i64) {
        self.measure_time = count as f64 + self.measure_time.rem_euclid(1.0);
    }

    /// Place the clock just before the next downbeat so the next advance
    /// crosses it
    pub fn set_downbeat(&mut self) {
        self.measure_time = self.measure_time.floor() + 1.0 - 1e-9;
    }

    /// Return to just before measure zero
    pub fn reset(&mut self) {
        self.measure_time = -1e-9;
    }

    /// Length of `interval` as a fraction of one measure
    pub fn measure_fraction(&self, interval: NoteInterval) -> f64 {
        let beat = 1.0 / self.time_signature.top as f64;
        match interval {
            NoteInterval::Whole => 1.0,
            NoteInterval::Half => beat * 2.0,
            NoteInterval::HalfTriplet => beat * 2.0 * 2.0 / 3.0,
            NoteInterval::Quarter => beat,
            NoteInterval::QuarterTriplet => beat * 2.0 / 3.0,
            NoteInterval::Eighth => beat * 0.5,
            NoteInterval::EighthTriplet => beat * 0.5 * 2.0 / 3.0,
            NoteInterval::Sixteenth => beat * 0.25,
            NoteInterval::SixteenthTriplet => beat * 0.25 * 2.0 / 3.0,
            NoteInterval::ThirtySecond => beat * 0.125,
            NoteInterval::ThirtySecondTriplet => beat * 0.125 * 2.0 / 3.0,
            NoteInterval::SixtyFourth => beat * 0.0625,
            NoteInterval::DottedQuarter => beat * 1.5,
            NoteInterval::DottedEighth => beat * 0.5 * 1.5,
            NoteInterval::DottedSixteenth => beat * 0.25 * 1.5,
            NoteInterval::Bars(n) => n.max(1) as f64,
            NoteInterval::CustomDivisor(n) => 1.0 / n.max(1) as f64,
            NoteInterval::Free | NoteInterval::None => beat * 0.25,
        }
    }

    /// Length of `interval` in milliseconds at the current tempo
    pub fn duration_ms(&self, interval: NoteInterval) -> f64 {
        self.ms_per_bar() * self.measure_fraction(interval)
    }

    /// How many of `interval` fit in a 4/4 measure, for sub-measure intervals
    pub fn count_in_standard_measure(interval: NoteInterval) -> Option<u32> {
        match interval {
            NoteInterval::Whole => Some(1),
            NoteInterval::Half => Some(2),
            NoteInterval::HalfTriplet => Some(3),
            NoteInterval::Quarter => Some(4),
            NoteInterval::QuarterTriplet => Some(6),
            NoteInterval::Eighth => Some(8),
            NoteInterval::EighthTriplet => Some(12),
            NoteInterval::Sixteenth => Some(16),
            NoteInterval::SixteenthTriplet => Some(24),
            NoteInterval::ThirtySecond => Some(32),
            NoteInterval::ThirtySecondTriplet => Some(48),
            NoteInterval::SixtyFourth => Some(64),
            _ => None,
        }
    }

    fn offset_in_measures(&self, offset: Offset) -> f64 {
        match offset {
            Offset::Ms(ms) => ms / self.ms_per_bar(),
            Offset::Measures(m) => m,
        }
    }

    /// Unclamped grid step index containing `time`
    pub fn step_at(&self, time: f64, interval: NoteInterval, offset: Offset) -> i64 {
        let fraction = self.measure_fraction(interval);
        ((self.measure_time(time) + self.offset_in_measures(offset)) / fraction).floor() as i64
    }

    /// The grid time of `interval` at or before `time`
    pub fn quantize(&self, time: f64, interval: NoteInterval) -> f64 {
        let fraction = self.measure_fraction(interval);
        let measure_time = self.measure_time(time);
        let grid = (measure_time / fraction).floor() * fraction;
        time - (measure_time - grid) * self.ms_per_bar()
    }

    /// Register a listener; fires in registration order within a block
    pub fn add_listener(&mut self, config: ListenerConfig) -> ListenerId {
        let id = self.listeners.insert(config);
        self.order.push(id);
        id
    }

    /// Change a listener's subdivision in place.
    ///
    /// Steps are evaluated with the new grid at both ends of the next window,
    /// so the change neither re-fires the boundary just crossed nor skips one.
    pub fn update_listener(&mut self, id: ListenerId, interval: NoteInterval, offset: Offset) {
        match self.listeners.get_mut(id) {
            Some(config) => {
                config.interval = interval;
                config.offset = offset;
            }
            None => debug_assert!(false, "update_listener called with a removed handle"),
        }
    }

    pub fn remove_listener(&mut self, id: ListenerId) {
        if self.listeners.remove(id).is_none() {
            debug_assert!(false, "remove_listener called with a removed handle");
            return;
        }
        self.order.retain(|&l| l != id);
    }

    pub fn listener(&self, id: ListenerId) -> Option<&ListenerConfig> {
        self.listeners.get(id)
    }

    pub fn contains_listener(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(id)
    }

    pub fn listener_count(&self) -> usize {
        self.order.len()
    }

    /// Steps per measure for a listener's interval
    pub fn steps_per_measure(&self, id: ListenerId) -> Option<u32> {
        let config = self.listeners.get(id)?;
        let steps = match config.interval {
            NoteInterval::CustomDivisor(n) => n,
            interval => {
                (1.0 / self.measure_fraction(interval)).round().max(1.0) as u32
            }
        };
        Some(steps)
    }

    /// Global step index for a listener at `time`, wrapped to `length` if given
    pub fn synced_step(&self, time: f64, id: ListenerId, length: Option<usize>) -> Option<i64> {
        let config = self.listeners.get(id)?;
        let step = self.step_at(time, config.interval, config.offset);
        Some(match length {
            Some(len) if len > 0 => step.rem_euclid(len as i64),
            _ => step,
        })
    }

    /// Advance the clock by `ms`, emitting every boundary in `(now, now + ms]`.
    ///
    /// Listeners are visited in registration order; a listener that crosses
    /// several boundaries in one window emits them in time order.
    pub fn advance(&mut self, ms: f64, mut on_event: impl FnMut(TimeEvent)) {
        if !(ms.is_finite() && ms > 0.0) {
            tracing::warn!(ms, "ignored non-positive transport advance");
            return;
        }

        let ms_per_bar = self.ms_per_bar();
        let start_time = self.now;
        let end_time = self.now + ms;
        let start_measure = self.measure_time;
        let end_measure = start_measure + ms / ms_per_bar;

        for &id in &self.order {
            let config = &self.listeners[id];
            if !config.interval.fires() {
                continue;
            }

            let fraction = self.measure_fraction(config.interval);
            let offset = self.offset_in_measures(config.offset);
            let old_step = ((start_measure + offset) / fraction).floor() as i64;
            let new_step = ((end_measure + offset) / fraction).floor() as i64;

            for step in (old_step + 1)..=new_step {
                let boundary = step as f64 * fraction - offset;
                let time = (start_time + (boundary - start_measure) * ms_per_bar)
                    .clamp(start_time, end_time);
                on_event(TimeEvent { listener: id, time });
                if config.fire_once {
                    self.expired.push(id);
                    break;
                }
            }
        }

        self.measure_time = end_measure;
        self.now = end_time;

        for id in self.expired.drain(..) {
            self.listeners.remove(id);
            self.order.retain(|&l| l != id);
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(120.0, TimeSignature::default())
    }
}

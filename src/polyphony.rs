//! Polyphony Support
//!
//! [`VoiceAllocator`] maps incoming notes onto a fixed pool of voices.
//!
//! # Allocation
//!
//! - A note with an explicit voice index binds to that slot, so a later stop
//!   with the same index ends the right voice.
//! - A note without an index first retriggers any voice (sounding or
//!   releasing) already playing the same pitch, then takes a free slot in
//!   round-robin order, then steals according to the [`StealPolicy`].
//!
//! The voice limit bounds how many voices sound at once. A stolen voice that
//! is still audible is rendered into a short fade buffer and faded out over
//! [`VOICE_FADE_SAMPLES`] samples instead of being cut off.

use crate::buffer::ChannelBuffer;
use crate::context::EngineContext;
use crate::note::Modulation;
use crate::voice::Voice;
use serde::{Deserialize, Serialize};

/// Size of the voice pool
pub const MAX_VOICES: usize = 16;

/// Length of the fade applied to a stolen voice
pub const VOICE_FADE_SAMPLES: usize = 64;

const FADE_CHANNELS: usize = ChannelBuffer::MAX_CHANNELS;

/// Which voice gives way when a new note arrives and the limit is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StealPolicy {
    /// Steal the voice that started longest ago
    #[default]
    Oldest,
    /// Steal the voice with the lowest current level
    Quietest,
    /// Never steal; the new note is ignored
    NoSteal,
}

impl StealPolicy {
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => StealPolicy::Quietest,
            2 => StealPolicy::NoSteal,
            _ => StealPolicy::Oldest,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            StealPolicy::Oldest => 0,
            StealPolicy::Quietest => 1,
            StealPolicy::NoSteal => 2,
        }
    }
}

/// Lifecycle of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceState {
    /// Not playing
    Free,
    /// Note held (attack, decay or sustain)
    Active,
    /// Note released; the envelope tail is still sounding
    Releasing,
}

#[derive(Debug)]
struct VoiceSlot<V> {
    voice: V,
    state: VoiceState,
    pitch: i32,
    start_time: f64,
    /// Allocation sequence number; lower is older
    order: u64,
}

/// Voice allocator for polyphonic modules
#[derive(Debug)]
pub struct VoiceAllocator<V: Voice> {
    slots: Vec<VoiceSlot<V>>,
    voice_limit: usize,
    policy: StealPolicy,
    last_voice: usize,
    counter: u64,
    ctx: EngineContext,
    fade_ctx: EngineContext,
    fade: [[f64; VOICE_FADE_SAMPLES]; FADE_CHANNELS],
    fade_head: usize,
    fade_remaining: usize,
    fade_scratch: ChannelBuffer,
    /// Time of the first sample the next `process` call renders
    render_from: f64,
    channels: usize,
    steals: usize,
}

impl<V: Voice> VoiceAllocator<V> {
    /// Create an allocator with [`MAX_VOICES`] voices built by `make`
    pub fn new(ctx: EngineContext, channels: usize, mut make: impl FnMut() -> V) -> Self {
        let slots = (0..MAX_VOICES)
            .map(|_| VoiceSlot {
                voice: make(),
                state: VoiceState::Free,
                pitch: 0,
                start_time: 0.0,
                order: 0,
            })
            .collect();
        let channels = channels.clamp(1, FADE_CHANNELS);

        Self {
            slots,
            voice_limit: MAX_VOICES,
            policy: StealPolicy::default(),
            last_voice: MAX_VOICES - 1,
            counter: 0,
            ctx,
            fade_ctx: EngineContext::new(ctx.sample_rate, VOICE_FADE_SAMPLES),
            fade: [[0.0; VOICE_FADE_SAMPLES]; FADE_CHANNELS],
            fade_head: 0,
            fade_remaining: 0,
            fade_scratch: ChannelBuffer::new(VOICE_FADE_SAMPLES, channels),
            render_from: 0.0,
            channels,
            steals: 0,
        }
    }

    pub fn policy(&self) -> StealPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: StealPolicy) {
        self.policy = policy;
    }

    pub fn voice_limit(&self) -> usize {
        self.voice_limit
    }

    /// Number of voices currently sounding (held or releasing)
    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != VoiceState::Free)
            .count()
    }

    pub fn state(&self, index: usize) -> Option<VoiceState> {
        self.slots.get(index).map(|s| s.state)
    }

    /// Pitch of the voice at `index`, if it is sounding
    pub fn pitch(&self, index: usize) -> Option<i32> {
        self.slots
            .get(index)
            .filter(|s| s.state != VoiceState::Free)
            .map(|s| s.pitch)
    }

    pub fn voice(&self, index: usize) -> Option<&V> {
        self.slots.get(index).map(|s| &s.voice)
    }

    /// Apply `f` to every voice in the pool
    pub fn for_each_voice(&mut self, mut f: impl FnMut(&mut V)) {
        for slot in &mut self.slots {
            f(&mut slot.voice);
        }
    }

    /// Total voices stolen since creation
    pub fn steal_count(&self) -> usize {
        self.steals
    }

    /// Whether a stolen voice's fade tail is still pending
    pub fn is_fading(&self) -> bool {
        self.fade_remaining > 0
    }

    /// Start a note, returning the voice it was assigned to.
    ///
    /// Returns `None` if the note could not be placed (an invalid voice index,
    /// or a full pool under [`StealPolicy::NoSteal`]).
    pub fn start(
        &mut self,
        time: f64,
        pitch: i32,
        velocity: f64,
        voice_idx: Option<usize>,
        modulation: Modulation,
    ) -> Option<usize> {
        let index = match voice_idx {
            Some(index) => self.bind_explicit(time, index)?,
            None => self.choose(time, pitch)?,
        };

        self.counter += 1;
        let slot = &mut self.slots[index];
        slot.state = VoiceState::Active;
        slot.pitch = pitch;
        slot.start_time = time;
        slot.order = self.counter;
        slot.voice.start(time, pitch as f64, velocity, modulation);
        self.last_voice = index;
        Some(index)
    }

    fn bind_explicit(&mut self, time: f64, index: usize) -> Option<usize> {
        if index >= MAX_VOICES {
            tracing::warn!(index, "voice index out of range");
            return None;
        }
        if self.slots[index].state == VoiceState::Free && self.active_count() >= self.voice_limit {
            let victim = self.pick_victim(time, Some(index))?;
            self.steal(victim, time);
        }
        Some(index)
    }

    fn choose(&mut self, time: f64, pitch: i32) -> Option<usize> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| s.state != VoiceState::Free && s.pitch == pitch)
        {
            return Some(index);
        }

        if self.active_count() < self.voice_limit {
            if let Some(index) = self.find_free_voice() {
                return Some(index);
            }
        }

        let victim = self.pick_victim(time, None)?;
        self.steal(victim, time);
        Some(victim)
    }

    /// Next free slot after the last voice used
    fn find_free_voice(&self) -> Option<usize> {
        (1..=MAX_VOICES)
            .map(|i| (self.last_voice + i) % MAX_VOICES)
            .find(|&i| self.slots[i].state == VoiceState::Free)
    }

    fn pick_victim(&self, time: f64, exclude: Option<usize>) -> Option<usize> {
        let candidates = self
            .slots
            .iter()
            .enumerate()
            .filter(|(i, s)| s.state != VoiceState::Free && Some(*i) != exclude);

        match self.policy {
            StealPolicy::NoSteal => {
                tracing::debug!("voice limit reached, note ignored");
                None
            }
            StealPolicy::Oldest => candidates.min_by_key(|(_, s)| s.order).map(|(i, _)| i),
            StealPolicy::Quietest => candidates
                .min_by(|(_, a), (_, b)| {
                    a.voice
                        .level(time)
                        .partial_cmp(&b.voice.level(time))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i),
        }
    }

    fn oldest(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state != VoiceState::Free)
            .min_by_key(|(_, s)| s.order)
            .map(|(i, _)| i)
    }

    /// Fade out and free the voice at `index`
    fn steal(&mut self, index: usize, time: f64) {
        self.steals += 1;
        let slot = &mut self.slots[index];
        if !slot.voice.is_done(time) {
            // The fade is mixed in from the next rendered sample on
            self.fade_scratch.clear();
            slot.voice
                .process(self.render_from, &mut self.fade_scratch, &self.fade_ctx);

            for ch in 0..self.channels {
                let src = self.fade_scratch.channel(ch).as_slice();
                for (i, sample) in src.iter().enumerate() {
                    let gain = 1.0 - i as f64 / VOICE_FADE_SAMPLES as f64;
                    self.fade[ch][(self.fade_head + i) % VOICE_FADE_SAMPLES] += sample * gain;
                }
            }
            self.fade_remaining = VOICE_FADE_SAMPLES;
        }
        slot.voice.clear();
        slot.state = VoiceState::Free;
        tracing::trace!(index, pitch = slot.pitch, "voice stolen");
    }

    /// Release the voice playing `pitch` (or bound to `voice_idx`).
    ///
    /// A stop that matches no held voice is ignored.
    pub fn stop(&mut self, time: f64, pitch: i32, voice_idx: Option<usize>) {
        let found = match voice_idx {
            Some(index) => self
                .slots
                .get(index)
                .filter(|s| s.state == VoiceState::Active && s.pitch == pitch)
                .map(|_| index),
            None => self
                .slots
                .iter()
                .position(|s| s.state == VoiceState::Active && s.pitch == pitch),
        };

        match found {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.voice.stop(time);
                slot.state = VoiceState::Releasing;
            }
            None => tracing::trace!(pitch, "stop with no matching voice"),
        }
    }

    /// Retune a sounding voice
    pub fn set_pitch(&mut self, index: usize, pitch: f64) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.state != VoiceState::Free {
                slot.voice.set_pitch(pitch);
            }
        }
    }

    /// Render all sounding voices into `out` and retire finished ones
    pub fn process(&mut self, time: f64, out: &mut ChannelBuffer) {
        if out.block_size() == 0 {
            return;
        }

        if self.fade_remaining > 0 {
            let n = out.block_size().min(self.fade_remaining);
            let channels = self.channels.min(out.num_active_channels());
            for ch in 0..FADE_CHANNELS {
                for i in 0..n {
                    let pos = (self.fade_head + i) % VOICE_FADE_SAMPLES;
                    if ch < channels {
                        out.channel_mut(ch).as_mut_slice()[i] += self.fade[ch][pos];
                    }
                    self.fade[ch][pos] = 0.0;
                }
            }
            self.fade_head = (self.fade_head + n) % VOICE_FADE_SAMPLES;
            self.fade_remaining -= n;
        }

        let end = time + out.block_size() as f64 * self.ctx.ms_per_sample();
        self.render_from = end;
        for slot in &mut self.slots {
            if slot.state == VoiceState::Free {
                continue;
            }
            slot.voice.process(time, out, &self.ctx);
            if slot.state == VoiceState::Releasing && slot.voice.is_done(end) {
                slot.voice.clear();
                slot.state = VoiceState::Free;
            }
        }
    }

    /// Bound concurrency to `limit` voices.
    ///
    /// Out-of-range limits are clamped to `1..=MAX_VOICES`. Lowering the limit
    /// below the number of sounding voices steals the oldest first.
    pub fn set_voice_limit(&mut self, limit: usize, time: f64) {
        let clamped = limit.clamp(1, MAX_VOICES);
        if clamped != limit {
            tracing::warn!(limit, clamped, "voice limit out of range");
        }
        self.voice_limit = clamped;

        while self.active_count() > self.voice_limit {
            match self.oldest() {
                Some(index) => self.steal(index, time),
                None => break,
            }
        }
    }

    /// Release every held voice
    pub fn all_notes_off(&mut self, time: f64) {
        for slot in &mut self.slots {
            if slot.state == VoiceState::Active {
                slot.voice.stop(time);
                slot.state = VoiceState::Releasing;
            }
        }
    }

    /// Silence every voice immediately
    pub fn kill_all(&mut self) {
        for slot in &mut self.slots {
            slot.voice.clear();
            slot.state = VoiceState::Free;
        }
        self.fade = [[0.0; VOICE_FADE_SAMPLES]; FADE_CHANNELS];
        self.fade_remaining = 0;
    }
}

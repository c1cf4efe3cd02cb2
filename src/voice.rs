//! Voices
//!
//! A [`Voice`] is one sounding note: an oscillator (or any generator) shaped
//! by an envelope. The [`VoiceAllocator`](crate::polyphony::VoiceAllocator)
//! owns a fixed pool of voices and decides which one plays each note.

use crate::buffer::ChannelBuffer;
use crate::context::EngineContext;
use crate::envelope::{AdsrParams, Envelope};
use crate::note::Modulation;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// A single polyphonic voice.
///
/// Times are absolute milliseconds. `process` adds the voice's contribution
/// into `out` for `out.block_size()` samples starting at `time`.
pub trait Voice: Send {
    fn start(&mut self, time: f64, pitch: f64, velocity: f64, modulation: Modulation);

    /// Enter the release stage
    fn stop(&mut self, time: f64);

    fn set_pitch(&mut self, pitch: f64);

    fn set_modulation(&mut self, modulation: Modulation);

    /// Silence immediately and forget the note
    fn clear(&mut self);

    /// Whether the voice has finished sounding at `time`
    fn is_done(&self, time: f64) -> bool;

    /// Current amplitude, used to rank steal candidates
    fn level(&self, time: f64) -> f64;

    fn process(&mut self, time: f64, out: &mut ChannelBuffer, ctx: &EngineContext);
}

/// Oscillator waveform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Waveform {
    #[default]
    Sine,
    Saw,
    Square,
    Triangle,
}

impl Waveform {
    pub fn from_index(index: usize) -> Self {
        match index {
            1 => Waveform::Saw,
            2 => Waveform::Square,
            3 => Waveform::Triangle,
            _ => Waveform::Sine,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Waveform::Sine => 0,
            Waveform::Saw => 1,
            Waveform::Square => 2,
            Waveform::Triangle => 3,
        }
    }

    /// Sample at phase `phase` in `[0, 1)`
    #[inline]
    fn sample(&self, phase: f64) -> f64 {
        match self {
            Waveform::Sine => libm::sin(phase * 2.0 * PI),
            Waveform::Saw => 2.0 * phase - 1.0,
            Waveform::Square => {
                if phase < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
        }
    }
}

/// Settings shared by every voice of a synth
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub waveform: Waveform,
    pub envelope: AdsrParams,
    pub gain: f64,
    /// Pitch bend range in semitones
    pub bend_range: f64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            envelope: AdsrParams::default(),
            gain: 0.5,
            bend_range: 2.0,
        }
    }
}

/// MIDI pitch to frequency in Hz (A4 = 69 = 440 Hz)
#[inline]
pub fn pitch_to_freq(pitch: f64) -> f64 {
    440.0 * libm::exp2((pitch - 69.0) / 12.0)
}

/// Basic oscillator-plus-envelope voice
#[derive(Debug, Clone)]
pub struct OscillatorVoice {
    settings: VoiceSettings,
    envelope: Envelope,
    pitch: f64,
    phase: f64,
    modulation: Modulation,
}

impl OscillatorVoice {
    pub fn new(settings: VoiceSettings) -> Self {
        Self {
            settings,
            envelope: Envelope::new(settings.envelope),
            pitch: 60.0,
            phase: 0.0,
            modulation: Modulation::default(),
        }
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: VoiceSettings) {
        self.settings = settings;
        self.envelope.set_params(settings.envelope);
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn pitch(&self) -> f64 {
        self.pitch
    }
}

impl Default for OscillatorVoice {
    fn default() -> Self {
        Self::new(VoiceSettings::default())
    }
}

impl Voice for OscillatorVoice {
    fn start(&mut self, time: f64, pitch: f64, velocity: f64, modulation: Modulation) {
        if self.envelope.is_done(time) {
            self.phase = 0.0;
        }
        self.pitch = pitch;
        self.modulation = modulation;
        self.envelope.start(time, velocity);
    }

    fn stop(&mut self, time: f64) {
        self.envelope.stop(time);
    }

    fn set_pitch(&mut self, pitch: f64) {
        self.pitch = pitch;
    }

    fn set_modulation(&mut self, modulation: Modulation) {
        self.modulation = modulation;
    }

    fn clear(&mut self) {
        self.envelope.clear();
        self.phase = 0.0;
        self.modulation = Modulation::default();
    }

    fn is_done(&self, time: f64) -> bool {
        self.envelope.is_done(time)
    }

    fn level(&self, time: f64) -> f64 {
        self.envelope.value(time)
    }

    fn process(&mut self, time: f64, out: &mut ChannelBuffer, ctx: &EngineContext) {
        if self.envelope.is_done(time) || ctx.sample_rate <= 0.0 {
            return;
        }

        let bend = self.modulation.pitch_bend_value() * self.settings.bend_range;
        let increment = pitch_to_freq(self.pitch + bend) / ctx.sample_rate;
        let ms_per_sample = ctx.ms_per_sample();

        let pan = self.modulation.pan;
        let stereo = out.num_active_channels() > 1;
        let (left, right) = if stereo {
            ((1.0 - pan) * 0.5, (1.0 + pan) * 0.5)
        } else {
            (1.0, 0.0)
        };

        for i in 0..out.block_size() {
            let level = self.envelope.value(time + i as f64 * ms_per_sample);
            let sample = self.settings.waveform.sample(self.phase) * level * self.settings.gain;
            self.phase = (self.phase + increment).fract();

            out.channel_mut(0).as_mut_slice()[i] += sample * left;
            if stereo {
                out.channel_mut(1).as_mut_slice()[i] += sample * right;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::AtomicF64;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn test_pitch_to_freq() {
        assert_relative_eq!(pitch_to_freq(69.0), 440.0);
        assert_relative_eq!(pitch_to_freq(81.0), 880.0);
    }

    #[test]
    fn test_waveform_index_roundtrip() {
        for i in 0..4 {
            assert_eq!(Waveform::from_index(i).index(), i);
        }
    }

    #[test]
    fn test_idle_voice_is_silent() {
        let ctx = EngineContext::default();
        let mut voice = OscillatorVoice::default();
        let mut out = ChannelBuffer::new(ctx.block_size, 1);
        voice.process(0.0, &mut out, &ctx);
        assert_eq!(out.channel(0).peak(), 0.0);
        assert!(voice.is_done(0.0));
    }

    #[test]
    fn test_started_voice_sounds_then_finishes() {
        let ctx = EngineContext::default();
        let mut voice = OscillatorVoice::new(VoiceSettings {
            waveform: Waveform::Square,
            ..VoiceSettings::default()
        });
        voice.start(0.0, 60.0, 1.0, Modulation::default());

        let mut out = ChannelBuffer::new(ctx.block_size, 1);
        voice.process(10.0, &mut out, &ctx);
        assert!(out.channel(0).peak() > 0.1);

        voice.stop(20.0);
        assert!(!voice.is_done(20.0));
        assert!(voice.is_done(20.0 + voice.settings().envelope.release_ms));
    }

    #[test]
    fn test_hard_pan_left() {
        let ctx = EngineContext::default();
        let mut voice = OscillatorVoice::new(VoiceSettings {
            waveform: Waveform::Square,
            ..VoiceSettings::default()
        });
        voice.start(0.0, 60.0, 1.0, Modulation::default().with_pan(-1.0));
        let mut out = ChannelBuffer::new(ctx.block_size, 2);
        voice.process(10.0, &mut out, &ctx);
        assert!(out.channel(0).peak() > 0.0);
        assert_eq!(out.channel(1).peak(), 0.0);
    }

    #[test]
    fn test_pitch_bend_follows_shared_cell() {
        let bend = Arc::new(AtomicF64::new(0.0));
        let mut voice = OscillatorVoice::default();
        voice.start(
            0.0,
            60.0,
            1.0,
            Modulation {
                pitch_bend: Some(bend.clone()),
                ..Modulation::default()
            },
        );
        bend.set(1.0);
        let ctx = EngineContext::default();
        let mut out = ChannelBuffer::new(ctx.block_size, 1);
        voice.process(10.0, &mut out, &ctx);
        assert!(out.channel(0).peak() > 0.0);
    }
}

//! Built-in Modules
//!
//! The note-driven building blocks a patch needs beyond hardware I/O:
//! a polyphonic synth voice bank, a gain stage, a transport-synced step
//! sequencer and a note transposer.

use crate::context::{EngineContext, Frame};
use crate::envelope::AdsrParams;
use crate::error::StateError;
use crate::module::{Module, ProcessIo};
use crate::note::{NoteMessage, NoteOutput};
use crate::polyphony::{StealPolicy, VoiceAllocator, MAX_VOICES};
use crate::port::{ParamDef, ParamId, PortDef, PortId, PortSpec};
use crate::transport::{ListenerConfig, NoteInterval};
use crate::voice::{OscillatorVoice, VoiceSettings, Waveform};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::any::Any;

/// Polyphonic Synthesizer
///
/// Plays incoming notes on a bank of oscillator voices. The voice limit and
/// steal policy are parameters, so they persist with the layout.
pub struct PolySynth {
    spec: PortSpec,
    params: Vec<ParamDef>,
    settings: VoiceSettings,
    voice_limit: usize,
    policy: StealPolicy,
    voices: VoiceAllocator<OscillatorVoice>,
    now: f64,
}

impl PolySynth {
    pub const WAVEFORM: ParamId = 0;
    pub const ATTACK: ParamId = 1;
    pub const DECAY: ParamId = 2;
    pub const SUSTAIN: ParamId = 3;
    pub const RELEASE: ParamId = 4;
    pub const CURVE: ParamId = 5;
    pub const GAIN: ParamId = 6;
    pub const VOICE_LIMIT: ParamId = 7;
    pub const STEAL_POLICY: ParamId = 8;

    pub fn new() -> Self {
        let settings = VoiceSettings::default();
        let env = settings.envelope;
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::note(0, "notes")],
                outputs: vec![PortDef::audio(10, "out").stereo()],
            },
            params: vec![
                ParamDef::new(Self::WAVEFORM, "waveform", 0.0, 0.0, 3.0),
                ParamDef::new(Self::ATTACK, "attack", env.attack_ms, 1.0, 10_000.0),
                ParamDef::new(Self::DECAY, "decay", env.decay_ms, 1.0, 10_000.0),
                ParamDef::new(Self::SUSTAIN, "sustain", env.sustain, 0.0, 1.0),
                ParamDef::new(Self::RELEASE, "release", env.release_ms, 1.0, 10_000.0),
                ParamDef::new(Self::CURVE, "curve", env.curve, -1.0, 1.0),
                ParamDef::new(Self::GAIN, "gain", settings.gain, 0.0, 1.0),
                ParamDef::new(
                    Self::VOICE_LIMIT,
                    "voice_limit",
                    MAX_VOICES as f64,
                    1.0,
                    MAX_VOICES as f64,
                ),
                ParamDef::new(Self::STEAL_POLICY, "steal_policy", 0.0, 0.0, 2.0),
            ],
            settings,
            voice_limit: MAX_VOICES,
            policy: StealPolicy::default(),
            voices: Self::allocator(EngineContext::default(), settings),
            now: 0.0,
        }
    }

    /// Start with a lower voice limit
    pub fn with_voice_limit(mut self, limit: usize) -> Self {
        self.voice_limit = limit.clamp(1, MAX_VOICES);
        self.voices.set_voice_limit(self.voice_limit, self.now);
        self
    }

    fn allocator(ctx: EngineContext, settings: VoiceSettings) -> VoiceAllocator<OscillatorVoice> {
        VoiceAllocator::new(ctx, 2, || OscillatorVoice::new(settings))
    }

    pub fn voices(&self) -> &VoiceAllocator<OscillatorVoice> {
        &self.voices
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    fn push_settings(&mut self) {
        let settings = self.settings;
        self.voices.for_each_voice(|v| v.set_settings(settings));
    }
}

impl Default for PolySynth {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PolySynth {
    fn type_id(&self) -> &'static str {
        "poly_synth"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn init(&mut self, ctx: &EngineContext) {
        self.voices = Self::allocator(*ctx, self.settings);
        self.voices.set_policy(self.policy);
        self.voices.set_voice_limit(self.voice_limit, self.now);
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        let env = &self.settings.envelope;
        match id {
            Self::WAVEFORM => Some(self.settings.waveform.index() as f64),
            Self::ATTACK => Some(env.attack_ms),
            Self::DECAY => Some(env.decay_ms),
            Self::SUSTAIN => Some(env.sustain),
            Self::RELEASE => Some(env.release_ms),
            Self::CURVE => Some(env.curve),
            Self::GAIN => Some(self.settings.gain),
            Self::VOICE_LIMIT => Some(self.voice_limit as f64),
            Self::STEAL_POLICY => Some(self.policy.index() as f64),
            _ => None,
        }
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        let env: &mut AdsrParams = &mut self.settings.envelope;
        match id {
            Self::WAVEFORM => self.settings.waveform = Waveform::from_index(value.round() as usize),
            Self::ATTACK => env.attack_ms = value,
            Self::DECAY => env.decay_ms = value,
            Self::SUSTAIN => env.sustain = value,
            Self::RELEASE => env.release_ms = value,
            Self::CURVE => env.curve = value,
            Self::GAIN => self.settings.gain = value,
            Self::VOICE_LIMIT => {
                self.voice_limit = (value.round() as usize).clamp(1, MAX_VOICES);
                self.voices.set_voice_limit(self.voice_limit, self.now);
                return;
            }
            Self::STEAL_POLICY => {
                self.policy = StealPolicy::from_index(value.round() as usize);
                self.voices.set_policy(self.policy);
                return;
            }
            _ => return,
        }
        self.push_settings();
    }

    fn poll(&mut self, frame: Frame) {
        self.now = frame.start;
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let start = io.frame.start;
        if let Some(out) = io.output(0) {
            self.voices.process(start, out);
        }
    }

    fn play_note(&mut self, _port: PortId, note: NoteMessage, _out: &mut NoteOutput) {
        if note.is_note_on() {
            let velocity = note.normalized_velocity();
            self.voices
                .start(note.time, note.pitch, velocity, note.voice_idx, note.modulation);
        } else {
            self.voices.stop(note.time, note.pitch, note.voice_idx);
        }
    }

    fn reset(&mut self) {
        self.voices.kill_all();
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

/// Gain stage
///
/// Scales a (mono or stereo) signal.
pub struct Gain {
    spec: PortSpec,
    params: Vec<ParamDef>,
    gain: f64,
}

impl Gain {
    pub const GAIN: ParamId = 0;

    pub fn new(gain: f64) -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::audio(0, "in").stereo()],
                outputs: vec![PortDef::audio(10, "out").stereo()],
            },
            params: vec![ParamDef::new(Self::GAIN, "gain", 1.0, 0.0, 4.0)],
            gain: gain.clamp(0.0, 4.0),
        }
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Module for Gain {
    fn type_id(&self) -> &'static str {
        "gain"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        (id == Self::GAIN).then_some(self.gain)
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        if id == Self::GAIN {
            self.gain = value;
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let (Some(input), Some(output)) = (io.inputs.first(), io.outputs.first_mut()) else {
            return;
        };
        output.set_num_active_channels(input.num_active_channels());
        output.add(input);
        for ch in 0..output.num_active_channels() {
            output.channel_mut(ch).mul_scalar(self.gain);
        }
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

/// Maximum steps in a sequencer pattern
pub const MAX_STEPS: usize = 16;

const SEQUENCER_STATE_REVISION: u32 = 1;

/// Grid intervals selectable by [`StepSequencer::INTERVAL`]
const SEQUENCER_INTERVALS: [NoteInterval; 8] = [
    NoteInterval::Quarter,
    NoteInterval::Eighth,
    NoteInterval::Sixteenth,
    NoteInterval::EighthTriplet,
    NoteInterval::SixteenthTriplet,
    NoteInterval::Half,
    NoteInterval::Whole,
    NoteInterval::ThirtySecond,
];

/// One step of a sequencer pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    /// Semitones above the root
    pub offset: i32,
    pub active: bool,
}

/// Step Sequencer
///
/// Listens to the transport and emits one note per grid step at the exact
/// boundary time, followed by a note-off after the gate length.
pub struct StepSequencer {
    spec: PortSpec,
    params: Vec<ParamDef>,
    pattern: [Step; MAX_STEPS],
    interval: usize,
    steps: usize,
    gate_ms: f64,
    velocity: i32,
    root: i32,
    position: usize,
}

impl StepSequencer {
    pub const INTERVAL: ParamId = 0;
    pub const STEPS: ParamId = 1;
    pub const GATE: ParamId = 2;
    pub const VELOCITY: ParamId = 3;
    pub const ROOT: ParamId = 4;

    pub fn new() -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![],
                outputs: vec![PortDef::note(0, "notes")],
            },
            params: vec![
                ParamDef::new(
                    Self::INTERVAL,
                    "interval",
                    1.0,
                    0.0,
                    (SEQUENCER_INTERVALS.len() - 1) as f64,
                ),
                ParamDef::new(Self::STEPS, "steps", 8.0, 1.0, MAX_STEPS as f64),
                ParamDef::new(Self::GATE, "gate", 100.0, 1.0, 4000.0),
                ParamDef::new(Self::VELOCITY, "velocity", 100.0, 1.0, 127.0),
                ParamDef::new(Self::ROOT, "root", 60.0, 0.0, 127.0),
            ],
            pattern: [Step {
                offset: 0,
                active: true,
            }; MAX_STEPS],
            interval: 1,
            steps: 8,
            gate_ms: 100.0,
            velocity: 100,
            root: 60,
            position: 0,
        }
    }

    /// Set a step's pitch offset and whether it plays
    pub fn set_step(&mut self, index: usize, offset: i32, active: bool) {
        if let Some(step) = self.pattern.get_mut(index) {
            *step = Step { offset, active };
        }
    }

    pub fn step(&self, index: usize) -> Option<Step> {
        self.pattern.get(index).copied()
    }

    /// Index of the step that plays next
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn interval(&self) -> NoteInterval {
        SEQUENCER_INTERVALS[self.interval]
    }
}

impl Default for StepSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for StepSequencer {
    fn type_id(&self) -> &'static str {
        "step_sequencer"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        match id {
            Self::INTERVAL => Some(self.interval as f64),
            Self::STEPS => Some(self.steps as f64),
            Self::GATE => Some(self.gate_ms),
            Self::VELOCITY => Some(self.velocity as f64),
            Self::ROOT => Some(self.root as f64),
            _ => None,
        }
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        match id {
            Self::INTERVAL => {
                self.interval = (value.round() as usize).min(SEQUENCER_INTERVALS.len() - 1)
            }
            Self::STEPS => {
                self.steps = (value.round() as usize).clamp(1, MAX_STEPS);
                self.position %= self.steps;
            }
            Self::GATE => self.gate_ms = value,
            Self::VELOCITY => self.velocity = value.round() as i32,
            Self::ROOT => self.root = value.round() as i32,
            _ => {}
        }
    }

    fn process(&mut self, _io: &mut ProcessIo<'_>) {}

    fn transport_listener(&self) -> Option<ListenerConfig> {
        Some(ListenerConfig::new(self.interval()))
    }

    fn on_time_event(&mut self, time: f64, out: &mut NoteOutput) {
        let step = self.pattern[self.position];
        self.position = (self.position + 1) % self.steps;
        if !step.active {
            return;
        }
        let pitch = (self.root + step.offset).clamp(0, 127);
        out.send(0, NoteMessage::on(time, pitch, self.velocity));
        out.send(0, NoteMessage::off(time + self.gate_ms, pitch));
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn state_revision(&self) -> u32 {
        SEQUENCER_STATE_REVISION
    }

    fn save_state(&self, out: &mut Vec<u8>) -> Result<(), StateError> {
        out.write_u32::<LittleEndian>(self.position as u32)?;
        out.write_u32::<LittleEndian>(MAX_STEPS as u32)?;
        for step in &self.pattern {
            out.write_i32::<LittleEndian>(step.offset)?;
            out.write_u8(step.active as u8)?;
        }
        Ok(())
    }

    fn load_state(&mut self, revision: u32, mut data: &[u8]) -> Result<(), StateError> {
        if revision != SEQUENCER_STATE_REVISION {
            return Err(StateError::UnsupportedRevision {
                found: revision,
                supported: SEQUENCER_STATE_REVISION,
            });
        }
        let position = data.read_u32::<LittleEndian>().map_err(|_| StateError::Truncated)? as usize;
        let count = data.read_u32::<LittleEndian>().map_err(|_| StateError::Truncated)? as usize;
        if count > MAX_STEPS {
            return Err(StateError::Corrupt {
                module: Module::type_id(self).to_string(),
                reason: format!("{} steps exceeds {}", count, MAX_STEPS),
            });
        }

        let mut pattern = [Step::default(); MAX_STEPS];
        for step in pattern.iter_mut().take(count) {
            step.offset = data.read_i32::<LittleEndian>().map_err(|_| StateError::Truncated)?;
            step.active = data.read_u8().map_err(|_| StateError::Truncated)? != 0;
        }

        self.pattern = pattern;
        self.position = position % self.steps;
        Ok(())
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

/// Note Transposer
///
/// Shifts incoming notes by a number of semitones. A note-off is shifted by
/// the amount that applied to its note-on, so changing the transposition
/// while notes are held never leaves them stuck.
pub struct NoteTranspose {
    spec: PortSpec,
    params: Vec<ParamDef>,
    semitones: i32,
    held: [i32; 128],
}

impl NoteTranspose {
    pub const SEMITONES: ParamId = 0;

    pub fn new(semitones: i32) -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::note(0, "notes")],
                outputs: vec![PortDef::note(1, "notes")],
            },
            params: vec![ParamDef::new(Self::SEMITONES, "semitones", 0.0, -48.0, 48.0)],
            semitones: semitones.clamp(-48, 48),
            held: [0; 128],
        }
    }
}

impl Default for NoteTranspose {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Module for NoteTranspose {
    fn type_id(&self) -> &'static str {
        "note_transpose"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        (id == Self::SEMITONES).then_some(self.semitones as f64)
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        if id == Self::SEMITONES {
            self.semitones = value.round() as i32;
        }
    }

    fn process(&mut self, _io: &mut ProcessIo<'_>) {}

    fn play_note(&mut self, _port: PortId, mut note: NoteMessage, out: &mut NoteOutput) {
        let Ok(source) = usize::try_from(note.pitch) else {
            return;
        };
        let Some(held) = self.held.get_mut(source) else {
            return;
        };
        if note.is_note_on() {
            *held = self.semitones;
        }
        note.pitch = (note.pitch + *held).clamp(0, 127);
        out.send(1, note);
    }

    fn reset(&mut self) {
        self.held = [0; 128];
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::Harness;
    use crate::polyphony::VoiceState;

    #[test]
    fn test_poly_synth_plays_note() {
        let mut synth = PolySynth::new();
        synth.init(&EngineContext::default());
        let mut harness = Harness::new(&synth);
        let frame = harness.ctx.frame_at(0.0);

        synth.play_note(0, NoteMessage::on(0.0, 69, 100), &mut harness.notes);
        harness.run(&mut synth, frame);
        assert!(harness.outputs[0].channel(0).peak() > 0.0);
        assert_eq!(synth.voices().active_count(), 1);
    }

    #[test]
    fn test_poly_synth_note_off_releases() {
        let mut synth = PolySynth::new();
        synth.init(&EngineContext::default());
        let mut out = NoteOutput::new();
        synth.play_note(0, NoteMessage::on(0.0, 60, 100), &mut out);
        synth.play_note(0, NoteMessage::off(1.0, 60), &mut out);
        assert_eq!(synth.voices().state(0), Some(VoiceState::Releasing));
    }

    #[test]
    fn test_poly_synth_voice_limit_param() {
        let mut synth = PolySynth::new();
        synth.init(&EngineContext::default());
        synth.set_param(PolySynth::VOICE_LIMIT, 2.0);
        let mut out = NoteOutput::new();
        for pitch in 60..64 {
            synth.play_note(0, NoteMessage::on(pitch as f64, pitch, 100), &mut out);
        }
        assert_eq!(synth.voices().voice_limit(), 2);
        assert_eq!(synth.voices().active_count(), 2);
        assert_eq!(synth.get_param(PolySynth::VOICE_LIMIT), Some(2.0));
    }

    #[test]
    fn test_poly_synth_limit_survives_init() {
        let mut synth = PolySynth::new().with_voice_limit(3);
        synth.set_param(PolySynth::STEAL_POLICY, 2.0);
        synth.init(&EngineContext::new(48000.0, 128));
        assert_eq!(synth.voices().voice_limit(), 3);
        assert_eq!(synth.voices().policy(), StealPolicy::NoSteal);
    }

    #[test]
    fn test_poly_synth_envelope_params() {
        let mut synth = PolySynth::new();
        synth.set_param(PolySynth::RELEASE, 750.0);
        synth.set_param(PolySynth::WAVEFORM, 2.0);
        assert_eq!(synth.settings().envelope.release_ms, 750.0);
        assert_eq!(synth.settings().waveform, Waveform::Square);
    }

    #[test]
    fn test_gain_scales_stereo() {
        let mut gain = Gain::new(0.5);
        let mut harness = Harness::new(&gain);
        harness.inputs[0].channel_mut(0).fill(1.0);
        harness.inputs[0].channel_mut(1).fill(-1.0);
        let frame = harness.ctx.frame_at(0.0);
        harness.run(&mut gain, frame);
        assert_eq!(harness.outputs[0].channel(0).get(0), 0.5);
        assert_eq!(harness.outputs[0].channel(1).get(0), -0.5);
    }

    #[test]
    fn test_sequencer_emits_at_boundary_time() {
        let mut seq = StepSequencer::new();
        seq.set_step(0, 7, true);
        let mut out = NoteOutput::new();
        seq.on_time_event(123.25, &mut out);

        let notes: Vec<NoteMessage> = out.drain().map(|(_, n)| n).collect();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].time, 123.25);
        assert_eq!(notes[0].pitch, 67);
        assert!(notes[0].is_note_on());
        assert_eq!(notes[1].time, 223.25);
        assert!(!notes[1].is_note_on());
        assert_eq!(seq.position(), 1);
    }

    #[test]
    fn test_sequencer_skips_inactive_steps_and_wraps() {
        let mut seq = StepSequencer::new();
        seq.set_param(StepSequencer::STEPS, 2.0);
        seq.set_step(1, 0, false);
        let mut out = NoteOutput::new();
        for t in 0..4 {
            seq.on_time_event(t as f64 * 10.0, &mut out);
        }
        // Steps 0, 1, 0, 1: two active steps, two notes each
        assert_eq!(out.len(), 4);
        assert_eq!(seq.position(), 0);
    }

    #[test]
    fn test_sequencer_interval_drives_listener() {
        let mut seq = StepSequencer::new();
        seq.set_param(StepSequencer::INTERVAL, 2.0);
        assert_eq!(
            seq.transport_listener().map(|l| l.interval),
            Some(NoteInterval::Sixteenth)
        );
    }

    #[test]
    fn test_sequencer_state_restores_pattern() {
        let mut seq = StepSequencer::new();
        seq.set_step(3, -5, false);
        let mut out = NoteOutput::new();
        for _ in 0..3 {
            seq.on_time_event(0.0, &mut out);
        }

        let mut bytes = Vec::new();
        seq.save_state(&mut bytes).unwrap();

        let mut restored = StepSequencer::new();
        restored
            .load_state(seq.state_revision(), &bytes)
            .unwrap();
        assert_eq!(restored.position(), 3);
        assert_eq!(restored.step(3), Some(Step { offset: -5, active: false }));
    }

    #[test]
    fn test_sequencer_rejects_truncated_state() {
        let mut seq = StepSequencer::new();
        let mut bytes = Vec::new();
        seq.save_state(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            seq.load_state(SEQUENCER_STATE_REVISION, &bytes),
            Err(StateError::Truncated)
        ));
        assert!(matches!(
            seq.load_state(99, &bytes),
            Err(StateError::UnsupportedRevision { .. })
        ));
    }

    #[test]
    fn test_sequencer_rejects_oversized_pattern() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(MAX_STEPS as u32 + 1).unwrap();

        let mut seq = StepSequencer::new();
        match seq.load_state(SEQUENCER_STATE_REVISION, &bytes) {
            Err(StateError::Corrupt { module, .. }) => assert_eq!(module, "step_sequencer"),
            other => panic!("expected a corrupt-state error, got {:?}", other),
        }
    }

    #[test]
    fn test_transpose_note_off_uses_note_on_shift() {
        let mut transpose = NoteTranspose::new(12);
        let mut out = NoteOutput::new();
        transpose.play_note(0, NoteMessage::on(0.0, 60, 100), &mut out);
        transpose.set_param(NoteTranspose::SEMITONES, -3.0);
        transpose.play_note(0, NoteMessage::off(5.0, 60), &mut out);

        let pitches: Vec<i32> = out.drain().map(|(_, n)| n.pitch).collect();
        assert_eq!(pitches, vec![72, 72]);
    }

    #[test]
    fn test_transpose_clamps_range() {
        let mut transpose = NoteTranspose::new(24);
        let mut out = NoteOutput::new();
        transpose.play_note(0, NoteMessage::on(0.0, 120, 100), &mut out);
        transpose.play_note(0, NoteMessage::on(0.0, -4, 100), &mut out);
        let pitches: Vec<i32> = out.drain().map(|(_, n)| n.pitch).collect();
        assert_eq!(pitches, vec![127]);
    }
}

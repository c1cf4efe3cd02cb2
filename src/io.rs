//! External I/O Integration
//!
//! Bridges between the patch and the outside world: hardware audio channels,
//! and note/controller input arriving from a MIDI thread.

use crate::context::Frame;
use crate::module::{Module, ProcessIo};
use crate::note::{Modulation, NoteMessage};
use crate::port::{ParamDef, ParamId, PortDef, PortSpec};
use rtrb::{Consumer, Producer, RingBuffer};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Atomic f64 for lock-free communication between threads
///
/// Uses AtomicU64 internally since there's no native AtomicF64.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self, ordering: Ordering) -> f64 {
        f64::from_bits(self.0.load(ordering))
    }

    pub fn store(&self, value: f64, ordering: Ordering) {
        self.0.store(value.to_bits(), ordering);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clone for AtomicF64 {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

/// Default capacity of the MIDI ring feeding a [`NoteInput`]
pub const MIDI_QUEUE_CAPACITY: usize = 256;

/// A raw MIDI message stamped with the engine clock time (ms)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidiMessage {
    pub time: f64,
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiMessage {
    pub fn new(time: f64, bytes: &[u8]) -> Self {
        let len = bytes.len().min(3);
        let mut data = [0; 3];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            time,
            data,
            len: len as u8,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// MIDI-thread side of a [`NoteInput`]
pub struct MidiSender {
    producer: Producer<MidiMessage>,
}

impl MidiSender {
    /// Queue a raw message; returned if the ring is full
    pub fn send(&mut self, time: f64, bytes: &[u8]) -> Result<(), MidiMessage> {
        self.producer
            .push(MidiMessage::new(time, bytes))
            .map_err(|rtrb::PushError::Full(m)| m)
    }
}

/// Controller values shared with every note a [`NoteInput`] emits
#[derive(Debug, Clone)]
pub struct Controllers {
    /// Pitch bend in units of the bend range, -1 to 1
    pub pitch_bend: Arc<AtomicF64>,
    pub mod_wheel: Arc<AtomicF64>,
    pub pressure: Arc<AtomicF64>,
}

impl Controllers {
    pub fn new() -> Self {
        Self {
            pitch_bend: Arc::new(AtomicF64::new(0.0)),
            mod_wheel: Arc::new(AtomicF64::new(0.0)),
            pressure: Arc::new(AtomicF64::new(0.0)),
        }
    }

    pub fn modulation(&self) -> Modulation {
        Modulation {
            pitch_bend: Some(self.pitch_bend.clone()),
            mod_wheel: Some(self.mod_wheel.clone()),
            pressure: Some(self.pressure.clone()),
            pan: 0.0,
        }
    }

    pub fn reset(&self) {
        self.pitch_bend.set(0.0);
        self.mod_wheel.set(0.0);
        self.pressure.set(0.0);
    }
}

impl Default for Controllers {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of parsing one MIDI message
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MidiEvent {
    NoteOn { channel: u8, pitch: u8, velocity: u8 },
    NoteOff { channel: u8, pitch: u8 },
    ModWheel(f64),
    PitchBend(f64),
    Pressure(f64),
    Ignored,
}

/// Parse a 1–3 byte MIDI channel message
pub fn parse_midi(msg: &[u8]) -> MidiEvent {
    if msg.is_empty() {
        return MidiEvent::Ignored;
    }

    let status = msg[0] & 0xF0;
    let channel = msg[0] & 0x0F;

    match (status, msg.len()) {
        (0x90, 3) if msg[2] > 0 => MidiEvent::NoteOn {
            channel,
            pitch: msg[1],
            velocity: msg[2],
        },
        // Note Off, or Note On with velocity 0
        (0x80, 3) | (0x90, 3) => MidiEvent::NoteOff {
            channel,
            pitch: msg[1],
        },
        (0xB0, 3) if msg[1] == 1 => MidiEvent::ModWheel(msg[2] as f64 / 127.0),
        (0xE0, 3) => {
            let raw = msg[1] as u16 | ((msg[2] as u16) << 7);
            MidiEvent::PitchBend(((raw as f64 - 8192.0) / 8192.0).clamp(-1.0, 1.0))
        }
        (0xD0, 2) | (0xD0, 3) => MidiEvent::Pressure(msg[1] as f64 / 127.0),
        (0xA0, 3) => MidiEvent::Pressure(msg[2] as f64 / 127.0),
        _ => MidiEvent::Ignored,
    }
}

const PARAM_CHANNEL_VOICES: ParamId = 0;

/// Note source fed by a MIDI thread.
///
/// Messages are timestamped by the sender with the engine clock. Each block
/// releases the messages due before the block end; a message stamped in the
/// past is delivered at the block start.
pub struct NoteInput {
    spec: PortSpec,
    params: Vec<ParamDef>,
    receiver: Consumer<MidiMessage>,
    sender: Option<MidiSender>,
    controllers: Controllers,
    /// Bind each MIDI channel to the voice of the same index
    channel_voices: bool,
}

impl NoteInput {
    pub fn new() -> Self {
        Self::with_capacity(MIDI_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (producer, receiver) = RingBuffer::new(capacity.max(1));
        Self {
            spec: PortSpec {
                inputs: vec![],
                outputs: vec![PortDef::note(0, "notes")],
            },
            params: vec![ParamDef::new(PARAM_CHANNEL_VOICES, "channel_voices", 0.0, 0.0, 1.0)],
            receiver,
            sender: Some(MidiSender { producer }),
            controllers: Controllers::new(),
            channel_voices: false,
        }
    }

    /// Take the MIDI-thread sender; only the first call returns it
    pub fn take_sender(&mut self) -> Option<MidiSender> {
        self.sender.take()
    }

    pub fn controllers(&self) -> &Controllers {
        &self.controllers
    }

    fn emit(&self, msg: &MidiMessage, frame: &Frame, io: &mut ProcessIo<'_>) {
        let time = msg.time.max(frame.start);
        match parse_midi(msg.bytes()) {
            MidiEvent::NoteOn {
                channel,
                pitch,
                velocity,
            } => {
                let mut note = NoteMessage::on(time, pitch as i32, velocity as i32)
                    .with_modulation(self.controllers.modulation());
                if self.channel_voices {
                    note = note.with_voice(channel as usize);
                }
                io.notes.send(0, note);
            }
            MidiEvent::NoteOff { channel, pitch } => {
                let mut note = NoteMessage::off(time, pitch as i32);
                if self.channel_voices {
                    note = note.with_voice(channel as usize);
                }
                io.notes.send(0, note);
            }
            MidiEvent::ModWheel(v) => self.controllers.mod_wheel.set(v),
            MidiEvent::PitchBend(v) => self.controllers.pitch_bend.set(v),
            MidiEvent::Pressure(v) => self.controllers.pressure.set(v),
            MidiEvent::Ignored => {}
        }
    }
}

impl Default for NoteInput {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for NoteInput {
    fn type_id(&self) -> &'static str {
        "note_input"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        match id {
            PARAM_CHANNEL_VOICES => Some(if self.channel_voices { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        if id == PARAM_CHANNEL_VOICES {
            self.channel_voices = value >= 0.5;
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let frame = io.frame;
        while let Ok(msg) = self.receiver.peek().copied() {
            if msg.time >= frame.end() {
                break;
            }
            let _ = self.receiver.pop();
            self.emit(&msg, &frame, io);
        }
    }

    fn reset(&mut self) {
        while self.receiver.pop().is_ok() {}
        self.controllers.reset();
    }

    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        Some(self)
    }
}

const PARAM_CHANNEL: ParamId = 0;

/// Reads one hardware input channel into the patch
pub struct AudioInput {
    spec: PortSpec,
    params: Vec<ParamDef>,
    channel: usize,
}

impl AudioInput {
    pub fn new(channel: usize) -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![],
                outputs: vec![PortDef::audio(0, "out")],
            },
            params: vec![ParamDef::new(PARAM_CHANNEL, "channel", 0.0, 0.0, 63.0)],
            channel,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl Module for AudioInput {
    fn type_id(&self) -> &'static str {
        "audio_input"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        (id == PARAM_CHANNEL).then_some(self.channel as f64)
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        if id == PARAM_CHANNEL {
            self.channel = value.max(0.0) as usize;
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let Some(source) = io.hw_inputs.get(self.channel) else {
            return;
        };
        if let Some(out) = io.outputs.get_mut(0) {
            out.channel_mut(0).copy_from(source.as_slice());
        }
    }
}

/// Sends its input to one or two hardware output channels.
///
/// A mono input goes to `channel`; a stereo input goes to `channel` and
/// `channel + 1`.
pub struct AudioOutput {
    spec: PortSpec,
    params: Vec<ParamDef>,
    channel: usize,
}

impl AudioOutput {
    pub fn new(channel: usize) -> Self {
        Self {
            spec: PortSpec {
                inputs: vec![PortDef::audio(0, "in").stereo()],
                outputs: vec![],
            },
            params: vec![ParamDef::new(PARAM_CHANNEL, "channel", 0.0, 0.0, 63.0)],
            channel,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }
}

impl Module for AudioOutput {
    fn type_id(&self) -> &'static str {
        "audio_output"
    }

    fn port_spec(&self) -> &PortSpec {
        &self.spec
    }

    fn params(&self) -> &[ParamDef] {
        &self.params
    }

    fn get_param(&self, id: ParamId) -> Option<f64> {
        (id == PARAM_CHANNEL).then_some(self.channel as f64)
    }

    fn set_param(&mut self, id: ParamId, value: f64) {
        if id == PARAM_CHANNEL {
            self.channel = value.max(0.0) as usize;
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) {
        let Some(input) = io.inputs.first() else {
            return;
        };
        for ch in 0..input.num_active_channels() {
            if let Some(dst) = io.hw_outputs.get_mut(self.channel + ch) {
                dst.add_block(input.channel(ch));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{AudioBlock, ChannelBuffer};
    use crate::module::testing::Harness;

    #[test]
    fn test_atomic_f64() {
        let a = AtomicF64::new(3.5);
        assert_eq!(a.get(), 3.5);
        a.set(2.5);
        assert_eq!(a.load(Ordering::SeqCst), 2.5);
    }

    #[test]
    fn test_atomic_f64_thread_safe() {
        let a = Arc::new(AtomicF64::new(0.0));
        let a2 = Arc::clone(&a);
        std::thread::spawn(move || a2.set(42.0)).join().unwrap();
        assert_eq!(a.get(), 42.0);
    }

    #[test]
    fn test_parse_note_on_off() {
        assert_eq!(
            parse_midi(&[0x91, 60, 100]),
            MidiEvent::NoteOn {
                channel: 1,
                pitch: 60,
                velocity: 100
            }
        );
        assert_eq!(
            parse_midi(&[0x90, 60, 0]),
            MidiEvent::NoteOff {
                channel: 0,
                pitch: 60
            }
        );
        assert_eq!(parse_midi(&[]), MidiEvent::Ignored);
    }

    #[test]
    fn test_parse_pitch_bend() {
        assert_eq!(parse_midi(&[0xE0, 0, 64]), MidiEvent::PitchBend(0.0));
        match parse_midi(&[0xE0, 127, 127]) {
            MidiEvent::PitchBend(v) => assert!(v > 0.99),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse_midi(&[0xE0, 0, 0]), MidiEvent::PitchBend(-1.0));
    }

    #[test]
    fn test_parse_controllers() {
        assert_eq!(parse_midi(&[0xB0, 1, 127]), MidiEvent::ModWheel(1.0));
        assert_eq!(parse_midi(&[0xB0, 7, 127]), MidiEvent::Ignored);
        assert_eq!(parse_midi(&[0xD0, 127]), MidiEvent::Pressure(1.0));
    }

    #[test]
    fn test_note_input_releases_due_messages() {
        let mut input = NoteInput::new();
        let mut sender = input.take_sender().unwrap();
        assert!(input.take_sender().is_none());

        sender.send(0.5, &[0x90, 60, 100]).unwrap();
        sender.send(1.0, &[0xE0, 127, 127]).unwrap();
        sender.send(5.0, &[0x80, 60, 0]).unwrap();

        let mut harness = Harness::new(&input);
        harness.run(&mut input, Frame::new(0.0, 2.0));
        let notes = harness.take_notes();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].is_note_on());
        assert!(notes[0].modulation.pitch_bend_value() > 0.99);

        harness.run(&mut input, Frame::new(2.0, 2.0));
        assert!(harness.take_notes().is_empty());

        harness.run(&mut input, Frame::new(4.0, 2.0));
        let notes = harness.take_notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].time, 5.0);
        assert!(!notes[0].is_note_on());
    }

    #[test]
    fn test_note_input_stale_message_clamped() {
        let mut input = NoteInput::new();
        let mut sender = input.take_sender().unwrap();
        sender.send(1.0, &[0x90, 60, 100]).unwrap();

        let mut harness = Harness::new(&input);
        harness.run(&mut input, Frame::new(10.0, 2.0));
        assert_eq!(harness.take_notes()[0].time, 10.0);
    }

    #[test]
    fn test_channel_voices() {
        let mut input = NoteInput::new();
        input.set_param(PARAM_CHANNEL_VOICES, 1.0);
        let mut sender = input.take_sender().unwrap();
        sender.send(0.0, &[0x93, 60, 100]).unwrap();

        let mut harness = Harness::new(&input);
        harness.run(&mut input, Frame::new(0.0, 2.0));
        assert_eq!(harness.take_notes()[0].voice_idx, Some(3));
    }

    #[test]
    fn test_audio_input_output() {
        let mut input = AudioInput::new(1);
        let mut harness = Harness::new(&input);
        harness.hw_inputs = vec![AudioBlock::new(4), AudioBlock::from_samples(vec![0.5; 4])];
        harness.set_block_size(4);
        harness.run(&mut input, Frame::new(0.0, 1.0));
        assert_eq!(harness.outputs[0].channel(0).as_slice(), &[0.5; 4]);

        let mut output = AudioOutput::new(0);
        let mut harness = Harness::new(&output);
        harness.set_block_size(4);
        harness.hw_outputs = vec![AudioBlock::new(4), AudioBlock::new(4)];
        let mut stereo = ChannelBuffer::new(4, 2);
        stereo.channel_mut(0).fill(0.25);
        stereo.channel_mut(1).fill(-0.25);
        harness.inputs[0] = stereo;
        harness.run(&mut output, Frame::new(0.0, 1.0));
        assert_eq!(harness.hw_outputs[0].as_slice(), &[0.25; 4]);
        assert_eq!(harness.hw_outputs[1].as_slice(), &[-0.25; 4]);
    }
}

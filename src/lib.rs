//! # Patchwire: Real-time Modular Synthesis Core
//!
//! `patchwire` is the engine room of a modular synthesizer: a patch graph of
//! modules joined by audio and note cables, executed block by block against a
//! sample-accurate musical clock, with polyphonic voice management.
//!
//! ## Architecture
//!
//! - **Transport** - tempo, meter and subdivision listeners fired at the exact
//!   boundary time inside a block
//! - **Event Queue** - per-port buffering of notes that belong to a later block
//! - **Voice Allocator** - bounded voice pool with retrigger and stealing
//! - **Patch Graph + Scheduler** - dependency ordering, cycle detection and the
//!   per-block execution pass
//!
//! Sample rate and block size live in an explicit [`EngineContext`] handed to
//! every component, so independent engines never share global state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patchwire::prelude::*;
//!
//! let engine = Engine::new(EngineConfig::default());
//!
//! let sender = engine.edit(|patch| -> Result<_, PatchError> {
//!     let seq = patch.add("seq", StepSequencer::new())?;
//!     let synth = patch.add("synth", PolySynth::new())?;
//!     let out = patch.add("out", AudioOutput::new(0))?;
//!     patch.connect(seq.out("notes")?, synth.in_("notes")?)?;
//!     patch.connect(synth.out("out")?, out.in_("in")?)?;
//!     Ok(())
//! });
//! sender.unwrap();
//!
//! // On the audio thread
//! let audio = engine.audio_handle();
//! let silence = vec![0.0; 64];
//! let (mut left, mut right) = (vec![0.0; 64], vec![0.0; 64]);
//! audio.process(&[&silence, &silence], &mut [&mut left, &mut right]);
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod event_queue;
pub mod graph;
pub mod io;
pub mod module;
pub mod modules;
pub mod note;
pub mod params;
pub mod polyphony;
pub mod port;
pub mod savestate;
pub mod scheduler;
pub mod serialize;
pub mod transport;
pub mod voice;

/// Prelude module for convenient imports
pub mod prelude {
    // Context and configuration
    pub use crate::config::EngineConfig;
    pub use crate::context::{EngineContext, Frame, DEFAULT_BLOCK_SIZE, DEFAULT_SAMPLE_RATE};
    pub use crate::error::{PatchError, StateError, TransportError};

    // Signals and ports
    pub use crate::buffer::{AudioBlock, ChannelBuffer};
    pub use crate::note::{Modulation, NoteMessage, NoteOutput};
    pub use crate::port::{Capabilities, ParamDef, ParamId, PortDef, PortId, PortKind, PortSpec};

    // Modules
    pub use crate::module::{Module, ProcessIo};
    pub use crate::modules::{Gain, NoteTranspose, PolySynth, Step, StepSequencer};
    pub use crate::io::{
        parse_midi, AtomicF64, AudioInput, AudioOutput, Controllers, MidiEvent, MidiSender,
        NoteInput,
    };

    // Timing
    pub use crate::event_queue::EventQueue;
    pub use crate::transport::{
        ListenerConfig, ListenerId, NoteInterval, Offset, TimeEvent, TimeSignature, Transport,
    };

    // Polyphony
    pub use crate::envelope::{AdsrParams, Envelope, EnvelopeStage};
    pub use crate::polyphony::{StealPolicy, VoiceAllocator, VoiceState, MAX_VOICES};
    pub use crate::voice::{OscillatorVoice, Voice, VoiceSettings, Waveform};

    // Graph and execution
    pub use crate::engine::{AudioHandle, Engine, EventLog, LogEntry, LogKind, SchedulerGuard};
    pub use crate::graph::{Cable, CableId, Cycle, NodeHandle, NodeId, Patch, PortRef};
    pub use crate::params::{ParamHandle, ParamMessage};
    pub use crate::scheduler::{BlockStats, Scheduler};

    // Persistence
    pub use crate::savestate::LoadReport;
    pub use crate::serialize::{CableDef, ModuleDef, ModuleMetadata, ModuleRegistry, PatchDef};
}

// Re-export key types at crate root for convenience
pub use prelude::*;

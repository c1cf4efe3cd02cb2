//! Module Trait
//!
//! Every node in a patch implements [`Module`]. The scheduler owns the
//! module's buffers and hands it a [`ProcessIo`] view once per block.

use crate::buffer::{AudioBlock, ChannelBuffer};
use crate::context::{EngineContext, Frame};
use crate::error::StateError;
use crate::note::{NoteMessage, NoteOutput};
use crate::port::{ParamDef, ParamId, PortId, PortSpec};
use crate::transport::ListenerConfig;
use std::any::Any;

/// Buffers and timing handed to [`Module::process`] for one block
pub struct ProcessIo<'a> {
    pub frame: Frame,
    pub ctx: &'a EngineContext,
    /// One buffer per declared input port, in declaration order; summed from
    /// every inbound audio cable
    pub inputs: &'a [ChannelBuffer],
    /// One buffer per declared output port, cleared before the call
    pub outputs: &'a mut [ChannelBuffer],
    /// Notes emitted during this block
    pub notes: &'a mut NoteOutput,
    /// Hardware input channels for this callback
    pub hw_inputs: &'a [AudioBlock],
    /// Hardware output channels, summed into by output modules
    pub hw_outputs: &'a mut [AudioBlock],
}

impl ProcessIo<'_> {
    /// Input buffer at port position `index`, if declared
    pub fn input(&self, index: usize) -> Option<&ChannelBuffer> {
        self.inputs.get(index)
    }

    /// Output buffer at port position `index`, if declared
    pub fn output(&mut self, index: usize) -> Option<&mut ChannelBuffer> {
        self.outputs.get_mut(index)
    }
}

/// A processing node that can be placed in a [`Patch`](crate::graph::Patch).
///
/// Construction only builds the module and its parameters; [`init`](Self::init)
/// runs once the parameters hold their initial values and before the module
/// first processes. All methods other than the persistence ones run on the
/// audio thread and must not block or allocate.
pub trait Module: Send {
    /// Registry name used for persistence
    fn type_id(&self) -> &'static str;

    fn port_spec(&self) -> &PortSpec;

    /// Finalize the module once its parameters are set
    fn init(&mut self, _ctx: &EngineContext) {}

    fn params(&self) -> &[ParamDef] {
        &[]
    }

    fn get_param(&self, _id: ParamId) -> Option<f64> {
        None
    }

    fn set_param(&mut self, _id: ParamId, _value: f64) {}

    /// Lightweight per-block bookkeeping, run before note delivery
    fn poll(&mut self, _frame: Frame) {}

    /// Render one block
    fn process(&mut self, io: &mut ProcessIo<'_>);

    /// Receive a note on input port `port`. Notes forwarded downstream go to `out`.
    fn play_note(&mut self, _port: PortId, _note: NoteMessage, _out: &mut NoteOutput) {}

    /// Transport subdivision this module wants to be notified on
    fn transport_listener(&self) -> Option<ListenerConfig> {
        None
    }

    /// Called at the exact time of each crossed transport boundary
    fn on_time_event(&mut self, _time: f64, _out: &mut NoteOutput) {}

    /// Silence voices and clear runtime state
    fn reset(&mut self) {}

    /// Revision of the [`save_state`](Self::save_state) payload layout
    fn state_revision(&self) -> u32 {
        0
    }

    /// Append runtime state that is not captured by parameters
    fn save_state(&self, _out: &mut Vec<u8>) -> Result<(), StateError> {
        Ok(())
    }

    fn load_state(&mut self, _revision: u32, _data: &[u8]) -> Result<(), StateError> {
        Ok(())
    }

    /// Concrete access for callers that know the module type
    fn as_any_mut(&mut self) -> Option<&mut dyn Any> {
        None
    }
}

/// Look up a parameter definition by id
pub fn find_param(params: &[ParamDef], id: ParamId) -> Option<&ParamDef> {
    params.iter().find(|p| p.id == id)
}

//! Ports, Capabilities and Parameter Definitions
//!
//! A module declares its ports once. The graph derives a [`Capabilities`]
//! tag from that declaration when the module is added, so the scheduler never
//! has to ask a module at runtime whether it is an audio or note endpoint.

use serde::{Deserialize, Serialize};

/// Unique identifier for a port within a module
pub type PortId = u32;

/// Unique identifier for a parameter within a module
pub type ParamId = u32;

/// What a cable carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// Continuous blocks of samples; multiple inbound cables are summed
    Audio,
    /// Discrete timestamped note and control events
    Note,
}

/// Definition of a single port (input or output)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDef {
    /// Unique identifier within the module
    pub id: PortId,

    /// Human-readable name (e.g. "in", "notes", "out")
    pub name: String,

    pub kind: PortKind,

    /// Channel count for audio outputs
    pub channels: usize,
}

impl PortDef {
    pub fn new(id: PortId, name: impl Into<String>, kind: PortKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            channels: 1,
        }
    }

    pub fn audio(id: PortId, name: impl Into<String>) -> Self {
        Self::new(id, name, PortKind::Audio)
    }

    pub fn note(id: PortId, name: impl Into<String>) -> Self {
        Self::new(id, name, PortKind::Note)
    }

    pub fn stereo(mut self) -> Self {
        self.channels = 2;
        self
    }
}

/// Specification of all ports for a module
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSpec {
    pub inputs: Vec<PortDef>,
    pub outputs: Vec<PortDef>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_by_name(&self, name: &str) -> Option<&PortDef> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&PortDef> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn input_by_id(&self, id: PortId) -> Option<&PortDef> {
        self.inputs.iter().find(|p| p.id == id)
    }

    pub fn output_by_id(&self, id: PortId) -> Option<&PortDef> {
        self.outputs.iter().find(|p| p.id == id)
    }

    /// Position of an input within `inputs`
    pub fn input_index(&self, id: PortId) -> Option<usize> {
        self.inputs.iter().position(|p| p.id == id)
    }

    /// Position of an output within `outputs`
    pub fn output_index(&self, id: PortId) -> Option<usize> {
        self.outputs.iter().position(|p| p.id == id)
    }

    pub fn capabilities(&self) -> Capabilities {
        let has = |ports: &[PortDef], kind| ports.iter().any(|p| p.kind == kind);
        Capabilities {
            audio_source: has(&self.outputs, PortKind::Audio),
            audio_receiver: has(&self.inputs, PortKind::Audio),
            note_source: has(&self.outputs, PortKind::Note),
            note_receiver: has(&self.inputs, PortKind::Note),
        }
    }
}

/// Capability tag resolved once when a module joins the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub audio_source: bool,
    pub audio_receiver: bool,
    pub note_source: bool,
    pub note_receiver: bool,
}

/// Parameter definition for UI binding and layout persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDef {
    pub id: ParamId,
    pub name: String,
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

impl ParamDef {
    pub fn new(id: ParamId, name: impl Into<String>, default: f64, min: f64, max: f64) -> Self {
        Self {
            id,
            name: name.into(),
            default,
            min,
            max,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PortSpec {
        PortSpec {
            inputs: vec![PortDef::note(0, "notes"), PortDef::audio(1, "in")],
            outputs: vec![PortDef::audio(10, "out").stereo()],
        }
    }

    #[test]
    fn test_port_spec_lookup() {
        let spec = spec();
        assert!(spec.input_by_name("notes").is_some());
        assert!(spec.input_by_name("nonexistent").is_none());
        assert_eq!(spec.output_by_name("out").map(|p| p.channels), Some(2));
        assert_eq!(spec.input_index(1), Some(1));
        assert!(spec.output_by_id(99).is_none());
    }

    #[test]
    fn test_capabilities_from_ports() {
        let caps = spec().capabilities();
        assert!(caps.note_receiver);
        assert!(caps.audio_receiver);
        assert!(caps.audio_source);
        assert!(!caps.note_source);
    }

    #[test]
    fn test_param_clamp() {
        let param = ParamDef::new(0, "gain", 1.0, 0.0, 2.0);
        assert_eq!(param.clamp(5.0), 2.0);
        assert_eq!(param.clamp(-1.0), 0.0);
    }
}

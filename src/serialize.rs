//! Serialization and Persistence
//!
//! The JSON layout stores what a user arranged: module names, types,
//! positions, parameter values and the cables between named ports. Runtime
//! state (voices, sequencer positions) lives in the binary
//! [`savestate`](crate::savestate) stream instead.
//!
//! Loading is forgiving. A module of unknown type, a parameter the module no
//! longer has, or a cable whose end cannot be resolved is skipped with a
//! warning and the rest of the layout still loads.

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::PatchError;
use crate::graph::{NodeHandle, Patch};
use crate::io::{AudioInput, AudioOutput, NoteInput};
use crate::module::Module;
use crate::modules::{Gain, NoteTranspose, PolySynth, StepSequencer};
use crate::port::PortSpec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Newest layout schema this crate writes
pub const LAYOUT_VERSION: u32 = 1;

/// Serializable patch definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDef {
    /// Schema version for forward compatibility
    pub version: u32,

    pub name: String,

    #[serde(default)]
    pub modules: Vec<ModuleDef>,

    #[serde(default)]
    pub cables: Vec<CableDef>,
}

impl PatchDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: LAYOUT_VERSION,
            name: name.into(),
            modules: vec![],
            cables: vec![],
        }
    }

    pub fn with_module(mut self, module: ModuleDef) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_cable(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.cables.push(CableDef::new(from, to));
        self
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Capture the layout of a live patch
    pub fn from_patch(patch: &Patch) -> Self {
        let modules = patch
            .nodes()
            .map(|(id, name, module)| ModuleDef {
                name: name.to_string(),
                module_type: module.type_id().to_string(),
                position: patch.position(id),
                enabled: patch.is_enabled(id),
                params: module
                    .params()
                    .iter()
                    .filter_map(|def| Some((def.name.clone(), module.get_param(def.id)?)))
                    .collect(),
            })
            .collect();

        let cables = patch
            .cables()
            .filter_map(|(_, cable)| {
                let from_module = patch.module(cable.from.node)?;
                let to_module = patch.module(cable.to.node)?;
                let from_port = from_module.port_spec().output_by_id(cable.from.port)?;
                let to_port = to_module.port_spec().input_by_id(cable.to.port)?;
                Some(CableDef {
                    from: format!("{}.{}", patch.name(cable.from.node)?, from_port.name),
                    to: format!("{}.{}", patch.name(cable.to.node)?, to_port.name),
                })
            })
            .collect();

        Self {
            version: LAYOUT_VERSION,
            name: String::new(),
            modules,
            cables,
        }
    }

    /// Build a new patch from this layout.
    ///
    /// Returns the patch and one message per skipped item.
    pub fn build(
        &self,
        registry: &ModuleRegistry,
        ctx: EngineContext,
    ) -> Result<(Patch, Vec<String>), PatchError> {
        let mut patch = Patch::new(ctx);
        let warnings = self.build_into(&mut patch, registry)?;
        Ok((patch, warnings))
    }

    /// Add this layout's modules and cables to `patch`.
    ///
    /// Each module is created, given its saved parameters and only then
    /// initialized by the patch.
    pub fn build_into(
        &self,
        patch: &mut Patch,
        registry: &ModuleRegistry,
    ) -> Result<Vec<String>, PatchError> {
        let mut warnings = Vec::new();
        let mut warn = |message: String| {
            tracing::warn!("{}", message);
            warnings.push(message);
        };

        if self.version > LAYOUT_VERSION {
            warn(format!(
                "layout version {} is newer than {}; loading what is understood",
                self.version, LAYOUT_VERSION
            ));
        }

        let mut handles: HashMap<&str, NodeHandle> = HashMap::new();
        for def in &self.modules {
            let Some(mut module) = registry.instantiate(&def.module_type) else {
                warn(PatchError::UnknownModuleType(def.module_type.clone()).to_string());
                continue;
            };

            for (param, &value) in &def.params {
                let Some(param_def) = module.params().iter().find(|p| &p.name == param).cloned()
                else {
                    warn(format!("`{}` has no parameter `{}`", def.name, param));
                    continue;
                };
                if !value.is_finite() {
                    warn(format!("`{}.{}` is not a number, keeping default", def.name, param));
                    continue;
                }
                module.set_param(param_def.id, param_def.clamp(value));
            }

            let handle = match patch.add_boxed(def.name.clone(), module) {
                Ok(handle) => handle,
                Err(err) => {
                    warn(err.to_string());
                    continue;
                }
            };
            if let Some(position) = def.position {
                patch.set_position(handle.id(), position);
            }
            if !def.enabled {
                patch.set_enabled(handle.id(), false)?;
            }
            handles.insert(def.name.as_str(), handle);
        }

        for cable in &self.cables {
            let resolved = resolve(&handles, &cable.from, true)
                .and_then(|from| Ok((from, resolve(&handles, &cable.to, false)?)));
            let result = resolved.and_then(|(from, to)| patch.connect(from, to));
            if let Err(err) = result {
                warn(format!(
                    "skipped cable {} -> {}: {}",
                    cable.from, cable.to, err
                ));
            }
        }

        Ok(warnings)
    }
}

impl Default for PatchDef {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

fn resolve(
    handles: &HashMap<&str, NodeHandle>,
    port_ref: &str,
    output: bool,
) -> Result<crate::graph::PortRef, PatchError> {
    let (module, port) = parse_port_ref(port_ref)?;
    let handle = handles
        .get(module)
        .ok_or_else(|| PatchError::UnknownModule(module.to_string()))?;
    if output {
        handle.out(port)
    } else {
        handle.in_(port)
    }
}

/// Split `"module.port"`; the port is everything after the last dot
fn parse_port_ref(s: &str) -> Result<(&str, &str), PatchError> {
    match s.rsplit_once('.') {
        Some((module, port)) if !module.is_empty() && !port.is_empty() => Ok((module, port)),
        _ => Err(PatchError::MalformedPortRef(s.to_string())),
    }
}

fn enabled_default() -> bool {
    true
}

/// Serializable module definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDef {
    /// Unique instance name
    pub name: String,

    /// Module type identifier
    #[serde(rename = "type")]
    pub module_type: String,

    /// UI position (optional)
    #[serde(default)]
    pub position: Option<(f32, f32)>,

    #[serde(default = "enabled_default")]
    pub enabled: bool,

    /// Parameter values by parameter name; missing ones keep their defaults
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

impl ModuleDef {
    pub fn new(name: impl Into<String>, module_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module_type: module_type.into(),
            position: None,
            enabled: true,
            params: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some((x, y));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: f64) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Serializable cable definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CableDef {
    /// Source: "module_name.port_name"
    pub from: String,

    /// Destination: "module_name.port_name"
    pub to: String,
}

impl CableDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Module factory function type
pub type ModuleFactory = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Metadata about a registered module type
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub type_id: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub port_spec: PortSpec,
}

/// Registry of available module types for instantiation
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
    metadata: HashMap<String, ModuleMetadata>,
}

impl ModuleRegistry {
    /// Create a registry holding the built-in modules
    pub fn new() -> Self {
        Self::from_config(&EngineConfig::default())
    }

    /// Built-in modules with defaults taken from `config`
    pub fn from_config(config: &EngineConfig) -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            metadata: HashMap::new(),
        };
        registry.register_builtin(config.voice_limit);
        registry
    }

    fn register_builtin(&mut self, voice_limit: usize) {
        self.register_factory(
            "note_input",
            "Note Input",
            "I/O",
            "Notes and controllers from a MIDI thread",
            || Box::new(NoteInput::new()),
        );
        self.register_factory(
            "audio_input",
            "Audio Input",
            "I/O",
            "One hardware input channel",
            || Box::new(AudioInput::new(0)),
        );
        self.register_factory(
            "audio_output",
            "Audio Output",
            "I/O",
            "One or two hardware output channels",
            || Box::new(AudioOutput::new(0)),
        );
        self.register_factory(
            "poly_synth",
            "Poly Synth",
            "Sources",
            "Polyphonic oscillator voices with ADSR envelopes",
            move || Box::new(PolySynth::new().with_voice_limit(voice_limit)),
        );
        self.register_factory(
            "gain",
            "Gain",
            "Utilities",
            "Scales a mono or stereo signal",
            || Box::new(Gain::default()),
        );
        self.register_factory(
            "step_sequencer",
            "Step Sequencer",
            "Sequencers",
            "Transport-synced note pattern",
            || Box::new(StepSequencer::new()),
        );
        self.register_factory(
            "note_transpose",
            "Transpose",
            "Note Effects",
            "Shifts notes by semitones",
            || Box::new(NoteTranspose::default()),
        );
    }

    /// Register a module factory with metadata
    pub fn register_factory<F>(
        &mut self,
        type_id: &str,
        name: &str,
        category: &str,
        description: &str,
        factory: F,
    ) where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        let port_spec = factory().port_spec().clone();

        self.factories
            .insert(type_id.to_string(), Box::new(factory));

        self.metadata.insert(
            type_id.to_string(),
            ModuleMetadata {
                type_id: type_id.to_string(),
                name: name.to_string(),
                category: category.to_string(),
                description: description.to_string(),
                port_spec,
            },
        );
    }

    /// Create an uninitialized module by type ID
    pub fn instantiate(&self, type_id: &str) -> Option<Box<dyn Module>> {
        self.factories.get(type_id).map(|f| f())
    }

    /// List all registered module types
    pub fn list_modules(&self) -> impl Iterator<Item = &ModuleMetadata> {
        self.metadata.values()
    }

    /// Get metadata for a specific module type
    pub fn get_metadata(&self, type_id: &str) -> Option<&ModuleMetadata> {
        self.metadata.get(type_id)
    }

    /// List modules in a specific category
    pub fn list_by_category<'a>(
        &'a self,
        category: &'a str,
    ) -> impl Iterator<Item = &'a ModuleMetadata> {
        self.metadata
            .values()
            .filter(move |m| m.category == category)
    }

    /// Get all unique categories
    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<_> = self.metadata.values().map(|m| m.category.clone()).collect();
        cats.sort();
        cats.dedup();
        cats
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PatchDef {
        PatchDef::new("Test Patch")
            .with_module(ModuleDef::new("seq", "step_sequencer").with_param("root", 48.0))
            .with_module(
                ModuleDef::new("synth", "poly_synth")
                    .with_position(10.0, 20.0)
                    .with_param("release", 400.0),
            )
            .with_module(ModuleDef::new("out", "audio_output"))
            .with_cable("seq.notes", "synth.notes")
            .with_cable("synth.out", "out.in")
    }

    #[test]
    fn test_patch_def_serialization() {
        let def = layout();
        let json = def.to_json().unwrap();
        assert!(json.contains("\"type\": \"poly_synth\""));
        let loaded = PatchDef::from_json(&json).unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let def = PatchDef::from_json(
            r#"{ "version": 1, "name": "x", "modules": [{ "name": "g", "type": "gain" }] }"#,
        )
        .unwrap();
        assert!(def.modules[0].enabled);
        assert!(def.modules[0].params.is_empty());
        assert!(def.cables.is_empty());
    }

    #[test]
    fn test_build_sets_params_before_init() {
        let registry = ModuleRegistry::new();
        let (mut patch, warnings) = layout().build(&registry, EngineContext::default()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(patch.node_count(), 3);
        assert_eq!(patch.cable_count(), 2);

        let synth = patch.find("synth").unwrap();
        assert_eq!(patch.position(synth), Some((10.0, 20.0)));
        let synth = patch.module_as::<PolySynth>(synth).unwrap();
        assert_eq!(synth.settings().envelope.release_ms, 400.0);
    }

    #[test]
    fn test_patch_roundtrip() {
        let registry = ModuleRegistry::new();
        let (patch, _) = layout().build(&registry, EngineContext::default()).unwrap();
        let saved = PatchDef::from_patch(&patch);
        let (reloaded, warnings) = saved.build(&registry, EngineContext::default()).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(PatchDef::from_patch(&reloaded), saved);
    }

    #[test]
    fn test_dangling_cable_skipped() {
        let registry = ModuleRegistry::new();
        let def = layout()
            .with_cable("ghost.out", "out.in")
            .with_cable("synth.nope", "out.in")
            .with_cable("no-dot", "out.in");
        let (patch, warnings) = def.build(&registry, EngineContext::default()).unwrap();
        assert_eq!(patch.cable_count(), 2);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn test_unknown_type_and_param_skipped() {
        let registry = ModuleRegistry::new();
        let def = layout()
            .with_module(ModuleDef::new("mystery", "theremin"))
            .with_module(ModuleDef::new("g", "gain").with_param("warmth", 1.0));
        let (patch, warnings) = def.build(&registry, EngineContext::default()).unwrap();
        assert_eq!(patch.node_count(), 4);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_param_values_clamped_on_load() {
        let registry = ModuleRegistry::new();
        let def = PatchDef::new("x")
            .with_module(ModuleDef::new("g", "gain").with_param("gain", 100.0));
        let (patch, _) = def.build(&registry, EngineContext::default()).unwrap();
        let g = patch.find("g").unwrap();
        assert_eq!(patch.get_param(g, Gain::GAIN), Some(4.0));
    }

    #[test]
    fn test_disabled_module_roundtrips() {
        let registry = ModuleRegistry::new();
        let mut def = PatchDef::new("x").with_module(ModuleDef::new("g", "gain"));
        def.modules[0].enabled = false;
        let (patch, _) = def.build(&registry, EngineContext::default()).unwrap();
        assert!(!patch.is_enabled(patch.find("g").unwrap()));
        assert!(!PatchDef::from_patch(&patch).modules[0].enabled);
    }

    #[test]
    fn test_parse_port_ref() {
        assert_eq!(parse_port_ref("a.b.out").unwrap(), ("a.b", "out"));
        assert!(parse_port_ref("nodot").is_err());
        assert!(parse_port_ref(".out").is_err());
    }

    #[test]
    fn test_module_registry_instantiate_all() {
        let registry = ModuleRegistry::new();
        for meta in registry.list_modules() {
            let module = registry.instantiate(&meta.type_id).unwrap();
            assert_eq!(module.type_id(), meta.type_id);
        }
        assert!(registry.instantiate("theremin").is_none());
        assert_eq!(registry.list_by_category("I/O").count(), 3);
    }
}

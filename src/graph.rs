//! Patch Graph
//!
//! The editable routing topology: modules, the cables between their ports,
//! and the execution order derived from them.
//!
//! # Ordering and cycles
//!
//! [`Patch::arrange_dependencies`] walks upstream over the audio cables with a
//! depth-first search. A cable that leads back to a module still on the
//! search stack closes a cycle: it is reported once and excluded from the
//! per-block audio routing, so its destination hears silence on that cable
//! instead of the graph deadlocking. Modules are then emitted after
//! everything feeding them. Note cables never form reportable cycles; they
//! order their ends only where the audio flow allows, and a backwards note
//! cable simply delivers a block later.

use crate::buffer::ChannelBuffer;
use crate::context::EngineContext;
use crate::error::PatchError;
use crate::event_queue::{EventQueue, DEFAULT_QUEUE_CAPACITY};
use crate::module::Module;
use crate::note::NoteOutput;
use crate::params::{param_channel, ParamHandle, ParamInbox};
use crate::port::{Capabilities, ParamId, PortId, PortKind, PortSpec};
use crate::transport::{ListenerConfig, ListenerId};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, HashSet};
use std::fmt;

new_key_type! {
    /// Unique identifier for a node in the patch graph
    pub struct NodeId;
    /// Unique identifier for a cable connection
    pub struct CableId;
}

/// Default capacity of each module's parameter ring
pub const DEFAULT_PARAM_QUEUE_CAPACITY: usize = 64;

/// Reference to a specific port on a specific node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeId,
    pub port: PortId,
}

impl PortRef {
    pub fn new(node: NodeId, port: PortId) -> Self {
        Self { node, port }
    }
}

/// A cable connecting an output port to an input port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cable {
    pub from: PortRef,
    pub to: PortRef,
    pub kind: PortKind,
}

/// An audio cycle found while arranging dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Modules on the cycle, starting at the source of the closing cable
    pub nodes: Vec<NodeId>,
    /// The cable excluded from audio routing
    pub closing_cable: CableId,
}

/// Precomputed audio routing for one inbound cable
#[derive(Debug, Clone, Copy)]
pub(crate) struct AudioRoute {
    pub from: NodeId,
    pub from_index: usize,
    pub to_index: usize,
}

/// Precomputed note routing for one cable
#[derive(Debug, Clone, Copy)]
pub(crate) struct NoteRoute {
    pub from: PortRef,
    pub to: PortRef,
}

/// A module plus the runtime storage the scheduler uses for it
pub(crate) struct Node {
    pub name: String,
    pub module: Box<dyn Module>,
    pub spec: PortSpec,
    pub caps: Capabilities,
    pub enabled: bool,
    pub position: Option<(f32, f32)>,
    /// One buffer per input port
    pub inputs: Vec<ChannelBuffer>,
    /// One buffer per output port
    pub outputs: Vec<ChannelBuffer>,
    /// One queue per note input port
    pub queues: Vec<(PortId, EventQueue)>,
    pub notes: NoteOutput,
    pub param_inbox: ParamInbox,
    pub param_handle: Option<ParamHandle>,
    pub listener: Option<ListenerId>,
    pub listener_config: Option<ListenerConfig>,
    pub audio_sources: Vec<AudioRoute>,
}

impl Node {
    pub fn queue_mut(&mut self, port: PortId) -> Option<&mut EventQueue> {
        self.queues
            .iter_mut()
            .find(|(p, _)| *p == port)
            .map(|(_, q)| q)
    }
}

/// Handle to a node for ergonomic port references
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    spec: PortSpec,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Reference an output port by name
    pub fn out(&self, name: &str) -> Result<PortRef, PatchError> {
        let port = self.spec.output_by_name(name).ok_or(PatchError::InvalidPort)?;
        Ok(PortRef::new(self.id, port.id))
    }

    /// Reference an input port by name
    pub fn in_(&self, name: &str) -> Result<PortRef, PatchError> {
        let port = self.spec.input_by_name(name).ok_or(PatchError::InvalidPort)?;
        Ok(PortRef::new(self.id, port.id))
    }

    pub fn spec(&self) -> &PortSpec {
        &self.spec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// The patch graph containing modules and connections
pub struct Patch {
    ctx: EngineContext,
    note_queue_capacity: usize,
    param_queue_capacity: usize,

    nodes: SlotMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    names: HashMap<String, NodeId>,
    cables: SlotMap<CableId, Cable>,
    cable_order: Vec<CableId>,

    // Derived by arrange_dependencies
    execution_order: Vec<NodeId>,
    note_routes: Vec<NoteRoute>,
    cycles: Vec<Cycle>,
    reported: HashSet<CableId>,
    dirty: bool,
    generation: u64,

    retired_listeners: Vec<ListenerId>,
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patch")
            .field("nodes", &self.node_count())
            .field("cables", &self.cable_count())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Patch {
    pub fn new(ctx: EngineContext) -> Self {
        Self::with_capacities(ctx, DEFAULT_QUEUE_CAPACITY, DEFAULT_PARAM_QUEUE_CAPACITY)
    }

    pub fn with_capacities(
        ctx: EngineContext,
        note_queue_capacity: usize,
        param_queue_capacity: usize,
    ) -> Self {
        Self {
            ctx,
            note_queue_capacity,
            param_queue_capacity,
            nodes: SlotMap::with_key(),
            node_order: Vec::new(),
            names: HashMap::new(),
            cables: SlotMap::with_key(),
            cable_order: Vec::new(),
            execution_order: Vec::new(),
            note_routes: Vec::new(),
            cycles: Vec::new(),
            reported: HashSet::new(),
            dirty: false,
            generation: 0,
            retired_listeners: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    /// Add a module under a unique name and initialize it.
    ///
    /// Parameters set on the module before this call are in place when its
    /// [`Module::init`] runs.
    pub fn add<M: Module + 'static>(
        &mut self,
        name: impl Into<String>,
        module: M,
    ) -> Result<NodeHandle, PatchError> {
        self.add_boxed(name, Box::new(module))
    }

    pub fn add_boxed(
        &mut self,
        name: impl Into<String>,
        mut module: Box<dyn Module>,
    ) -> Result<NodeHandle, PatchError> {
        let name = name.into();
        if self.names.contains_key(&name) {
            return Err(PatchError::DuplicateName(name));
        }

        module.init(&self.ctx);
        let spec = module.port_spec().clone();
        let block_size = self.ctx.block_size;
        let inputs = spec
            .inputs
            .iter()
            .map(|p| ChannelBuffer::new(block_size, p.channels))
            .collect();
        let outputs = spec
            .outputs
            .iter()
            .map(|p| ChannelBuffer::new(block_size, p.channels))
            .collect();
        let queues = spec
            .inputs
            .iter()
            .filter(|p| p.kind == PortKind::Note)
            .map(|p| (p.id, EventQueue::new(self.note_queue_capacity)))
            .collect();
        let listener_config = module.transport_listener();

        let param_capacity = self.param_queue_capacity;
        let id = self.nodes.insert_with_key(|id| {
            let (handle, inbox) = param_channel(id, param_capacity);
            Node {
                name: name.clone(),
                module,
                caps: spec.capabilities(),
                spec: spec.clone(),
                enabled: true,
                position: None,
                inputs,
                outputs,
                queues,
                notes: NoteOutput::new(),
                param_inbox: inbox,
                param_handle: Some(handle),
                listener: None,
                listener_config,
                audio_sources: Vec::new(),
            }
        });

        self.names.insert(name, id);
        self.node_order.push(id);
        self.dirty = true;
        Ok(NodeHandle { id, spec })
    }

    /// Remove a module and every cable touching it
    pub fn remove(&mut self, node: NodeId) -> Result<(), PatchError> {
        let removed = self.nodes.remove(node).ok_or(PatchError::InvalidNode)?;
        self.names.remove(&removed.name);
        self.node_order.retain(|&n| n != node);
        if let Some(listener) = removed.listener {
            self.retired_listeners.push(listener);
        }

        let touching: Vec<CableId> = self
            .cable_order
            .iter()
            .copied()
            .filter(|&c| {
                let cable = &self.cables[c];
                cable.from.node == node || cable.to.node == node
            })
            .collect();
        for cable in touching {
            self.remove_cable(cable);
        }

        self.dirty = true;
        Ok(())
    }

    /// Connect an output port to an input port of the same kind.
    ///
    /// Connecting the same pair twice returns the existing cable.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<CableId, PatchError> {
        let from_kind = self.output_kind(from)?;
        let to_kind = self.input_kind(to)?;
        if from_kind != to_kind {
            return Err(PatchError::KindMismatch {
                from: from_kind,
                to: to_kind,
            });
        }

        if let Some(existing) = self
            .cable_order
            .iter()
            .copied()
            .find(|&c| self.cables[c].from == from && self.cables[c].to == to)
        {
            return Ok(existing);
        }

        let id = self.cables.insert(Cable {
            from,
            to,
            kind: from_kind,
        });
        self.cable_order.push(id);
        self.dirty = true;
        Ok(id)
    }

    /// Connect one output to multiple inputs (fan-out)
    pub fn mult(&mut self, from: PortRef, to: &[PortRef]) -> Result<Vec<CableId>, PatchError> {
        to.iter().map(|&dest| self.connect(from, dest)).collect()
    }

    pub fn disconnect(&mut self, cable: CableId) -> Result<(), PatchError> {
        if !self.cables.contains_key(cable) {
            return Err(PatchError::InvalidCable);
        }
        self.remove_cable(cable);
        self.dirty = true;
        Ok(())
    }

    fn remove_cable(&mut self, cable: CableId) {
        self.cables.remove(cable);
        self.cable_order.retain(|&c| c != cable);
    }

    fn output_kind(&self, port: PortRef) -> Result<PortKind, PatchError> {
        let node = self.nodes.get(port.node).ok_or(PatchError::InvalidNode)?;
        node.spec
            .output_by_id(port.port)
            .map(|p| p.kind)
            .ok_or(PatchError::InvalidPort)
    }

    fn input_kind(&self, port: PortRef) -> Result<PortKind, PatchError> {
        let node = self.nodes.get(port.node).ok_or(PatchError::InvalidNode)?;
        node.spec
            .input_by_id(port.port)
            .map(|p| p.kind)
            .ok_or(PatchError::InvalidPort)
    }

    /// Give a module a new unique name
    pub fn rename(&mut self, node: NodeId, name: impl Into<String>) -> Result<(), PatchError> {
        let name = name.into();
        let current = self.nodes.get(node).ok_or(PatchError::InvalidNode)?;
        if current.name == name {
            return Ok(());
        }
        if self.names.contains_key(&name) {
            return Err(PatchError::DuplicateName(name));
        }
        self.names.remove(&current.name);
        self.names.insert(name.clone(), node);
        if let Some(n) = self.nodes.get_mut(node) {
            n.name = name;
        }
        Ok(())
    }

    /// Disabled modules output silence and ignore incoming notes
    pub fn set_enabled(&mut self, node: NodeId, enabled: bool) -> Result<(), PatchError> {
        let n = self.nodes.get_mut(node).ok_or(PatchError::InvalidNode)?;
        n.enabled = enabled;
        if !enabled {
            for out in &mut n.outputs {
                out.clear();
            }
        }
        Ok(())
    }

    pub fn is_enabled(&self, node: NodeId) -> bool {
        self.nodes.get(node).is_some_and(|n| n.enabled)
    }

    /// Set a parameter directly; only for use while the graph is not running
    /// a block (under the engine lock or before the engine starts)
    pub fn set_param(
        &mut self,
        node: NodeId,
        param: ParamId,
        value: f64,
    ) -> Result<(), PatchError> {
        let n = self.nodes.get_mut(node).ok_or(PatchError::InvalidNode)?;
        let def = crate::module::find_param(n.module.params(), param)
            .ok_or(PatchError::UnknownParam(param))?;
        let value = def.clamp(value);
        n.module.set_param(param, value);
        Ok(())
    }

    pub fn get_param(&self, node: NodeId, param: ParamId) -> Option<f64> {
        self.nodes.get(node).and_then(|n| n.module.get_param(param))
    }

    /// Take the lock-free parameter sender for a module; only the first call
    /// returns it
    pub fn take_param_handle(&mut self, node: NodeId) -> Option<ParamHandle> {
        self.nodes.get_mut(node).and_then(|n| n.param_handle.take())
    }

    pub fn set_position(&mut self, node: NodeId, position: (f32, f32)) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.position = Some(position);
        }
    }

    pub fn position(&self, node: NodeId) -> Option<(f32, f32)> {
        self.nodes.get(node).and_then(|n| n.position)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).map(|n| n.name.as_str())
    }

    pub fn handle(&self, node: NodeId) -> Option<NodeHandle> {
        self.nodes.get(node).map(|n| NodeHandle {
            id: node,
            spec: n.spec.clone(),
        })
    }

    pub fn capabilities(&self, node: NodeId) -> Option<Capabilities> {
        self.nodes.get(node).map(|n| n.caps)
    }

    pub fn module(&self, node: NodeId) -> Option<&dyn Module> {
        self.nodes.get(node).map(|n| n.module.as_ref())
    }

    pub fn module_mut(&mut self, node: NodeId) -> Option<&mut (dyn Module + 'static)> {
        self.nodes.get_mut(node).map(|n| n.module.as_mut())
    }

    /// Concrete access to a module of known type
    pub fn module_as<T: 'static>(&mut self, node: NodeId) -> Option<&mut T> {
        self.module_mut(node)?.as_any_mut()?.downcast_mut::<T>()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn cable_count(&self) -> usize {
        self.cables.len()
    }

    pub fn cable(&self, cable: CableId) -> Option<&Cable> {
        self.cables.get(cable)
    }

    /// Cables in creation order
    pub fn cables(&self) -> impl Iterator<Item = (CableId, &Cable)> {
        self.cable_order.iter().map(move |&c| (c, &self.cables[c]))
    }

    /// Modules in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &str, &dyn Module)> {
        self.node_order.iter().map(move |&id| {
            let node = &self.nodes[id];
            let module: &dyn Module = node.module.as_ref();
            (id, node.name.as_str(), module)
        })
    }

    /// Whether the topology changed since the last arrange
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bumped by every arrange
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Execution order from the last arrange
    pub fn execution_order(&self) -> &[NodeId] {
        &self.execution_order
    }

    /// Every audio cycle found by the last arrange
    pub fn find_circular_dependencies(&self) -> &[Cycle] {
        &self.cycles
    }

    /// Fail with the first audio cycle, if any
    pub fn validate(&self) -> Result<(), PatchError> {
        match self.cycles.first() {
            Some(cycle) => Err(PatchError::CycleDetected {
                nodes: cycle.nodes.clone(),
                closing_cable: cycle.closing_cable,
            }),
            None => Ok(()),
        }
    }

    /// Recompute the execution order and routing tables.
    ///
    /// Deterministic for a given topology. Returns only the cycles not
    /// reported by an earlier call.
    pub fn arrange_dependencies(&mut self) -> Vec<Cycle> {
        // Only audio cables can deadlock a block
        let mut incoming: HashMap<NodeId, Vec<CableId>> = HashMap::new();
        for &c in &self.cable_order {
            let cable = &self.cables[c];
            if cable.kind == PortKind::Audio {
                incoming.entry(cable.to.node).or_default().push(c);
            }
        }

        let mut marks: HashMap<NodeId, Mark> = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for &id in &self.node_order {
            if !marks.contains_key(&id) {
                self.visit(id, &incoming, &mut marks, &mut stack, &mut cycles);
            }
        }
        let closing: HashSet<CableId> = cycles.iter().map(|c| c.closing_cable).collect();

        let mut upstream: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &c in &self.cable_order {
            let cable = &self.cables[c];
            if cable.kind == PortKind::Audio && !closing.contains(&c) {
                upstream.entry(cable.to.node).or_default().push(cable.from.node);
            }
        }
        // Note cables order their ends unless that would contradict the audio flow
        for &c in &self.cable_order {
            let cable = &self.cables[c];
            let (from, to) = (cable.from.node, cable.to.node);
            if cable.kind == PortKind::Note && from != to && !Self::feeds(&upstream, to, from) {
                upstream.entry(to).or_default().push(from);
            }
        }

        let mut placed = HashSet::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());
        for &id in &self.node_order {
            Self::place(id, &upstream, &mut placed, &mut order);
        }

        self.rebuild_routes(&closing);

        self.reported.retain(|c| closing.contains(c));
        let mut fresh = Vec::new();
        for cycle in &cycles {
            if self.reported.insert(cycle.closing_cable) {
                let names: Vec<&str> = cycle
                    .nodes
                    .iter()
                    .filter_map(|&n| self.name(n))
                    .collect();
                tracing::warn!(modules = ?names, "circular audio dependency; closing cable muted");
                fresh.push(cycle.clone());
            }
        }

        self.execution_order = order;
        self.cycles = cycles;
        self.dirty = false;
        self.generation += 1;
        fresh
    }

    fn visit(
        &self,
        id: NodeId,
        incoming: &HashMap<NodeId, Vec<CableId>>,
        marks: &mut HashMap<NodeId, Mark>,
        stack: &mut Vec<NodeId>,
        cycles: &mut Vec<Cycle>,
    ) {
        marks.insert(id, Mark::InProgress);
        stack.push(id);

        for &cable_id in incoming.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            let source = self.cables[cable_id].from.node;
            match marks.get(&source) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|&n| n == source).unwrap_or(0);
                    cycles.push(Cycle {
                        nodes: stack[start..].to_vec(),
                        closing_cable: cable_id,
                    });
                }
                None => self.visit(source, incoming, marks, stack, cycles),
            }
        }

        stack.pop();
        marks.insert(id, Mark::Done);
    }

    /// Whether `source` is upstream of `target`
    fn feeds(upstream: &HashMap<NodeId, Vec<NodeId>>, source: NodeId, target: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut pending = vec![target];
        while let Some(id) = pending.pop() {
            if id == source {
                return true;
            }
            if seen.insert(id) {
                pending.extend(upstream.get(&id).into_iter().flatten().copied());
            }
        }
        false
    }

    /// Emit `id` after everything upstream of it
    fn place(
        id: NodeId,
        upstream: &HashMap<NodeId, Vec<NodeId>>,
        placed: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) {
        if !placed.insert(id) {
            return;
        }
        for &source in upstream.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            Self::place(source, upstream, placed, order);
        }
        order.push(id);
    }

    fn rebuild_routes(&mut self, closing: &HashSet<CableId>) {
        for node in self.nodes.values_mut() {
            node.audio_sources.clear();
        }
        self.note_routes.clear();

        for &c in &self.cable_order {
            let cable = self.cables[c];
            match cable.kind {
                PortKind::Note => self.note_routes.push(NoteRoute {
                    from: cable.from,
                    to: cable.to,
                }),
                PortKind::Audio => {
                    if closing.contains(&c) {
                        continue;
                    }
                    let from_index = self.nodes[cable.from.node].spec.output_index(cable.from.port);
                    let dest = &mut self.nodes[cable.to.node];
                    let to_index = dest.spec.input_index(cable.to.port);
                    if let (Some(from_index), Some(to_index)) = (from_index, to_index) {
                        dest.audio_sources.push(AudioRoute {
                            from: cable.from.node,
                            from_index,
                            to_index,
                        });
                    }
                }
            }
        }
    }

    /// Reset every module and clear pending notes
    pub fn reset(&mut self) {
        for node in self.nodes.values_mut() {
            node.module.reset();
            for (_, queue) in &mut node.queues {
                queue.clear();
            }
            for buffer in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                buffer.clear();
            }
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = (NodeId, &mut Node)> {
        self.nodes.iter_mut()
    }

    pub(crate) fn note_routes(&self) -> &[NoteRoute] {
        &self.note_routes
    }

    pub(crate) fn take_retired_listeners(&mut self) -> Vec<ListenerId> {
        std::mem::take(&mut self.retired_listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ProcessIo;
    use crate::port::PortDef;

    // Simple passthrough module for testing
    struct Passthrough {
        spec: PortSpec,
    }

    impl Passthrough {
        fn new() -> Self {
            Self {
                spec: PortSpec {
                    inputs: vec![PortDef::audio(0, "in"), PortDef::note(1, "notes")],
                    outputs: vec![PortDef::audio(10, "out"), PortDef::note(11, "notes")],
                },
            }
        }
    }

    impl Module for Passthrough {
        fn type_id(&self) -> &'static str {
            "passthrough"
        }

        fn port_spec(&self) -> &PortSpec {
            &self.spec
        }

        fn process(&mut self, io: &mut ProcessIo<'_>) {
            io.outputs[0].add(&io.inputs[0]);
        }
    }

    fn patch() -> Patch {
        Patch::new(EngineContext::default())
    }

    fn audio(patch: &mut Patch, a: &NodeHandle, b: &NodeHandle) -> CableId {
        patch
            .connect(a.out("out").unwrap(), b.in_("in").unwrap())
            .unwrap()
    }

    #[test]
    fn test_add_module() {
        let mut patch = patch();
        let handle = patch.add("test", Passthrough::new()).unwrap();
        assert_eq!(patch.node_count(), 1);
        assert_eq!(patch.name(handle.id()), Some("test"));
        assert_eq!(patch.find("test"), Some(handle.id()));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut patch = patch();
        patch.add("a", Passthrough::new()).unwrap();
        assert!(matches!(
            patch.add("a", Passthrough::new()),
            Err(PatchError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_connect_checks_kind() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();

        assert!(patch.connect(a.out("out").unwrap(), b.in_("in").unwrap()).is_ok());
        assert!(matches!(
            patch.connect(a.out("notes").unwrap(), b.in_("in").unwrap()),
            Err(PatchError::KindMismatch { .. })
        ));
        assert!(a.out("missing").is_err());
        assert_eq!(patch.cable_count(), 1);
    }

    #[test]
    fn test_connect_twice_is_idempotent() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let first = audio(&mut patch, &a, &b);
        let second = audio(&mut patch, &a, &b);
        assert_eq!(first, second);
        assert_eq!(patch.cable_count(), 1);
    }

    #[test]
    fn test_dependency_order() {
        let mut patch = patch();
        // Insert downstream first so insertion order alone would be wrong
        let c = patch.add("c", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let a = patch.add("a", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &b);
        audio(&mut patch, &b, &c);

        assert!(patch.arrange_dependencies().is_empty());
        assert_eq!(patch.execution_order(), &[a.id(), b.id(), c.id()]);
    }

    #[test]
    fn test_arrange_is_idempotent() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let c = patch.add("c", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &c);
        audio(&mut patch, &b, &c);

        patch.arrange_dependencies();
        let first = patch.execution_order().to_vec();
        patch.arrange_dependencies();
        assert_eq!(first, patch.execution_order());
    }

    #[test]
    fn test_cycle_reported_once() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let forward = audio(&mut patch, &a, &b);
        audio(&mut patch, &b, &a);

        let cycles = patch.arrange_dependencies();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].nodes, vec![a.id(), b.id()]);
        // The search starts at `a` and walks upstream, so `a -> b` closes the loop
        assert_eq!(cycles[0].closing_cable, forward);
        assert_eq!(patch.execution_order(), &[b.id(), a.id()]);
        assert!(matches!(
            patch.validate(),
            Err(PatchError::CycleDetected { .. })
        ));

        assert!(patch.arrange_dependencies().is_empty());
        assert_eq!(patch.find_circular_dependencies().len(), 1);
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &a);
        let cycles = patch.arrange_dependencies();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].nodes, vec![a.id()]);
    }

    #[test]
    fn test_note_cycle_not_reported() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        patch
            .connect(a.out("notes").unwrap(), b.in_("notes").unwrap())
            .unwrap();
        patch
            .connect(b.out("notes").unwrap(), a.in_("notes").unwrap())
            .unwrap();
        assert!(patch.arrange_dependencies().is_empty());
        assert!(patch.validate().is_ok());
    }

    #[test]
    fn test_note_cable_against_audio_flow_is_not_a_cycle() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let forward = audio(&mut patch, &a, &b);
        patch
            .connect(b.out("notes").unwrap(), a.in_("notes").unwrap())
            .unwrap();

        assert!(patch.arrange_dependencies().is_empty());
        assert!(patch.find_circular_dependencies().is_empty());
        assert_eq!(patch.execution_order(), &[a.id(), b.id()]);

        let sources: Vec<NodeId> = patch
            .node(b.id())
            .unwrap()
            .audio_sources
            .iter()
            .map(|route| route.from)
            .collect();
        assert_eq!(sources, vec![a.id()]);
        assert!(patch.cable(forward).is_some());
    }

    #[test]
    fn test_note_cable_orders_its_ends() {
        let mut patch = patch();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let a = patch.add("a", Passthrough::new()).unwrap();
        patch
            .connect(a.out("notes").unwrap(), b.in_("notes").unwrap())
            .unwrap();
        patch.arrange_dependencies();
        assert_eq!(patch.execution_order(), &[a.id(), b.id()]);
    }

    #[test]
    fn test_reformed_cycle_reported_again() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &b);
        let back = audio(&mut patch, &b, &a);
        assert_eq!(patch.arrange_dependencies().len(), 1);

        // Break the loop through the cable that did not close it
        patch.disconnect(back).unwrap();
        assert!(patch.arrange_dependencies().is_empty());

        audio(&mut patch, &b, &a);
        let cycles = patch.arrange_dependencies();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].nodes, vec![a.id(), b.id()]);
    }

    #[test]
    fn test_generation_advances_per_arrange() {
        let mut patch = patch();
        assert_eq!(patch.generation(), 0);
        patch.arrange_dependencies();
        patch.arrange_dependencies();
        assert_eq!(patch.generation(), 2);
    }

    #[test]
    fn test_breaking_cycle_clears_it() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &b);
        let back = audio(&mut patch, &b, &a);
        patch.arrange_dependencies();
        patch.disconnect(back).unwrap();
        patch.arrange_dependencies();
        assert!(patch.find_circular_dependencies().is_empty());
    }

    #[test]
    fn test_mult() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        let c = patch.add("c", Passthrough::new()).unwrap();

        let result = patch.mult(
            a.out("out").unwrap(),
            &[b.in_("in").unwrap(), c.in_("in").unwrap()],
        );
        assert!(result.is_ok());
        assert_eq!(patch.cable_count(), 2);
    }

    #[test]
    fn test_disconnect() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();

        let cable = audio(&mut patch, &a, &b);
        patch.disconnect(cable).unwrap();
        assert_eq!(patch.cable_count(), 0);
        assert!(matches!(patch.disconnect(cable), Err(PatchError::InvalidCable)));
    }

    #[test]
    fn test_remove_module() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let b = patch.add("b", Passthrough::new()).unwrap();
        audio(&mut patch, &a, &b);

        patch.remove(a.id()).unwrap();
        assert_eq!(patch.node_count(), 1);
        assert_eq!(patch.cable_count(), 0);
        assert!(patch.find("a").is_none());
        assert!(matches!(patch.remove(a.id()), Err(PatchError::InvalidNode)));
    }

    #[test]
    fn test_rename() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        patch.add("b", Passthrough::new()).unwrap();

        assert!(matches!(
            patch.rename(a.id(), "b"),
            Err(PatchError::DuplicateName(_))
        ));
        patch.rename(a.id(), "osc").unwrap();
        assert_eq!(patch.find("osc"), Some(a.id()));
        assert!(patch.find("a").is_none());
    }

    #[test]
    fn test_enable_disable() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        assert!(patch.is_enabled(a.id()));
        patch.set_enabled(a.id(), false).unwrap();
        assert!(!patch.is_enabled(a.id()));
    }

    #[test]
    fn test_capabilities_resolved_at_add() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        let caps = patch.capabilities(a.id()).unwrap();
        assert!(caps.audio_source && caps.audio_receiver);
        assert!(caps.note_source && caps.note_receiver);
    }

    #[test]
    fn test_param_handle_taken_once() {
        let mut patch = patch();
        let a = patch.add("a", Passthrough::new()).unwrap();
        assert!(patch.take_param_handle(a.id()).is_some());
        assert!(patch.take_param_handle(a.id()).is_none());
    }
}

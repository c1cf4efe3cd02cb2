//! Graph Scheduler
//!
//! Executes a [`Patch`] once per block on the audio thread. Edits are
//! arranged on the control thread through [`Scheduler::rebuild`]; a block that
//! still finds the patch changed re-arranges it as a fallback. Every other
//! block walks the cached execution order and precomputed routes without
//! allocating.
//!
//! Per block:
//!
//! 1. Apply pending parameter messages for every module (block-start snapshot)
//! 2. Advance the transport and deliver boundary events to their listeners
//! 3. For each module in dependency order: poll, release due queued notes,
//!    sum inbound audio, process, then route emitted notes
//!
//! Notes routed to a module that already ran this block start sounding in the
//! next block. Notes whose time lies past the current block are queued on the
//! receiving port.

use crate::buffer::AudioBlock;
use crate::context::{EngineContext, Frame};
use crate::engine::{EventLog, LogKind};
use crate::graph::{NodeId, Patch, PortRef};
use crate::module::ProcessIo;
use crate::note::NoteMessage;
use crate::transport::{ListenerId, TimeEvent, Transport};
use slotmap::SecondaryMap;
use std::collections::VecDeque;

/// Maximum note-cable hops a single note may take within one block
pub const MAX_NOTE_HOPS: u32 = 16;

/// Capacity of the in-flight note routing buffer
pub const NOTE_WORK_CAPACITY: usize = 1024;

/// Counters accumulated on the audio thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub blocks: u64,
    /// Notes dropped by full queues or outboxes
    pub dropped_notes: usize,
    /// Notes dropped because they exceeded [`MAX_NOTE_HOPS`]
    pub hop_limit_drops: usize,
}

/// Runs a patch block by block
pub struct Scheduler {
    ctx: EngineContext,
    patch: Patch,
    transport: Transport,
    order: Vec<NodeId>,
    /// Patch generation `order` was copied from
    arranged: Option<u64>,
    listeners: SecondaryMap<ListenerId, NodeId>,
    time_events: Vec<TimeEvent>,
    note_work: VecDeque<(PortRef, NoteMessage, u32)>,
    hw_inputs: Vec<AudioBlock>,
    hw_outputs: Vec<AudioBlock>,
    frame: Frame,
    stats: BlockStats,
    log: EventLog,
}

impl Scheduler {
    /// Create a scheduler with `inputs` hardware input and `outputs` hardware
    /// output channels
    pub fn new(patch: Patch, transport: Transport, inputs: usize, outputs: usize) -> Self {
        let ctx = *patch.ctx();
        let mut scheduler = Self {
            ctx,
            order: Vec::with_capacity(patch.node_count()),
            arranged: None,
            listeners: SecondaryMap::new(),
            time_events: Vec::with_capacity(64),
            note_work: VecDeque::with_capacity(NOTE_WORK_CAPACITY),
            hw_inputs: (0..inputs).map(|_| AudioBlock::new(ctx.block_size)).collect(),
            hw_outputs: (0..outputs).map(|_| AudioBlock::new(ctx.block_size)).collect(),
            frame: ctx.frame_at(transport.now()),
            patch,
            transport,
            stats: BlockStats::default(),
            log: EventLog::default(),
        };
        scheduler.rebuild();
        scheduler
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn ctx(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    pub fn patch_mut(&mut self) -> &mut Patch {
        &mut self.patch
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Window of the next block to run
    pub fn frame(&self) -> Frame {
        self.ctx.frame_at(self.transport.now())
    }

    /// Window of the most recently run block
    pub fn last_frame(&self) -> Frame {
        self.frame
    }

    pub fn stats(&self) -> BlockStats {
        self.stats
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    pub fn hw_input_count(&self) -> usize {
        self.hw_inputs.len()
    }

    pub fn hw_output_count(&self) -> usize {
        self.hw_outputs.len()
    }

    /// Swap in a new patch, returning the old one.
    ///
    /// The old patch's transport listeners are unregistered.
    pub fn replace_patch(&mut self, patch: Patch) -> Patch {
        for (listener, _) in self.listeners.drain() {
            if self.transport.contains_listener(listener) {
                self.transport.remove_listener(listener);
            }
        }
        self.order.clear();
        self.arranged = None;
        self.note_work.clear();
        let old = std::mem::replace(&mut self.patch, patch);
        self.rebuild();
        old
    }

    /// Whether the patch changed since the cached order was taken
    pub fn needs_rebuild(&self) -> bool {
        self.patch.is_dirty() || self.arranged != Some(self.patch.generation())
    }

    /// Re-arrange the patch if its topology changed, pick up its execution
    /// order and sync transport listeners with the modules that want them
    pub fn rebuild(&mut self) {
        for listener in self.patch.take_retired_listeners() {
            self.listeners.remove(listener);
            if self.transport.contains_listener(listener) {
                self.transport.remove_listener(listener);
            }
        }

        if self.patch.is_dirty() {
            for cycle in self.patch.arrange_dependencies() {
                let names: Vec<&str> = cycle
                    .nodes
                    .iter()
                    .filter_map(|&n| self.patch.name(n))
                    .collect();
                self.log.push(
                    LogKind::Warning,
                    format!(
                        "circular audio dependency through {}; closing cable muted",
                        names.join(" -> ")
                    ),
                );
            }
        }

        if self.arranged != Some(self.patch.generation()) {
            self.order.clear();
            self.order.extend_from_slice(self.patch.execution_order());
            self.arranged = Some(self.patch.generation());
            tracing::debug!(modules = self.order.len(), "patch arranged");
        }

        for (id, node) in self.patch.nodes_mut() {
            if node.listener.is_none() {
                if let Some(config) = node.listener_config {
                    let listener = self.transport.add_listener(config);
                    node.listener = Some(listener);
                    self.listeners.insert(listener, id);
                }
            }
        }
    }

    /// Render one block.
    ///
    /// `inputs` holds one slice per hardware input channel and `outputs` one
    /// per hardware output channel; missing channels read as silence and
    /// extra channels are left untouched.
    pub fn run_block(&mut self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        if self.needs_rebuild() {
            self.rebuild();
        }

        let frame = self.ctx.frame_at(self.transport.now());
        self.frame = frame;

        for (i, block) in self.hw_inputs.iter_mut().enumerate() {
            match inputs.get(i) {
                Some(samples) => block.copy_from(samples),
                None => block.clear(),
            }
        }
        for block in &mut self.hw_outputs {
            block.clear();
        }

        self.drain_params(frame);
        self.dispatch_time_events(frame);

        for i in 0..self.order.len() {
            let id = self.order[i];
            self.run_node(id, frame);
        }

        for (block, out) in self.hw_outputs.iter().zip(outputs.iter_mut()) {
            let n = block.len().min(out.len());
            out[..n].copy_from_slice(&block.as_slice()[..n]);
        }

        self.collect_drops();
        self.stats.blocks += 1;
    }

    fn drain_params(&mut self, frame: Frame) {
        for (id, node) in self.patch.nodes_mut() {
            if !node.param_inbox.drain(frame.start, node.module.as_mut()) {
                continue;
            }

            let wanted = node.module.transport_listener();
            if wanted == node.listener_config {
                continue;
            }
            node.listener_config = wanted;
            let registered = node.listener.filter(|&l| self.transport.contains_listener(l));
            match (registered, wanted) {
                (Some(listener), Some(config)) => {
                    self.transport
                        .update_listener(listener, config.interval, config.offset);
                }
                (Some(listener), None) => {
                    self.transport.remove_listener(listener);
                    self.listeners.remove(listener);
                    node.listener = None;
                }
                (None, Some(config)) => {
                    let listener = self.transport.add_listener(config);
                    node.listener = Some(listener);
                    self.listeners.insert(listener, id);
                }
                (None, None) => {}
            }
        }
    }

    fn dispatch_time_events(&mut self, frame: Frame) {
        self.time_events.clear();
        let events = &mut self.time_events;
        self.transport.advance(frame.duration, |event| events.push(event));

        for i in 0..self.time_events.len() {
            let event = self.time_events[i];
            let Some(&id) = self.listeners.get(event.listener) else {
                continue;
            };
            let Some(node) = self.patch.node_mut(id) else {
                continue;
            };
            if !node.enabled {
                continue;
            }
            node.module.on_time_event(event.time, &mut node.notes);
            self.route_notes(id, frame);
        }
    }

    fn run_node(&mut self, id: NodeId, frame: Frame) {
        let Some(node) = self.patch.node_mut(id) else {
            return;
        };
        if !node.enabled {
            return;
        }

        node.module.poll(frame);
        for (port, queue) in node.queues.iter_mut() {
            let port = *port;
            queue.process(&frame, |note| {
                node.module.play_note(port, note, &mut node.notes);
            });
        }
        self.route_notes(id, frame);

        // Sum inbound audio
        let (mut inputs, routes) = match self.patch.node_mut(id) {
            Some(node) => (
                std::mem::take(&mut node.inputs),
                std::mem::take(&mut node.audio_sources),
            ),
            None => return,
        };
        // Inputs widen to the channel count of whatever feeds them
        for buffer in inputs.iter_mut() {
            buffer.clear();
            buffer.set_num_active_channels(1);
        }
        for route in &routes {
            if let (Some(source), Some(input)) =
                (self.patch.node(route.from), inputs.get_mut(route.to_index))
            {
                if let Some(output) = source.outputs.get(route.from_index) {
                    input.add(output);
                }
            }
        }

        let Some(node) = self.patch.node_mut(id) else {
            return;
        };
        node.inputs = inputs;
        node.audio_sources = routes;

        for output in &mut node.outputs {
            output.clear();
        }
        let mut io = ProcessIo {
            frame,
            ctx: &self.ctx,
            inputs: &node.inputs,
            outputs: &mut node.outputs,
            notes: &mut node.notes,
            hw_inputs: &self.hw_inputs,
            hw_outputs: &mut self.hw_outputs,
        };
        node.module.process(&mut io);

        self.route_notes(id, frame);
    }

    /// Deliver every note `source` has emitted, following note cables
    fn route_notes(&mut self, source: NodeId, frame: Frame) {
        let Some(node) = self.patch.node_mut(source) else {
            return;
        };
        if node.notes.is_empty() {
            return;
        }
        for (port, note) in node.notes.drain() {
            if self.note_work.len() >= NOTE_WORK_CAPACITY {
                self.stats.dropped_notes += 1;
                continue;
            }
            self.note_work.push_back((PortRef::new(source, port), note, 0));
        }

        while let Some((from, note, hops)) = self.note_work.pop_front() {
            for i in 0..self.patch.note_routes().len() {
                let route = self.patch.note_routes()[i];
                if route.from != from {
                    continue;
                }
                self.deliver(route.to, note.clone(), hops, frame);
            }
        }
    }

    fn deliver(&mut self, to: PortRef, mut note: NoteMessage, hops: u32, frame: Frame) {
        let Some(dest) = self.patch.node_mut(to.node) else {
            return;
        };
        if !dest.enabled {
            return;
        }

        if note.time >= frame.end() {
            if let Some(queue) = dest.queue_mut(to.port) {
                queue.queue_note(note);
            }
            return;
        }

        note.time = note.time.max(frame.start);
        dest.module.play_note(to.port, note, &mut dest.notes);

        if dest.notes.is_empty() {
            return;
        }
        if hops >= MAX_NOTE_HOPS {
            self.stats.hop_limit_drops += dest.notes.len();
            dest.notes.clear();
            return;
        }
        for (port, note) in dest.notes.drain() {
            if self.note_work.len() >= NOTE_WORK_CAPACITY {
                self.stats.dropped_notes += 1;
                continue;
            }
            self.note_work
                .push_back((PortRef::new(to.node, port), note, hops + 1));
        }
    }

    fn collect_drops(&mut self) {
        for (_, node) in self.patch.nodes_mut() {
            self.stats.dropped_notes += node.notes.take_dropped();
            for (_, queue) in node.queues.iter_mut() {
                self.stats.dropped_notes += queue.take_dropped();
            }
        }
    }

    /// Move audio-thread counters into the event log.
    ///
    /// Call from the control thread; returns the number of new entries.
    pub fn flush_stats(&mut self) -> usize {
        let mut added = 0;
        if self.stats.dropped_notes > 0 {
            self.log.push(
                LogKind::Warning,
                format!("{} notes dropped by full queues", self.stats.dropped_notes),
            );
            self.stats.dropped_notes = 0;
            added += 1;
        }
        if self.stats.hop_limit_drops > 0 {
            self.log.push(
                LogKind::Warning,
                format!(
                    "{} notes dropped after {} note-cable hops",
                    self.stats.hop_limit_drops, MAX_NOTE_HOPS
                ),
            );
            self.stats.hop_limit_drops = 0;
            added += 1;
        }
        added
    }

    /// Silence every module, clear pending notes and rewind the transport
    pub fn reset(&mut self) {
        self.patch.reset();
        self.note_work.clear();
        self.transport.reset();
    }
}

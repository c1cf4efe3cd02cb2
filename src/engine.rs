//! Engine
//!
//! Ties a [`Scheduler`] to the two threads that use it. The control thread
//! edits the patch through [`Engine::lock`]; the audio thread calls
//! [`AudioHandle::process`] once per callback. Both take the same coarse lock,
//! so an edit is never observed halfway through a block. Parameter changes
//! bypass the lock through each module's [`ParamHandle`](crate::params::ParamHandle).

use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::error::{PatchError, StateError, TransportError};
use crate::graph::Patch;
use crate::savestate;
use crate::scheduler::Scheduler;
use crate::serialize::{ModuleRegistry, PatchDef};
use crate::transport::Transport;
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Severity of an [`EventLog`] entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKind::Info => write!(f, "info"),
            LogKind::Warning => write!(f, "warning"),
            LogKind::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: LogKind,
    pub message: String,
}

/// Bounded, newest-last record of user-visible warnings and errors
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, discarding the oldest when full
    pub fn push(&mut self, kind: LogKind, message: impl Into<String>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            kind,
            message: message.into(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<LogEntry> {
        self.entries.drain(..).collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(EngineConfig::default().event_log_capacity)
    }
}

/// Audio-thread entry point; cheap to clone
#[derive(Clone)]
pub struct AudioHandle {
    inner: Arc<Mutex<Scheduler>>,
}

impl AudioHandle {
    /// Render one block into `outputs`
    pub fn process(&self, inputs: &[&[f64]], outputs: &mut [&mut [f64]]) {
        self.inner.lock().run_block(inputs, outputs);
    }
}

/// Exclusive access to the running scheduler.
///
/// Edits made through the guard are arranged when it drops, on the thread
/// that made them, so the next block starts from a ready execution order.
pub struct SchedulerGuard<'a> {
    scheduler: MutexGuard<'a, Scheduler>,
}

impl Deref for SchedulerGuard<'_> {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl DerefMut for SchedulerGuard<'_> {
    fn deref_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
}

impl Drop for SchedulerGuard<'_> {
    fn drop(&mut self) {
        if self.scheduler.needs_rebuild() {
            self.scheduler.rebuild();
        }
    }
}

/// A running patch plus its configuration
pub struct Engine {
    config: EngineConfig,
    registry: ModuleRegistry,
    inner: Arc<Mutex<Scheduler>>,
}

impl Engine {
    /// Build an engine with an empty patch.
    ///
    /// Invalid configuration fields fall back to their defaults; each
    /// correction is recorded in the event log.
    pub fn new(config: EngineConfig) -> Self {
        let (config, corrections) = config.validated();
        let mut log = EventLog::new(config.event_log_capacity);
        for correction in corrections {
            log.push(LogKind::Warning, correction);
        }

        let patch = Self::empty_patch(&config);
        let transport = Transport::new(config.tempo, config.time_signature);
        let scheduler = Scheduler::new(
            patch,
            transport,
            config.input_channels,
            config.output_channels,
        )
        .with_event_log(log);

        tracing::info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            "engine started"
        );

        Self {
            registry: ModuleRegistry::from_config(&config),
            config,
            inner: Arc::new(Mutex::new(scheduler)),
        }
    }

    fn empty_patch(config: &EngineConfig) -> Patch {
        Patch::with_capacities(
            config.context(),
            config.note_queue_capacity,
            config.param_queue_capacity,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ctx(&self) -> EngineContext {
        self.config.context()
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }

    pub fn audio_handle(&self) -> AudioHandle {
        AudioHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Take the topology lock for editing
    pub fn lock(&self) -> SchedulerGuard<'_> {
        SchedulerGuard {
            scheduler: self.inner.lock(),
        }
    }

    /// Run `f` against the patch under the topology lock, then arrange it
    pub fn edit<R>(&self, f: impl FnOnce(&mut Patch) -> R) -> R {
        let mut scheduler = self.inner.lock();
        let result = f(scheduler.patch_mut());
        if scheduler.needs_rebuild() {
            scheduler.rebuild();
        }
        result
    }

    pub fn set_tempo(&self, tempo: f64) -> Result<(), TransportError> {
        let mut scheduler = self.inner.lock();
        let result = scheduler.transport_mut().set_tempo(tempo);
        if let Err(err) = &result {
            scheduler.log_mut().push(LogKind::Warning, err.to_string());
        }
        result
    }

    /// Replace the running patch with one built from a layout.
    ///
    /// Recoverable problems (unknown parameters, dangling cables) are logged
    /// and skipped. The new patch is built before the lock is taken.
    pub fn load_layout(&self, def: &PatchDef) -> Result<(), PatchError> {
        let mut patch = Self::empty_patch(&self.config);
        let warnings = def.build_into(&mut patch, &self.registry)?;

        let mut scheduler = self.inner.lock();
        scheduler.replace_patch(patch);
        for warning in warnings {
            scheduler.log_mut().push(LogKind::Warning, warning);
        }
        Ok(())
    }

    pub fn load_layout_json(&self, json: &str) -> Result<(), PatchError> {
        let def = PatchDef::from_json(json)?;
        self.load_layout(&def)
    }

    /// Current layout as a serializable definition
    pub fn layout(&self) -> PatchDef {
        PatchDef::from_patch(self.inner.lock().patch())
    }

    /// Binary snapshot of the patch's runtime state
    pub fn save_state(&self) -> Result<Vec<u8>, StateError> {
        savestate::save(self.inner.lock().patch())
    }

    /// Restore a snapshot from [`save_state`](Self::save_state).
    ///
    /// Records that fail to decode are skipped and logged; returns the number
    /// of modules restored.
    pub fn load_state(&self, bytes: &[u8]) -> Result<usize, StateError> {
        let mut scheduler = self.inner.lock();
        let report = savestate::load(scheduler.patch_mut(), bytes)?;
        for problem in &report.skipped {
            scheduler.log_mut().push(LogKind::Warning, problem.clone());
        }
        Ok(report.restored)
    }

    /// Drain the event log, including counters gathered on the audio thread
    pub fn events(&self) -> Vec<LogEntry> {
        let mut scheduler = self.inner.lock();
        scheduler.flush_stats();
        scheduler.log_mut().drain()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("sample_rate", &self.config.sample_rate)
            .field("block_size", &self.config.block_size)
            .finish()
    }
}

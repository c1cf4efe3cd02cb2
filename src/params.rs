//! Parameter Messages
//!
//! The control thread never writes module parameters directly. It pushes
//! [`ParamMessage`]s into a per-module lock-free ring, and the audio thread
//! drains the ring at the start of each block before the module runs. Every
//! value a module sees during a block is therefore a stable snapshot, and a
//! multi-field update sent as [`ParamMessage::SetMany`] lands atomically.

use crate::graph::NodeId;
use crate::module::{find_param, Module};
use crate::port::ParamId;
use rtrb::{Consumer, Producer, RingBuffer};

/// Largest number of values carried by one [`ParamMessage::SetMany`]
pub const MAX_BATCH: usize = 8;

/// Concurrent ramps per module
pub const MAX_RAMPS: usize = 16;

/// A parameter change travelling from the control thread to the audio thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamMessage {
    Set {
        id: ParamId,
        value: f64,
    },
    /// Several values applied together in one block
    SetMany {
        count: usize,
        values: [(ParamId, f64); MAX_BATCH],
    },
    /// Move linearly to `target` over `duration_ms`, starting at the next block
    Ramp {
        id: ParamId,
        target: f64,
        duration_ms: f64,
    },
}

impl ParamMessage {
    /// Build a batch; `None` if there are more than [`MAX_BATCH`] values
    pub fn batch(values: &[(ParamId, f64)]) -> Option<Self> {
        if values.len() > MAX_BATCH {
            return None;
        }
        let mut packed = [(0, 0.0); MAX_BATCH];
        packed[..values.len()].copy_from_slice(values);
        Some(ParamMessage::SetMany {
            count: values.len(),
            values: packed,
        })
    }
}

/// Control-side sender for one module's parameters.
///
/// Sending is lock-free. If the ring is full the message is returned.
pub struct ParamHandle {
    node: NodeId,
    sender: Producer<ParamMessage>,
}

impl ParamHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn send(&mut self, msg: ParamMessage) -> Result<(), ParamMessage> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    pub fn set(&mut self, id: ParamId, value: f64) -> Result<(), ParamMessage> {
        self.send(ParamMessage::Set { id, value })
    }

    /// Send several values that must take effect in the same block.
    ///
    /// Batches larger than [`MAX_BATCH`] are split; each chunk is still
    /// applied atomically.
    pub fn set_many(&mut self, values: &[(ParamId, f64)]) -> Result<(), ParamMessage> {
        for chunk in values.chunks(MAX_BATCH) {
            if let Some(msg) = ParamMessage::batch(chunk) {
                self.send(msg)?;
            }
        }
        Ok(())
    }

    pub fn ramp(&mut self, id: ParamId, target: f64, duration_ms: f64) -> Result<(), ParamMessage> {
        self.send(ParamMessage::Ramp {
            id,
            target,
            duration_ms,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct ParamRamp {
    id: ParamId,
    from: f64,
    target: f64,
    start: f64,
    end: f64,
}

/// Audio-side receiver that applies queued parameter changes at block start
pub struct ParamInbox {
    receiver: Consumer<ParamMessage>,
    ramps: Vec<ParamRamp>,
}

/// Create a connected handle/inbox pair for `node`
pub fn param_channel(node: NodeId, capacity: usize) -> (ParamHandle, ParamInbox) {
    let (sender, receiver) = RingBuffer::new(capacity.max(1));
    (
        ParamHandle { node, sender },
        ParamInbox {
            receiver,
            ramps: Vec::with_capacity(MAX_RAMPS),
        },
    )
}

fn apply(module: &mut dyn Module, id: ParamId, value: f64) {
    if !value.is_finite() {
        tracing::warn!(id, "ignored non-finite parameter value");
        return;
    }
    match find_param(module.params(), id) {
        Some(def) => {
            let value = def.clamp(value);
            module.set_param(id, value);
        }
        None => tracing::warn!(id, module = module.type_id(), "unknown parameter"),
    }
}

impl ParamInbox {
    /// Apply every pending message and advance ramps to `block_start`.
    ///
    /// Returns true if any parameter changed.
    pub fn drain(&mut self, block_start: f64, module: &mut dyn Module) -> bool {
        let mut changed = false;

        while let Ok(msg) = self.receiver.pop() {
            changed = true;
            match msg {
                ParamMessage::Set { id, value } => {
                    self.cancel_ramp(id);
                    apply(module, id, value);
                }
                ParamMessage::SetMany { count, values } => {
                    for &(id, value) in &values[..count.min(MAX_BATCH)] {
                        self.cancel_ramp(id);
                        apply(module, id, value);
                    }
                }
                ParamMessage::Ramp {
                    id,
                    target,
                    duration_ms,
                } => {
                    self.cancel_ramp(id);
                    if duration_ms.is_nan() || duration_ms <= 0.0 {
                        apply(module, id, target);
                        continue;
                    }
                    if self.ramps.len() >= MAX_RAMPS {
                        tracing::warn!(id, "too many active ramps, jumping to target");
                        apply(module, id, target);
                        continue;
                    }
                    let from = module.get_param(id).unwrap_or(target);
                    self.ramps.push(ParamRamp {
                        id,
                        from,
                        target,
                        start: block_start,
                        end: block_start + duration_ms,
                    });
                }
            }
        }

        for ramp in &self.ramps {
            let t = ((block_start - ramp.start) / (ramp.end - ramp.start)).clamp(0.0, 1.0);
            apply(module, ramp.id, ramp.from + (ramp.target - ramp.from) * t);
            changed = true;
        }
        self.ramps.retain(|r| r.end > block_start);

        changed
    }

    /// Whether any ramp is still in progress
    pub fn is_ramping(&self) -> bool {
        !self.ramps.is_empty()
    }

    fn cancel_ramp(&mut self, id: ParamId) {
        self.ramps.retain(|r| r.id != id);
    }
}

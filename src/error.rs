//! Error types
//!
//! Control-thread operations report failures through these types. The audio
//! path never returns them: it guards its preconditions and renders silence.

use crate::graph::{CableId, NodeId};
use thiserror::Error;

/// Errors raised while editing or loading a patch graph
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid node")]
    InvalidNode,

    #[error("invalid port")]
    InvalidPort,

    #[error("invalid cable")]
    InvalidCable,

    #[error("cannot connect a {from:?} output to a {to:?} input")]
    KindMismatch {
        from: crate::port::PortKind,
        to: crate::port::PortKind,
    },

    #[error("a module named `{0}` already exists")]
    DuplicateName(String),

    #[error("unknown module `{0}`")]
    UnknownModule(String),

    #[error("unknown parameter {0}")]
    UnknownParam(crate::port::ParamId),

    #[error("unknown module type `{0}`")]
    UnknownModuleType(String),

    #[error("malformed port reference `{0}` (expected `module.port`)")]
    MalformedPortRef(String),

    #[error("cycle detected through {} modules", nodes.len())]
    CycleDetected {
        nodes: Vec<NodeId>,
        closing_cable: CableId,
    },

    #[error("patch definition error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the transport
#[derive(Debug, Error, PartialEq)]
pub enum TransportError {
    #[error("invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },
}

/// Errors raised while reading a binary save-state stream
#[derive(Debug, Error)]
pub enum StateError {
    #[error("stream ended unexpectedly")]
    Truncated,

    #[error("not a save-state stream")]
    BadMagic,

    #[error("unsupported revision {found} (newest supported is {supported})")]
    UnsupportedRevision { found: u32, supported: u32 },

    #[error("corrupt state for `{module}`: {reason}")]
    Corrupt { module: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

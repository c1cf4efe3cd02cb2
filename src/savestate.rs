//! Binary Save-State Stream
//!
//! A fast snapshot of the runtime state layouts do not capture. The stream is
//! a header followed by one length-prefixed record per module:
//!
//! ```text
//! header:  magic "PWST" | format revision u32 | record count u32
//! record:  name length u16 | name (UTF-8) | module revision u32
//!          | payload length u32 | payload
//! ```
//!
//! All integers are little-endian. Because every record carries its length, a
//! record that fails to decode is skipped and loading resumes at the next one.

use crate::error::StateError;
use crate::graph::Patch;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// Stream signature
pub const MAGIC: [u8; 4] = *b"PWST";

/// Newest stream format this crate reads and writes
pub const FORMAT_REVISION: u32 = 1;

/// Outcome of [`load`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Modules whose state was restored
    pub restored: usize,
    /// One message per record that was skipped
    pub skipped: Vec<String>,
    /// The stream ended inside a record
    pub truncated: bool,
}

/// Write the runtime state of every module in `patch`
pub fn save(patch: &Patch) -> Result<Vec<u8>, StateError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.write_u32::<LittleEndian>(FORMAT_REVISION)?;
    out.write_u32::<LittleEndian>(patch.node_count() as u32)?;

    let mut payload = Vec::new();
    for (_, name, module) in patch.nodes() {
        payload.clear();
        module.save_state(&mut payload)?;

        let name = name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| StateError::Corrupt {
            module: String::from_utf8_lossy(name).into_owned(),
            reason: "name too long".into(),
        })?;
        out.write_u16::<LittleEndian>(name_len)?;
        out.extend_from_slice(name);
        out.write_u32::<LittleEndian>(module.state_revision())?;
        out.write_u32::<LittleEndian>(payload.len() as u32)?;
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

/// Restore module state from a [`save`] stream.
///
/// Header problems fail the whole load. Per-record problems are collected in
/// the report; a truncated stream keeps whatever was restored before the cut.
pub fn load(patch: &mut Patch, mut bytes: &[u8]) -> Result<LoadReport, StateError> {
    let mut magic = [0u8; 4];
    bytes.read_exact(&mut magic).map_err(|_| StateError::Truncated)?;
    if magic != MAGIC {
        return Err(StateError::BadMagic);
    }
    let revision = bytes.read_u32::<LittleEndian>().map_err(|_| StateError::Truncated)?;
    if revision > FORMAT_REVISION {
        return Err(StateError::UnsupportedRevision {
            found: revision,
            supported: FORMAT_REVISION,
        });
    }
    let count = bytes.read_u32::<LittleEndian>().map_err(|_| StateError::Truncated)?;

    let mut report = LoadReport::default();
    for _ in 0..count {
        let record = match read_record(&mut bytes) {
            Ok(record) => record,
            Err(_) => {
                tracing::warn!(restored = report.restored, "save-state stream truncated");
                report.truncated = true;
                report.skipped.push("save-state stream ended early".into());
                break;
            }
        };

        let Ok(name) = std::str::from_utf8(record.name) else {
            report.skipped.push("record with an unreadable module name".into());
            continue;
        };
        let Some(module) = patch.find(name).and_then(|id| patch.module_mut(id)) else {
            tracing::debug!(module = name, "no module for save-state record");
            report.skipped.push(format!("no module named `{}`", name));
            continue;
        };

        match module.load_state(record.revision, record.payload) {
            Ok(()) => report.restored += 1,
            Err(err) => {
                tracing::warn!(module = name, %err, "skipped save-state record");
                report.skipped.push(format!("`{}`: {}", name, err));
            }
        }
    }

    Ok(report)
}

struct Record<'a> {
    name: &'a [u8],
    revision: u32,
    payload: &'a [u8],
}

fn read_record<'a>(bytes: &mut &'a [u8]) -> Result<Record<'a>, StateError> {
    let name_len = bytes.read_u16::<LittleEndian>()? as usize;
    let name = take(bytes, name_len)?;
    let revision = bytes.read_u32::<LittleEndian>()?;
    let payload_len = bytes.read_u32::<LittleEndian>()? as usize;
    let payload = take(bytes, payload_len)?;
    Ok(Record {
        name,
        revision,
        payload,
    })
}

fn take<'a>(bytes: &mut &'a [u8], len: usize) -> Result<&'a [u8], StateError> {
    if bytes.len() < len {
        return Err(StateError::Truncated);
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

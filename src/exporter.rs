//! JSON export of the normalized model.
//!
//! Output is compact, one document per file. Each reply nests inside the
//! message it answers, so an unbranched chat is as deep as it is long; both
//! directions run through `serde_stacker`, which grows the stack on demand.
//!
//! ```json
//! { "conversations": [ { "id": "…", "schema_kind": "chat", "title": "…",
//!                        "root": { "id": "…", "role": "user", "content": "…",
//!                                  "timestamp": "…", "children": [ … ] } } ] }
//! ```
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_stacker::{Deserializer as StackerDeserializer, Serializer as StackerSerializer};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::model::ConversationTree;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Export {
    pub conversations: Vec<ConversationTree>,
}

pub fn write_export<W: Write>(writer: W, export: &Export) -> Result<(), ExportError> {
    let mut writer = BufWriter::new(writer);
    let mut ser = serde_json::Serializer::new(&mut writer);
    export.serialize(StackerSerializer::new(&mut ser))?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

/// Read an export back, restoring each node's `parent_id`.
pub fn read_export<R: Read>(reader: R) -> Result<Export, ExportError> {
    let mut de = serde_json::Deserializer::from_reader(BufReader::new(reader));
    de.disable_recursion_limit();
    let mut export = Export::deserialize(StackerDeserializer::new(&mut de))?;
    de.end()?;
    for conv in &mut export.conversations {
        conv.root.relink_parents();
    }
    Ok(export)
}

/// Write the export next to `path` and move it into place, so a failed run
/// never leaves a truncated file behind.
pub fn write_export_file(path: &Path, export: &Export) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("Failed to create output directory: {}", dir.display()))?;

    let tmp = NamedTempFile::new_in(dir).wrap_err("Failed to create temporary file")?;
    write_export(tmp.as_file(), export)
        .wrap_err_with(|| format!("Failed to write export: {}", path.display()))?;
    tmp.persist(path)
        .wrap_err_with(|| format!("Failed to move export into place: {}", path.display()))?;
    Ok(())
}

pub fn read_export_file(path: &Path) -> Result<Export> {
    let file = fs::File::open(path)
        .wrap_err_with(|| format!("Failed to open export: {}", path.display()))?;
    read_export(file).wrap_err_with(|| format!("Failed to parse export: {}", path.display()))
}

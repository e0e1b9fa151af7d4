//! Notebook file format (nbformat v4 JSON, `.ipynb`).
//!
//! The skip flag round-trips as cell `metadata.execute = false`. Files are
//! validated against the embedded notebook schema before deserialization.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::core::document::{Cell, CellKind, Document, Output, multiline};

const NOTEBOOK_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/notebook/v4.schema.json"
));
const EXECUTE_FLAG: &str = "execute";

#[derive(Debug, Deserialize)]
struct RawNotebook {
    cells: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    cell_type: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(deserialize_with = "multiline")]
    source: String,
    #[serde(default)]
    outputs: Vec<Output>,
}

impl RawCell {
    fn into_cell(self) -> Cell {
        let kind = match self.cell_type.as_str() {
            "code" => CellKind::Code,
            _ => CellKind::Markdown,
        };
        let mut cell = Cell::new(kind, self.source);
        if kind == CellKind::Code {
            cell.outputs = self.outputs;
        }
        cell.skip_execution = self.metadata.get(EXECUTE_FLAG) == Some(&Value::Bool(false));
        cell
    }
}

/// Serialize a document as an nbformat v4 notebook value.
pub fn document_to_json(doc: &Document) -> Value {
    let cells: Vec<Value> = doc.cells().iter().map(cell_to_json).collect();
    json!({
        "cells": cells,
        "metadata": {
            "kernelspec": {
                "display_name": "Python 3",
                "language": "python",
                "name": "python3"
            },
            "language_info": { "name": "python" }
        },
        "nbformat": 4,
        "nbformat_minor": 4
    })
}

fn cell_to_json(cell: &Cell) -> Value {
    let mut metadata = Map::new();
    if cell.skip_execution {
        metadata.insert(EXECUTE_FLAG.to_string(), Value::Bool(false));
    }
    match cell.kind {
        CellKind::Code => json!({
            "cell_type": "code",
            "execution_count": null,
            "metadata": metadata,
            "outputs": cell.outputs,
            "source": cell.source,
        }),
        CellKind::Markdown => json!({
            "cell_type": "markdown",
            "metadata": metadata,
            "source": cell.source,
        }),
    }
}

/// Validate and deserialize a notebook value.
pub fn document_from_json(value: Value) -> Result<Document> {
    validate_schema(&value)?;
    let raw: RawNotebook = serde_json::from_value(value).context("deserialize notebook")?;
    Ok(Document::from_cells(
        raw.cells.into_iter().map(RawCell::into_cell).collect(),
    ))
}

/// Atomically write a document to `path`.
pub fn save_document(path: &Path, doc: &Document) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(&document_to_json(doc))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load and validate a document from `path`.
pub fn load_document(path: &Path) -> Result<Document> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read notebook {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse notebook {}", path.display()))?;
    document_from_json(value).with_context(|| format!("load notebook {}", path.display()))
}

fn validate_schema(notebook: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(NOTEBOOK_SCHEMA).context("parse notebook schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(notebook) {
        let messages = compiled
            .iter_errors(notebook)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "notebook schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

/// Write `contents` to a sibling temp file, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = temp_sibling(path);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

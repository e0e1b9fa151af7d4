//! In-memory notebook document and its cell-editing primitives.
//!
//! Cell indices are positions, not identifiers: inserting or removing a cell
//! shifts every later index. Cell order defines execution order.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Kind of a notebook cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
        }
    }

    /// Map a model-written cell type to a kind. Unknown values become `Code`.
    pub fn from_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "markdown" | "narrative" | "text" => CellKind::Markdown,
            _ => CellKind::Code,
        }
    }
}

/// One output produced by executing a code cell (nbformat v4 shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: String,
        #[serde(deserialize_with = "multiline")]
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    DisplayData {
        #[serde(default)]
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
    },
    ExecuteResult {
        #[serde(default)]
        data: BTreeMap<String, Value>,
        #[serde(default)]
        metadata: BTreeMap<String, Value>,
        #[serde(default)]
        execution_count: Option<u32>,
    },
}

impl Output {
    pub fn stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: "stdout".to_string(),
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Output::Error { .. })
    }
}

/// nbformat allows multi-line strings to be stored as a list of lines.
pub(crate) fn multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Text {
        One(String),
        Lines(Vec<String>),
    }

    Ok(match Text::deserialize(deserializer)? {
        Text::One(text) => text,
        Text::Lines(lines) => lines.concat(),
    })
}

/// A single cell. `outputs` is only ever populated for code cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub kind: CellKind,
    pub source: String,
    pub outputs: Vec<Output>,
    /// Once set, full-document executions leave this cell (and its outputs) alone.
    pub skip_execution: bool,
}

impl Cell {
    pub fn new(kind: CellKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            outputs: Vec::new(),
            skip_execution: false,
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(CellKind::Code, source)
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self::new(CellKind::Markdown, source)
    }
}

/// Where to insert a new cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    At(usize),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("cell index {index} out of range (document has {len} cells)")]
    IndexOutOfRange { index: i64, len: usize },
}

/// Ordered sequence of cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    cells: Vec<Cell>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    pub fn cell(&self, index: usize) -> Option<&Cell> {
        self.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Insert a new cell. `At(len)` is equivalent to `End`.
    pub fn add_cell(
        &mut self,
        content: impl Into<String>,
        kind: CellKind,
        position: Position,
    ) -> Result<usize, DocumentError> {
        let cell = Cell::new(kind, content);
        match position {
            Position::End => {
                self.cells.push(cell);
                Ok(self.cells.len() - 1)
            }
            Position::At(index) => {
                if index > self.cells.len() {
                    return Err(self.out_of_range(index));
                }
                self.cells.insert(index, cell);
                Ok(index)
            }
        }
    }

    /// Replace the source of an existing cell. Kind and outputs are kept until
    /// the next execution.
    pub fn replace_cell(
        &mut self,
        index: usize,
        content: impl Into<String>,
    ) -> Result<(), DocumentError> {
        let err = self.out_of_range(index);
        let cell = self.cells.get_mut(index).ok_or(err)?;
        cell.source = content.into();
        Ok(())
    }

    pub fn remove_cell(&mut self, index: usize) -> Result<Cell, DocumentError> {
        if index >= self.cells.len() {
            return Err(self.out_of_range(index));
        }
        Ok(self.cells.remove(index))
    }

    pub fn skip_execution(&mut self, index: usize) -> Result<(), DocumentError> {
        let err = self.out_of_range(index);
        let cell = self.cells.get_mut(index).ok_or(err)?;
        cell.skip_execution = true;
        Ok(())
    }

    fn out_of_range(&self, index: usize) -> DocumentError {
        DocumentError::IndexOutOfRange {
            index: i64::try_from(index).unwrap_or(i64::MAX),
            len: self.cells.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_cells() -> Document {
        Document::from_cells(vec![
            Cell::markdown("# title"),
            Cell::code("a = 1"),
            Cell::code("print(a)"),
        ])
    }

    #[test]
    fn add_cell_at_len_appends() {
        let mut doc = three_cells();
        let idx = doc
            .add_cell("b = 2", CellKind::Code, Position::At(3))
            .expect("add");
        assert_eq!(idx, 3);
        assert_eq!(doc.cell(3).map(|c| c.source.as_str()), Some("b = 2"));
    }

    #[test]
    fn add_cell_past_end_is_rejected() {
        let mut doc = three_cells();
        let err = doc
            .add_cell("x", CellKind::Code, Position::At(7))
            .expect_err("out of range");
        assert_eq!(err, DocumentError::IndexOutOfRange { index: 7, len: 3 });
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn remove_shifts_later_indices() {
        let mut doc = three_cells();
        let removed = doc.remove_cell(1).expect("remove");
        assert_eq!(removed.source, "a = 1");
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.cell(1).map(|c| c.source.as_str()), Some("print(a)"));
    }

    #[test]
    fn replace_keeps_kind_and_outputs() {
        let mut doc = three_cells();
        doc.cells_mut()[2].outputs.push(Output::stdout("1\n"));
        doc.replace_cell(2, "print(a + 1)").expect("replace");
        let cell = doc.cell(2).expect("cell");
        assert_eq!(cell.kind, CellKind::Code);
        assert_eq!(cell.outputs.len(), 1);
        assert_eq!(cell.source, "print(a + 1)");
    }

    #[test]
    fn skip_execution_flags_cell() {
        let mut doc = three_cells();
        doc.skip_execution(1).expect("skip");
        assert!(doc.cell(1).expect("cell").skip_execution);
        assert!(doc.skip_execution(3).is_err());
    }

    #[test]
    fn lenient_kind_falls_back_to_code() {
        assert_eq!(CellKind::from_lenient(" Markdown "), CellKind::Markdown);
        assert_eq!(CellKind::from_lenient("python"), CellKind::Code);
    }

    #[test]
    fn stream_text_accepts_line_lists() {
        let raw = r#"{"output_type":"stream","name":"stdout","text":["a\n","b\n"]}"#;
        let output: Output = serde_json::from_str(raw).expect("parse");
        assert_eq!(output, Output::stdout("a\nb\n"));
    }
}

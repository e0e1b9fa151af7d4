//! Render a document into bounded prompt content.
//!
//! Layout, wrapped in a leading/trailing code fence:
//!
//! ```text
//! # <cell 0>                  markdown cells
//! ...
//! # </cell 0>
//! # <cell 1: input>           code cells
//! ...
//! # </cell 1: input>
//! # <cell 1: output>          only when the cell has non-empty outputs
//! ...
//! # </cell 1: output>
//! ```
//!
//! Text outputs of one cell share a character budget; images are free.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::core::content::ContentBlock;
use crate::core::document::{Cell, CellKind, Document, Output};

/// Default character budget for the text outputs of a single cell.
pub const MAX_CELL_OUTPUT_CHARS: usize = 3000;
pub const TRUNCATION_MARKER: &str = "... (truncated)";

const FENCE_OPEN: &str = "```python\n";
const FENCE_CLOSE: &str = "```";
const PNG_MIME: &str = "image/png";

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub include_outputs: bool,
    pub max_output_chars: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_outputs: true,
            max_output_chars: MAX_CELL_OUTPUT_CHARS,
        }
    }
}

/// Render every cell in order into content blocks.
pub fn render_document(doc: &Document, options: &RenderOptions) -> Vec<ContentBlock> {
    let mut blocks = vec![ContentBlock::text(FENCE_OPEN)];
    for (idx, cell) in doc.cells().iter().enumerate() {
        match cell.kind {
            CellKind::Markdown => blocks.push(ContentBlock::text(format!(
                "# <cell {idx}>\n{}\n# </cell {idx}>",
                cell.source
            ))),
            CellKind::Code => {
                blocks.push(ContentBlock::text(format!(
                    "# <cell {idx}: input>\n{}\n# </cell {idx}: input>",
                    cell.source
                )));
                if options.include_outputs {
                    blocks.extend(render_cell_outputs(idx, cell, options.max_output_chars));
                }
            }
        }
    }
    blocks.push(ContentBlock::text(FENCE_CLOSE));
    blocks
}

fn render_cell_outputs(idx: usize, cell: &Cell, budget: usize) -> Vec<ContentBlock> {
    let mut rendered = Vec::new();
    let mut used = 0usize;
    for output in &cell.outputs {
        match render_output(output) {
            Some(ContentBlock::Text { text }) => {
                if text.is_empty() || used >= budget {
                    continue;
                }
                let len = text.chars().count();
                let text = if used + len > budget {
                    let mut cut = take_chars(&text, budget - used).to_string();
                    cut.push_str(TRUNCATION_MARKER);
                    cut
                } else {
                    text
                };
                used += text.chars().count();
                rendered.push(ContentBlock::text(text));
            }
            Some(image) => rendered.push(image),
            None => {}
        }
    }
    if rendered.is_empty() {
        return rendered;
    }

    let mut blocks = Vec::with_capacity(rendered.len() + 2);
    blocks.push(ContentBlock::text(format!("\n# <cell {idx}: output>\n")));
    blocks.extend(rendered);
    blocks.push(ContentBlock::text(format!("\n# </cell {idx}: output>\n")));
    blocks
}

/// Render one output. Kinds with no prompt representation yield `None`.
fn render_output(output: &Output) -> Option<ContentBlock> {
    match output {
        Output::Stream { text, .. } => Some(ContentBlock::text(text.clone())),
        Output::Error {
            ename,
            evalue,
            traceback,
        } => {
            let trace = traceback
                .iter()
                .map(|line| ANSI_RE.replace_all(line, ""))
                .collect::<Vec<_>>()
                .join("\n");
            Some(ContentBlock::text(format!("\n{ename}: {evalue}\n{trace}\n")))
        }
        Output::DisplayData { data, .. } => {
            let payload = media_text(data.get(PNG_MIME)?)?;
            Some(ContentBlock::image(format!("data:{PNG_MIME};base64,{payload}")))
        }
        Output::ExecuteResult { .. } => None,
    }
}

/// Media payloads may be stored as a string or a list of lines.
fn media_text(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts.iter().filter_map(Value::as_str).collect(),
        _ => return None,
    };
    let compact: String = raw.split_whitespace().collect();
    (!compact.is_empty()).then_some(compact)
}

fn take_chars(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

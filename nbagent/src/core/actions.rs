//! Action protocol: the tag grammar the model must answer in, and its decoder.
//!
//! Decoding is lenient by contract. Each mutation kind is scanned
//! independently (Insert, Replace, Remove, Stop, in that order) and a block is
//! kept only if every required field is present and its index parses. Anything
//! else is dropped without an error.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::document::CellKind;

const INSERT_TAG: &str = "add_cell";
const REPLACE_TAG: &str = "modify_cell";
const REMOVE_TAG: &str = "delete_cell";
const STOP_TAG: &str = "stop";
const FEEDBACK_TAG: &str = "feedback";

const TYPE_FIELD: &str = "type";
const IDX_FIELD: &str = "idx";
const CONTENT_FIELD: &str = "content";

/// Insert index meaning "end of document".
pub const APPEND_SENTINEL: &str = "append";

static TAG_PATTERNS: LazyLock<HashMap<&'static str, Regex>> = LazyLock::new(|| {
    [
        INSERT_TAG,
        REPLACE_TAG,
        REMOVE_TAG,
        STOP_TAG,
        FEEDBACK_TAG,
        TYPE_FIELD,
        IDX_FIELD,
        CONTENT_FIELD,
    ]
    .into_iter()
    .map(|tag| {
        let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
        (tag, Regex::new(&pattern).unwrap())
    })
    .collect()
});

/// Target position of an insert as written by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertAt {
    Index(i64),
    End,
}

/// One structured edit decoded from a model reply.
///
/// Indices are kept as written (possibly negative); range checks happen when
/// the mutation is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Insert {
        kind: CellKind,
        at: InsertAt,
        content: String,
    },
    Replace {
        index: i64,
        content: String,
    },
    Remove {
        index: i64,
    },
    Stop,
}

/// Result of decoding a generate-mode reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedActions {
    /// Well-formed mutations in kind order, then appearance order.
    pub mutations: Vec<Mutation>,
    /// True iff at least one stop block was present.
    pub stop: bool,
}

impl ParsedActions {
    /// Number of document edits (stop markers excluded).
    pub fn edit_count(&self) -> usize {
        self.mutations
            .iter()
            .filter(|m| !matches!(m, Mutation::Stop))
            .count()
    }
}

/// Result of decoding a critique-mode reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CritiqueDecision {
    pub feedback: Option<String>,
    pub stop: bool,
}

/// Textual grammar for all generate-mode actions, embedded verbatim in prompts.
pub fn action_grammar() -> String {
    format!(
        r#"
Possible actions:
1. Add a cell
<{INSERT_TAG}>
<{TYPE_FIELD}>Cell type i.e. either `code` or `markdown`. Type: enum</{TYPE_FIELD}>
<{IDX_FIELD}>Cell index i.e. the index the new cell will occupy, or `{APPEND_SENTINEL}` to add it at the end. Type: int</{IDX_FIELD}>
<{CONTENT_FIELD}>
Cell content i.e. the content of the cell to add. Type: str
</{CONTENT_FIELD}>
</{INSERT_TAG}>

2. Modify a cell
<{REPLACE_TAG}>
<{IDX_FIELD}>Cell index i.e. the index of the cell to modify. Type: int</{IDX_FIELD}>
<{CONTENT_FIELD}>
Cell content i.e. the new content of the cell. Type: str
</{CONTENT_FIELD}>
</{REPLACE_TAG}>

3. Delete a cell
<{REMOVE_TAG}>
<{IDX_FIELD}>Cell index i.e. the index of the cell to delete. Type: int</{IDX_FIELD}>
</{REMOVE_TAG}>

4. Stop
<{STOP_TAG}>
</{STOP_TAG}>
"#
    )
}

/// Textual grammar for critique-mode answers.
pub fn critique_grammar() -> String {
    format!(
        r#"
Possible actions:
1. Provide feedback
<{FEEDBACK_TAG}>
What is missing or wrong, and what the next attempt should do differently. Type: str
</{FEEDBACK_TAG}>

2. Accept the notebook as complete
<{STOP_TAG}>
</{STOP_TAG}>
"#
    )
}

/// Decode a generate-mode reply into mutations and a stop flag.
pub fn parse_actions(reply: &str) -> ParsedActions {
    let mut mutations = Vec::new();
    mutations.extend(extract_blocks(reply, INSERT_TAG).filter_map(decode_insert));
    mutations.extend(extract_blocks(reply, REPLACE_TAG).filter_map(decode_replace));
    mutations.extend(extract_blocks(reply, REMOVE_TAG).filter_map(decode_remove));

    let stops = extract_blocks(reply, STOP_TAG).count();
    mutations.extend(std::iter::repeat_n(Mutation::Stop, stops));

    ParsedActions {
        mutations,
        stop: stops > 0,
    }
}

/// Decode a critique-mode reply. Multiple feedback blocks are joined by newlines.
pub fn parse_critique(reply: &str) -> CritiqueDecision {
    let parts: Vec<&str> = extract_blocks(reply, FEEDBACK_TAG)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    let feedback = (!parts.is_empty()).then(|| parts.join("\n"));
    let stop = extract_blocks(reply, STOP_TAG).next().is_some();
    CritiqueDecision { feedback, stop }
}

fn decode_insert(block: &str) -> Option<Mutation> {
    let kind = field(block, TYPE_FIELD).filter(|raw| !raw.trim().is_empty())?;
    let at = parse_insert_at(field(block, IDX_FIELD)?)?;
    let content = cell_content(field(block, CONTENT_FIELD)?)?;
    Some(Mutation::Insert {
        kind: CellKind::from_lenient(kind),
        at,
        content,
    })
}

fn decode_replace(block: &str) -> Option<Mutation> {
    let index = parse_index(field(block, IDX_FIELD)?)?;
    let content = cell_content(field(block, CONTENT_FIELD)?)?;
    Some(Mutation::Replace { index, content })
}

fn decode_remove(block: &str) -> Option<Mutation> {
    let index = parse_index(field(block, IDX_FIELD)?)?;
    Some(Mutation::Remove { index })
}

/// Every `<tag>…</tag>` body in appearance order (non-greedy, spans lines).
fn extract_blocks<'a>(
    text: &'a str,
    tag: &'static str,
) -> impl Iterator<Item = &'a str> + 'a {
    TAG_PATTERNS[tag]
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
}

fn field<'a>(block: &'a str, tag: &'static str) -> Option<&'a str> {
    extract_blocks(block, tag).next()
}

fn parse_index(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

fn parse_insert_at(raw: &str) -> Option<InsertAt> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case(APPEND_SENTINEL) {
        return Some(InsertAt::End);
    }
    match parse_index(trimmed)? {
        -1 => Some(InsertAt::End),
        index => Some(InsertAt::Index(index)),
    }
}

/// Strip the newlines that surround content inside its tags; blank content is
/// treated as missing.
fn cell_content(raw: &str) -> Option<String> {
    if raw.trim().is_empty() {
        return None;
    }
    Some(raw.trim_matches(|c| c == '\n' || c == '\r').to_string())
}

//! Applying decoded mutations to a document.
//!
//! Mutations are applied in the order the decoder produced them (all inserts,
//! then replaces, then removes). Each one is independent: an out-of-range
//! index skips that mutation and the batch continues.
//!
//! Known ordering hazard: indices are used exactly as the model wrote them,
//! against the document as it is at that point in the batch. A reply that
//! inserts at 0 and removes 2 removes what was cell 1 before the insert.

use crate::core::actions::{InsertAt, Mutation, ParsedActions};
use crate::core::document::{Document, DocumentError, Position};

/// Outcome of applying one batch of mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    /// Mutations that were rejected, with the reason.
    pub skipped: Vec<(Mutation, DocumentError)>,
}

/// Apply every edit in `actions` to `doc`. Stop markers are ignored here; the
/// caller honors `actions.stop` after the edits land.
pub fn apply_mutations(doc: &mut Document, actions: &ParsedActions) -> ApplySummary {
    let mut summary = ApplySummary::default();
    for mutation in &actions.mutations {
        let result = match mutation {
            Mutation::Insert { kind, at, content } => insert_position(doc, *at)
                .and_then(|position| doc.add_cell(content.clone(), *kind, position))
                .map(|_| ()),
            Mutation::Replace { index, content } => {
                to_index(doc, *index).and_then(|i| doc.replace_cell(i, content.clone()))
            }
            Mutation::Remove { index } => {
                to_index(doc, *index).and_then(|i| doc.remove_cell(i).map(|_| ()))
            }
            Mutation::Stop => continue,
        };
        match result {
            Ok(()) => summary.applied += 1,
            Err(err) => summary.skipped.push((mutation.clone(), err)),
        }
    }
    summary
}

fn insert_position(doc: &Document, at: InsertAt) -> Result<Position, DocumentError> {
    match at {
        InsertAt::End => Ok(Position::End),
        InsertAt::Index(index) => to_index(doc, index).map(Position::At),
    }
}

fn to_index(doc: &Document, index: i64) -> Result<usize, DocumentError> {
    usize::try_from(index).map_err(|_| DocumentError::IndexOutOfRange {
        index,
        len: doc.len(),
    })
}

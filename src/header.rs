//! Header row resolution.
//!
//! Exports from accounting tools often carry a few preamble lines (report
//! title, date range) before the real header. Auto-detection scans a bounded
//! window for the first row containing every required column in order;
//! alternatively the caller supplies explicit column positions.

use std::collections::{BTreeMap, HashMap};

use crate::coerce::clean_cell;

/// Rows scanned for a header before giving up.
pub const DEFAULT_HEADER_LOOKAHEAD: usize = 20;

/// Explicit `column name -> CSV index` pairs supplied by the caller.
pub type ColumnMapping = BTreeMap<String, i64>;

/// Case-insensitive column name to CSV position table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderIndex {
    columns: HashMap<String, usize>,
    names: Vec<String>,
}

impl HeaderIndex {
    /// Index every cell of a header row. The first occurrence of a repeated
    /// name wins.
    pub fn from_row(cells: &[String]) -> Self {
        let names: Vec<String> = cells.iter().map(|c| clean_cell(c)).collect();
        let mut columns = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            columns.entry(name.to_lowercase()).or_insert(i);
        }
        Self { columns, names }
    }

    /// Build from an explicit mapping, bounds-checked against the observed
    /// header row. Negative or out-of-range positions are dropped.
    pub fn from_mapping(mapping: &ColumnMapping, header: &[String]) -> Self {
        let names: Vec<String> = header.iter().map(|c| clean_cell(c)).collect();
        let columns = mapping
            .iter()
            .filter_map(|(name, &idx)| {
                let idx = usize::try_from(idx).ok()?;
                (idx < names.len()).then(|| (name.trim().to_lowercase(), idx))
            })
            .collect();
        Self { columns, names }
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.columns.get(&name.to_lowercase()).copied()
    }

    /// The header row as it appeared in the file (cleaned).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// True when `expected` (lower-cased) appears within the cleaned cells, in
/// order, possibly with other columns interleaved.
pub fn header_matches(cells: &[String], expected: &[String]) -> bool {
    let mut wanted = expected.iter().peekable();
    for cell in cells {
        let Some(next) = wanted.peek() else { break };
        if clean_cell(cell).to_lowercase() == **next {
            wanted.next();
        }
    }
    wanted.peek().is_none()
}

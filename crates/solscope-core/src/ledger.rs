//! Per-line analysis results.
//!
//! Every interpreted statement publishes a record keyed by its source
//! line. Records carry flattened variable snapshots (`"x" -> "[0,9]"`,
//! `"owner" -> "addr#101"`), so consumers never need the domain types.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Declaration,
    Assignment,
    BranchTrue,
    RequireTrue,
    AssertTrue,
    LoopDelta,
    ImplicitReturn,
    Return,
    Revert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    /// Flattened variable paths to rendered values.
    pub vars: BTreeMap<String, String>,
}

impl Record {
    pub fn new(kind: RecordKind, vars: BTreeMap<String, String>) -> Self {
        Record { kind, vars }
    }
}

/// Line-indexed record store with replace-on-repeat semantics so that
/// re-interpreting a line updates its records in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    records: IndexMap<u32, Vec<Record>>,
}

impl Ledger {
    pub fn new() -> Self {
        Ledger::default()
    }

    /// Publishes a record for `line`. An existing record with the same
    /// kind and the same variable key set is replaced; anything else is
    /// appended.
    pub fn append_or_replace(&mut self, line: u32, record: Record) {
        let slot = self.records.entry(line).or_default();
        for existing in slot.iter_mut() {
            if existing.kind == record.kind
                && existing.vars.keys().eq(record.vars.keys())
            {
                *existing = record;
                return;
            }
        }
        slot.push(record);
    }

    pub fn clear_line(&mut self, line: u32) {
        self.records.shift_remove(&line);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, line: u32) -> &[Record] {
        self.records.get(&line).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records for lines in `lo..=hi`, in ascending line order.
    pub fn get_range(&self, lo: u32, hi: u32) -> Vec<(u32, &Record)> {
        let mut out: Vec<(u32, &Record)> = self
            .records
            .iter()
            .filter(|(line, _)| (lo..=hi).contains(line))
            .flat_map(|(line, recs)| recs.iter().map(move |r| (*line, r)))
            .collect();
        out.sort_by_key(|(line, _)| *line);
        out
    }

    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        self.records.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(kind: RecordKind, pairs: &[(&str, &str)]) -> Record {
        Record::new(
            kind,
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        )
    }

    #[test]
    fn test_same_kind_same_keys_replaces() {
        let mut l = Ledger::new();
        l.append_or_replace(3, rec(RecordKind::Assignment, &[("x", "[0,5]")]));
        l.append_or_replace(3, rec(RecordKind::Assignment, &[("x", "[0,9]")]));
        assert_eq!(l.get(3).len(), 1);
        assert_eq!(l.get(3)[0].vars["x"], "[0,9]");
    }

    #[test]
    fn test_different_keys_append() {
        let mut l = Ledger::new();
        l.append_or_replace(3, rec(RecordKind::Assignment, &[("x", "[0,5]")]));
        l.append_or_replace(3, rec(RecordKind::Assignment, &[("y", "[1,1]")]));
        assert_eq!(l.get(3).len(), 2);
    }

    #[test]
    fn test_different_kind_append() {
        let mut l = Ledger::new();
        l.append_or_replace(7, rec(RecordKind::BranchTrue, &[("x", "[0,5]")]));
        l.append_or_replace(7, rec(RecordKind::Assignment, &[("x", "[0,5]")]));
        assert_eq!(l.get(7).len(), 2);
    }

    #[test]
    fn test_clear_line_and_range() {
        let mut l = Ledger::new();
        l.append_or_replace(10, rec(RecordKind::Declaration, &[("a", "[0,0]")]));
        l.append_or_replace(2, rec(RecordKind::Declaration, &[("b", "[0,0]")]));
        l.append_or_replace(5, rec(RecordKind::Return, &[("return", "[1,1]")]));
        let range = l.get_range(2, 5);
        assert_eq!(range.iter().map(|(line, _)| *line).collect::<Vec<_>>(), vec![2, 5]);
        l.clear_line(5);
        assert!(l.get(5).is_empty());
        assert!(!l.get(10).is_empty());
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut l = Ledger::new();
        l.append_or_replace(1, rec(RecordKind::RequireTrue, &[("x", "[1,9]")]));
        let json = serde_json::to_string(&l.get(1)[0]).unwrap();
        assert!(json.contains("\"requireTrue\""));
    }
}

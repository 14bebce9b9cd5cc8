//! The data model shared by the query-execution paths: command tags, row
//! metadata, and the materialized result of a statement.

use std::sync::Arc;

/// Oid of a Postgres type, as sent in `RowDescription`/`ParameterDescription`.
pub type Oid = u32;

/// One column of a `RowDescription`.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: Option<Oid>,
    pub column_id: Option<i16>,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    /// `0` = text, `1` = binary.
    pub format: i16,
}

/// The column metadata for a prepared statement, as produced by
/// `Describe(Statement)`. Shared (via `Arc`) across every row produced by
/// the statement's execution so re-describing on every row isn't needed.
#[derive(Debug, Clone)]
pub struct StatementDescription {
    pub param_types: Vec<Oid>,
    pub fields: Arc<Vec<FieldDescription>>,
}

/// A materialized row: the raw column bytes plus a shared pointer to the
/// field metadata describing how to interpret them. Values are kept as raw
/// `Option<Vec<u8>>` (a `None` entry is a SQL `NULL`, carried over the wire
/// as a `-1` length prefix) since decoding into Rust types is out of scope
/// for this crate (see spec's Non-goals on type codec/facade).
#[derive(Debug, Clone)]
pub struct Row {
    pub fields: Arc<Vec<FieldDescription>>,
    pub values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index)?.as_deref()
    }

    pub fn column_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|f| f.name.as_str())
    }
}

/// Which SQL verbs report an affected-row count in their `CommandComplete`
/// tag, per the Postgres protocol docs. Verbs outside this set (`CREATE
/// TABLE`, `BEGIN`, ...) have no row count and `CommandTag::rows()` is
/// `None` for them.
const COUNTED_VERBS: &[&str] = &[
    "INSERT", "DELETE", "UPDATE", "SELECT", "MOVE", "FETCH", "COPY",
];

/// The parsed form of a `CommandComplete` message's tag string, e.g.
/// `"UPDATE 3"` or `"INSERT 0 1"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    raw: String,
    verb: String,
    rows: Option<u64>,
}

impl CommandTag {
    /// Parse a `CommandComplete` tag string. Unrecognized verbs are kept
    /// verbatim with `rows() == None`, never an error: new commands (or
    /// extensions) can introduce tags this crate has never seen.
    pub fn parse(tag: &str) -> CommandTag {
        let mut parts = tag.split(' ');
        let verb = parts.next().unwrap_or_default().to_string();
        let rest: Vec<&str> = parts.collect();

        let rows = if COUNTED_VERBS.contains(&verb.as_str()) {
            // INSERT tags are "INSERT <oid> <rows>"; everything else
            // counted is "<VERB> <rows>".
            let last = rest.last().copied();
            last.and_then(|s| s.parse::<u64>().ok())
        } else {
            None
        };

        CommandTag {
            raw: tag.to_string(),
            verb,
            rows,
        }
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn rows(&self) -> Option<u64> {
        self.rows
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// The outcome of executing a single statement: affected/returned row count
/// plus (for queries) the rows themselves.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn extend(&mut self, other: &QueryResult) {
        self.rows_affected += other.rows_affected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_update_tag() {
        let tag = CommandTag::parse("UPDATE 3");
        assert_eq!(tag.verb(), "UPDATE");
        assert_eq!(tag.rows(), Some(3));
    }

    #[test]
    fn parses_insert_tag_uses_last_number() {
        let tag = CommandTag::parse("INSERT 0 1");
        assert_eq!(tag.verb(), "INSERT");
        assert_eq!(tag.rows(), Some(1));
    }

    #[test]
    fn uncounted_verbs_have_no_row_count() {
        let tag = CommandTag::parse("CREATE TABLE");
        assert_eq!(tag.verb(), "CREATE");
        assert_eq!(tag.rows(), None);
    }

    #[test]
    fn begin_has_no_row_count() {
        let tag = CommandTag::parse("BEGIN");
        assert_eq!(tag.rows(), None);
    }

    #[test]
    fn unknown_verb_is_kept_verbatim() {
        let tag = CommandTag::parse("LISTEN");
        assert_eq!(tag.as_str(), "LISTEN");
        assert_eq!(tag.rows(), None);
    }
}

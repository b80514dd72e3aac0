//! Hive-style partition keys and partition DDL
//!
//! Object keys under a table location carry their partition as
//! `name=value` path segments with percent-encoded values:
//!
//! ```text
//! datalake/alb/__ds__=2023-03-11-20-00/region=us-east-1/part-0001.json.gz
//!              \________________ partition ________________/
//! ```
//!
//! Distinct partitions are rendered into batched `ALTER TABLE` statements.

pub mod athena;
pub mod catalog;

pub use athena::AthenaClient;
pub use catalog::{
    execute_and_wait, MemoryCatalog, QueryContext, QueryExecutor, QueryOutcome,
    QueryState, QueryStatus,
};

use lightengine_common::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Value Hive uses for a dimension without a value.
pub const DEFAULT_PARTITION_VALUE: &str = "__HIVE_DEFAULT_PARTITION__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionAction {
    #[default]
    Add,
    Drop,
}

impl fmt::Display for PartitionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionAction::Add => f.write_str("ADD"),
            PartitionAction::Drop => f.write_str("DROP"),
        }
    }
}

/// Ordered `(dimension, encoded value)` pairs of one partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pairs: Vec<(String, String)>,
}

impl PartitionKey {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    /// Parse a `d1=v1/d2=v2` fragment. Segments without `=` are ignored;
    /// `None` when no segment names a partition.
    pub fn parse(fragment: &str) -> Option<Self> {
        let pairs: Vec<(String, String)> = fragment
            .split('/')
            .filter_map(|segment| segment.split_once('='))
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        (!pairs.is_empty()).then_some(Self { pairs })
    }

    /// Partition of an object key under `table_prefix`; the file name is
    /// not part of the partition.
    pub fn from_object_key(table_prefix: &str, key: &str) -> Option<Self> {
        let prefix = table_prefix.trim_matches('/');
        let relative = key.strip_prefix(prefix)?;
        if !prefix.is_empty() && !relative.starts_with('/') {
            return None;
        }
        let (directory, _file) = relative.trim_start_matches('/').rsplit_once('/')?;
        Self::parse(directory)
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn value(&self, dimension: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    /// `d1=v1/d2=v2`, values still encoded
    pub fn path(&self) -> String {
        self.pairs
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// `` (`d1`='v1', `d2`='v2') ``
    pub fn to_spec(&self) -> Result<String> {
        let columns = self
            .pairs
            .iter()
            .map(|(name, value)| Ok(format!("{}={}", quote_identifier(name), escape_literal(value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("({})", columns.join(", ")))
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Percent-decode a value and render it as a single-quoted literal.
/// Single quotes are doubled; double quotes pass through.
pub fn escape_literal(encoded: &str) -> Result<String> {
    let decoded = urlencoding::decode(encoded)
        .map_err(|e| EngineError::Validation(format!("invalid partition value {}: {}", encoded, e)))?;
    Ok(format!("'{}'", decoded.replace('\'', "''")))
}

/// Drop repeated partitions, keeping first-seen order.
pub fn dedupe(keys: impl IntoIterator<Item = PartitionKey>) -> Vec<PartitionKey> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|key| seen.insert(key.clone())).collect()
}

/// Render `ALTER TABLE` statements, at most `batch_size` partitions each.
pub fn render_ddl(
    action: PartitionAction,
    database: &str,
    table: &str,
    keys: &[PartitionKey],
    batch_size: usize,
) -> Result<Vec<String>> {
    if batch_size == 0 {
        return Err(EngineError::Validation("DDL batch size must be positive".to_string()));
    }
    let target = format!("{}.{}", quote_identifier(database), quote_identifier(table));

    keys.chunks(batch_size)
        .map(|chunk| {
            let specs = chunk
                .iter()
                .map(|key| Ok(format!("PARTITION {}", key.to_spec()?)))
                .collect::<Result<Vec<_>>>()?;
            Ok(match action {
                PartitionAction::Add => format!(
                    "ALTER TABLE {} ADD IF NOT EXISTS {};",
                    target,
                    specs.join(" ")
                ),
                PartitionAction::Drop => format!(
                    "ALTER TABLE {} DROP IF EXISTS {};",
                    target,
                    specs.join(", ")
                ),
            })
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(path: &str) -> PartitionKey {
        PartitionKey::parse(path).unwrap()
    }

    #[test]
    fn test_parse_ignores_plain_segments() {
        let key = key("x/d1=v1/y/d2=v2");
        assert_eq!(key.path(), "d1=v1/d2=v2");
        assert_eq!(key.value("d2"), Some("v2"));
        assert!(PartitionKey::parse("a/b").is_none());
    }

    #[test]
    fn test_from_object_key() {
        let key = PartitionKey::from_object_key(
            "datalake/alb/",
            "datalake/alb/__ds__=2023-03-11-20-00/region=us-east-1/part.json.gz",
        )
        .unwrap();
        assert_eq!(key.path(), "__ds__=2023-03-11-20-00/region=us-east-1");

        assert!(PartitionKey::from_object_key("datalake/alb", "datalake/alb/part.gz").is_none());
        assert!(PartitionKey::from_object_key("datalake/alb", "datalake/albx/d=1/p.gz").is_none());
        assert!(PartitionKey::from_object_key("datalake/alb", "other/d=1/p.gz").is_none());
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_literal("%27Amazon%27").unwrap(), "'''Amazon'''");
        assert_eq!(escape_literal("%22Amazon%22").unwrap(), "'\"Amazon\"'");
        assert_eq!(escape_literal("a%20b").unwrap(), "'a b'");
        assert!(escape_literal("%FF").is_err());
    }

    #[test]
    fn test_render_add() {
        let keys = vec![key("d1=v1/d2=v2"), key("d1=v3/d2=v4")];
        let ddl = render_ddl(PartitionAction::Add, "db", "table", &keys, 100).unwrap();
        assert_eq!(
            ddl,
            vec!["ALTER TABLE `db`.`table` ADD IF NOT EXISTS PARTITION (`d1`='v1', `d2`='v2') PARTITION (`d1`='v3', `d2`='v4');"]
        );
    }

    #[test]
    fn test_render_drop_batches() {
        let keys: Vec<_> = (0..5).map(|i| key(&format!("d={}", i))).collect();
        let ddl = render_ddl(PartitionAction::Drop, "db", "t", &keys, 2).unwrap();
        assert_eq!(ddl.len(), 3);
        assert_eq!(
            ddl[0],
            "ALTER TABLE `db`.`t` DROP IF EXISTS PARTITION (`d`='0'), PARTITION (`d`='1');"
        );
        assert!(render_ddl(PartitionAction::Drop, "db", "t", &[], 2).unwrap().is_empty());
        assert!(render_ddl(PartitionAction::Add, "db", "t", &keys, 0).is_err());
    }

    #[test]
    fn test_dedupe_keeps_first_seen_order() {
        let keys = dedupe(vec![key("d=2"), key("d=1"), key("d=2"), key("d=3")]);
        let paths: Vec<_> = keys.iter().map(PartitionKey::path).collect();
        assert_eq!(paths, vec!["d=2", "d=1", "d=3"]);
    }

    #[test]
    fn test_action_wire_names() {
        assert_eq!(serde_json::to_string(&PartitionAction::Drop).unwrap(), "\"DROP\"");
        let action: PartitionAction = serde_json::from_str("\"ADD\"").unwrap();
        assert_eq!(action, PartitionAction::Add);
        assert_eq!(PartitionAction::default(), PartitionAction::Add);
    }

    proptest! {
        #[test]
        fn prop_literal_round_trips(value in "\\PC{0,24}") {
            let encoded = urlencoding::encode(&value);
            let literal = escape_literal(&encoded).unwrap();
            prop_assert!(literal.starts_with('\'') && literal.ends_with('\''));
            let body = &literal[1..literal.len() - 1];
            // No lone quote survives inside the literal
            prop_assert!(!body.replace("''", "").contains('\''));
            prop_assert_eq!(body.replace("''", "'"), value);
        }
    }
}

//! Query catalog access
//!
//! DDL is submitted through an asynchronous statement API: a query is
//! started, then polled until it reaches a terminal state.
//! [`AthenaClient`](super::athena::AthenaClient) runs statements in Athena;
//! [`MemoryCatalog`] applies partition DDL to in-process tables with Hive
//! semantics.

use async_trait::async_trait;
use lightengine_common::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Succeeded | QueryState::Failed | QueryState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub error: Option<String>,
}

impl QueryStatus {
    fn new(state: QueryState) -> Self {
        Self { state, error: None }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            state: QueryState::Failed,
            error: Some(message.into()),
        }
    }
}

/// Execution context of a statement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub database: String,
    pub work_group: String,
    pub output_location: String,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Submit a statement; returns its query id.
    async fn start_query(&self, sql: &str, context: &QueryContext) -> Result<String>;

    async fn get_query_state(&self, query_id: &str) -> Result<QueryStatus>;
}

/// Terminal outcome of one statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryOutcome {
    pub query_id: String,
    pub state: QueryState,
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == QueryState::Succeeded
    }
}

/// Submit `sql` and poll until it finishes or `timeout` passes.
#[instrument(skip(executor, sql, context), fields(database = %context.database))]
pub async fn execute_and_wait(
    executor: &dyn QueryExecutor,
    sql: &str,
    context: &QueryContext,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<QueryOutcome> {
    let query_id = executor.start_query(sql, context).await?;
    debug!(query_id = %query_id, "Query started");
    let started = Instant::now();

    loop {
        let status = executor.get_query_state(&query_id).await?;
        if status.state.is_terminal() {
            if let Some(error) = &status.error {
                warn!(query_id = %query_id, state = ?status.state, error = %error, "Query did not succeed");
            }
            return Ok(QueryOutcome {
                query_id,
                state: status.state,
                error: status.error,
            });
        }
        if started.elapsed() >= timeout {
            return Err(EngineError::Catalog(format!(
                "query {} still {:?} after {:?}",
                query_id, status.state, timeout
            )));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

type Partition = Vec<(String, String)>;

#[derive(Debug, Default)]
struct CatalogState {
    tables: HashMap<(String, String), Vec<Partition>>,
    queries: HashMap<String, QueryStatus>,
    history: Vec<String>,
    failing: Vec<String>,
    next_id: u64,
}

/// Partitioned tables held in process
///
/// Understands the partition DDL the engine renders: `ADD IF NOT EXISTS` is
/// idempotent and `DROP IF EXISTS` ignores absent partitions. Statements are
/// complete as soon as they are started.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    state: Arc<Mutex<CatalogState>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_table(&self, database: &str, table: &str) {
        self.state()
            .tables
            .entry((database.to_string(), table.to_string()))
            .or_default();
    }

    /// Partitions of a table as `d1=v1/d2=v2` paths with decoded values.
    pub fn partitions(&self, database: &str, table: &str) -> Vec<String> {
        self.state()
            .tables
            .get(&(database.to_string(), table.to_string()))
            .map(|partitions| {
                partitions
                    .iter()
                    .map(|p| {
                        p.iter()
                            .map(|(name, value)| format!("{}={}", name, value))
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Statements started so far, in order.
    pub fn history(&self) -> Vec<String> {
        self.state().history.clone()
    }

    /// Fail every later statement that contains `pattern`.
    pub fn fail_statements_containing(&self, pattern: &str) {
        self.state().failing.push(pattern.to_string());
    }

    fn apply(state: &mut CatalogState, sql: &str, context: &QueryContext) -> QueryStatus {
        if state.failing.iter().any(|p| sql.contains(p.as_str())) {
            return QueryStatus::failed("statement rejected");
        }
        let statement = match parse_alter(sql, &context.database) {
            Ok(statement) => statement,
            Err(e) => return QueryStatus::failed(e.to_string()),
        };
        let Some(partitions) = state
            .tables
            .get_mut(&(statement.database.clone(), statement.table.clone()))
        else {
            return QueryStatus::failed(format!(
                "Table not found: {}.{}",
                statement.database, statement.table
            ));
        };

        for partition in statement.partitions {
            let exists = partitions.contains(&partition);
            match (statement.add, exists) {
                (true, false) => partitions.push(partition),
                (false, true) => partitions.retain(|p| *p != partition),
                _ => {}
            }
        }
        QueryStatus::new(QueryState::Succeeded)
    }
}

#[async_trait]
impl QueryExecutor for MemoryCatalog {
    async fn start_query(&self, sql: &str, context: &QueryContext) -> Result<String> {
        let mut state = self.state();
        state.next_id += 1;
        let query_id = format!("memory-{}", state.next_id);
        state.history.push(sql.to_string());
        let status = Self::apply(&mut state, sql, context);
        info!(query_id = %query_id, state = ?status.state, "Applied statement");
        state.queries.insert(query_id.clone(), status);
        Ok(query_id)
    }

    async fn get_query_state(&self, query_id: &str) -> Result<QueryStatus> {
        self.state()
            .queries
            .get(query_id)
            .cloned()
            .ok_or_else(|| EngineError::Catalog(format!("unknown query {}", query_id)))
    }
}

struct AlterStatement {
    database: String,
    table: String,
    add: bool,
    partitions: Vec<Partition>,
}

fn parse_alter(sql: &str, default_database: &str) -> Result<AlterStatement> {
    let invalid = |what: &str| EngineError::Catalog(format!("unsupported statement ({}): {}", what, sql));
    let mut cursor = Scanner::new(sql.trim().trim_end_matches(';'));

    cursor.keyword("ALTER").ok_or_else(|| invalid("ALTER"))?;
    cursor.keyword("TABLE").ok_or_else(|| invalid("TABLE"))?;
    let first = cursor.identifier().ok_or_else(|| invalid("table name"))?;
    let (database, table) = if cursor.symbol('.') {
        let table = cursor.identifier().ok_or_else(|| invalid("table name"))?;
        (first, table)
    } else {
        (default_database.to_string(), first)
    };

    let add = if cursor.keyword("ADD").is_some() {
        true
    } else if cursor.keyword("DROP").is_some() {
        false
    } else {
        return Err(invalid("action"));
    };
    cursor.keyword("IF").ok_or_else(|| invalid("IF"))?;
    if add {
        cursor.keyword("NOT").ok_or_else(|| invalid("NOT"))?;
    }
    cursor.keyword("EXISTS").ok_or_else(|| invalid("EXISTS"))?;

    let mut partitions = Vec::new();
    while cursor.keyword("PARTITION").is_some() {
        if !cursor.symbol('(') {
            return Err(invalid("partition spec"));
        }
        let mut partition = Vec::new();
        loop {
            let name = cursor.identifier().ok_or_else(|| invalid("partition column"))?;
            if !cursor.symbol('=') {
                return Err(invalid("partition value"));
            }
            let value = cursor.literal().ok_or_else(|| invalid("partition literal"))?;
            partition.push((name, value));
            if cursor.symbol(')') {
                break;
            }
            if !cursor.symbol(',') {
                return Err(invalid("partition spec"));
            }
        }
        partitions.push(partition);
        cursor.symbol(',');
    }

    if !cursor.at_end() || partitions.is_empty() {
        return Err(invalid("trailing input"));
    }
    Ok(AlterStatement {
        database,
        table,
        add,
        partitions,
    })
}

struct Scanner<'a> {
    rest: &'a str,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { rest: input }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.rest.is_empty()
    }

    fn keyword(&mut self, word: &str) -> Option<()> {
        self.skip_whitespace();
        let candidate = self.rest.get(..word.len())?;
        let boundary = self.rest[word.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric() && c != '_');
        if candidate.eq_ignore_ascii_case(word) && boundary {
            self.rest = &self.rest[word.len()..];
            Some(())
        } else {
            None
        }
    }

    fn symbol(&mut self, symbol: char) -> bool {
        self.skip_whitespace();
        match self.rest.strip_prefix(symbol) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    /// Quoted with the given delimiter; doubled delimiters escape themselves.
    fn quoted(&mut self, delimiter: char) -> Option<String> {
        self.skip_whitespace();
        let mut chars = self.rest.strip_prefix(delimiter)?.char_indices().peekable();
        let body_start = delimiter.len_utf8();
        let mut value = String::new();
        while let Some((index, c)) = chars.next() {
            if c == delimiter {
                if chars.peek().map(|(_, next)| *next) == Some(delimiter) {
                    chars.next();
                    value.push(delimiter);
                    continue;
                }
                self.rest = &self.rest[body_start + index + c.len_utf8()..];
                return Some(value);
            }
            value.push(c);
        }
        None
    }

    fn identifier(&mut self) -> Option<String> {
        self.skip_whitespace();
        if self.rest.starts_with('`') {
            return self.quoted('`');
        }
        let end = self
            .rest
            .find(|c: char| !c.is_alphanumeric() && c != '_')
            .unwrap_or(self.rest.len());
        if end == 0 {
            return None;
        }
        let identifier = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Some(identifier)
    }

    fn literal(&mut self) -> Option<String> {
        self.quoted('\'')
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn context() -> QueryContext {
        QueryContext {
            database: "centralized".to_string(),
            work_group: "primary".to_string(),
            output_location: "s3://results/".to_string(),
        }
    }

    async fn run(executor: &dyn QueryExecutor, sql: &str) -> QueryOutcome {
        execute_and_wait(executor, sql, &context(), Duration::from_millis(1), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_memory_catalog_add_is_idempotent() {
        let catalog = MemoryCatalog::new();
        catalog.create_table("centralized", "alb");
        let sql = "ALTER TABLE `centralized`.`alb` ADD IF NOT EXISTS PARTITION (`d1`='v1', `d2`='it''s') PARTITION (`d1`='v2', `d2`='x');";

        assert!(run(&catalog, sql).await.succeeded());
        let after_first = catalog.partitions("centralized", "alb");
        assert!(run(&catalog, sql).await.succeeded());
        assert_eq!(catalog.partitions("centralized", "alb"), after_first);
        assert_eq!(after_first, vec!["d1=v1/d2=it's", "d1=v2/d2=x"]);
    }

    #[tokio::test]
    async fn test_memory_catalog_drop() {
        let catalog = MemoryCatalog::new();
        catalog.create_table("centralized", "alb");
        run(&catalog, "ALTER TABLE `centralized`.`alb` ADD IF NOT EXISTS PARTITION (`d`='1') PARTITION (`d`='2');").await;

        let outcome = run(&catalog, "ALTER TABLE `centralized`.`alb` DROP IF EXISTS PARTITION (`d`='1'), PARTITION (`d`='9');").await;
        assert!(outcome.succeeded());
        assert_eq!(catalog.partitions("centralized", "alb"), vec!["d=2"]);
    }

    #[tokio::test]
    async fn test_memory_catalog_failures() {
        let catalog = MemoryCatalog::new();
        let missing = run(&catalog, "ALTER TABLE `db`.`nope` ADD IF NOT EXISTS PARTITION (`d`='1');").await;
        assert_eq!(missing.state, QueryState::Failed);
        assert!(missing.error.unwrap().contains("Table not found"));

        let garbage = run(&catalog, "SELECT 1").await;
        assert_eq!(garbage.state, QueryState::Failed);

        catalog.create_table("db", "t");
        catalog.fail_statements_containing("'bad'");
        let rejected = run(&catalog, "ALTER TABLE `db`.`t` ADD IF NOT EXISTS PARTITION (`d`='bad');").await;
        assert_eq!(rejected.state, QueryState::Failed);
        assert_eq!(catalog.history().len(), 3);
    }

    #[tokio::test]
    async fn test_timeout() {
        struct Stuck;

        #[async_trait]
        impl QueryExecutor for Stuck {
            async fn start_query(&self, _sql: &str, _context: &QueryContext) -> Result<String> {
                Ok("stuck".to_string())
            }
            async fn get_query_state(&self, _query_id: &str) -> Result<QueryStatus> {
                Ok(QueryStatus::new(QueryState::Running))
            }
        }

        let err = execute_and_wait(&Stuck, "SELECT 1", &context(), Duration::from_millis(1), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Catalog(_)));
    }
}

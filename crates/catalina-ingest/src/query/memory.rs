//! In-process catalog
//!
//! Interprets the DDL the pipeline emits (database and table creation, drops,
//! partition listing and partition adds) against an in-memory model of
//! databases, tables and partitions. Statements take effect on submit. Their
//! reported state can lag for a configurable number of polls, hang forever,
//! or fail, so the polling and error paths can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use catalina_common::S3Location;
use regex::Regex;

use super::{QueryEngine, QueryId, QueryState, Statement};
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Default)]
struct Table {
    location: String,
    /// Partition value to location
    partitions: BTreeMap<String, String>,
}

#[derive(Debug)]
struct Execution {
    state: QueryState,
    rows: Vec<Vec<String>>,
    polls_left: usize,
    hang: bool,
}

#[derive(Debug, Default)]
struct Catalog {
    databases: BTreeMap<String, BTreeMap<String, Table>>,
    executions: HashMap<QueryId, Execution>,
    history: Vec<Statement>,
    cancelled: Vec<QueryId>,
    failures: Vec<(String, String)>,
    hangs: Vec<String>,
}

struct Patterns {
    create_database: Regex,
    drop_database: Regex,
    create_table: Regex,
    location: Regex,
    drop_table: Regex,
    show_partitions: Regex,
    alter_table: Regex,
    partition: Regex,
}

impl Patterns {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| IngestError::query_engine(format!("bad pattern: {e}")))
        };

        Ok(Self {
            create_database: compile(
                r"(?i)^\s*CREATE\s+DATABASE\s+IF\s+NOT\s+EXISTS\s+`?(\w+)`?",
            )?,
            drop_database: compile(r"(?i)^\s*DROP\s+DATABASE\s+IF\s+EXISTS\s+`?(\w+)`?")?,
            create_table: compile(
                r"(?i)^\s*CREATE\s+EXTERNAL\s+TABLE\s+IF\s+NOT\s+EXISTS\s+`?(\w+)`?",
            )?,
            location: compile(r"(?i)\bLOCATION\s+'([^']+)'")?,
            drop_table: compile(r"(?i)^\s*DROP\s+TABLE\s+IF\s+EXISTS\s+`?(\w+)`?")?,
            show_partitions: compile(r"(?i)^\s*SHOW\s+PARTITIONS\s+`?(\w+)`?")?,
            alter_table: compile(
                r"(?i)^\s*ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+IF\s+NOT\s+EXISTS",
            )?,
            partition: compile(
                r"(?i)PARTITION\s*\(\s*day\s*=\s*'([^']+)'\s*\)\s*LOCATION\s+'([^']+)'",
            )?,
        })
    }
}

pub struct MemoryCatalog {
    inner: Mutex<Catalog>,
    patterns: Option<Patterns>,
    latency: usize,
    next_id: AtomicUsize,
    status_calls: AtomicUsize,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Catalog::default()),
            patterns: Patterns::new().ok(),
            latency: 0,
            next_id: AtomicUsize::new(1),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// Report every statement as running for `polls` status calls.
    pub fn with_latency(mut self, polls: usize) -> Self {
        self.latency = polls;
        self
    }

    /// Fail statements whose SQL contains `needle` (case-insensitive).
    pub fn fail_on(&self, needle: impl Into<String>, reason: impl Into<String>) {
        self.lock().failures.push((needle.into(), reason.into()));
    }

    /// Keep statements whose SQL contains `needle` running forever.
    pub fn hang_on(&self, needle: impl Into<String>) {
        self.lock().hangs.push(needle.into());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.failures.clear();
        inner.hangs.clear();
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.lock().databases.contains_key(database)
    }

    pub fn has_table(&self, database: &str, table: &str) -> bool {
        self.lock()
            .databases
            .get(database)
            .is_some_and(|tables| tables.contains_key(table))
    }

    pub fn table_location(&self, database: &str, table: &str) -> Option<String> {
        self.lock()
            .databases
            .get(database)
            .and_then(|tables| tables.get(table))
            .map(|t| t.location.clone())
    }

    /// Registered partition values, sorted.
    pub fn partitions(&self, database: &str, table: &str) -> Vec<String> {
        self.lock()
            .databases
            .get(database)
            .and_then(|tables| tables.get(table))
            .map(|t| t.partitions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_location(&self, database: &str, table: &str, value: &str) -> Option<String> {
        self.lock()
            .databases
            .get(database)
            .and_then(|tables| tables.get(table))
            .and_then(|t| t.partitions.get(value).cloned())
    }

    /// Register a partition directly, bypassing SQL.
    pub fn register_partition(&self, database: &str, table: &str, value: &str, location: &str) {
        if let Some(t) = self
            .lock()
            .databases
            .get_mut(database)
            .and_then(|tables| tables.get_mut(table))
        {
            t.partitions.insert(value.to_string(), location.to_string());
        }
    }

    /// Every statement submitted so far, in order.
    pub fn history(&self) -> Vec<Statement> {
        self.lock().history.clone()
    }

    /// Submitted statements whose SQL contains `needle` (case-insensitive).
    pub fn statements_matching(&self, needle: &str) -> Vec<Statement> {
        let needle = needle.to_ascii_uppercase();
        self.lock()
            .history
            .iter()
            .filter(|s| s.sql.to_ascii_uppercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn cancelled(&self) -> Vec<QueryId> {
        self.lock().cancelled.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Catalog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(
        &self,
        catalog: &mut Catalog,
        statement: &Statement,
    ) -> std::result::Result<Vec<Vec<String>>, String> {
        let patterns = self
            .patterns
            .as_ref()
            .ok_or_else(|| "statement patterns unavailable".to_string())?;
        let sql = statement.sql.as_str();

        if let Some(caps) = patterns.create_database.captures(sql) {
            catalog.databases.entry(caps[1].to_string()).or_default();
            return Ok(Vec::new());
        }

        if let Some(caps) = patterns.drop_database.captures(sql) {
            let name = &caps[1];
            if catalog.databases.get(name).is_some_and(|tables| !tables.is_empty()) {
                return Err(format!("Database {name} is not empty"));
            }
            catalog.databases.remove(name);
            return Ok(Vec::new());
        }

        let database = statement.database.as_deref().unwrap_or("default");

        if let Some(caps) = patterns.create_table.captures(sql) {
            let location = patterns
                .location
                .captures(sql)
                .map(|c| c[1].to_string())
                .ok_or_else(|| "CREATE TABLE without LOCATION".to_string())?;
            let tables = catalog
                .databases
                .get_mut(database)
                .ok_or_else(|| format!("Database does not exist: {database}"))?;
            tables.entry(caps[1].to_string()).or_insert(Table {
                location,
                partitions: BTreeMap::new(),
            });
            return Ok(Vec::new());
        }

        if let Some(caps) = patterns.drop_table.captures(sql) {
            if let Some(tables) = catalog.databases.get_mut(database) {
                tables.remove(&caps[1]);
            }
            return Ok(Vec::new());
        }

        if let Some(caps) = patterns.show_partitions.captures(sql) {
            let table = table_mut(catalog, database, &caps[1])?;
            return Ok(table
                .partitions
                .keys()
                .map(|value| vec![format!("day={value}")])
                .collect());
        }

        if let Some(caps) = patterns.alter_table.captures(sql) {
            let table = table_mut(catalog, database, &caps[1])?;
            for partition in patterns.partition.captures_iter(sql) {
                table
                    .partitions
                    .entry(partition[1].to_string())
                    .or_insert_with(|| partition[2].to_string());
            }
            return Ok(Vec::new());
        }

        Err(format!("Unsupported statement: {}", first_line(sql)))
    }
}

fn table_mut<'a>(
    catalog: &'a mut Catalog,
    database: &str,
    table: &str,
) -> std::result::Result<&'a mut Table, String> {
    catalog
        .databases
        .get_mut(database)
        .and_then(|tables| tables.get_mut(table))
        .ok_or_else(|| format!("Table not found {database}.{table}"))
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_uppercase()
        .contains(&needle.to_ascii_uppercase())
}

#[async_trait]
impl QueryEngine for MemoryCatalog {
    async fn submit(&self, statement: &Statement, _output: &S3Location) -> Result<QueryId> {
        let id = QueryId(format!(
            "query-{}",
            self.next_id.fetch_add(1, Ordering::Relaxed)
        ));

        let mut catalog = self.lock();
        catalog.history.push(statement.clone());

        let failure = catalog
            .failures
            .iter()
            .find(|(needle, _)| contains_ignore_case(&statement.sql, needle))
            .map(|(_, reason)| reason.clone());
        let hang = catalog
            .hangs
            .iter()
            .any(|needle| contains_ignore_case(&statement.sql, needle));

        let (state, rows) = match failure {
            Some(reason) => (QueryState::Failed(reason), Vec::new()),
            None if hang => (QueryState::Running, Vec::new()),
            None => match self.apply(&mut catalog, statement) {
                Ok(rows) => (QueryState::Succeeded, rows),
                Err(reason) => (QueryState::Failed(reason), Vec::new()),
            },
        };

        catalog.executions.insert(
            id.clone(),
            Execution {
                state,
                rows,
                polls_left: self.latency,
                hang,
            },
        );

        Ok(id)
    }

    async fn status(&self, id: &QueryId) -> Result<QueryState> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);

        let mut catalog = self.lock();
        let execution = catalog
            .executions
            .get_mut(id)
            .ok_or_else(|| IngestError::query_engine(format!("unknown query id {id}")))?;

        if execution.hang {
            return Ok(QueryState::Running);
        }
        if execution.polls_left > 0 {
            execution.polls_left -= 1;
            return Ok(QueryState::Running);
        }
        Ok(execution.state.clone())
    }

    async fn fetch_rows(&self, id: &QueryId) -> Result<Vec<Vec<String>>> {
        let catalog = self.lock();
        let execution = catalog
            .executions
            .get(id)
            .ok_or_else(|| IngestError::query_engine(format!("unknown query id {id}")))?;

        if execution.state != QueryState::Succeeded {
            return Err(IngestError::query_engine(format!(
                "query {id} has no results in state {:?}",
                execution.state
            )));
        }
        Ok(execution.rows.clone())
    }

    async fn cancel(&self, id: &QueryId) -> Result<()> {
        let mut catalog = self.lock();
        if let Some(execution) = catalog.executions.get_mut(id) {
            execution.hang = false;
            execution.polls_left = 0;
            if !execution.state.is_terminal() {
                execution.state = QueryState::Cancelled;
            }
        }
        catalog.cancelled.push(id.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn run(
        catalog: &MemoryCatalog,
        statement: Statement,
    ) -> (QueryState, Vec<Vec<String>>) {
        let output = S3Location::parse("s3://temp-output-query/temp").unwrap();
        let id = catalog.submit(&statement, &output).await.unwrap();
        let state = catalog.status(&id).await.unwrap();
        let rows = if state == QueryState::Succeeded {
            catalog.fetch_rows(&id).await.unwrap()
        } else {
            Vec::new()
        };
        (state, rows)
    }

    async fn setup(catalog: &MemoryCatalog) {
        run(catalog, Statement::new("db", "CREATE DATABASE IF NOT EXISTS ingest")).await;
        let (state, _) = run(
            catalog,
            Statement::new(
                "table",
                "CREATE EXTERNAL TABLE IF NOT EXISTS tcl_data (`Brand` string)\n\
                 PARTITIONED BY (day string)\n\
                 LOCATION 's3://out/TCL-data/'",
            )
            .in_database("ingest"),
        )
        .await;
        assert_eq!(state, QueryState::Succeeded);
    }

    #[tokio::test]
    async fn test_create_and_drop() {
        let catalog = MemoryCatalog::new();
        setup(&catalog).await;
        assert!(catalog.has_table("ingest", "tcl_data"));
        assert_eq!(
            catalog.table_location("ingest", "tcl_data").as_deref(),
            Some("s3://out/TCL-data/")
        );

        // Non-empty database cannot be dropped
        let drop_database = Statement::new("drop db", "DROP DATABASE IF EXISTS ingest");
        let (state, _) = run(&catalog, drop_database.clone()).await;
        assert!(matches!(state, QueryState::Failed(_)));

        let drop_table =
            Statement::new("drop", "DROP TABLE IF EXISTS tcl_data").in_database("ingest");
        run(&catalog, drop_table).await;
        assert!(!catalog.has_table("ingest", "tcl_data"));

        let (state, _) = run(&catalog, drop_database).await;
        assert_eq!(state, QueryState::Succeeded);
        assert!(!catalog.has_database("ingest"));
    }

    #[tokio::test]
    async fn test_partitions() {
        let catalog = MemoryCatalog::new();
        setup(&catalog).await;

        let (state, _) = run(
            &catalog,
            Statement::new(
                "add",
                "ALTER TABLE tcl_data ADD IF NOT EXISTS\n\
                 PARTITION (day='20220512') LOCATION 's3://out/TCL-data/day=20220512/'\n\
                 PARTITION (day='20220513') LOCATION 's3://out/TCL-data/day=20220513/'",
            )
            .in_database("ingest"),
        )
        .await;
        assert_eq!(state, QueryState::Succeeded);
        assert_eq!(catalog.partitions("ingest", "tcl_data"), vec!["20220512", "20220513"]);

        let (_, rows) = run(
            &catalog,
            Statement::new("show", "SHOW PARTITIONS tcl_data").in_database("ingest"),
        )
        .await;
        assert_eq!(rows, vec![vec!["day=20220512"], vec!["day=20220513"]]);
    }

    #[tokio::test]
    async fn test_table_requires_database() {
        let catalog = MemoryCatalog::new();
        let (state, _) = run(
            &catalog,
            Statement::new(
                "table",
                "CREATE EXTERNAL TABLE IF NOT EXISTS t (a string) LOCATION 's3://out/'",
            )
            .in_database("missing"),
        )
        .await;
        assert!(matches!(state, QueryState::Failed(ref r) if r.contains("missing")));
    }

    #[tokio::test]
    async fn test_unsupported_statement_fails() {
        let catalog = MemoryCatalog::new();
        let (state, _) = run(&catalog, Statement::new("select", "SELECT 1")).await;
        assert!(matches!(state, QueryState::Failed(_)));
        assert_eq!(catalog.history().len(), 1);
    }
}

//! SQL query engine access
//!
//! Statements go through the [`QueryEngine`] trait: submit, poll the state,
//! fetch rows. [`QueryRunner`] layers the submit-then-wait discipline on top,
//! with a poll interval and an overall timeout per statement.
//!
//! [`AthenaEngine`] is the production engine. [`memory::MemoryCatalog`]
//! understands the handful of DDL statements the pipeline issues and backs
//! tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use catalina_common::S3Location;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

pub mod athena;
pub mod memory;

pub use athena::AthenaEngine;
pub use memory::MemoryCatalog;

/// A SQL statement with a human readable name for logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub name: String,
    pub sql: String,
    /// Database the statement runs in, `None` for database-level DDL
    pub database: Option<String>,
}

impl Statement {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            database: None,
        }
    }

    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }
}

/// Engine-assigned identifier of a submitted statement
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryId(pub String);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Queued | QueryState::Running)
    }
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Submit a statement, writing results under `output`.
    async fn submit(&self, statement: &Statement, output: &S3Location) -> Result<QueryId>;

    async fn status(&self, id: &QueryId) -> Result<QueryState>;

    /// Result rows of a finished statement, one `Vec` of cells per row.
    async fn fetch_rows(&self, id: &QueryId) -> Result<Vec<Vec<String>>>;

    /// Ask the engine to stop a statement.
    async fn cancel(&self, id: &QueryId) -> Result<()>;
}

/// Submit-then-wait execution of statements
#[derive(Clone)]
pub struct QueryRunner {
    engine: Arc<dyn QueryEngine>,
    output: S3Location,
    timeout: Duration,
    poll_interval: Duration,
}

impl QueryRunner {
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        output: S3Location,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine,
            output,
            timeout,
            poll_interval,
        }
    }

    /// Run a statement to completion.
    pub async fn execute(&self, statement: &Statement) -> Result<QueryId> {
        let id = self.engine.submit(statement, &self.output).await?;
        info!(query = %statement.name, query_id = %id, "Submitted query");

        self.wait(statement, &id).await?;

        info!(query = %statement.name, query_id = %id, "Query succeeded");
        Ok(id)
    }

    /// Run statements one after the other, stopping at the first failure.
    pub async fn execute_all(&self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            self.execute(statement).await?;
        }
        Ok(())
    }

    /// Run a statement and return its result rows.
    pub async fn query_rows(&self, statement: &Statement) -> Result<Vec<Vec<String>>> {
        let id = self.execute(statement).await?;
        self.engine.fetch_rows(&id).await
    }

    async fn wait(&self, statement: &Statement, id: &QueryId) -> Result<()> {
        let poll = async {
            loop {
                match self.engine.status(id).await? {
                    QueryState::Succeeded => return Ok(()),
                    QueryState::Failed(reason) => {
                        return Err(IngestError::QueryFailed {
                            name: statement.name.clone(),
                            reason,
                        })
                    }
                    QueryState::Cancelled => {
                        return Err(IngestError::QueryCancelled {
                            name: statement.name.clone(),
                        })
                    }
                    state @ (QueryState::Queued | QueryState::Running) => {
                        debug!(
                            query = %statement.name,
                            query_id = %id,
                            ?state,
                            "Waiting for query"
                        );
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        };

        match tokio::time::timeout(self.timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = self.engine.cancel(id).await {
                    warn!(
                        query = %statement.name,
                        query_id = %id,
                        error = %e,
                        "Failed to cancel timed out query"
                    );
                }
                Err(IngestError::QueryTimeout {
                    name: statement.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

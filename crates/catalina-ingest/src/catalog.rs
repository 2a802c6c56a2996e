//! Catalog setup and partition reconciliation
//!
//! The table is an external, `day`-partitioned table over the table root.
//! After every run the partitions present in the object store are compared
//! with the ones the catalog knows, and the missing ones are registered.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use catalina_common::S3Location;
use futures::TryStreamExt;
use tracing::{info, warn};

use crate::error::{IngestError, Result};
use crate::publisher::{parse_partition_segment, partition_segment, PARTITION_KEY};
use crate::query::{QueryRunner, Statement};
use crate::storage::{list_prefixes, ObjectStore};

/// Upper bound on partitions added by a single statement
pub const MAX_PARTITIONS_PER_STATEMENT: usize = 100;

const BUILTIN_TABLE_TEMPLATE: &str = include_str!("../sql/create_table.sql");
const TABLE_PLACEHOLDER: &str = "{table}";
const LOCATION_PLACEHOLDER: &str = "{location}";

/// `CREATE EXTERNAL TABLE` statement with `{table}` and `{location}`
/// placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTemplate {
    sql: String,
}

impl TableTemplate {
    pub fn builtin() -> Self {
        Self {
            sql: BUILTIN_TABLE_TEMPLATE.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let sql = std::fs::read_to_string(path)?;
        Self::from_sql(sql).map_err(|e| match e {
            IngestError::Template(msg) => {
                IngestError::Template(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_sql(sql: impl Into<String>) -> Result<Self> {
        let sql = sql.into();
        for placeholder in [TABLE_PLACEHOLDER, LOCATION_PLACEHOLDER] {
            if !sql.contains(placeholder) {
                return Err(IngestError::Template(format!(
                    "missing {placeholder} placeholder"
                )));
            }
        }
        Ok(Self { sql })
    }

    pub fn render(&self, table: &str, location: &S3Location) -> String {
        self.sql
            .replace(TABLE_PLACEHOLDER, table)
            .replace(LOCATION_PLACEHOLDER, &location.dir_url())
    }
}

impl Default for TableTemplate {
    fn default() -> Self {
        Self::builtin()
    }
}

pub struct CatalogReconciler {
    runner: QueryRunner,
    store: Arc<dyn ObjectStore>,
    database: String,
    table: String,
    table_root: S3Location,
    template: TableTemplate,
}

impl CatalogReconciler {
    pub fn new(
        runner: QueryRunner,
        store: Arc<dyn ObjectStore>,
        database: impl Into<String>,
        table: impl Into<String>,
        table_root: S3Location,
        template: TableTemplate,
    ) -> Self {
        Self {
            runner,
            store,
            database: database.into(),
            table: table.into(),
            table_root,
            template,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn table_root(&self) -> &S3Location {
        &self.table_root
    }

    pub async fn ensure_database(&self) -> Result<()> {
        let statement = Statement::new(
            "create_database",
            format!("CREATE DATABASE IF NOT EXISTS {}", self.database),
        );
        self.runner.execute(&statement).await?;
        Ok(())
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let statement = Statement::new(
            "create_table",
            self.template.render(&self.table, &self.table_root),
        )
        .in_database(&self.database);
        self.runner.execute(&statement).await?;
        Ok(())
    }

    /// Create database and table if missing.
    pub async fn setup(&self) -> Result<()> {
        self.ensure_database().await?;
        self.ensure_table().await?;
        info!(
            database = %self.database,
            table = %self.table,
            location = %self.table_root,
            "Catalog ready"
        );
        Ok(())
    }

    pub async fn drop_table(&self) -> Result<()> {
        let statement =
            Statement::new("drop_table", format!("DROP TABLE IF EXISTS {}", self.table))
                .in_database(&self.database);
        self.runner.execute(&statement).await?;
        info!(database = %self.database, table = %self.table, "Dropped table");
        Ok(())
    }

    pub async fn drop_database(&self) -> Result<()> {
        let statement = Statement::new(
            "drop_database",
            format!("DROP DATABASE IF EXISTS {}", self.database),
        );
        self.runner.execute(&statement).await?;
        info!(database = %self.database, "Dropped database");
        Ok(())
    }

    /// Drop the table and database, then recreate both.
    pub async fn teardown(&self) -> Result<()> {
        self.drop_table().await?;
        self.drop_database().await?;
        self.setup().await
    }

    /// Partition values with a directory under the table root
    pub async fn physical_partitions(&self) -> Result<BTreeSet<String>> {
        let prefixes: Vec<String> = list_prefixes(self.store.as_ref(), &self.table_root)
            .try_collect()
            .await?;
        let mut values = BTreeSet::new();
        for prefix in prefixes {
            let segment = self.table_root.relative_key(&prefix).unwrap_or(&prefix);
            match parse_partition_segment(segment) {
                Some(value) if !value.contains('\'') => {
                    values.insert(value.to_string());
                }
                _ => warn!(prefix = %prefix, "Ignoring directory that is not a partition"),
            }
        }
        Ok(values)
    }

    /// Partition values the catalog has registered
    pub async fn registered_partitions(&self) -> Result<BTreeSet<String>> {
        let statement =
            Statement::new("show_partitions", format!("SHOW PARTITIONS {}", self.table))
                .in_database(&self.database);
        let rows = self.runner.query_rows(&statement).await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.first())
            .filter_map(|cell| parse_partition_segment(cell.trim()))
            .map(str::to_string)
            .collect())
    }

    /// `ALTER TABLE .. ADD` statements registering `values`, at most
    /// [`MAX_PARTITIONS_PER_STATEMENT`] per statement.
    pub fn partition_statements(&self, values: &[String]) -> Result<Vec<Statement>> {
        values
            .chunks(MAX_PARTITIONS_PER_STATEMENT)
            .enumerate()
            .map(|(index, chunk)| -> Result<Statement> {
                let mut sql = format!("ALTER TABLE {} ADD IF NOT EXISTS", self.table);
                for value in chunk {
                    let location = self.table_root.join([partition_segment(value)])?;
                    sql.push_str(&format!(
                        "\n  PARTITION ({PARTITION_KEY}='{value}') LOCATION '{}'",
                        location.dir_url()
                    ));
                }
                Ok(Statement::new(format!("add_partitions_{index}"), sql)
                    .in_database(&self.database))
            })
            .collect()
    }

    /// Register every physical partition the catalog is missing and return
    /// the values added.
    pub async fn sync_partitions(&self) -> Result<Vec<String>> {
        let physical = self.physical_partitions().await?;
        let registered = self.registered_partitions().await?;
        let missing: Vec<String> = physical.difference(&registered).cloned().collect();

        if missing.is_empty() {
            info!(
                physical = physical.len(),
                registered = registered.len(),
                "Partitions up to date"
            );
            return Ok(missing);
        }

        let statements = self.partition_statements(&missing)?;
        self.runner.execute_all(&statements).await?;

        info!(
            added = missing.len(),
            statements = statements.len(),
            "Registered missing partitions"
        );
        Ok(missing)
    }
}

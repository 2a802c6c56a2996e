use async_trait::async_trait;
use aws_sdk_athena::{
    error::DisplayErrorContext,
    types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration},
    Client,
};
use catalina_common::S3Location;
use tracing::{debug, instrument};

use super::{QueryEngine, QueryId, QueryState, Statement};
use crate::error::{IngestError, Result};

/// [`QueryEngine`] backed by Amazon Athena
#[derive(Clone)]
pub struct AthenaEngine {
    client: Client,
}

impl AthenaEngine {
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(sdk_config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn map_state(state: Option<&QueryExecutionState>, reason: Option<&str>) -> QueryState {
    match state {
        Some(QueryExecutionState::Queued) => QueryState::Queued,
        Some(QueryExecutionState::Running) => QueryState::Running,
        Some(QueryExecutionState::Succeeded) => QueryState::Succeeded,
        Some(QueryExecutionState::Cancelled) => QueryState::Cancelled,
        Some(QueryExecutionState::Failed) => {
            QueryState::Failed(reason.unwrap_or("no reason given").to_string())
        }
        // Unknown or missing states are reported as still running; the
        // runner's timeout bounds how long that can last.
        _ => QueryState::Running,
    }
}

#[async_trait]
impl QueryEngine for AthenaEngine {
    #[instrument(skip_all, fields(query = %statement.name))]
    async fn submit(&self, statement: &Statement, output: &S3Location) -> Result<QueryId> {
        let context = statement
            .database
            .as_ref()
            .map(|db| QueryExecutionContext::builder().database(db).build());

        let response = self
            .client
            .start_query_execution()
            .query_string(&statement.sql)
            .set_query_execution_context(context)
            .result_configuration(
                ResultConfiguration::builder()
                    .output_location(output.dir_url())
                    .build(),
            )
            .send()
            .await
            .map_err(|e| IngestError::QueryFailed {
                name: statement.name.clone(),
                reason: DisplayErrorContext(e).to_string(),
            })?;

        let id = response
            .query_execution_id()
            .ok_or_else(|| IngestError::query_engine("Athena returned no query execution id"))?;

        debug!(query_id = id, "Started query execution");

        Ok(QueryId(id.to_string()))
    }

    async fn status(&self, id: &QueryId) -> Result<QueryState> {
        let response = self
            .client
            .get_query_execution()
            .query_execution_id(&id.0)
            .send()
            .await
            .map_err(|e| IngestError::query_engine(DisplayErrorContext(e)))?;

        let status = response.query_execution().and_then(|q| q.status());
        Ok(map_state(
            status.and_then(|s| s.state()),
            status.and_then(|s| s.state_change_reason()),
        ))
    }

    #[instrument(skip_all, fields(query_id = %id))]
    async fn fetch_rows(&self, id: &QueryId) -> Result<Vec<Vec<String>>> {
        let mut rows = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .get_query_results()
                .query_execution_id(&id.0)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| IngestError::query_engine(DisplayErrorContext(e)))?;

            if let Some(result_set) = response.result_set() {
                rows.extend(result_set.rows().iter().map(|row| {
                    row.data()
                        .iter()
                        .map(|datum| datum.var_char_value().unwrap_or_default().to_string())
                        .collect::<Vec<_>>()
                }));
            }

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(rows = rows.len(), "Fetched query results");

        Ok(rows)
    }

    async fn cancel(&self, id: &QueryId) -> Result<()> {
        self.client
            .stop_query_execution()
            .query_execution_id(&id.0)
            .send()
            .await
            .map_err(|e| IngestError::query_engine(DisplayErrorContext(e)))?;
        Ok(())
    }
}

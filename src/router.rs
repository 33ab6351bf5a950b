//! Execution router: inline for small views, queued for async ones

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::ResultSet;
use crate::query::{AssembledQuery, QueryRequest};
use crate::queue::JobProducer;
use crate::reader::RowSource;
use crate::registry::{Registry, ViewDescriptor};

#[derive(Debug)]
pub enum Routed {
    /// Rows from an inline query, ready for formatting
    Rows(ResultSet),
    /// The query was queued; poll the job status store
    Job { job_id: String },
}

#[derive(Clone)]
pub struct QueryRouter {
    registry: Arc<Registry>,
    source: Arc<dyn RowSource>,
    producer: JobProducer,
}

impl QueryRouter {
    pub fn new(registry: Arc<Registry>, source: Arc<dyn RowSource>, producer: JobProducer) -> Self {
        Self {
            registry,
            source,
            producer,
        }
    }

    /// Validate, assemble and dispatch a request
    pub async fn handle(&self, request: &QueryRequest) -> Result<Routed> {
        let view = self.registry.view(&request.view)?;
        let query = request.assemble(&self.registry)?;
        if request.debug {
            info!(view = view.name, sql = %query.sql, params = ?query.params, "assembled query");
        } else {
            debug!(view = view.name, sql = %query.sql, "assembled query");
        }
        self.route(view, &query, request.debug).await
    }

    pub async fn route(
        &self,
        view: &ViewDescriptor,
        query: &AssembledQuery,
        debug: bool,
    ) -> Result<Routed> {
        if view.is_async {
            let job_id = self
                .producer
                .enqueue(&query.sql, &query.params, debug)
                .await?;
            return Ok(Routed::Job { job_id });
        }

        let rows = self.source.fetch_all(query).await?;
        if rows.is_empty() {
            return Err(Error::EmptyResult);
        }
        debug!(view = view.name, rows = rows.len(), "query returned rows");
        Ok(Routed::Rows(ResultSet::from_rows(rows, view.geometry_column)))
    }
}

//! Postgres row reader: inline fetch and bounded-batch streaming
//!
//! Every statement is wrapped so rows come back as ordered JSON objects.
//! That lets one decoder handle any column type the views expose, PostGIS
//! geometry included (cast to GeoJSON by the server).

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::query::{AssembledQuery, SqlParam};

/// One result row, columns in projection order
pub type JsonRow = Map<String, Value>;

/// Where query results come from
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Run `query` and collect every row
    async fn fetch_all(&self, query: &AssembledQuery) -> Result<Vec<JsonRow>>;

    /// Run `query`, yielding rows in batches of at most `batch_rows`
    ///
    /// At most one batch is buffered ahead of the consumer.
    fn stream_batches(
        &self,
        query: &AssembledQuery,
        batch_rows: usize,
    ) -> BoxStream<'static, Result<Vec<JsonRow>>>;
}

pub struct PgReader {
    pool: PgPool,
}

impl PgReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Open the connection pool shared by queries, exports and the job table
pub async fn connect(url: &str, max_connections: u32, timeout: Duration) -> Result<PgPool> {
    info!(max_connections, "connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeout)
        .connect(url)
        .await?;
    debug!("connection pool ready");
    Ok(pool)
}

#[async_trait]
impl RowSource for PgReader {
    async fn fetch_all(&self, query: &AssembledQuery) -> Result<Vec<JsonRow>> {
        let sql = as_json_rows(&query.sql);
        let rows = bind_params(sqlx::query(&sql), &query.params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    fn stream_batches(
        &self,
        query: &AssembledQuery,
        batch_rows: usize,
    ) -> BoxStream<'static, Result<Vec<JsonRow>>> {
        let pool = self.pool.clone();
        let sql = as_json_rows(&query.sql);
        let params = query.params.clone();
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut batches = bind_params(sqlx::query(&sql), &params)
                .fetch(&pool)
                .map(|row| row.map_err(Error::from).and_then(|row| decode_row(&row)))
                .try_chunks(batch_rows.max(1));

            while let Some(batch) = batches.next().await {
                let batch = batch.map_err(|e| e.1);
                let failed = batch.is_err();
                // a dropped receiver means the consumer gave up
                if tx.send(batch).await.is_err() || failed {
                    break;
                }
            }
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

/// Wrap a statement so each row arrives as one JSON object
pub fn as_json_rows(sql: &str) -> String {
    format!("SELECT row_to_json(q)::text FROM ({sql}) AS q")
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Bool(b) => query.bind(*b),
            SqlParam::Int(i) => query.bind(*i),
            SqlParam::Float(f) => query.bind(*f),
            SqlParam::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<JsonRow> {
    let text: String = row.try_get(0)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_statement() {
        assert_eq!(
            as_json_rows(r#"SELECT * FROM "plot_pixels_mv" LIMIT $1"#),
            r#"SELECT row_to_json(q)::text FROM (SELECT * FROM "plot_pixels_mv" LIMIT $1) AS q"#
        );
    }

    #[test]
    fn test_decoded_rows_keep_column_order() {
        let row: JsonRow =
            serde_json::from_str(r#"{"z": 1, "a": "x", "geom": {"type": "Point"}}"#).unwrap();
        let columns: Vec<_> = row.keys().cloned().collect();
        assert_eq!(columns, vec!["z", "a", "geom"]);
    }
}

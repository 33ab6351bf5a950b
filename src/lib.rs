//! viewgate: filtered, parameterized access to whitelisted PostGIS views
//!
//! Small views are queried inline and returned as JSON, GeoJSON or
//! (Geo)Parquet. Large views are exported asynchronously: the assembled
//! statement is queued, streamed to object storage as CSV by a worker pool,
//! and polled through the job status store.

pub mod api;
pub mod config;
pub mod error;
pub mod filter;
pub mod format;
pub mod geometry;
pub mod jobs;
pub mod query;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod router;
pub mod storage;
pub mod worker;

pub use error::{Error, Result};
pub use query::{assemble, AssembledQuery, QueryRequest, SqlParam};
pub use registry::{FieldKind, Registry, ViewDescriptor};

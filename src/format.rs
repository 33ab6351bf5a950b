//! Output serialization: JSON, GeoJSON, (Geo)Parquet and CSV export chunks
//!
//! The geometry column, when present, is never treated as a plain scalar:
//! it becomes the feature geometry in GeoJSON and a WKB column in GeoParquet.

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow_array::builder::{
    BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::geometry;
use crate::reader::JsonRow;

/// Rows returned by a synchronous query
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<JsonRow>,
    /// Set when the view's geometry column is part of the result
    pub geometry_column: Option<String>,
}

impl ResultSet {
    pub fn from_rows(rows: Vec<JsonRow>, geometry_column: Option<&str>) -> Self {
        let columns: Vec<String> = rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        let geometry_column = geometry_column
            .filter(|g| columns.iter().any(|c| c == g))
            .map(str::to_string);
        Self {
            columns,
            rows,
            geometry_column,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_geometry(&self) -> bool {
        self.geometry_column.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    GeoJson,
    Parquet,
    GeoParquet,
}

impl OutputFormat {
    /// Unknown names fall back to JSON
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "geojson" => OutputFormat::GeoJson,
            "parquet" => OutputFormat::Parquet,
            "geoparquet" => OutputFormat::GeoParquet,
            _ => OutputFormat::Json,
        }
    }
}

/// A serialized response body
#[derive(Debug, Clone)]
pub struct Rendered {
    pub content_type: &'static str,
    /// Attachment filename, for file-like formats
    pub filename: Option<String>,
    pub body: Vec<u8>,
}

pub fn render(result: &ResultSet, format: OutputFormat, view_name: &str) -> Result<Rendered> {
    let parquet = matches!(format, OutputFormat::Parquet | OutputFormat::GeoParquet);
    match (parquet, result.geometry_column.as_deref()) {
        (true, geom) => Ok(Rendered {
            content_type: "application/octet-stream",
            filename: Some(format!("{view_name}.parquet")),
            body: to_parquet(result, geom)?,
        }),
        (false, Some(geom)) => Ok(Rendered {
            content_type: "application/geo+json",
            filename: Some(format!("{view_name}.geojson")),
            body: to_geojson(result, geom)?,
        }),
        (false, None) => Ok(Rendered {
            content_type: "application/json",
            filename: None,
            body: serde_json::to_vec(&result.rows)?,
        }),
    }
}

/// Geometry as returned by the database: a GeoJSON object, or GeoJSON text
fn geometry_value(value: Option<&Value>) -> Option<Value> {
    match value? {
        Value::Object(_) => value.cloned(),
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .filter(Value::is_object),
        _ => None,
    }
}

pub fn to_geojson(result: &ResultSet, geometry_column: &str) -> Result<Vec<u8>> {
    let features: Vec<Value> = result
        .rows
        .iter()
        .map(|row| {
            let mut properties = row.clone();
            let geometry = geometry_value(properties.remove(geometry_column).as_ref());
            json!({
                "type": "Feature",
                "geometry": geometry,
                "properties": properties,
            })
        })
        .collect();

    Ok(serde_json::to_vec(&json!({
        "type": "FeatureCollection",
        "features": features,
    }))?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Wkb,
}

fn infer_type<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnType {
    let mut inferred: Option<ColumnType> = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) if n.is_i64() => ColumnType::Int64,
            Value::Number(_) => ColumnType::Float64,
            _ => ColumnType::Utf8,
        };
        inferred = Some(match (inferred, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(ColumnType::Int64), ColumnType::Float64)
            | (Some(ColumnType::Float64), ColumnType::Int64) => ColumnType::Float64,
            _ => return ColumnType::Utf8,
        });
    }
    inferred.unwrap_or(ColumnType::Utf8)
}

fn build_column(rows: &[JsonRow], column: &str, kind: ColumnType) -> Result<ArrayRef> {
    let values = rows.iter().map(|row| row.get(column).unwrap_or(&Value::Null));
    let array: ArrayRef = match kind {
        ColumnType::Boolean => {
            let mut b = BooleanBuilder::with_capacity(rows.len());
            values.for_each(|v| b.append_option(v.as_bool()));
            Arc::new(b.finish())
        }
        ColumnType::Int64 => {
            let mut b = Int64Builder::with_capacity(rows.len());
            values.for_each(|v| b.append_option(v.as_i64()));
            Arc::new(b.finish())
        }
        ColumnType::Float64 => {
            let mut b = Float64Builder::with_capacity(rows.len());
            values.for_each(|v| b.append_option(v.as_f64()));
            Arc::new(b.finish())
        }
        ColumnType::Utf8 => {
            let mut b = StringBuilder::new();
            for v in values {
                match v {
                    Value::Null => b.append_null(),
                    Value::String(s) => b.append_value(s),
                    other => b.append_value(other.to_string()),
                }
            }
            Arc::new(b.finish())
        }
        ColumnType::Wkb => {
            let mut b = BinaryBuilder::new();
            for v in values {
                match geometry_value(Some(v)) {
                    Some(g) => b.append_value(geometry::to_wkb(&g)?),
                    None => b.append_null(),
                }
            }
            Arc::new(b.finish())
        }
    };
    Ok(array)
}

fn arrow_type(kind: ColumnType) -> DataType {
    match kind {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Utf8 => DataType::Utf8,
        ColumnType::Wkb => DataType::Binary,
    }
}

/// GeoParquet 1.0 file metadata for a single WKB column (CRS defaults to OGC:CRS84)
fn geo_metadata(result: &ResultSet, geometry_column: &str) -> String {
    let types: BTreeSet<String> = result
        .rows
        .iter()
        .filter_map(|row| geometry_value(row.get(geometry_column)))
        .filter_map(|g| geometry::type_name(&g).map(str::to_string))
        .collect();
    json!({
        "version": "1.0.0",
        "primary_column": geometry_column,
        "columns": {
            geometry_column: {
                "encoding": "WKB",
                "geometry_types": types,
            }
        }
    })
    .to_string()
}

/// Snappy-compressed Parquet; GeoParquet when `geometry_column` is set
pub fn to_parquet(result: &ResultSet, geometry_column: Option<&str>) -> Result<Vec<u8>> {
    let kinds: Vec<ColumnType> = result
        .columns
        .iter()
        .map(|c| {
            if Some(c.as_str()) == geometry_column {
                ColumnType::Wkb
            } else {
                infer_type(result.rows.iter().filter_map(|row| row.get(c)))
            }
        })
        .collect();

    let schema = Arc::new(Schema::new(
        result
            .columns
            .iter()
            .zip(&kinds)
            .map(|(c, k)| Field::new(c, arrow_type(*k), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = result
        .columns
        .iter()
        .zip(&kinds)
        .map(|(c, k)| build_column(&result.rows, c, *k))
        .collect::<Result<Vec<_>>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;

    let mut props = WriterProperties::builder().set_compression(Compression::SNAPPY);
    if let Some(geom) = geometry_column {
        props = props.set_key_value_metadata(Some(vec![KeyValue::new(
            "geo".to_string(),
            geo_metadata(result, geom),
        )]));
    }

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props.build()))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Encodes streamed rows as CSV, header on the first non-empty chunk only
#[derive(Debug, Default)]
pub struct CsvChunkEncoder {
    columns: Option<Vec<String>>,
}

impl CsvChunkEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(&mut self, rows: &[JsonRow]) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        if self.columns.is_none() {
            if let Some(first) = rows.first() {
                let columns: Vec<String> = first.keys().cloned().collect();
                writer.write_record(&columns)?;
                self.columns = Some(columns);
            }
        }
        if let Some(columns) = &self.columns {
            for row in rows {
                writer.write_record(columns.iter().map(|c| csv_cell(row.get(c))))?;
            }
        }
        writer
            .into_inner()
            .map_err(|e| Error::Format(e.to_string()))
    }
}

fn csv_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

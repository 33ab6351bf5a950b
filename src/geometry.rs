//! GeoJSON geometry handling
//!
//! Validation of polygon filters and WKB encoding for GeoParquet output.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::query::{quote_ident, Fragment, SqlParam};

/// SRID every stored geometry uses
pub const SRID: u32 = 4326;

/// Check that `value` is a GeoJSON Polygon or MultiPolygon with well-formed coordinates
pub fn validate_polygon(value: &Value) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidGeometry("expected a GeoJSON object".into()))?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidGeometry("missing 'type'".into()))?;
    let coordinates = object
        .get("coordinates")
        .ok_or_else(|| Error::InvalidGeometry("missing 'coordinates'".into()))?;

    match kind {
        "Polygon" => check_polygon(coordinates),
        "MultiPolygon" => {
            let polygons = as_array(coordinates, "MultiPolygon coordinates")?;
            if polygons.is_empty() {
                return Err(Error::InvalidGeometry("empty MultiPolygon".into()));
            }
            polygons.iter().try_for_each(check_polygon)
        }
        other => Err(Error::InvalidGeometry(format!(
            "expected Polygon or MultiPolygon, got {other}"
        ))),
    }
}

fn check_polygon(value: &Value) -> Result<()> {
    let rings = as_array(value, "polygon")?;
    if rings.is_empty() {
        return Err(Error::InvalidGeometry("polygon has no rings".into()));
    }
    for ring in rings {
        let positions = as_array(ring, "ring")?;
        if positions.len() < 4 {
            return Err(Error::InvalidGeometry(
                "a linear ring needs at least 4 positions".into(),
            ));
        }
        positions.iter().try_for_each(|p| position(p).map(|_| ()))?;
    }
    Ok(())
}

fn as_array<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::InvalidGeometry(format!("{what} must be an array")))
}

fn position(value: &Value) -> Result<Vec<f64>> {
    let coords = as_array(value, "position")?;
    if coords.len() < 2 {
        return Err(Error::InvalidGeometry("position needs x and y".into()));
    }
    coords
        .iter()
        .map(|c| {
            c.as_f64()
                .ok_or_else(|| Error::InvalidGeometry("coordinate is not a number".into()))
        })
        .collect()
}

/// Bounding-box pre-filter (index assisted) conjoined with the exact intersection test
pub fn intersects_clause(column: &str, geometry: &Value) -> Fragment {
    let column = quote_ident(column);
    let text = geometry.to_string();
    Fragment::new()
        .sql(format!("{column} && ST_SetSRID(ST_GeomFromGeoJSON("))
        .param(SqlParam::Text(text.clone()), None)
        .sql(format!("), {SRID}) AND ST_Intersects({column}, ST_SetSRID(ST_GeomFromGeoJSON("))
        .param(SqlParam::Text(text), None)
        .sql(format!("), {SRID}))"))
}

/// Encode a GeoJSON geometry as little-endian ISO WKB
pub fn to_wkb(geometry: &Value) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    write_geometry(&mut out, geometry)?;
    Ok(out)
}

/// The GeoJSON `type` of a geometry value, if any
pub fn type_name(geometry: &Value) -> Option<&str> {
    geometry.get("type").and_then(Value::as_str)
}

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;
const WKB_COLLECTION: u32 = 7;
const WKB_Z_OFFSET: u32 = 1000;

fn write_geometry(out: &mut Vec<u8>, geometry: &Value) -> Result<()> {
    let kind = type_name(geometry)
        .ok_or_else(|| Error::Format("geometry without 'type'".into()))?;

    if kind == "GeometryCollection" {
        let members = geometry
            .get("geometries")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Format("GeometryCollection without 'geometries'".into()))?;
        header(out, WKB_COLLECTION, false);
        count(out, members.len())?;
        return members.iter().try_for_each(|g| write_geometry(out, g));
    }

    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| Error::Format(format!("{kind} without 'coordinates'")))?;
    let dims = first_position_dims(coords);
    if !(2..=3).contains(&dims) {
        return Err(Error::Format(format!("unsupported {dims}-dimensional positions")));
    }
    let has_z = dims == 3;

    match kind {
        "Point" => {
            header(out, WKB_POINT, has_z);
            write_position(out, coords, dims)
        }
        "LineString" => {
            header(out, WKB_LINESTRING, has_z);
            write_positions(out, coords, dims)
        }
        "Polygon" => {
            header(out, WKB_POLYGON, has_z);
            write_rings(out, coords, dims)
        }
        "MultiPoint" => {
            let points = coord_array(coords)?;
            header(out, WKB_MULTIPOINT, has_z);
            count(out, points.len())?;
            points.iter().try_for_each(|p| {
                header(out, WKB_POINT, has_z);
                write_position(out, p, dims)
            })
        }
        "MultiLineString" => {
            let lines = coord_array(coords)?;
            header(out, WKB_MULTILINESTRING, has_z);
            count(out, lines.len())?;
            lines.iter().try_for_each(|l| {
                header(out, WKB_LINESTRING, has_z);
                write_positions(out, l, dims)
            })
        }
        "MultiPolygon" => {
            let polygons = coord_array(coords)?;
            header(out, WKB_MULTIPOLYGON, has_z);
            count(out, polygons.len())?;
            polygons.iter().try_for_each(|p| {
                header(out, WKB_POLYGON, has_z);
                write_rings(out, p, dims)
            })
        }
        other => Err(Error::Format(format!("unsupported geometry type {other}"))),
    }
}

fn header(out: &mut Vec<u8>, code: u32, has_z: bool) {
    out.push(1);
    let code = if has_z { code + WKB_Z_OFFSET } else { code };
    out.extend_from_slice(&code.to_le_bytes());
}

fn count(out: &mut Vec<u8>, n: usize) -> Result<()> {
    let n = u32::try_from(n).map_err(|_| Error::Format(format!("{n} elements overflow WKB")))?;
    out.extend_from_slice(&n.to_le_bytes());
    Ok(())
}

fn coord_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::Format("coordinates must be arrays".into()))
}

fn first_position_dims(coords: &Value) -> usize {
    let mut current = coords;
    while let Some(first) = current.as_array().and_then(|a| a.first()) {
        if first.is_number() {
            return current.as_array().map_or(2, Vec::len);
        }
        current = first;
    }
    2
}

fn write_position(out: &mut Vec<u8>, value: &Value, dims: usize) -> Result<()> {
    let coords = coord_array(value)?;
    if coords.len() != dims {
        return Err(Error::Format(format!(
            "mixed dimensions: expected {dims} ordinates, got {}",
            coords.len()
        )));
    }
    for c in coords {
        let c = c
            .as_f64()
            .ok_or_else(|| Error::Format(format!("non-numeric ordinate {c}")))?;
        out.extend_from_slice(&c.to_le_bytes());
    }
    Ok(())
}

fn write_positions(out: &mut Vec<u8>, value: &Value, dims: usize) -> Result<()> {
    let positions = coord_array(value)?;
    count(out, positions.len())?;
    positions.iter().try_for_each(|p| write_position(out, p, dims))
}

fn write_rings(out: &mut Vec<u8>, value: &Value, dims: usize) -> Result<()> {
    let rings = coord_array(value)?;
    count(out, rings.len())?;
    rings.iter().try_for_each(|r| write_positions(out, r, dims))
}

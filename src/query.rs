//! Query assembly - ties together the registry and the clause builders
//!
//! SQL text only ever contains quoted identifiers that passed the view's
//! allow-lists, SQL keywords and positional placeholders. Every value travels
//! in the parameter list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::filter::build_where;
use crate::registry::Registry;

/// A bound parameter value
///
/// Serialized untagged so the queue message carries a plain JSON list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for SqlParam {
    fn from(s: &str) -> Self {
        SqlParam::Text(s.to_string())
    }
}

impl From<i64> for SqlParam {
    fn from(i: i64) -> Self {
        SqlParam::Int(i)
    }
}

impl From<f64> for SqlParam {
    fn from(f: f64) -> Self {
        SqlParam::Float(f)
    }
}

impl From<bool> for SqlParam {
    fn from(b: bool) -> Self {
        SqlParam::Bool(b)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Sql(String),
    Param {
        value: SqlParam,
        cast: Option<&'static str>,
    },
}

/// SQL text interleaved with the values it binds
///
/// Placeholders are numbered only when the whole statement is rendered, so
/// fragments compose in any order and the count always matches the params.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    parts: Vec<Part>,
}

impl Fragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sql(mut self, text: impl Into<String>) -> Self {
        self.push_sql(text);
        self
    }

    pub fn param(mut self, value: SqlParam, cast: Option<&'static str>) -> Self {
        self.parts.push(Part::Param { value, cast });
        self
    }

    pub fn push_sql(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(Part::Sql(last)) = self.parts.last_mut() {
            last.push_str(&text);
        } else {
            self.parts.push(Part::Sql(text));
        }
    }

    pub fn append(&mut self, other: Fragment) {
        for part in other.parts {
            match part {
                Part::Sql(text) => self.push_sql(text),
                param => self.parts.push(param),
            }
        }
    }

    /// Join fragments with `sep`, e.g. `" AND "`
    pub fn join(fragments: impl IntoIterator<Item = Fragment>, sep: &str) -> Fragment {
        let mut out = Fragment::new();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if i > 0 {
                out.push_sql(sep);
            }
            out.append(fragment);
        }
        out
    }

    pub fn parenthesized(self) -> Fragment {
        let mut out = Fragment::new().sql("(");
        out.append(self);
        out.sql(")")
    }

    pub fn param_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::Param { .. }))
            .count()
    }

    /// Render into `sql`, numbering placeholders after the params already bound
    pub fn render(self, sql: &mut String, params: &mut Vec<SqlParam>) {
        for part in self.parts {
            match part {
                Part::Sql(text) => sql.push_str(&text),
                Part::Param { value, cast } => {
                    params.push(value);
                    sql.push('$');
                    sql.push_str(&params.len().to_string());
                    if let Some(cast) = cast {
                        sql.push_str("::");
                        sql.push_str(cast);
                    }
                }
            }
        }
    }
}

/// Double-quote an identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A parameterized statement ready to execute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

/// Everything a caller can ask of a view
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub view: String,
    pub select: Option<Vec<String>>,
    pub filters: Option<Map<String, Value>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub debug: bool,
}

impl QueryRequest {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            ..Default::default()
        }
    }

    pub fn assemble(&self, registry: &Registry) -> Result<AssembledQuery> {
        assemble(
            registry,
            &self.view,
            self.select.as_deref(),
            self.filters.as_ref(),
            self.limit,
            self.offset,
        )
    }
}

/// Build `SELECT ... FROM "<view>" [WHERE ...] [LIMIT $n] [OFFSET $n]`
///
/// Validation (view, projection, filter columns, value shapes, geometry)
/// completes before any SQL is produced. A limit or offset of zero is unset.
pub fn assemble(
    registry: &Registry,
    view_name: &str,
    select: Option<&[String]>,
    filters: Option<&Map<String, Value>>,
    limit: Option<u64>,
    offset: Option<u64>,
) -> Result<AssembledQuery> {
    let view = registry.view(view_name)?;

    let projection = match select {
        Some(columns) if !columns.is_empty() => {
            if let Some(bad) = columns.iter().find(|c| !view.can_select(c)) {
                return Err(Error::InvalidColumn {
                    view: view.name.to_string(),
                    column: bad.clone(),
                });
            }
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        }
        _ => "*".to_string(),
    };

    let where_clause = match filters {
        Some(filters) => build_where(registry, view, filters)?,
        None => None,
    };

    let mut statement = Fragment::new().sql(format!(
        "SELECT {} FROM {}",
        projection,
        quote_ident(view.name)
    ));
    if let Some(where_clause) = where_clause {
        statement.push_sql(" WHERE ");
        statement.append(where_clause);
    }
    if let Some(limit) = limit.filter(|l| *l > 0) {
        statement = statement.sql(" LIMIT ").param(SqlParam::Int(to_i64(limit)), None);
    }
    if let Some(offset) = offset.filter(|o| *o > 0) {
        statement = statement.sql(" OFFSET ").param(SqlParam::Int(to_i64(offset)), None);
    }

    let expected = statement.param_count();
    let mut sql = String::new();
    let mut params = Vec::new();
    statement.render(&mut sql, &mut params);
    debug_assert_eq!(params.len(), expected);
    Ok(AssembledQuery { sql, params })
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

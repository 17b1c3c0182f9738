use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use simmer_common::{Result, SimmerError};

/// Scalar value as shuttled between SQL results and ingredient calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
}

impl Value {
    /// Render as a SQL literal, escaped for direct inclusion in a statement.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Real(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        }
    }

    /// Canonical key form used for de-duplication and merge joins.
    ///
    /// Floats key by their display form, so `1.0` and `1.00` collapse.
    pub fn merge_key(&self) -> String {
        match self {
            Value::Null => "\0null".to_string(),
            Value::Integer(i) => format!("i:{i}"),
            Value::Real(f) => format!("r:{f}"),
            Value::Text(s) => format!("t:{s}"),
            Value::Boolean(b) => format!("b:{b}"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

/// Backend column type as reported by schema introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Unknown,
}

/// `table -> column -> type` as reported by [`crate::Database::schema`].
pub type SchemaMap = std::collections::BTreeMap<String, std::collections::BTreeMap<String, ColumnType>>;

/// Small in-memory row-major relation.
///
/// This is the unit of exchange between the backend and ingredient calls;
/// it is not a columnar execution format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Relation {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Result<Self> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(SimmerError::Backend(format!(
                    "row {i} has {} values for {} columns",
                    row.len(),
                    columns.len()
                )));
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(SimmerError::Backend(format!(
                "row has {} values for {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Result<Vec<Value>> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| SimmerError::Backend(format!("no such column: {name}")))?;
        Ok(self.rows.iter().map(|r| r[idx].clone()).collect())
    }

    /// Distinct non-null values of one column, first-seen order.
    pub fn distinct_values(&self, name: &str) -> Result<Vec<Value>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for v in self.column_values(name)? {
            if v.is_null() {
                continue;
            }
            if seen.insert(v.merge_key()) {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Flatten a single-column relation to its value list.
    ///
    /// The cardinality check backs the `options`-subquery contract.
    pub fn into_single_column(self) -> Result<Vec<Value>> {
        if self.columns.len() != 1 {
            return Err(SimmerError::InvalidQuery(format!(
                "expected a single-column relation, got {} columns",
                self.columns.len()
            )));
        }
        Ok(self.rows.into_iter().map(|mut r| r.remove(0)).collect())
    }

    /// Left-merge a mapped column into this relation by key column.
    ///
    /// Every row keeps its position; the new column value comes from
    /// `mapping` keyed by the row's `key_column` value. When the relation
    /// already has `new_column`, existing non-null values are kept and only
    /// gaps are filled, so later merges never overwrite earlier ones.
    ///
    /// Row count is preserved by construction; callers enforce the
    /// base-row-count invariant against the ingredient's output.
    pub fn merge_mapped_column(
        &self,
        key_column: &str,
        new_column: &str,
        mapping: &HashMap<String, Value>,
    ) -> Result<Relation> {
        let key_idx = self
            .column_index(key_column)
            .ok_or_else(|| SimmerError::Backend(format!("no such column: {key_column}")))?;
        let existing_idx = self.column_index(new_column);

        let mut columns = self.columns.clone();
        if existing_idx.is_none() {
            columns.push(new_column.to_string());
        }

        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mapped = mapping.get(&row[key_idx].merge_key()).cloned();
            let mut out = row.clone();
            match existing_idx {
                Some(i) => {
                    if out[i].is_null() {
                        out[i] = mapped.unwrap_or(Value::Null);
                    }
                }
                None => out.push(mapped.unwrap_or(Value::Null)),
            }
            rows.push(out);
        }
        Relation::with_rows(columns, rows)
    }
}

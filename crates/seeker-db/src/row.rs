//! Materialized result rows.

use std::sync::Arc;

use rusqlite::types::{FromSql, Value, ValueRef};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::error::DbError;

/// One result row as an ordered column → value mapping.
///
/// Rows from the same result set share their column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Looks up a value by column name. The first matching column wins.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.index_of(column).map(|idx| &self.values[idx])
    }

    /// Converts a column to a Rust type.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` wrapping `InvalidColumnName` if the column
    /// is absent, or `FromSqlConversionFailure` if the value does not
    /// convert.
    pub fn get_as<T: FromSql>(&self, column: &str) -> Result<T, DbError> {
        let idx = self
            .index_of(column)
            .ok_or_else(|| rusqlite::Error::InvalidColumnName(column.to_string()))?;
        let value = &self.values[idx];
        T::column_result(ValueRef::from(value)).map_err(|e| {
            DbError::Query(rusqlite::Error::FromSqlConversionFailure(
                idx,
                value.data_type(),
                Box::new(e),
            ))
        })
    }

    /// Iterates `(column, value)` pairs in select order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

struct SqlValue<'a>(&'a Value);

impl Serialize for SqlValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => serializer.serialize_none(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_bytes(b),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (column, value) in self.iter() {
            map.serialize_entry(column, &SqlValue(value))?;
        }
        map.end()
    }
}

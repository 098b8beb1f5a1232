//! Data-shape translators used at the persistence boundary.
//!
//! Mappers are pure and synchronous. Endpoints call them and report their
//! failures as `MappingFailure` inside the endpoint's result.

use std::collections::HashMap;
use std::hash::Hash;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::Value;
use crate::error::{ErrorKind, Outcome};

/// Column name to value.
pub type Record = serde_json::Map<String, Value>;

/// Turns an entity into named fields.
pub trait EntityMapper<T>: Send + Sync {
    /// Map `entity` into a record.
    fn map(&self, entity: &T) -> Outcome<Record>;
}

/// Decodes one row of a result set.
pub trait ResultSetMapper<T>: Send + Sync {
    /// Decode `row`, whose values line up with `columns`.
    fn map(&self, row: &[Value], columns: &[String]) -> Outcome<T>;
}

/// `EntityMapper` backed by `serde`; the entity must serialize to a map.
#[derive(Debug)]
pub struct SerdeEntityMapper<T> {
    _entity: PhantomData<fn(&T)>,
}

impl<T> SerdeEntityMapper<T> {
    /// Create the mapper.
    pub fn new() -> Self {
        Self {
            _entity: PhantomData,
        }
    }
}

impl<T> Default for SerdeEntityMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> EntityMapper<T> for SerdeEntityMapper<T> {
    fn map(&self, entity: &T) -> Outcome<Record> {
        match serde_json::to_value(entity)? {
            Value::Object(record) => Ok(record),
            other => Err(ErrorKind::MappingFailure(format!(
                "entity serialized to {} instead of an object",
                kind_of(&other)
            ))),
        }
    }
}

/// `ResultSetMapper` producing the row as a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordMapper;

impl ResultSetMapper<Record> for RecordMapper {
    fn map(&self, row: &[Value], columns: &[String]) -> Outcome<Record> {
        if row.len() != columns.len() {
            return Err(ErrorKind::MappingFailure(format!(
                "row has {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }
        Ok(columns.iter().cloned().zip(row.iter().cloned()).collect())
    }
}

/// `ResultSetMapper` deserializing the row record into `T`.
#[derive(Debug)]
pub struct SerdeRowMapper<T> {
    _row: PhantomData<fn() -> T>,
}

impl<T> SerdeRowMapper<T> {
    /// Create the mapper.
    pub fn new() -> Self {
        Self { _row: PhantomData }
    }
}

impl<T> Default for SerdeRowMapper<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> ResultSetMapper<T> for SerdeRowMapper<T> {
    fn map(&self, row: &[Value], columns: &[String]) -> Outcome<T> {
        let record = RecordMapper.map(row, columns)?;
        Ok(serde_json::from_value(Value::Object(record))?)
    }
}

/// Decode every row, stopping at the first failure.
pub fn map_rows<T, M>(mapper: &M, rows: &[Vec<Value>], columns: &[String]) -> Outcome<Vec<T>>
where
    M: ResultSetMapper<T> + ?Sized,
{
    rows.iter()
        .enumerate()
        .map(|(index, row)| {
            mapper.map(row, columns).map_err(|error| match error {
                ErrorKind::MappingFailure(reason) => {
                    ErrorKind::MappingFailure(format!("row {}: {}", index, reason))
                }
                other => other,
            })
        })
        .collect()
}

/// Decode every row and index the results by `key`.
///
/// Later rows replace earlier ones with the same key.
pub fn map_rows_by<K, T, M, F>(
    mapper: &M,
    rows: &[Vec<Value>],
    columns: &[String],
    mut key: F,
) -> Outcome<HashMap<K, T>>
where
    K: Eq + Hash,
    M: ResultSetMapper<T> + ?Sized,
    F: FnMut(&T) -> K,
{
    let values = map_rows(mapper, rows, columns)?;
    Ok(values.into_iter().map(|value| (key(&value), value)).collect())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

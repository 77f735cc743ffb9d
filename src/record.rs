use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::pool::PostgresError;
use crate::value::SqlValue;

/// The serialized form of a record: an ordered field-name to value mapping.
///
/// Used as the intermediate representation for parameter binding and row
/// reconstruction. Null values are omitted on insertion, so a map built from a
/// record only ever carries populated fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordMap {
    columns: Vec<(String, SqlValue)>,
}

impl RecordMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under `column`, replacing any previous value. A null
    /// value removes the field instead.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        let column = column.into();
        let value = value.into();

        if value.is_null() {
            self.columns.retain(|(name, _)| *name != column);
            return;
        }

        if let Some(existing) = self.columns.iter_mut().find(|(name, _)| *name == column) {
            existing.1 = value;
        } else {
            self.columns.push((column, value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = JsonMap::with_capacity(self.columns.len());
        for (name, value) in &self.columns {
            map.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

/// Nested record fields are carried as JSON in their parent's serialized form.
impl From<RecordMap> for SqlValue {
    fn from(map: RecordMap) -> Self {
        Self::Json(map.to_json())
    }
}

/// A record type that maps one-to-one onto a database table.
///
/// Field names are fixed at the type level and correspond to column names.
/// Implementations declare the table, column set, and key columns, and convert
/// between the typed record and its [`RecordMap`] form. Unlike the usual
/// reflective take on this pattern, nothing here is dynamic: `from_map`
/// ignores columns the type does not declare, and `set_column` refuses them.
pub trait Record: Sized + Send + Sync {
    fn table() -> &'static str;

    fn columns() -> &'static [&'static str];

    /// Columns that uniquely identify a row for updates and lookups.
    fn key_columns() -> &'static [&'static str];

    /// Serialized form containing every populated field. Enum fields are
    /// reduced to their primitive value, nested records to JSON.
    fn to_map(&self) -> RecordMap;

    /// Builds a record from a mapping, e.g. a decoded database row. Columns
    /// not declared on the type are ignored; a missing required column is a
    /// [`PostgresError::MissingColumn`] fault.
    fn from_map(map: &RecordMap) -> Result<Self, PostgresError>;

    /// Assigns one declared column on an existing record, used to copy
    /// server-generated values back after `INSERT .. RETURNING`.
    fn set_column(&mut self, column: &str, value: SqlValue) -> Result<(), PostgresError>;
}

/// Fails with [`PostgresError::UnknownColumn`] unless `column` is declared on
/// the record type. Guards every identifier the operations interpolate.
pub fn ensure_declared<R: Record>(column: &str) -> Result<(), PostgresError> {
    if R::columns().iter().any(|declared| *declared == column) {
        Ok(())
    } else {
        Err(PostgresError::UnknownColumn {
            table: R::table(),
            column: column.to_string(),
        })
    }
}

/// Decodes a driver row into its serialized form. NULL columns are omitted,
/// matching the shape `Record::to_map` produces.
pub fn row_to_map(row: &tokio_postgres::Row) -> Result<RecordMap, PostgresError> {
    let mut map = RecordMap::new();

    for (index, column) in row.columns().iter().enumerate() {
        let value: SqlValue = row.try_get(index)?;
        map.set(column.name(), value);
    }

    Ok(map)
}

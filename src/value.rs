use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};
use uuid::Uuid;

use crate::pool::PostgresError;

/// A single field value as it crosses the SQL boundary.
///
/// Everything a record field can hold maps onto one of these variants; enum
/// fields are reduced to their underlying primitive before they get here, and
/// nested records arrive as [`SqlValue::Json`].
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(value) => JsonValue::Bool(*value),
            Self::Int(value) => JsonValue::from(*value),
            Self::Real(value) => {
                serde_json::Number::from_f64(*value).map_or(JsonValue::Null, JsonValue::Number)
            }
            Self::Text(value) => JsonValue::String(value.clone()),
            Self::Timestamp(value) => JsonValue::String(value.to_rfc3339()),
            Self::Uuid(value) => JsonValue::String(value.to_string()),
            Self::Json(value) => value.clone(),
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i8> for SqlValue {
    fn from(value: i8) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i16> for SqlValue {
    fn from(value: i16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u8> for SqlValue {
    fn from(value: u8) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u16> for SqlValue {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f32> for SqlValue {
    fn from(value: f32) -> Self {
        Self::Real(f64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value.and_utc())
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl ToSql for SqlValue {
    fn accepts(_ty: &Type) -> bool
    where
        Self: Sized,
    {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut tokio_util::bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        log::trace!("to_sql_checked: ty={}", ty.name());
        Ok(match self {
            Self::Null => IsNull::Yes,
            Self::Bool(value) => value.to_sql(ty, out)?,
            Self::Int(value) => {
                if *ty == Type::INT2 {
                    i16::try_from(*value)?.to_sql(ty, out)?
                } else if *ty == Type::INT4 {
                    i32::try_from(*value)?.to_sql(ty, out)?
                } else {
                    value.to_sql(ty, out)?
                }
            }
            Self::Real(value) => {
                if *ty == Type::FLOAT4 {
                    #[allow(clippy::cast_possible_truncation)]
                    (*value as f32).to_sql(ty, out)?
                } else {
                    value.to_sql(ty, out)?
                }
            }
            Self::Text(value) => value.to_sql(ty, out)?,
            Self::Timestamp(value) => {
                if *ty == Type::TIMESTAMP {
                    value.naive_utc().to_sql(ty, out)?
                } else {
                    value.to_sql(ty, out)?
                }
            }
            Self::Uuid(value) => value.to_sql(ty, out)?,
            Self::Json(value) => value.to_sql(ty, out)?,
        })
    }

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut tokio_util::bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>>
    where
        Self: Sized,
    {
        self.to_sql_checked(ty, out)
    }
}

impl<'a> FromSql<'a> for SqlValue {
    fn from_sql(
        ty: &Type,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(if *ty == Type::BOOL {
            Self::Bool(bool::from_sql(ty, raw)?)
        } else if *ty == Type::INT2 {
            Self::Int(i64::from(i16::from_sql(ty, raw)?))
        } else if *ty == Type::INT4 {
            Self::Int(i64::from(i32::from_sql(ty, raw)?))
        } else if *ty == Type::INT8 {
            Self::Int(i64::from_sql(ty, raw)?)
        } else if *ty == Type::FLOAT4 {
            Self::Real(f64::from(f32::from_sql(ty, raw)?))
        } else if *ty == Type::FLOAT8 {
            Self::Real(f64::from_sql(ty, raw)?)
        } else if *ty == Type::TEXT
            || *ty == Type::VARCHAR
            || *ty == Type::BPCHAR
            || *ty == Type::NAME
        {
            Self::Text(String::from_sql(ty, raw)?)
        } else if *ty == Type::TIMESTAMP {
            Self::Timestamp(NaiveDateTime::from_sql(ty, raw)?.and_utc())
        } else if *ty == Type::TIMESTAMPTZ {
            Self::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?)
        } else if *ty == Type::UUID {
            Self::Uuid(Uuid::from_sql(ty, raw)?)
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            Self::Json(JsonValue::from_sql(ty, raw)?)
        } else {
            return Err(Box::new(PostgresError::UnsupportedType {
                type_name: ty.name().to_string(),
            }));
        })
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(Self::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_converts_to_null() {
        assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
        assert!(SqlValue::from(None::<String>).is_null());
    }

    #[test]
    fn some_converts_to_inner_variant() {
        assert_eq!(SqlValue::from(Some(7_i32)), SqlValue::Int(7));
        assert_eq!(
            SqlValue::from(Some("widget")),
            SqlValue::Text("widget".to_string())
        );
    }

    #[test]
    fn accessors_match_variants() {
        assert_eq!(SqlValue::Int(42).as_i64(), Some(42));
        assert_eq!(SqlValue::Int(42).as_str(), None);
        assert_eq!(SqlValue::Bool(true).as_bool(), Some(true));
        assert_eq!(SqlValue::Text("a".into()).as_str(), Some("a"));
    }

    #[test]
    fn to_json_reduces_scalars() {
        assert_eq!(SqlValue::Null.to_json(), JsonValue::Null);
        assert_eq!(SqlValue::Int(9).to_json(), JsonValue::from(9));
        assert_eq!(
            SqlValue::Text("gadget".into()).to_json(),
            JsonValue::String("gadget".into())
        );
    }
}

use chrono::{DateTime, Utc};
use tokio_postgres::{GenericClient, Transaction};

use postgres_record_store::ops;
use postgres_record_store::pool::PostgresError;
use postgres_record_store::record::{Record, RecordMap};
use postgres_record_store::value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetStatus {
    Draft,
    Active,
    Retired,
}

impl WidgetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "retired" => Some(Self::Retired),
            _ => None,
        }
    }
}

impl From<WidgetStatus> for SqlValue {
    fn from(status: WidgetStatus) -> Self {
        Self::Text(status.as_str().to_string())
    }
}

/// One row of the `widgets` table. The id is assigned by the database on
/// insert and read back through a RETURNING clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Widget {
    pub id: Option<i64>,
    pub name: String,
    pub status: WidgetStatus,
    pub created_at: Option<DateTime<Utc>>,
}

impl Widget {
    pub fn new(name: impl Into<String>, status: WidgetStatus) -> Self {
        Self {
            id: None,
            name: name.into(),
            status,
            created_at: Some(Utc::now()),
        }
    }

    pub fn create_table_sql() -> &'static str {
        r#"
        CREATE TABLE IF NOT EXISTS widgets (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#
    }

    /// Inserts this widget and captures the generated id.
    pub async fn to_db<C: GenericClient + Sync>(
        &mut self,
        client: &C,
    ) -> Result<(), PostgresError> {
        ops::insert(client, self, &["id"]).await
    }

    /// Updates the row identified by this widget's id.
    pub async fn update_db<C: GenericClient + Sync>(&self, client: &C) -> Result<(), PostgresError> {
        ops::update(client, self).await
    }

    /// Single-record lookup by id.
    pub async fn from_db<C: GenericClient + Sync>(
        client: &C,
        widget_id: i64,
    ) -> Result<Option<Self>, PostgresError> {
        ops::fetch_one(
            client,
            "SELECT * FROM widgets WHERE id = $1",
            &[SqlValue::Int(widget_id)],
        )
        .await
    }

    /// All widgets, streamed from the server in `chunk_size` batches.
    pub async fn all(tx: &Transaction<'_>, chunk_size: usize) -> Result<Vec<Self>, PostgresError> {
        ops::fetch_many::<Self>(tx, "SELECT * FROM widgets ORDER BY id", &[], chunk_size)
            .await?
            .try_collect()
            .await
    }

    pub async fn widget_exists<C: GenericClient + Sync>(
        client: &C,
        widget_id: i64,
    ) -> Result<bool, PostgresError> {
        ops::exists::<Self, _>(client, "id", &SqlValue::Int(widget_id)).await
    }

    pub async fn delete_db<C: GenericClient + Sync>(
        client: &C,
        widget_id: i64,
    ) -> Result<u64, PostgresError> {
        ops::delete(
            client,
            "DELETE FROM widgets WHERE id = $1",
            &[SqlValue::Int(widget_id)],
        )
        .await
    }
}

impl Record for Widget {
    fn table() -> &'static str {
        "widgets"
    }

    fn columns() -> &'static [&'static str] {
        &["id", "name", "status", "created_at"]
    }

    fn key_columns() -> &'static [&'static str] {
        &["id"]
    }

    fn to_map(&self) -> RecordMap {
        let mut map = RecordMap::new();
        map.set("id", self.id);
        map.set("name", self.name.as_str());
        map.set("status", self.status);
        map.set("created_at", self.created_at);
        map
    }

    fn from_map(map: &RecordMap) -> Result<Self, PostgresError> {
        let name = map
            .get("name")
            .and_then(SqlValue::as_str)
            .ok_or(PostgresError::MissingColumn {
                table: Self::table(),
                column: "name",
            })?
            .to_string();

        let status = map
            .get("status")
            .and_then(SqlValue::as_str)
            .and_then(WidgetStatus::parse)
            .ok_or(PostgresError::MissingColumn {
                table: Self::table(),
                column: "status",
            })?;

        Ok(Self {
            id: map.get("id").and_then(SqlValue::as_i64),
            name,
            status,
            created_at: map.get("created_at").and_then(SqlValue::as_timestamp),
        })
    }

    fn set_column(&mut self, column: &str, value: SqlValue) -> Result<(), PostgresError> {
        match column {
            "id" => self.id = value.as_i64(),
            "name" => {
                if let Some(name) = value.as_str() {
                    self.name = name.to_string();
                }
            }
            "status" => {
                if let Some(status) = value.as_str().and_then(WidgetStatus::parse) {
                    self.status = status;
                }
            }
            "created_at" => self.created_at = value.as_timestamp(),
            _ => {
                return Err(PostgresError::UnknownColumn {
                    table: Self::table(),
                    column: column.to_string(),
                })
            }
        }
        Ok(())
    }
}

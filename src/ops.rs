use std::marker::PhantomData;

use futures::Stream;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, Portal, Transaction};

use crate::pool::PostgresError;
use crate::record::{ensure_declared, row_to_map, Record, RecordMap};
use crate::value::SqlValue;

/// Inserts one row holding every populated field of `record`.
///
/// Requested `returning` columns are appended as a `RETURNING` clause and the
/// returned values are copied back onto the record, which is how
/// server-assigned identifiers reach the in-memory instance. A record with no
/// populated fields inserts `DEFAULT VALUES`.
pub async fn insert<R, C>(
    client: &C,
    record: &mut R,
    returning: &[&str],
) -> Result<(), PostgresError>
where
    R: Record,
    C: GenericClient + Sync,
{
    for column in returning {
        ensure_declared::<R>(column)?;
    }

    let map = record.to_map();
    let columns: Vec<&str> = map.iter().map(|(name, _)| name).collect();
    let query = build_insert_sql(R::table(), &columns, returning);
    let values: Vec<SqlValue> = map.iter().map(|(_, value)| value.clone()).collect();

    log::trace!("Running insert query: {query} with params: {values:?}");

    if returning.is_empty() {
        let affected = client.execute(&query, &as_params(&values)).await?;
        log::debug!("Inserted {affected} row into {}", R::table());
    } else {
        let row = client.query_one(&query, &as_params(&values)).await?;
        let returned = row_to_map(&row)?;

        for column in returning {
            let value = returned.get(column).cloned().unwrap_or(SqlValue::Null);
            record.set_column(column, value)?;
        }
    }

    Ok(())
}

/// Updates the row identified by the record's key columns, setting every
/// populated non-key field.
///
/// The statement must affect exactly one row. Any other count is a
/// [`PostgresError::UpdateCardinality`] fault raised locally, even when the
/// statement itself executed cleanly.
pub async fn update<R, C>(client: &C, record: &R) -> Result<(), PostgresError>
where
    R: Record,
    C: GenericClient + Sync,
{
    let map = record.to_map();
    let (set_columns, key_columns) = split_update_columns::<R>(&map)?;

    let set_names: Vec<&str> = set_columns.iter().map(|(name, _)| *name).collect();
    let key_names: Vec<&str> = key_columns.iter().map(|(name, _)| *name).collect();
    let query = build_update_sql(R::table(), &set_names, &key_names);

    let values: Vec<SqlValue> = set_columns
        .iter()
        .chain(key_columns.iter())
        .map(|(_, value)| (*value).clone())
        .collect();

    log::trace!("Running update query: {query} with params: {values:?}");

    let affected = client.execute(&query, &as_params(&values)).await?;

    if affected == 1 {
        Ok(())
    } else {
        Err(PostgresError::UpdateCardinality {
            table: R::table(),
            affected,
        })
    }
}

/// Executes an arbitrary query and decodes the single resulting row, if any.
pub async fn fetch_one<R, C>(
    client: &C,
    query: &str,
    params: &[SqlValue],
) -> Result<Option<R>, PostgresError>
where
    R: Record,
    C: GenericClient + Sync,
{
    log::trace!("Running fetch_one query: {query} with params: {params:?}");

    match client.query_opt(query, &as_params(params)).await? {
        Some(row) => Ok(Some(R::from_map(&row_to_map(&row)?)?)),
        None => Ok(None),
    }
}

/// Executes an arbitrary query on a caller-owned transaction and returns a
/// forward-only cursor that pulls rows in `chunk_size` batches.
///
/// Portals only live inside a transaction, which is why this operation alone
/// takes a [`Transaction`] rather than any client. The transaction boundary
/// stays with the caller.
pub async fn fetch_many<'a, R>(
    tx: &'a Transaction<'a>,
    query: &str,
    params: &[SqlValue],
    chunk_size: usize,
) -> Result<RecordCursor<'a, R>, PostgresError>
where
    R: Record,
{
    log::trace!("Binding fetch_many portal: {query} with params: {params:?}");

    let portal = tx.bind(query, &as_params(params)).await?;

    Ok(RecordCursor {
        tx,
        portal,
        chunk_size: chunk_size.max(1),
        pending: Vec::new().into_iter(),
        exhausted: false,
        _marker: PhantomData,
    })
}

/// Executes an arbitrary delete (or other row-affecting) statement and reports
/// the affected count. Completion without a driver fault is success.
pub async fn delete<C>(client: &C, query: &str, params: &[SqlValue]) -> Result<u64, PostgresError>
where
    C: GenericClient + Sync,
{
    log::trace!("Running delete query: {query} with params: {params:?}");

    Ok(client.execute(query, &as_params(params)).await?)
}

/// `SELECT EXISTS` check on the record's table for a single key value. The key
/// column is validated against the declared schema; the value is bound as a
/// parameter.
pub async fn exists<R, C>(
    client: &C,
    key_column: &str,
    key: &SqlValue,
) -> Result<bool, PostgresError>
where
    R: Record,
    C: GenericClient + Sync,
{
    ensure_declared::<R>(key_column)?;

    let query = build_exists_sql(R::table(), key_column);
    log::trace!("Running exists query: {query} with key: {key:?}");

    let row = client
        .query_one(&query, &[key as &(dyn ToSql + Sync)])
        .await?;

    Ok(row.try_get(0)?)
}

/// Multi-row insert, chunked so a single statement never exceeds the
/// protocol's parameter limit.
///
/// The column set is taken from the first record's populated fields, so
/// server-side defaults still apply to columns the batch omits entirely;
/// fields missing from later records bind as NULL. A later record populating
/// a column outside that set is a [`PostgresError::BatchColumnMismatch`]
/// fault, raised before anything executes.
pub async fn insert_many<R, C>(client: &C, records: &[R]) -> Result<u64, PostgresError>
where
    R: Record,
    C: GenericClient + Sync,
{
    let Some(first) = records.first() else {
        return Ok(0);
    };

    let first_map = first.to_map();
    if first_map.is_empty() {
        return Err(PostgresError::EmptyRecord { table: R::table() });
    }

    let columns: Vec<String> = first_map.iter().map(|(name, _)| name.to_string()).collect();
    let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();

    ensure_batch_columns::<R>(records, &column_refs)?;

    let max_rows = (usize::from(u16::MAX) / columns.len()).max(1);
    let mut affected = 0;

    for chunk in records.chunks(max_rows) {
        let query = build_insert_many_sql(R::table(), &column_refs, chunk.len());

        let mut values = Vec::with_capacity(columns.len() * chunk.len());
        for record in chunk {
            let map = record.to_map();
            for column in &column_refs {
                values.push(map.get(column).cloned().unwrap_or(SqlValue::Null));
            }
        }

        log::trace!("Running insert_many chunk: {} rows", chunk.len());
        affected += client.execute(&query, &as_params(&values)).await?;
    }

    log::debug!("Inserted {affected} rows into {}", R::table());
    Ok(affected)
}

/// Forward-only, single-pass record cursor over a bound portal.
///
/// Rows are retrieved from the server `chunk_size` at a time and the cursor
/// terminates exactly when the driver returns an empty batch.
pub struct RecordCursor<'a, R: Record> {
    tx: &'a Transaction<'a>,
    portal: Portal,
    chunk_size: usize,
    pending: std::vec::IntoIter<tokio_postgres::Row>,
    exhausted: bool,
    _marker: PhantomData<fn() -> R>,
}

impl<'a, R: Record> RecordCursor<'a, R> {
    pub async fn try_next(&mut self) -> Result<Option<R>, PostgresError> {
        loop {
            if let Some(row) = self.pending.next() {
                return Ok(Some(R::from_map(&row_to_map(&row)?)?));
            }

            if self.exhausted {
                return Ok(None);
            }

            let max_rows = i32::try_from(self.chunk_size).unwrap_or(i32::MAX);
            let rows = self.tx.query_portal(&self.portal, max_rows).await?;
            log::trace!("Fetched batch of {} rows", rows.len());

            if rows.is_empty() {
                self.exhausted = true;
                return Ok(None);
            }

            self.pending = rows.into_iter();
        }
    }

    pub async fn try_collect(mut self) -> Result<Vec<R>, PostgresError> {
        let mut records = Vec::new();
        while let Some(record) = self.try_next().await? {
            records.push(record);
        }
        Ok(records)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<R, PostgresError>> + 'a
    where
        R: 'a,
    {
        futures::stream::try_unfold(self, |mut cursor| async move {
            Ok(cursor.try_next().await?.map(|record| (record, cursor)))
        })
    }
}

fn as_params(values: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    values
        .iter()
        .map(|value| value as &(dyn ToSql + Sync))
        .collect()
}

type ColumnValues<'a> = Vec<(&'a str, &'a SqlValue)>;

/// Splits a serialized record into SET columns and key columns for an update.
/// Every key column must be populated; at least one non-key column must be
/// left to assign.
fn split_update_columns<R: Record>(
    map: &RecordMap,
) -> Result<(ColumnValues<'_>, ColumnValues<'_>), PostgresError> {
    let mut key_columns = Vec::with_capacity(R::key_columns().len());

    for key in R::key_columns() {
        let value = map.get(key).ok_or(PostgresError::MissingColumn {
            table: R::table(),
            column: key,
        })?;
        key_columns.push((*key, value));
    }

    let set_columns: ColumnValues<'_> = map
        .iter()
        .filter(|(name, _)| !R::key_columns().iter().any(|key| key == name))
        .collect();

    if set_columns.is_empty() {
        return Err(PostgresError::EmptyRecord { table: R::table() });
    }

    Ok((set_columns, key_columns))
}

/// Every record in a batch must stay within the column set taken from the
/// first record; a populated column outside that set would otherwise be
/// dropped without binding.
fn ensure_batch_columns<R: Record>(records: &[R], columns: &[&str]) -> Result<(), PostgresError> {
    for record in records.iter().skip(1) {
        let map = record.to_map();
        for (name, _) in map.iter() {
            if !columns.iter().any(|column| *column == name) {
                return Err(PostgresError::BatchColumnMismatch {
                    table: R::table(),
                    column: name.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn quote_identifier(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|position| format!("${position}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_insert_sql(table: &str, columns: &[&str], returning: &[&str]) -> String {
    let mut query = if columns.is_empty() {
        format!("INSERT INTO {table} DEFAULT VALUES")
    } else {
        format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            column_list(columns),
            placeholders(1, columns.len()),
        )
    };

    if !returning.is_empty() {
        query.push_str(" RETURNING ");
        query.push_str(&column_list(returning));
    }

    query
}

fn build_insert_many_sql(table: &str, columns: &[&str], rows: usize) -> String {
    let values = (0..rows)
        .map(|row| format!("({})", placeholders(row * columns.len() + 1, columns.len())))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {table} ({}) VALUES {values}",
        column_list(columns),
    )
}

fn build_update_sql(table: &str, set_columns: &[&str], key_columns: &[&str]) -> String {
    let assignments = set_columns
        .iter()
        .enumerate()
        .map(|(index, column)| format!("{}=${}", quote_identifier(column), index + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let filters = key_columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            format!(
                "{}=${}",
                quote_identifier(column),
                set_columns.len() + index + 1
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");

    format!("UPDATE {table} SET {assignments} WHERE {filters}")
}

fn build_exists_sql(table: &str, key_column: &str) -> String {
    format!(
        "SELECT EXISTS(SELECT 1 FROM {table} WHERE {} = $1)",
        quote_identifier(key_column),
    )
}

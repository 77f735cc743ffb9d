//! End-to-end checks against a real PostgreSQL instance.
//!
//! Run with a reachable server, e.g.:
//! `POSTGRES_URL=postgres://postgres@localhost/postgres cargo test -- --ignored`

use tokio_postgres::NoTls;

use postgres_record_store::ops;
use postgres_record_store::pool::PostgresError;
use postgres_record_store::record::{Record, RecordMap};
use postgres_record_store::value::SqlValue;

#[derive(Debug, Clone, PartialEq)]
struct Item {
    id: Option<i64>,
    name: Option<String>,
    qty: Option<i64>,
}

impl Item {
    fn named(name: &str, qty: i64) -> Self {
        Self {
            id: None,
            name: Some(name.to_string()),
            qty: Some(qty),
        }
    }
}

impl Record for Item {
    fn table() -> &'static str {
        "live_items"
    }

    fn columns() -> &'static [&'static str] {
        &["id", "name", "qty"]
    }

    fn key_columns() -> &'static [&'static str] {
        &["id"]
    }

    fn to_map(&self) -> RecordMap {
        let mut map = RecordMap::new();
        map.set("id", self.id);
        map.set("name", self.name.clone());
        map.set("qty", self.qty);
        map
    }

    fn from_map(map: &RecordMap) -> Result<Self, PostgresError> {
        Ok(Self {
            id: map.get("id").and_then(SqlValue::as_i64),
            name: map
                .get("name")
                .and_then(SqlValue::as_str)
                .map(ToOwned::to_owned),
            qty: map.get("qty").and_then(SqlValue::as_i64),
        })
    }

    fn set_column(&mut self, column: &str, value: SqlValue) -> Result<(), PostgresError> {
        match column {
            "id" => self.id = value.as_i64(),
            "name" => self.name = value.as_str().map(ToOwned::to_owned),
            "qty" => self.qty = value.as_i64(),
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

async fn connect() -> tokio_postgres::Client {
    let url = std::env::var("POSTGRES_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/postgres".to_string());

    let (client, connection) = tokio_postgres::connect(&url, NoTls)
        .await
        .expect("connect to POSTGRES_URL");

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("connection task error: {e}");
        }
    });

    // Temporary table: scoped to this session, dropped on disconnect.
    client
        .batch_execute(
            "CREATE TEMPORARY TABLE live_items (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                qty BIGINT
            )",
        )
        .await
        .expect("create temp table");

    client
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL at POSTGRES_URL"]
async fn full_record_lifecycle() {
    let mut client = connect().await;

    // Insert with a requested returning field populates the id in place.
    let mut item = Item::named("widget", 3);
    assert_eq!(item.id, None);
    ops::insert(&client, &mut item, &["id"]).await.unwrap();
    let id = item.id.expect("id assigned from RETURNING clause");

    // Update by key affects exactly one row and succeeds silently.
    item.name = Some("gadget".to_string());
    ops::update(&client, &item).await.unwrap();

    // A key matching no rows is an update cardinality fault.
    let missing = Item {
        id: Some(id + 1_000_000),
        name: Some("ghost".to_string()),
        qty: Some(1),
    };
    let err = ops::update(&client, &missing).await.unwrap_err();
    assert!(matches!(
        err,
        PostgresError::UpdateCardinality { affected: 0, .. }
    ));

    // Fetch-one sees the updated row; an unmatched query yields None.
    let fetched: Item = ops::fetch_one(
        &client,
        "SELECT * FROM live_items WHERE id = $1",
        &[SqlValue::Int(id)],
    )
    .await
    .unwrap()
    .expect("row exists");
    assert_eq!(fetched.name.as_deref(), Some("gadget"));
    assert_eq!(fetched.qty, Some(3));

    let absent: Option<Item> = ops::fetch_one(
        &client,
        "SELECT * FROM live_items WHERE id = $1",
        &[SqlValue::Int(id + 1_000_000)],
    )
    .await
    .unwrap();
    assert!(absent.is_none());

    // Fetch-many pulls batches smaller than the result set, in row order.
    let extras: Vec<Item> = (0..25).map(|i| Item::named("bulk", i)).collect();
    ops::insert_many(&client, &extras).await.unwrap();

    let tx = client.transaction().await.unwrap();
    let all = ops::fetch_many::<Item>(&tx, "SELECT * FROM live_items ORDER BY id", &[], 10)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 26);
    let ids: Vec<i64> = all.iter().filter_map(|item| item.id).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);

    let none = ops::fetch_many::<Item>(
        &tx,
        "SELECT * FROM live_items WHERE qty = $1",
        &[SqlValue::Int(-1)],
        10,
    )
    .await
    .unwrap()
    .try_collect()
    .await
    .unwrap();
    assert!(none.is_empty());
    tx.commit().await.unwrap();

    // Existence check flips to false once the row is deleted.
    assert!(ops::exists::<Item, _>(&client, "id", &SqlValue::Int(id))
        .await
        .unwrap());

    ops::delete(
        &client,
        "DELETE FROM live_items WHERE id = $1",
        &[SqlValue::Int(id)],
    )
    .await
    .unwrap();

    assert!(!ops::exists::<Item, _>(&client, "id", &SqlValue::Int(id))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL at POSTGRES_URL"]
async fn update_matching_multiple_rows_is_a_fault() {
    let client = connect().await;

    // Two rows sharing the same qty, updated through a record whose "key"
    // column is qty for this table variant.
    #[derive(Debug)]
    struct ByQty {
        name: Option<String>,
        qty: Option<i64>,
    }

    impl Record for ByQty {
        fn table() -> &'static str {
            "live_items"
        }

        fn columns() -> &'static [&'static str] {
            &["id", "name", "qty"]
        }

        fn key_columns() -> &'static [&'static str] {
            &["qty"]
        }

        fn to_map(&self) -> RecordMap {
            let mut map = RecordMap::new();
            map.set("name", self.name.clone());
            map.set("qty", self.qty);
            map
        }

        fn from_map(map: &RecordMap) -> Result<Self, PostgresError> {
            Ok(Self {
                name: map
                    .get("name")
                    .and_then(SqlValue::as_str)
                    .map(ToOwned::to_owned),
                qty: map.get("qty").and_then(SqlValue::as_i64),
            })
        }

        fn set_column(&mut self, column: &str, value: SqlValue) -> Result<(), PostgresError> {
            match column {
                "name" => self.name = value.as_str().map(ToOwned::to_owned),
                "qty" => self.qty = value.as_i64(),
                "id" => {}
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

    let mut a = Item::named("first", 7);
    let mut b = Item::named("second", 7);
    ops::insert(&client, &mut a, &[]).await.unwrap();
    ops::insert(&client, &mut b, &[]).await.unwrap();

    let update = ByQty {
        name: Some("renamed".to_string()),
        qty: Some(7),
    };

    let err = ops::update(&client, &update).await.unwrap_err();
    assert!(matches!(
        err,
        PostgresError::UpdateCardinality { affected: 2, .. }
    ));
}

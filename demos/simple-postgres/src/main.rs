use std::sync::Arc;

use anyhow::Result;

use postgres_record_store::config::{FetchConfig, PostgresConfig, StoreConfig};
use postgres_record_store::pool::PostgresConnectionPool;

mod model;

use crate::model::{Widget, WidgetStatus};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let config = load_config();

    let pool = PostgresConnectionPool::new(config.clone(), None);
    pool.initialize().await?;

    {
        let conn = pool.get_connection().await?;
        conn.batch_execute(Widget::create_table_sql()).await?;
        println!("DB init successful");
    }

    let mut conn = pool.get_connection().await?;

    // Insert, capturing the generated id
    let mut widget = Widget::new("widget", WidgetStatus::Draft);
    widget.to_db(&**conn).await?;
    let widget_id = widget.id.expect("id assigned by RETURNING");
    println!("Inserted widget with id {widget_id}");

    // Rename and activate, then write the change back
    widget.name = "gadget".to_string();
    widget.status = WidgetStatus::Active;
    widget.update_db(&**conn).await?;

    let fetched = Widget::from_db(&**conn, widget_id).await?;
    println!("Fetched back: {fetched:?}");

    // Seed a few more rows and stream everything out in small batches
    for i in 0..25 {
        let mut extra = Widget::new(format!("widget-{i}"), WidgetStatus::Draft);
        extra.to_db(&**conn).await?;
    }

    let widgets = {
        let tx = conn.transaction().await?;
        let widgets = Widget::all(&tx, config.fetch.chunk_size.min(10)).await?;
        tx.commit().await?;
        widgets
    };
    println!("Retrieved {} widgets", widgets.len());

    // Existence check, delete, check again
    println!(
        "Widget {widget_id} exists: {}",
        Widget::widget_exists(&**conn, widget_id).await?
    );
    Widget::delete_db(&**conn, widget_id).await?;
    println!(
        "Widget {widget_id} exists after delete: {}",
        Widget::widget_exists(&**conn, widget_id).await?
    );

    drop(conn);
    pool.shutdown().await?;

    Ok(())
}

fn load_config() -> Arc<StoreConfig> {
    let host = std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("POSTGRES_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(5432);
    let database = std::env::var("POSTGRES_DB").unwrap_or_else(|_| "postgres".to_string());
    let username = std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string());
    let password = std::env::var("POSTGRES_PASSWORD").unwrap_or_default();

    let postgres = PostgresConfig::new(host, port, database, username, password, 10, 30, 5);

    Arc::new(StoreConfig::new(postgres, FetchConfig::default()))
}

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::{Manager, Metrics, Object, PoolError, RecycleError, Status};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_postgres::{Client, NoTls};

use crate::config::{ConfigError, StoreConfig};
use crate::metrics::{Kind, MetricConfig, SharedRegistrar};

#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("Postgres client error: {0}")]
    Client(#[from] tokio_postgres::Error),

    #[error("Invalid connection settings: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection timed out")]
    Timeout,

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Column '{column}' is not declared on table '{table}'")]
    UnknownColumn { table: &'static str, column: String },

    #[error("Missing value for column '{column}' on table '{table}'")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    #[error("Unsupported column type '{type_name}'")]
    UnsupportedType { type_name: String },

    #[error("Update affected {affected} rows on table '{table}', expected exactly 1")]
    UpdateCardinality { table: &'static str, affected: u64 },

    #[error("Record for table '{table}' has no populated fields")]
    EmptyRecord { table: &'static str },

    #[error("Batch for table '{table}' populates column '{column}' missing from the batch column set")]
    BatchColumnMismatch { table: &'static str, column: String },
}

impl From<tokio::time::error::Elapsed> for PostgresError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl<T: fmt::Display> From<PoolError<T>> for PostgresError {
    fn from(value: PoolError<T>) -> Self {
        Self::Pool(value.to_string())
    }
}

/// Creation and last-use timestamps for a pooled connection.
#[derive(Debug, Clone, Copy)]
struct ConnectionClock {
    created_at: Instant,
    last_used: Instant,
}

impl ConnectionClock {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_used: now,
        }
    }

    fn mark_used(&mut self) {
        self.last_used = Instant::now();
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }
}

/// A live client plus the spawned task driving its wire connection.
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
    id: u64,
    clock: ConnectionClock,
}

impl PgConnection {
    pub fn new(client: Client, driver: JoinHandle<()>, id: u64) -> Self {
        Self {
            client,
            driver,
            id,
            clock: ConnectionClock::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.clock.age()
    }

    pub fn idle_time(&self) -> Duration {
        self.clock.idle_time()
    }

    /// Stamps the connection as just handed out or health-checked.
    pub fn mark_used(&mut self) {
        self.clock.mark_used();
    }

    pub async fn health_check(&self) -> Result<(), PostgresError> {
        self.client
            .batch_execute("SELECT 1")
            .await
            .map_err(PostgresError::Client)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.client
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("id", &self.id)
            .field("clock", &self.clock)
            .finish()
    }
}

#[derive(Debug)]
pub struct PgConnectionManager {
    config: Arc<StoreConfig>,
    next_connection_id: AtomicU64,
    is_shutting_down: Arc<AtomicBool>,
    metrics: Option<SharedRegistrar>,
}

impl PgConnectionManager {
    pub fn new(config: Arc<StoreConfig>, metrics: Option<SharedRegistrar>) -> Self {
        Self {
            config,
            next_connection_id: AtomicU64::new(1),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            metrics,
        }
    }

    pub fn initiate_shutdown(&self) {
        self.is_shutting_down.store(true, Ordering::SeqCst);
        log::info!("Postgres connection manager shutdown in progress");
    }

    async fn connect(&self) -> Result<(Client, JoinHandle<()>), PostgresError> {
        let postgres = &self.config.postgres;
        let url = postgres.connection_url()?;

        let (client, connection) = timeout(
            postgres.connect_timeout(),
            tokio_postgres::connect(url.as_str(), NoTls),
        )
        .await??;

        // tokio-postgres splits the client from the connection; the
        // connection future has to be polled for the client to make progress.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("Postgres connection task ended with error: {e}");
            }
        });

        Ok((client, driver))
    }
}

impl Manager for PgConnectionManager {
    type Type = PgConnection;
    type Error = PostgresError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Err(PostgresError::ShuttingDown);
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();

        let postgres = &self.config.postgres;
        log::debug!(
            "Creating new Postgres connection [id: {}] to {}:{}/{}",
            connection_id,
            postgres.host,
            postgres.port,
            postgres.database
        );

        let result = self.connect().await;
        let duration = start.elapsed();

        if let Some(metrics) = &self.metrics {
            metrics.set_gauge_vec(
                "postgres_connection_creation_seconds",
                &["create"],
                duration.as_secs_f64(),
            );
        }

        match result {
            Ok((client, driver)) => {
                log::debug!("Connection established [id: {connection_id}] in {duration:?}");

                if let Some(metrics) = &self.metrics {
                    metrics.inc_int_counter_vec("postgres_connections_created_total", &["success"]);
                }

                Ok(PgConnection::new(client, driver, connection_id))
            }
            Err(e) => {
                log::error!("Failed to establish Postgres connection [id: {connection_id}]: {e}");

                if let Some(metrics) = &self.metrics {
                    metrics.inc_int_counter_vec("postgres_connections_created_total", &["failure"]);
                }

                Err(e)
            }
        }
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &Metrics,
    ) -> Result<(), RecycleError<Self::Error>> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Err(RecycleError::Message("Shutting down".into()));
        }

        log::debug!("Testing health of connection [id: {}]", conn.id());

        let validation_timeout = self.config.postgres.connect_timeout();

        match timeout(validation_timeout, conn.health_check()).await {
            Ok(Ok(())) => {
                log::debug!("Connection [id: {}] health check passed", conn.id());
                conn.mark_used();

                if let Some(metrics) = &self.metrics {
                    metrics.inc_int_counter_vec(
                        "postgres_connection_health_checks_total",
                        &["success"],
                    );
                }

                Ok(())
            }
            Ok(Err(e)) => {
                log::warn!("Connection [id: {}] health check failed: {}", conn.id(), e);

                if let Some(metrics) = &self.metrics {
                    metrics.inc_int_counter_vec(
                        "postgres_connection_health_checks_total",
                        &["failure"],
                    );
                }

                Err(RecycleError::Message(
                    format!("Health check failed: {e}").into(),
                ))
            }
            Err(_) => {
                log::warn!(
                    "Connection [id: {}] health check timed out after {:?}",
                    conn.id(),
                    validation_timeout
                );

                if let Some(metrics) = &self.metrics {
                    metrics.inc_int_counter_vec(
                        "postgres_connection_health_checks_total",
                        &["timeout"],
                    );
                }

                Err(RecycleError::Message("Health check timed out".into()))
            }
        }
    }
}

pub type Pool = deadpool::managed::Pool<PgConnectionManager>;
pub type PooledConnection = Object<PgConnectionManager>;

pub struct PostgresConnectionPool {
    pool: Pool,
    config: Arc<StoreConfig>,
    metrics: Option<SharedRegistrar>,
    is_initialized: AtomicBool,
}

impl PostgresConnectionPool {
    pub fn new(config: Arc<StoreConfig>, metrics: Option<SharedRegistrar>) -> Self {
        if let Some(metrics_ref) = &metrics {
            Self::register_metrics(metrics_ref);
        }

        let max_size = config.postgres.max_connections as usize;
        let manager = PgConnectionManager::new(config.clone(), metrics.clone());

        let pool = Pool::builder(manager)
            .max_size(max_size)
            .build()
            .expect("Failed to build connection pool");

        Self {
            pool,
            config,
            metrics,
            is_initialized: AtomicBool::new(false),
        }
    }

    /// Warms the pool up to its configured size, health-checking each
    /// connection as it comes up.
    pub async fn initialize(&self) -> Result<(), PostgresError> {
        if self.is_initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        log::info!("Initializing Postgres connection pool");

        let warmup_count = self.config.postgres.max_connections as usize;
        let mut warmup_handles = Vec::with_capacity(warmup_count);

        for i in 0..warmup_count {
            let pool = self.pool.clone();

            warmup_handles.push(tokio::spawn(async move {
                match pool.get().await {
                    Ok(conn) => conn.health_check().await.map_err(|e| {
                        log::error!("Warm-up connection {i} health check failed: {e}");
                        e
                    }),
                    Err(e) => {
                        log::error!("Failed to get warm-up connection {i}: {e}");
                        Err(PostgresError::Pool(e.to_string()))
                    }
                }
            }));
        }

        let mut warmup_success_count = 0;
        for (i, handle) in warmup_handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(())) => warmup_success_count += 1,
                Ok(Err(e)) => log::warn!("Warm-up connection {i} failed: {e}"),
                Err(e) => log::error!("Warm-up task {i} panicked: {e}"),
            }
        }

        log::info!("Connection pool warm-up complete: {warmup_success_count}/{warmup_count} successful");

        self.is_initialized.store(true, Ordering::SeqCst);

        if let Some(metrics) = &self.metrics {
            let status = self.pool.status();
            metrics.set_int_gauge_vec(
                "postgres_pool_connections",
                &["available"],
                status.available as i64,
            );
            metrics.set_int_gauge_vec("postgres_pool_connections", &["size"], status.size as i64);
        }

        Ok(())
    }

    pub async fn get_connection(&self) -> Result<PooledConnection, PostgresError> {
        if !self.is_initialized.load(Ordering::SeqCst) {
            log::warn!("Attempting to get connection from uninitialized pool");
        }

        let start = Instant::now();
        let timeout_duration = self.config.postgres.connect_timeout();

        match timeout(timeout_duration, self.pool.get()).await {
            Ok(Ok(mut conn)) => {
                let duration = start.elapsed();
                conn.mark_used();

                if let Some(metrics) = &self.metrics {
                    metrics.set_gauge_vec(
                        "postgres_connection_acquisition_seconds",
                        &["success"],
                        duration.as_secs_f64(),
                    );
                    metrics
                        .inc_int_counter_vec("postgres_connection_acquisition_total", &["success"]);
                }

                log::debug!("Connection acquired in {duration:?}");
                Ok(conn)
            }
            Ok(Err(e)) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .inc_int_counter_vec("postgres_connection_acquisition_total", &["failure"]);
                }

                log::warn!("Failed to get connection from pool: {e}");
                Err(PostgresError::Pool(e.to_string()))
            }
            Err(_) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .inc_int_counter_vec("postgres_connection_acquisition_total", &["timeout"]);
                }

                log::warn!("Timed out waiting for connection after {timeout_duration:?}");
                Err(PostgresError::Timeout)
            }
        }
    }

    pub fn status(&self) -> Status {
        self.pool.status()
    }

    /// Stops handing out connections, waits for in-flight ones to come back,
    /// then closes the pool. The drain gives up after 30 seconds.
    pub async fn shutdown(&self) -> Result<(), PostgresError> {
        log::info!("Initiating graceful shutdown of Postgres connection pool");

        self.pool.manager().initiate_shutdown();

        let drain_timeout = Duration::from_secs(30);
        let drain_start = Instant::now();

        loop {
            let status = self.pool.status();
            let in_use = status.size - status.available;

            if in_use == 0 {
                log::info!("All connections returned to pool, proceeding with shutdown");
                break;
            }

            if drain_start.elapsed() > drain_timeout {
                log::warn!("Shutdown drain timeout exceeded, {in_use} connections still in use");
                break;
            }

            log::info!("Waiting for {in_use} connections to be returned to pool");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.pool.close();
        log::info!("Postgres connection pool shutdown complete");

        Ok(())
    }

    fn register_metrics(metrics: &SharedRegistrar) {
        let metric_configs = [
            MetricConfig {
                kind: Kind::IntCounterVec,
                name: "postgres_connections_created_total",
                help: "Total no. of connections created",
                label_names: &["status"],
            },
            MetricConfig {
                kind: Kind::IntGaugeVec,
                name: "postgres_pool_connections",
                help: "Current no. of connections in the pool",
                label_names: &["state"],
            },
            MetricConfig {
                kind: Kind::IntCounterVec,
                name: "postgres_connection_health_checks_total",
                help: "Total no. of connection health checks",
                label_names: &["status"],
            },
            MetricConfig {
                kind: Kind::GaugeVec,
                name: "postgres_connection_creation_seconds",
                help: "Time taken to create connections",
                label_names: &["operation"],
            },
            MetricConfig {
                kind: Kind::GaugeVec,
                name: "postgres_connection_acquisition_seconds",
                help: "Time taken to acquire a connection from the pool",
                label_names: &["status"],
            },
            MetricConfig {
                kind: Kind::IntCounterVec,
                name: "postgres_connection_acquisition_total",
                help: "Total number of connection acquisition attempts",
                label_names: &["status"],
            },
        ];

        metrics.with_metric_configs(&metric_configs).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_a_connection_used_resets_the_idle_clock() {
        let mut clock = ConnectionClock::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.idle_time() >= Duration::from_millis(20));

        clock.mark_used();
        assert!(clock.idle_time() < clock.age());
    }
}

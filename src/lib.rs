pub mod config;
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod record;
pub mod value;

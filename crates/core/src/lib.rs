pub mod config;
pub mod error;

pub use config::{CatalogConfig, CollectorConfig, Config, PostgresConfig};
pub use error::*;

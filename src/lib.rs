pub mod auditor;
pub mod classifier;
pub mod config;
pub mod connectors;
pub mod error;
pub mod http_cache;
pub mod http_client;
pub mod identity;
pub mod manager;
pub mod merger;
pub mod model;
pub mod planner;
pub mod store;
pub mod transport;

pub use error::{Result, SyncError};
pub use manager::DataCollectionManager;

//! resource-hub library: concurrent bring-up of backend resources.
//!
//! A [`Config`] declares relational databases (leader plus optional
//! replica), redis caches and object storage buckets.  [`ResourceHub::new`]
//! connects all of them concurrently and returns a name-keyed registry
//! that lives for the rest of the process; [`ResourceHub::close_all`]
//! releases everything on shutdown.

pub mod backoff;
pub mod bringup;
pub mod cache;
pub mod config;
pub mod database;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use bringup::Connectors;
pub use cache::CacheHandle;
pub use config::{load_config, Config};
pub use database::DatabaseHandle;
pub use errors::{
    BringUpError, CloseAllError, ConfigError, LookupError, PartialBringUp, ResourceError,
    ResourceFailure, ResourceKind, Stage,
};
pub use hub::{Resource, ResourceHub};
pub use storage::ObjectStorageHandle;

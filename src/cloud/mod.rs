//! Cloud storage: connector trait and backends, the async transfer engine,
//! and pooled CSV journals.

pub mod async_connector;
pub mod connector;
pub mod journal_pool;

pub use async_connector::AsyncCloudConnector;
pub use connector::{CloudConnector, LocalCloudConnector};
pub use journal_pool::JournalPool;

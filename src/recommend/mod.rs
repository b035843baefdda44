//! Recommend Task Service (C7): user/order ingest, co-visit/purchase matrix
//! updates, and the cron-driven flush + similarity rebuild (spec §4.7).

pub mod service;
pub mod stores;

pub use service::RecommendTaskService;
pub use stores::{OrderItem, OrderMap, OrderRecord};

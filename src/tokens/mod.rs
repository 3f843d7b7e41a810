//! The token registry: the single authority over tokens, keys,
//! certificates and certificate requests, and its durable snapshot.
mod model;
pub use self::model::*;

mod registry;
pub use self::registry::{SyncSummary, TokenRegistry};

mod store;
pub use self::store::SnapshotStore;

mod manager;
pub use self::manager::{CertAndKey, TokenAndKey, TokenManager};

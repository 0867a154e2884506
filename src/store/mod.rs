//! Sources of truth behind the caches: dashboard definitions, RBAC, token
//! blacklist and the analytics data itself.

mod memory;
mod postgres;

pub use memory::{
    InMemoryDashboardStore, InMemoryQueryExecutor, InMemoryRbacStore, InMemoryTokenBlacklistStore,
};
pub use postgres::PostgresStore;

//! Database layer.
//!
//! This module provides the transactional SQL service and its collaborators:
//! - Connection abstraction with a sqlx backend
//! - Connection pool with lifetime and idle eviction
//! - Transaction-scoped prepared statement cache
//! - Unit of work coordinator and the SQL transaction member
//! - Bind scanning, custom bind functions and statement processing
//! - SQL dialect styles

pub mod backend;
pub mod binds;
pub mod connection;
pub mod functions;
pub(crate) mod macros;
pub mod member;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod pool;
pub mod processor;
pub mod service;
pub mod statement_cache;
pub mod style;
pub mod transaction;

pub use backend::SqlxConnector;
pub use connection::{Connection, Connector, DataSourceRegistry, PreparedStatement};
pub use functions::{AccessControl, Descriptor, DescriptorIndex, TextProvider};
pub use member::{MemberState, SqlTransactionMember};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
pub use processor::SelectStreamHandler;
pub use service::{DefaultHooks, SqlService, SqlServiceBuilder, SqlServiceHooks};
pub use statement_cache::StatementCache;
pub use style::SqlStyle;
pub use transaction::{Transaction, TransactionMember};

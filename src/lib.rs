//! txsql
//!
//! A transactional SQL service with a bounded connection pool, transaction
//! scoped statement caching and custom bind functions, together with the web
//! service pipeline that runs transactional handlers inside their own unit of
//! work bound to a server session.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod server;
pub mod transport;

pub use config::{Config, SqlServiceConfig};
pub use db::{SqlService, Transaction};
pub use error::{SqlError, SqlResult};
pub use transport::{TubelineAssembler, WsError};

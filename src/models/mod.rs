//! Data models shared by the SQL layer and the handler pipeline.

pub mod bind;
pub mod database;
pub mod message;
pub mod value;

pub use bind::{BindBase, Holder, ListHolder, OutputTarget};
pub use database::DatabaseType;
pub use message::{Fault, FaultCode, Header, Message};
pub use value::{Row, Value};

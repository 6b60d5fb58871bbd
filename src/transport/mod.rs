//! Web service message pipeline.
//!
//! - `context`: per-request state passed through the pipeline
//! - `handler`: handler chain contract and the transactional decorator
//! - `tube`: pipeline stages (validation, handlers, monitoring, addressing,
//!   must-understand, security)
//! - `assembler`: builds server and client pipelines

pub mod assembler;
pub mod context;
pub mod error;
pub mod handler;
pub mod tube;

pub use assembler::{Tubeline, TubelineAssembler, WebServiceDescriptor};
pub use context::{Credentials, Direction, MessageContext};
pub use error::WsError;
pub use handler::{
    Handler, PortTypeSessionFactoryRegistrationHandler, TransactionalHandler, TransactionalMarker,
};
pub use tube::{Endpoint, MessageTransport, MonitoringStats, Side, Tube};

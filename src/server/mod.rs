//! Server-side sessions and job execution.

pub mod job;
pub mod session;

pub use job::{JobContext, JobInput, JobManager};
pub use session::{
    DefaultServerSessionFactory, ServerSession, ServerSessionFactory, SessionFactoryRegistry,
};

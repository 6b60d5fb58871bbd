//! Errors raised inside the handler pipeline.

use crate::error::SqlError;
use crate::models::{Fault, FaultCode};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum WsError {
    /// A declared fault, returned to the caller as is.
    #[error("{0}")]
    Fault(Fault),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WsError {
    pub fn client_fault(reason: impl Into<String>) -> Self {
        Self::Fault(Fault::new(FaultCode::Client, reason))
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Sql(SqlError::Rejected { .. })
        )
    }

    /// The fault sent back to the caller. Undeclared failures are logged here
    /// and replaced by a generic internal-server-error fault.
    pub fn to_fault(&self) -> Fault {
        match self {
            Self::Fault(fault) => fault.clone(),
            Self::Rejected(reason) => Fault::new(FaultCode::Client, reason.clone()),
            Self::Sql(SqlError::Rejected { message }) => {
                Fault::new(FaultCode::Client, message.clone())
            }
            Self::Sql(e) => {
                error!(error = %e, "Unhandled SQL failure in web service call");
                Fault::internal_server_error()
            }
            Self::Internal(message) => {
                error!(error = %message, "Unhandled failure in web service call");
                Fault::internal_server_error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_client_fault() {
        let fault = WsError::rejected("no session").to_fault();
        assert_eq!(fault.code, FaultCode::Client);
        assert_eq!(fault.reason, "no session");

        let fault = WsError::from(SqlError::rejected("no session")).to_fault();
        assert_eq!(fault.code, FaultCode::Client);
    }

    #[test]
    fn test_undeclared_failure_is_hidden() {
        let err = WsError::from(SqlError::processing("ORA-00942: table or view does not exist"));
        let fault = err.to_fault();
        assert_eq!(fault, Fault::internal_server_error());
        assert!(!fault.reason.contains("ORA-00942"));
    }

    #[test]
    fn test_declared_fault_passes_through() {
        let fault = WsError::client_fault("Unauthorized").to_fault();
        assert_eq!(fault.reason, "Unauthorized");
    }
}

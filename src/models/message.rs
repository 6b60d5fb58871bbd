//! Messages flowing through the handler pipeline.

use serde::{Deserialize, Serialize};

/// Fault code categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultCode {
    /// The request was malformed or not acceptable.
    Client,
    /// The server failed while processing an acceptable request.
    Server,
    /// A header flagged as must-understand was not processed.
    MustUnderstand,
}

impl std::fmt::Display for FaultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "Client"),
            Self::Server => write!(f, "Server"),
            Self::MustUnderstand => write!(f, "MustUnderstand"),
        }
    }
}

/// A fault returned instead of a regular response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl Fault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Generic fault for undeclared failures. The cause is logged, never exposed.
    pub fn internal_server_error() -> Self {
        Self::new(FaultCode::Server, "Internal server error")
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

/// A message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub must_understand: bool,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            must_understand: false,
        }
    }

    pub fn must_understand(mut self) -> Self {
        self.must_understand = true;
        self
    }
}

/// A request or response message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Operation being invoked on the port type.
    pub operation: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl Message {
    pub fn new(operation: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            operation: operation.into(),
            headers: Vec::new(),
            body,
            fault: None,
        }
    }

    /// Build a fault message.
    pub fn from_fault(operation: impl Into<String>, fault: Fault) -> Self {
        Self {
            operation: operation.into(),
            headers: Vec::new(),
            body: serde_json::Value::Null,
            fault: Some(fault),
        }
    }

    pub fn with_header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    /// First header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&Header> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
    }

    /// Remove all headers with the given name and return how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }
}

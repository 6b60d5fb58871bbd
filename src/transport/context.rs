//! Per-request state shared by the tubes and handlers of a pipeline.

use crate::models::Message;
use crate::server::ServerSession;
use std::collections::HashMap;
use std::sync::Arc;

/// Whether the message travels towards the endpoint or back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Self::Inbound => Self::Outbound,
            Self::Outbound => Self::Inbound,
        }
    }
}

/// User name and password carried by a request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Parse `user:password`. The password may contain colons.
    pub fn parse(raw: &str) -> Option<Self> {
        let (user, password) = raw.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        Some(Self::new(user, password))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct MessageContext {
    pub direction: Direction,
    pub message: Message,
    /// Server session resolved or created for this request.
    pub session: Option<Arc<ServerSession>>,
    /// Name of the session factory declared on the port type.
    pub session_factory: Option<String>,
    /// Authenticated user.
    pub principal: Option<String>,
    pub credentials: Option<Credentials>,
    /// Addressing message id of the request.
    pub message_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl MessageContext {
    pub fn inbound(message: Message) -> Self {
        Self {
            direction: Direction::Inbound,
            message,
            ..Self::default()
        }
    }

    pub fn outbound(message: Message) -> Self {
        Self {
            direction: Direction::Outbound,
            message,
            ..Self::default()
        }
    }

    pub fn is_inbound(&self) -> bool {
        self.direction == Direction::Inbound
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Turn the context around once the message becomes the response.
    pub fn reverse(&mut self) {
        self.direction = self.direction.reversed();
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_parse() {
        let creds = Credentials::parse("alice:s3:cret").unwrap();
        assert_eq!(creds.user, "alice");
        assert_eq!(creds.password, "s3:cret");
        assert!(Credentials::parse("nocolon").is_none());
        assert!(Credentials::parse(":pw").is_none());
        assert!(!format!("{:?}", creds).contains("s3:cret"));
    }
}

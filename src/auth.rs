//! Authentication for server endpoints.
//!
//! Endpoints name an authentication handler and, optionally, a credential
//! validation strategy. Both are instantiated through an
//! [`AuthenticationRegistry`]; a failure to instantiate either is logged and
//! the endpoint starts without it.

use crate::error::SqlError;
use crate::server::SessionFactoryRegistry;
use crate::transport::context::{Credentials, MessageContext};
use crate::transport::error::WsError;
use crate::transport::handler::Handler;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, error, warn};

pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Decides whether a user name and password are acceptable.
pub trait CredentialValidationStrategy: Send + Sync {
    fn is_valid(&self, user: &str, password: &str) -> bool;
}

/// Users and passwords from configuration, given as `user:password;user2:password2`.
#[derive(Clone)]
pub struct ConfigCredentialValidationStrategy {
    users: HashMap<String, String>,
}

impl ConfigCredentialValidationStrategy {
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut users = HashMap::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let credentials = Credentials::parse(entry)
                .ok_or_else(|| format!("Invalid credential entry (expected user:password): '{}'", mask(entry)))?;
            if credentials.password.is_empty() {
                return Err(format!("Empty password for user '{}'", credentials.user));
            }
            users.insert(credentials.user, credentials.password);
        }
        if users.is_empty() {
            return Err("No credentials configured".to_string());
        }
        Ok(Self { users })
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl CredentialValidationStrategy for ConfigCredentialValidationStrategy {
    fn is_valid(&self, user: &str, password: &str) -> bool {
        match self.users.get(user) {
            Some(expected) => constant_time_eq(password.as_bytes(), expected.as_bytes()),
            None => false,
        }
    }
}

impl std::fmt::Debug for ConfigCredentialValidationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCredentialValidationStrategy")
            .field("users", &self.users.len())
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn mask(value: &str) -> String {
    if value.len() <= 3 {
        "***".to_string()
    } else {
        format!("{}***", &value[..3])
    }
}

/// Extract credentials from an `Authorization: Basic <base64>` header.
fn extract_basic_credentials(ctx: &MessageContext) -> Result<Option<Credentials>, &'static str> {
    let Some(header) = ctx.message.header(AUTHORIZATION_HEADER) else {
        return Ok(None);
    };
    let Some(encoded) = header.value.strip_prefix("Basic ") else {
        return Err("Invalid Authorization header format. Expected 'Basic <credentials>'");
    };
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| "Authorization header is not valid base64")?;
    let raw = String::from_utf8(decoded).map_err(|_| "Authorization header is not valid UTF-8")?;
    Credentials::parse(&raw)
        .map(Some)
        .ok_or("Authorization header does not contain user:password")
}

/// Authenticates inbound requests and creates their server session.
///
/// Credentials come from the message-level security header (already moved
/// into the context) or from a basic `Authorization` header. Requests that
/// already carry a session pass through.
pub struct BasicAuthenticationHandler {
    strategy: Option<Arc<dyn CredentialValidationStrategy>>,
    sessions: SessionFactoryRegistry,
}

impl BasicAuthenticationHandler {
    pub const NAME: &'static str = "basicAuthentication";

    pub fn new(
        strategy: Option<Arc<dyn CredentialValidationStrategy>>,
        sessions: SessionFactoryRegistry,
    ) -> Self {
        Self { strategy, sessions }
    }

    pub fn has_strategy(&self) -> bool {
        self.strategy.is_some()
    }

    async fn create_session(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        let Some(factory_name) = ctx.session_factory.clone() else {
            return Ok(());
        };
        let Some(factory) = self.sessions.get(&factory_name) else {
            warn!(session_factory = %factory_name, "Unknown session factory, no session created");
            return Ok(());
        };
        ctx.session = factory.create(ctx.principal.as_deref()).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for BasicAuthenticationHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn headers(&self) -> Vec<String> {
        vec![AUTHORIZATION_HEADER.to_string()]
    }

    async fn handle_message(&self, ctx: &mut MessageContext) -> Result<bool, WsError> {
        if !ctx.is_inbound() || ctx.session.is_some() {
            return Ok(true);
        }

        let credentials = match ctx.credentials.clone() {
            Some(credentials) => credentials,
            None => match extract_basic_credentials(ctx) {
                Ok(Some(credentials)) => credentials,
                Ok(None) => {
                    warn!("Authentication failed: no credentials");
                    return Err(WsError::client_fault("Unauthorized"));
                }
                Err(msg) => {
                    warn!(reason = msg, "Authentication failed: invalid header");
                    return Err(WsError::client_fault("Unauthorized"));
                }
            },
        };
        ctx.message.remove_header(AUTHORIZATION_HEADER);

        let Some(strategy) = &self.strategy else {
            warn!(user = %credentials.user, "Authentication failed: no credential validation strategy installed");
            return Err(WsError::client_fault("Unauthorized"));
        };
        if !strategy.is_valid(&credentials.user, &credentials.password) {
            warn!(user = %credentials.user, "Authentication failed: invalid credentials");
            return Err(WsError::client_fault("Unauthorized"));
        }

        debug!(user = %credentials.user, "Request authenticated");
        ctx.principal = Some(credentials.user.clone());
        ctx.credentials = Some(credentials);
        self.create_session(ctx).await?;
        Ok(true)
    }
}

type HandlerFactory = Arc<
    dyn Fn(Option<Arc<dyn CredentialValidationStrategy>>) -> Result<Arc<dyn Handler>, String>
        + Send
        + Sync,
>;
type StrategyFactory = Arc<dyn Fn() -> Result<Arc<dyn CredentialValidationStrategy>, String> + Send + Sync>;

/// Authentication handlers and credential validation strategies by name.
#[derive(Default, Clone)]
pub struct AuthenticationRegistry {
    handlers: HashMap<String, HandlerFactory>,
    strategies: HashMap<String, StrategyFactory>,
}

impl AuthenticationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`BasicAuthenticationHandler`] under its name.
    pub fn with_basic_authentication(sessions: SessionFactoryRegistry) -> Self {
        let mut registry = Self::new();
        registry.register_handler(BasicAuthenticationHandler::NAME, move |strategy| {
            Ok(Arc::new(BasicAuthenticationHandler::new(strategy, sessions.clone())) as Arc<dyn Handler>)
        });
        registry
    }

    pub fn register_handler<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(Option<Arc<dyn CredentialValidationStrategy>>) -> Result<Arc<dyn Handler>, String>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(factory));
    }

    pub fn register_strategy<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn CredentialValidationStrategy>, String> + Send + Sync + 'static,
    {
        self.strategies.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate the named handler with the named strategy. Failures are
    /// logged: an unusable strategy leaves the handler without one, an
    /// unusable handler yields `None`.
    pub fn create_handler(
        &self,
        endpoint: &str,
        handler: &str,
        strategy: Option<&str>,
    ) -> Option<Arc<dyn Handler>> {
        let strategy = strategy.and_then(|name| match self.create_strategy(name) {
            Ok(strategy) => Some(strategy),
            Err(e) => {
                error!(endpoint = endpoint, strategy = name, error = %e, "Failed to create credential validation strategy");
                None
            }
        });

        let result = match self.handlers.get(handler) {
            Some(factory) => factory(strategy).map_err(|e| {
                SqlError::configuration(format!("authentication handler '{}': {}", handler, e))
            }),
            None => Err(SqlError::configuration(format!(
                "unknown authentication handler '{}'",
                handler
            ))),
        };
        match result {
            Ok(handler) => Some(handler),
            Err(e) => {
                error!(endpoint = endpoint, error = %e, "Failed to install authentication handler");
                None
            }
        }
    }

    fn create_strategy(&self, name: &str) -> Result<Arc<dyn CredentialValidationStrategy>, SqlError> {
        let factory = self.strategies.get(name).ok_or_else(|| {
            SqlError::configuration(format!("unknown credential validation strategy '{}'", name))
        })?;
        factory().map_err(|e| SqlError::configuration(format!("credential validation strategy '{}': {}", name, e)))
    }
}

impl std::fmt::Debug for AuthenticationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        let mut strategies: Vec<&String> = self.strategies.keys().collect();
        strategies.sort();
        f.debug_struct("AuthenticationRegistry")
            .field("handlers", &handlers)
            .field("strategies", &strategies)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FaultCode, Header, Message};
    use crate::server::DefaultServerSessionFactory;

    fn strategy() -> Arc<dyn CredentialValidationStrategy> {
        Arc::new(ConfigCredentialValidationStrategy::parse("alice:secret; bob:hunter2").unwrap())
    }

    fn sessions() -> SessionFactoryRegistry {
        let sessions = SessionFactoryRegistry::new();
        sessions.register(Arc::new(DefaultServerSessionFactory::new("default")));
        sessions
    }

    fn basic(user: &str, password: &str) -> Header {
        let encoded = STANDARD.encode(format!("{}:{}", user, password));
        Header::new(AUTHORIZATION_HEADER, format!("Basic {}", encoded))
    }

    #[test]
    fn test_parse_strategy() {
        let parsed = ConfigCredentialValidationStrategy::parse("alice:secret;bob:hunter2").unwrap();
        assert_eq!(parsed.user_count(), 2);
        assert!(parsed.is_valid("alice", "secret"));
        assert!(!parsed.is_valid("alice", "secreT"));
        assert!(!parsed.is_valid("carol", "secret"));

        assert!(ConfigCredentialValidationStrategy::parse("").is_err());
        assert!(ConfigCredentialValidationStrategy::parse("alice").is_err());
        assert!(ConfigCredentialValidationStrategy::parse("alice:").is_err());
    }

    #[tokio::test]
    async fn test_basic_authentication_creates_session() {
        let handler = BasicAuthenticationHandler::new(Some(strategy()), sessions());
        let mut ctx = MessageContext::inbound(Message::default().with_header(basic("alice", "secret")));
        ctx.session_factory = Some("default".to_string());

        assert!(handler.handle_message(&mut ctx).await.unwrap());
        assert_eq!(ctx.principal.as_deref(), Some("alice"));
        assert_eq!(ctx.session.as_ref().and_then(|s| s.user_id()), Some("alice"));
        assert!(ctx.message.header(AUTHORIZATION_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_security_header_credentials() {
        let handler = BasicAuthenticationHandler::new(Some(strategy()), sessions());
        let mut ctx = MessageContext::inbound(Message::default());
        ctx.credentials = Some(Credentials::new("bob", "hunter2"));

        assert!(handler.handle_message(&mut ctx).await.unwrap());
        assert_eq!(ctx.principal.as_deref(), Some("bob"));
        assert!(ctx.session.is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let handler = BasicAuthenticationHandler::new(Some(strategy()), sessions());

        let mut ctx = MessageContext::inbound(Message::default().with_header(basic("alice", "wrong")));
        let err = handler.handle_message(&mut ctx).await.unwrap_err();
        assert_eq!(err.to_fault().code, FaultCode::Client);

        let mut ctx = MessageContext::inbound(Message::default());
        assert!(handler.handle_message(&mut ctx).await.is_err());

        let mut ctx = MessageContext::inbound(
            Message::default().with_header(Header::new(AUTHORIZATION_HEADER, "Bearer abc")),
        );
        assert!(handler.handle_message(&mut ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_without_strategy_rejects() {
        let handler = BasicAuthenticationHandler::new(None, sessions());
        let mut ctx = MessageContext::inbound(Message::default().with_header(basic("alice", "secret")));
        assert!(handler.handle_message(&mut ctx).await.is_err());
    }

    #[test]
    fn test_registry_degrades() {
        let mut registry = AuthenticationRegistry::with_basic_authentication(sessions());
        registry.register_strategy("broken", || Err("missing credentials".to_string()));

        assert!(registry.create_handler("orders", "unknown", None).is_none());
        assert!(registry.create_handler("orders", BasicAuthenticationHandler::NAME, Some("broken")).is_some());
        assert!(registry.create_handler("orders", BasicAuthenticationHandler::NAME, Some("missing")).is_some());
    }
}

//! Server sessions and the factories that create them.

use crate::error::SqlResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// An authenticated server-side session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSession {
    id: String,
    user_id: Option<String>,
}

impl ServerSession {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            user_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// Creates server sessions for a request.
#[async_trait]
pub trait ServerSessionFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Create a session for `principal`. `None` means no session can be
    /// created for this request.
    async fn create(&self, principal: Option<&str>) -> SqlResult<Option<Arc<ServerSession>>>;
}

/// Creates one session per authenticated principal and none for anonymous requests.
#[derive(Debug, Clone)]
pub struct DefaultServerSessionFactory {
    name: String,
}

impl DefaultServerSessionFactory {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ServerSessionFactory for DefaultServerSessionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, principal: Option<&str>) -> SqlResult<Option<Arc<ServerSession>>> {
        Ok(principal.map(|user| {
            let session = ServerSession::new(Some(user.to_string()));
            debug!(factory = %self.name, session_id = %session.id(), user = user, "Server session created");
            Arc::new(session)
        }))
    }
}

/// Session factories by name.
#[derive(Default, Clone)]
pub struct SessionFactoryRegistry {
    factories: Arc<RwLock<HashMap<String, Arc<dyn ServerSessionFactory>>>>,
}

impl SessionFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under its name, replacing any previous one.
    pub fn register(&self, factory: Arc<dyn ServerSessionFactory>) {
        if let Ok(mut factories) = self.factories.write() {
            factories.insert(factory.name().to_string(), factory);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServerSessionFactory>> {
        self.factories.read().ok()?.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SessionFactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactoryRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_factory() {
        let factory = DefaultServerSessionFactory::new("default");
        let session = factory.create(Some("alice")).await.unwrap().unwrap();
        assert_eq!(session.user_id(), Some("alice"));
        assert!(session.id().starts_with("session_"));
        assert!(factory.create(None).await.unwrap().is_none());
    }

    #[test]
    fn test_registry() {
        let registry = SessionFactoryRegistry::new();
        registry.register(Arc::new(DefaultServerSessionFactory::new("b")));
        registry.register(Arc::new(DefaultServerSessionFactory::new("a")));
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}

//! Message handlers and the transactional handler decorator.
//!
//! A [`Handler`] sees every message passing through the handler tube. Handlers
//! that declare a [`TransactionalMarker`] are wrapped by the assembler in a
//! [`TransactionalHandler`], which runs each chain call in its own unit of work
//! bound to a server session.

use crate::server::{JobInput, JobManager, ServerSession, ServerSessionFactory};
use crate::transport::context::MessageContext;
use crate::transport::error::WsError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Declares that a handler must run inside a unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionalMarker {
    /// Name of the session factory used when the request carries no session.
    pub session_factory: Option<String>,
}

impl TransactionalMarker {
    pub fn with_session_factory(name: impl Into<String>) -> Self {
        Self {
            session_factory: Some(name.into()),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// Header names this handler processes. Used by the must-understand check.
    fn headers(&self) -> Vec<String> {
        Vec::new()
    }

    /// Process a message. Returning `false` stops processing in this direction.
    async fn handle_message(&self, ctx: &mut MessageContext) -> Result<bool, WsError>;

    async fn handle_fault(&self, _ctx: &mut MessageContext) -> Result<bool, WsError> {
        Ok(true)
    }

    async fn close(&self, _ctx: &mut MessageContext) -> Result<(), WsError> {
        Ok(())
    }

    fn transactional(&self) -> Option<TransactionalMarker> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainMethod {
    HandleMessage,
    HandleFault,
    Close,
}

impl ChainMethod {
    fn as_str(self) -> &'static str {
        match self {
            Self::HandleMessage => "handleMessage",
            Self::HandleFault => "handleFault",
            Self::Close => "close",
        }
    }

    async fn invoke(self, handler: &dyn Handler, ctx: &mut MessageContext) -> Result<bool, WsError> {
        match self {
            Self::HandleMessage => handler.handle_message(ctx).await,
            Self::HandleFault => handler.handle_fault(ctx).await,
            Self::Close => handler.close(ctx).await.map(|()| true),
        }
    }
}

type ContextSlot = Arc<Mutex<Option<MessageContext>>>;

fn take_context(slot: &ContextSlot) -> Option<MessageContext> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn put_context(slot: &ContextSlot, ctx: MessageContext) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(ctx);
}

/// Runs every chain call of the wrapped handler in a new unit of work bound to
/// the request's server session.
pub struct TransactionalHandler {
    inner: Arc<dyn Handler>,
    session_factory: Arc<dyn ServerSessionFactory>,
    jobs: JobManager,
}

impl TransactionalHandler {
    pub fn new(
        inner: Arc<dyn Handler>,
        session_factory: Arc<dyn ServerSessionFactory>,
        jobs: JobManager,
    ) -> Self {
        Self {
            inner,
            session_factory,
            jobs,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Handler> {
        &self.inner
    }

    /// The session on the context, or a new one from the factory, which is
    /// then cached on the context.
    async fn resolve_session(&self, ctx: &mut MessageContext) -> Result<Arc<ServerSession>, WsError> {
        if let Some(session) = &ctx.session {
            return Ok(session.clone());
        }
        let created = match self.session_factory.create(ctx.principal.as_deref()).await {
            Ok(created) => created,
            Err(e) => {
                error!(
                    handler = self.inner.name(),
                    session_factory = self.session_factory.name(),
                    error = %e,
                    "Failed to create server session"
                );
                None
            }
        };
        match created {
            Some(session) => {
                ctx.session = Some(session.clone());
                Ok(session)
            }
            None => {
                warn!(
                    handler = self.inner.name(),
                    session_factory = self.session_factory.name(),
                    "No server session available for transactional handler"
                );
                Err(WsError::rejected(format!(
                    "No server session available to run handler '{}'",
                    self.inner.name()
                )))
            }
        }
    }

    async fn run(&self, method: ChainMethod, ctx: &mut MessageContext) -> Result<bool, WsError> {
        let session = self.resolve_session(ctx).await?;
        debug!(
            handler = self.inner.name(),
            method = method.as_str(),
            session_id = %session.id(),
            "Running handler in a new transaction"
        );

        let slot: ContextSlot = Arc::new(Mutex::new(Some(std::mem::take(ctx))));
        let job_slot = slot.clone();
        let inner = self.inner.clone();
        let input = JobInput::new(format!("{}.{}", self.inner.name(), method.as_str()), session);

        let result = self
            .jobs
            .run_now(input, move |_job| async move {
                let mut job_ctx = take_context(&job_slot)
                    .ok_or_else(|| WsError::Internal("message context missing".to_string()))?;
                let outcome = method.invoke(inner.as_ref(), &mut job_ctx).await;
                put_context(&job_slot, job_ctx);
                outcome
            })
            .await;

        if let Some(restored) = take_context(&slot) {
            *ctx = restored;
        }
        result
    }
}

#[async_trait]
impl Handler for TransactionalHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn headers(&self) -> Vec<String> {
        self.inner.headers()
    }

    async fn handle_message(&self, ctx: &mut MessageContext) -> Result<bool, WsError> {
        self.run(ChainMethod::HandleMessage, ctx).await
    }

    async fn handle_fault(&self, ctx: &mut MessageContext) -> Result<bool, WsError> {
        self.run(ChainMethod::HandleFault, ctx).await
    }

    async fn close(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        self.run(ChainMethod::Close, ctx).await.map(|_| ())
    }
}

/// First handler of every server chain. Stores the session factory declared
/// on the port type so later handlers create sessions the same way.
#[derive(Debug, Clone)]
pub struct PortTypeSessionFactoryRegistrationHandler {
    session_factory: Option<String>,
}

impl PortTypeSessionFactoryRegistrationHandler {
    pub const NAME: &'static str = "portTypeSessionFactoryRegistration";

    pub fn new(session_factory: Option<String>) -> Self {
        Self { session_factory }
    }
}

#[async_trait]
impl Handler for PortTypeSessionFactoryRegistrationHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle_message(&self, ctx: &mut MessageContext) -> Result<bool, WsError> {
        if ctx.is_inbound() && ctx.session_factory.is_none() {
            ctx.session_factory = self.session_factory.clone();
        }
        Ok(true)
    }
}

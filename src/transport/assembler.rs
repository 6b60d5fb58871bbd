//! Builds the server and client pipelines of a web service endpoint.
//!
//! Server pipeline, innermost first: terminal, validation, handler,
//! monitoring, addressing, must-understand, security.
//! Client pipeline, innermost first: transport, security, addressing,
//! must-understand, validation, handler.
//!
//! Handlers that declare a [`TransactionalMarker`](super::handler::TransactionalMarker)
//! are wrapped in a [`TransactionalHandler`] before the pipeline is built.

use crate::auth::AuthenticationRegistry;
use crate::models::Message;
use crate::server::{JobManager, SessionFactoryRegistry};
use crate::transport::context::MessageContext;
use crate::transport::handler::{
    Handler, PortTypeSessionFactoryRegistrationHandler, TransactionalHandler,
};
use crate::transport::tube::{
    AddressingTube, Endpoint, HandlerTube, MessageTransport, MonitoringStats, MonitoringTube,
    MustUnderstandTube, SecurityTube, Side, TerminalTube, TransportTube, Tube, ValidationTube,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Deployment settings of a server endpoint.
#[derive(Debug, Clone, Default)]
pub struct WebServiceDescriptor {
    pub name: String,
    pub authentication_handler: Option<String>,
    pub credential_validation_strategy: Option<String>,
    /// Session factory declared on the port type.
    pub session_factory: Option<String>,
}

impl WebServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_authentication(
        mut self,
        handler: impl Into<String>,
        strategy: Option<impl Into<String>>,
    ) -> Self {
        self.authentication_handler = Some(handler.into());
        self.credential_validation_strategy = strategy.map(Into::into);
        self
    }

    pub fn with_session_factory(mut self, name: impl Into<String>) -> Self {
        self.session_factory = Some(name.into());
        self
    }
}

/// An assembled pipeline.
pub struct Tubeline {
    name: String,
    side: Side,
    head: Arc<dyn Tube>,
}

impl Tubeline {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Tube names from the outermost to the innermost.
    pub fn tube_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut current = Some(&self.head);
        while let Some(tube) = current {
            names.push(tube.name());
            current = tube.next();
        }
        names
    }

    /// Context for a new call on this pipeline.
    pub fn new_context(&self, message: Message) -> MessageContext {
        match self.side {
            Side::Server => MessageContext::inbound(message),
            Side::Client => MessageContext::outbound(message),
        }
    }

    /// Run the context through the pipeline. Failures are turned into a fault
    /// message in the context.
    pub async fn process(&self, ctx: &mut MessageContext) {
        if let Err(e) = self.head.process(ctx).await {
            let operation = ctx.message.operation.clone();
            ctx.message = Message::from_fault(operation, e.to_fault());
        }
    }

    pub async fn call(&self, message: Message) -> Message {
        let mut ctx = self.new_context(message);
        self.process(&mut ctx).await;
        ctx.message
    }
}

impl std::fmt::Debug for Tubeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tubeline")
            .field("name", &self.name)
            .field("side", &self.side)
            .field("tubes", &self.tube_names())
            .finish()
    }
}

pub struct TubelineAssembler {
    sessions: SessionFactoryRegistry,
    jobs: JobManager,
    authentication: AuthenticationRegistry,
    stats: Arc<MonitoringStats>,
    /// Authentication handler per endpoint, created on first assembly.
    installed: Mutex<HashMap<String, Option<Arc<dyn Handler>>>>,
}

impl TubelineAssembler {
    pub fn new(
        sessions: SessionFactoryRegistry,
        jobs: JobManager,
        authentication: AuthenticationRegistry,
    ) -> Self {
        Self {
            sessions,
            jobs,
            authentication,
            stats: Arc::new(MonitoringStats::default()),
            installed: Mutex::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> &Arc<MonitoringStats> {
        &self.stats
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    fn authentication_handler(&self, descriptor: &WebServiceDescriptor) -> Option<Arc<dyn Handler>> {
        let handler_name = descriptor.authentication_handler.as_deref()?;
        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        installed
            .entry(descriptor.name.clone())
            .or_insert_with(|| {
                let handler = self.authentication.create_handler(
                    &descriptor.name,
                    handler_name,
                    descriptor.credential_validation_strategy.as_deref(),
                );
                if handler.is_some() {
                    info!(endpoint = %descriptor.name, handler = handler_name, "Authentication handler installed");
                }
                handler
            })
            .clone()
    }

    /// Replace `handler` by a transactional decorator if it asks for one.
    fn wrap_transactional(&self, endpoint: &str, handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
        let Some(marker) = handler.transactional() else {
            return handler;
        };
        let Some(factory_name) = marker.session_factory else {
            error!(
                endpoint = endpoint,
                handler = handler.name(),
                "Transactional handler declares no session factory, running it without a transaction"
            );
            return handler;
        };
        match self.sessions.get(&factory_name) {
            Some(factory) => Arc::new(TransactionalHandler::new(handler, factory, self.jobs.clone())),
            None => {
                error!(
                    endpoint = endpoint,
                    handler = handler.name(),
                    session_factory = %factory_name,
                    "Unknown session factory, running handler without a transaction"
                );
                handler
            }
        }
    }

    fn wrap_all(&self, endpoint: &str, handlers: Vec<Arc<dyn Handler>>) -> Vec<Arc<dyn Handler>> {
        handlers
            .into_iter()
            .map(|h| self.wrap_transactional(endpoint, h))
            .collect()
    }

    fn understood_headers(handlers: &[Arc<dyn Handler>]) -> Vec<String> {
        handlers.iter().flat_map(|h| h.headers()).collect()
    }

    pub fn create_server(
        &self,
        descriptor: &WebServiceDescriptor,
        endpoint: Arc<dyn Endpoint>,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> Tubeline {
        let mut chain: Vec<Arc<dyn Handler>> = Vec::with_capacity(handlers.len() + 2);
        chain.push(Arc::new(PortTypeSessionFactoryRegistrationHandler::new(
            descriptor.session_factory.clone(),
        )));
        if let Some(auth) = self.authentication_handler(descriptor) {
            chain.push(auth);
        }
        chain.extend(handlers);
        let chain = self.wrap_all(&descriptor.name, chain);
        let understood = Self::understood_headers(&chain);

        let tube: Arc<dyn Tube> = Arc::new(TerminalTube::new(endpoint));
        let tube: Arc<dyn Tube> = Arc::new(ValidationTube::new(tube));
        let tube: Arc<dyn Tube> = Arc::new(HandlerTube::new(chain, tube));
        let tube: Arc<dyn Tube> = Arc::new(MonitoringTube::new(
            descriptor.name.clone(),
            self.stats.clone(),
            tube,
        ));
        let tube: Arc<dyn Tube> = Arc::new(AddressingTube::new(Side::Server, tube));
        let tube: Arc<dyn Tube> = Arc::new(MustUnderstandTube::new(Side::Server, understood, tube));
        let head: Arc<dyn Tube> = Arc::new(SecurityTube::new(Side::Server, tube));

        Tubeline {
            name: descriptor.name.clone(),
            side: Side::Server,
            head,
        }
    }

    pub fn create_client(
        &self,
        name: impl Into<String>,
        transport: Arc<dyn MessageTransport>,
        handlers: Vec<Arc<dyn Handler>>,
    ) -> Tubeline {
        let name = name.into();
        let chain = self.wrap_all(&name, handlers);
        let understood = Self::understood_headers(&chain);

        let tube: Arc<dyn Tube> = Arc::new(TransportTube::new(transport));
        let tube: Arc<dyn Tube> = Arc::new(SecurityTube::new(Side::Client, tube));
        let tube: Arc<dyn Tube> = Arc::new(AddressingTube::new(Side::Client, tube));
        let tube: Arc<dyn Tube> = Arc::new(MustUnderstandTube::new(Side::Client, understood, tube));
        let tube: Arc<dyn Tube> = Arc::new(ValidationTube::new(tube));
        let head: Arc<dyn Tube> = Arc::new(HandlerTube::new(chain, tube));

        Tubeline {
            name,
            side: Side::Client,
            head,
        }
    }
}

impl std::fmt::Debug for TubelineAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubelineAssembler")
            .field("sessions", &self.sessions)
            .field("authentication", &self.authentication)
            .finish()
    }
}

//! Tubes: the stages of a message pipeline.
//!
//! Each tube does its request-side work, hands the context to the next tube,
//! then does its response-side work on the message the next tube left in the
//! context. The innermost tube (the endpoint on a server, the transport on a
//! client) turns the request into the response.

use crate::models::{Fault, FaultCode, Header, Message};
use crate::transport::context::{Credentials, MessageContext};
use crate::transport::error::WsError;
use crate::transport::handler::Handler;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const WSA_MESSAGE_ID: &str = "wsa:MessageID";
pub const WSA_ACTION: &str = "wsa:Action";
pub const WSA_RELATES_TO: &str = "wsa:RelatesTo";
pub const SECURITY_HEADER: &str = "wsse:Security";

#[async_trait]
pub trait Tube: Send + Sync {
    fn name(&self) -> &'static str;

    /// The tube this one hands the message to. `None` for the innermost tube.
    fn next(&self) -> Option<&Arc<dyn Tube>>;

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError>;
}

/// The port type implementation behind a server pipeline.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn invoke(&self, request: Message, ctx: &MessageContext) -> Result<Message, WsError>;
}

/// Carries a request to a remote endpoint and returns its response.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, request: Message) -> Result<Message, WsError>;
}

/// Which end of a call a tube sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

async fn forward(next: &Arc<dyn Tube>, ctx: &mut MessageContext) -> Result<(), WsError> {
    next.process(ctx).await
}

/// Invokes the endpoint. Innermost server tube.
pub struct TerminalTube {
    endpoint: Arc<dyn Endpoint>,
}

impl TerminalTube {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl Tube for TerminalTube {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        None
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        let request = ctx.message.clone();
        let response = self.endpoint.invoke(request, ctx).await?;
        ctx.message = response;
        ctx.reverse();
        Ok(())
    }
}

/// Sends the request over a [`MessageTransport`]. Innermost client tube.
pub struct TransportTube {
    transport: Arc<dyn MessageTransport>,
}

impl TransportTube {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Tube for TransportTube {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        None
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        ctx.message = self.transport.send(ctx.message.clone()).await?;
        ctx.reverse();
        Ok(())
    }
}

/// Rejects requests that name no operation, and responses that are neither
/// a fault nor tied to an operation.
pub struct ValidationTube {
    next: Arc<dyn Tube>,
}

impl ValidationTube {
    pub fn new(next: Arc<dyn Tube>) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Tube for ValidationTube {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        if ctx.message.operation.trim().is_empty() {
            return Err(WsError::client_fault("Message does not name an operation"));
        }
        forward(&self.next, ctx).await?;
        if !ctx.message.is_fault() && ctx.message.operation.trim().is_empty() {
            return Err(WsError::Internal(
                "Response does not name an operation".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs the handler chain around the rest of the pipeline.
///
/// On the request pass handlers run in chain order, on the response pass in
/// reverse. A handler returning `false` turns the message around: the inner
/// tubes are skipped and the handlers invoked before it see the message on
/// the way back. If a handler or an inner tube fails, the failure becomes a
/// fault message and `handle_fault` runs on the handlers that already ran.
/// `close` is called on every invoked handler.
pub struct HandlerTube {
    handlers: Vec<Arc<dyn Handler>>,
    next: Arc<dyn Tube>,
}

impl HandlerTube {
    pub fn new(handlers: Vec<Arc<dyn Handler>>, next: Arc<dyn Tube>) -> Self {
        Self { handlers, next }
    }

    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    /// Response pass over the first `count` handlers, last to first.
    async fn respond(&self, count: usize, ctx: &mut MessageContext) -> Result<(), WsError> {
        for handler in self.handlers[..count].iter().rev() {
            let proceed = if ctx.message.is_fault() {
                handler.handle_fault(ctx).await?
            } else {
                handler.handle_message(ctx).await?
            };
            if !proceed {
                debug!(handler = handler.name(), "Handler stopped response processing");
                break;
            }
        }
        Ok(())
    }

    async fn fault(&self, count: usize, error: &WsError, ctx: &mut MessageContext) {
        let operation = ctx.message.operation.clone();
        ctx.message = Message::from_fault(operation, error.to_fault());
        for handler in self.handlers[..count].iter().rev() {
            match handler.handle_fault(ctx).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(handler = handler.name(), error = %e, "handleFault failed");
                    break;
                }
            }
        }
    }

    async fn close_all(&self, count: usize, ctx: &mut MessageContext) {
        for handler in self.handlers[..count].iter().rev() {
            if let Err(e) = handler.close(ctx).await {
                warn!(handler = handler.name(), error = %e, "Handler close failed");
            }
        }
    }

    async fn run(&self, ctx: &mut MessageContext, invoked: &mut usize) -> Result<(), WsError> {
        let response_direction = ctx.direction.reversed();
        let mut turned_at = None;
        for (index, handler) in self.handlers.iter().enumerate() {
            *invoked = index + 1;
            match handler.handle_message(ctx).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(handler = handler.name(), "Handler stopped request processing");
                    turned_at = Some(index);
                    break;
                }
                Err(e) => {
                    ctx.direction = response_direction;
                    self.fault(index, &e, ctx).await;
                    return Ok(());
                }
            }
        }

        let respond_to = match turned_at {
            Some(index) => index,
            None => match forward(&self.next, ctx).await {
                Ok(()) => self.handlers.len(),
                Err(e) => {
                    ctx.direction = response_direction;
                    self.fault(self.handlers.len(), &e, ctx).await;
                    return Ok(());
                }
            },
        };
        ctx.direction = response_direction;
        self.respond(respond_to, ctx).await
    }
}

#[async_trait]
impl Tube for HandlerTube {
    fn name(&self) -> &'static str {
        "handler"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        let mut invoked = 0;
        let result = self.run(ctx, &mut invoked).await;
        self.close_all(invoked, ctx).await;
        result
    }
}

/// Request counters kept by a [`MonitoringTube`].
#[derive(Debug, Default)]
pub struct MonitoringStats {
    requests: AtomicU64,
    faults: AtomicU64,
    total_micros: AtomicU64,
}

/// Snapshot of [`MonitoringStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitoringSnapshot {
    pub requests: u64,
    pub faults: u64,
    pub total_micros: u64,
}

impl MonitoringStats {
    pub fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

pub struct MonitoringTube {
    endpoint: String,
    stats: Arc<MonitoringStats>,
    next: Arc<dyn Tube>,
}

impl MonitoringTube {
    pub fn new(endpoint: impl Into<String>, stats: Arc<MonitoringStats>, next: Arc<dyn Tube>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stats,
            next,
        }
    }
}

#[async_trait]
impl Tube for MonitoringTube {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        let start = Instant::now();
        let operation = ctx.message.operation.clone();
        let result = forward(&self.next, ctx).await;
        let elapsed = start.elapsed();

        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        let fault = result.is_err() || ctx.message.is_fault();
        if fault {
            self.stats.faults.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            endpoint = %self.endpoint,
            operation = %operation,
            fault = fault,
            duration_ms = elapsed.as_millis() as u64,
            "Web service call completed"
        );
        result
    }
}

/// Message addressing headers.
///
/// Server: records the request's message id, checks its action against the
/// operation, and stamps `RelatesTo` on the response. Client: stamps a new
/// message id and action on the request and checks `RelatesTo` on the response.
pub struct AddressingTube {
    side: Side,
    next: Arc<dyn Tube>,
}

impl AddressingTube {
    pub fn new(side: Side, next: Arc<dyn Tube>) -> Self {
        Self { side, next }
    }
}

#[async_trait]
impl Tube for AddressingTube {
    fn name(&self) -> &'static str {
        "addressing"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        match self.side {
            Side::Server => {
                if let Some(action) = ctx.message.header(WSA_ACTION) {
                    if action.value != ctx.message.operation {
                        return Err(WsError::client_fault(format!(
                            "Action '{}' does not match operation '{}'",
                            action.value, ctx.message.operation
                        )));
                    }
                }
                ctx.message_id = ctx.message.header(WSA_MESSAGE_ID).map(|h| h.value.clone());

                forward(&self.next, ctx).await?;

                if let Some(id) = ctx.message_id.clone() {
                    ctx.message.remove_header(WSA_RELATES_TO);
                    ctx.message.headers.push(Header::new(WSA_RELATES_TO, id));
                }
                if !ctx.message.is_fault() && ctx.message.header(WSA_ACTION).is_none() {
                    let action = format!("{}Response", ctx.message.operation);
                    ctx.message.headers.push(Header::new(WSA_ACTION, action));
                }
                Ok(())
            }
            Side::Client => {
                let id = format!("urn:uuid:{}", Uuid::new_v4());
                ctx.message.remove_header(WSA_MESSAGE_ID);
                ctx.message.headers.push(Header::new(WSA_MESSAGE_ID, id.clone()));
                if ctx.message.header(WSA_ACTION).is_none() {
                    let action = ctx.message.operation.clone();
                    ctx.message.headers.push(Header::new(WSA_ACTION, action));
                }
                ctx.message_id = Some(id.clone());

                forward(&self.next, ctx).await?;

                match ctx.message.header(WSA_RELATES_TO) {
                    Some(relates_to) if relates_to.value != id => Err(WsError::client_fault(
                        format!("Response relates to '{}', expected '{}'", relates_to.value, id),
                    )),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Rejects messages carrying must-understand headers nobody processes. The
/// server checks requests, the client checks responses.
pub struct MustUnderstandTube {
    side: Side,
    understood: HashSet<String>,
    next: Arc<dyn Tube>,
}

impl MustUnderstandTube {
    pub fn new<I, S>(side: Side, understood: I, next: Arc<dyn Tube>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let understood = understood
            .into_iter()
            .map(|s| s.as_ref().to_ascii_lowercase())
            .chain(
                [WSA_MESSAGE_ID, WSA_ACTION, WSA_RELATES_TO, SECURITY_HEADER]
                    .iter()
                    .map(|s| s.to_ascii_lowercase()),
            )
            .collect();
        Self {
            side,
            understood,
            next,
        }
    }

    fn check(&self, message: &Message) -> Result<(), WsError> {
        let missing: Vec<&str> = message
            .headers
            .iter()
            .filter(|h| h.must_understand && !self.understood.contains(&h.name.to_ascii_lowercase()))
            .map(|h| h.name.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(WsError::Fault(Fault::new(
                FaultCode::MustUnderstand,
                format!("Headers not understood: {}", missing.join(", ")),
            )))
        }
    }
}

#[async_trait]
impl Tube for MustUnderstandTube {
    fn name(&self) -> &'static str {
        match self.side {
            Side::Server => "serverMustUnderstand",
            Side::Client => "clientMustUnderstand",
        }
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        if self.side == Side::Server {
            self.check(&ctx.message)?;
        }
        forward(&self.next, ctx).await?;
        if self.side == Side::Client {
            self.check(&ctx.message)?;
        }
        Ok(())
    }
}

/// Message-level credentials. The server moves the security header into the
/// context; the client writes the context's credentials into the header.
pub struct SecurityTube {
    side: Side,
    next: Arc<dyn Tube>,
}

impl SecurityTube {
    pub fn new(side: Side, next: Arc<dyn Tube>) -> Self {
        Self { side, next }
    }
}

#[async_trait]
impl Tube for SecurityTube {
    fn name(&self) -> &'static str {
        "security"
    }

    fn next(&self) -> Option<&Arc<dyn Tube>> {
        Some(&self.next)
    }

    async fn process(&self, ctx: &mut MessageContext) -> Result<(), WsError> {
        match self.side {
            Side::Server => {
                if let Some(header) = ctx.message.header(SECURITY_HEADER) {
                    let credentials = Credentials::parse(&header.value)
                        .ok_or_else(|| WsError::client_fault("Malformed security header"))?;
                    ctx.credentials = Some(credentials);
                    ctx.message.remove_header(SECURITY_HEADER);
                }
            }
            Side::Client => {
                if let Some(credentials) = &ctx.credentials {
                    let value = format!("{}:{}", credentials.user, credentials.password);
                    ctx.message.remove_header(SECURITY_HEADER);
                    ctx.message
                        .headers
                        .push(Header::new(SECURITY_HEADER, value).must_understand());
                }
            }
        }
        forward(&self.next, ctx).await
    }
}

//! Handler registry for operations pushed by the peer.
//!
//! Handlers are keyed by operation code and target name (variable, function
//! or event). A per-code fallback handler catches targets without their own
//! entry.
//!
//! # Example
//!
//! ```
//! use aggwire_client::command::OperationCode;
//! use aggwire_client::handler::OperationRegistry;
//! use aggwire_client::table::{DataTable, Record};
//!
//! let mut registry = OperationRegistry::new();
//! registry.register(OperationCode::GetVariable, "uptime", |_data: DataTable, ctx| async move {
//!     ctx.respond(&DataTable::single(Record::new().with("uptime", 42))).await
//! });
//! assert!(registry.get_handler(OperationCode::GetVariable, "uptime").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use super::OperationContext;
use crate::command::{OperationCode, OperationMessage};
use crate::error::Result;
use crate::table::DataTable;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for operation handlers.
pub trait OperationHandler: Send + Sync + 'static {
    /// Handle an operation with its raw (still encoded) data parameter.
    fn call(&self, data: Option<&str>, ctx: OperationContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that decodes the data parameter into a [`DataTable`] first.
pub struct TypedHandler<F, Fut>
where
    F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
}

impl<F, Fut> TypedHandler<F, Fut>
where
    F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> OperationHandler for TypedHandler<F, Fut>
where
    F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, data: Option<&str>, ctx: OperationContext) -> BoxFuture<'static, HandlerResult> {
        let table = match ctx.codec().decode(data.unwrap_or("")) {
            Ok(t) => t,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        Box::pin((self.handler)(table, ctx))
    }
}

/// Registry mapping (operation code, target) to handlers.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<(OperationCode, String), Box<dyn OperationHandler>>,
    fallbacks: HashMap<OperationCode, Box<dyn OperationHandler>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one target.
    pub fn register<F, Fut>(&mut self, code: OperationCode, target: &str, handler: F)
    where
        F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .insert((code, target.to_string()), Box::new(TypedHandler::new(handler)));
    }

    /// Register a handler for every target of `code` without its own entry.
    pub fn register_fallback<F, Fut>(&mut self, code: OperationCode, handler: F)
    where
        F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.fallbacks.insert(code, Box::new(TypedHandler::new(handler)));
    }

    /// Register a handler object working on raw data.
    pub fn register_raw(&mut self, code: OperationCode, target: &str, handler: Box<dyn OperationHandler>) {
        self.handlers.insert((code, target.to_string()), handler);
    }

    pub fn get_handler(&self, code: OperationCode, target: &str) -> Option<&dyn OperationHandler> {
        self.handlers
            .get(&(code, target.to_string()))
            .or_else(|| self.fallbacks.get(&code))
            .map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len() + self.fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch an operation to its handler.
    ///
    /// Unknown operations are answered with an error reply. A handler that
    /// fails before replying gets its error sent back as the reply.
    pub async fn dispatch(&self, operation: &OperationMessage, ctx: OperationContext) -> Result<()> {
        let handler = match self.get_handler(operation.code, &operation.target) {
            Some(h) => h,
            None => {
                let message = format!(
                    "No handler for {:?} '{}' in '{}'",
                    operation.code, operation.target, operation.context
                );
                tracing::debug!("{}", message);
                return ctx.error(&message).await;
            }
        };

        match handler.call(operation.data.as_deref(), ctx.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if !ctx.has_replied() => {
                ctx.error(&e.to_string()).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("handlers", &self.handlers.len())
            .field("fallbacks", &self.fallbacks.len())
            .finish()
    }
}

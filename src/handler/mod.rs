//! Handler module - operations pushed by the peer.
//!
//! Provides:
//! - [`OperationRegistry`] - maps operation code and target to handlers
//! - [`OperationContext`] - lets handlers reply (respond, ack, deny, error)
//!
//! # Example
//!
//! ```
//! use aggwire_client::command::OperationCode;
//! use aggwire_client::handler::OperationRegistry;
//! use aggwire_client::table::DataTable;
//!
//! let mut registry = OperationRegistry::new();
//!
//! // Answer reads of the "status" variable
//! registry.register(OperationCode::GetVariable, "status", |_data: DataTable, ctx| async move {
//!     ctx.respond(&DataTable::new()).await
//! });
//!
//! // Accept any function call
//! registry.register_fallback(OperationCode::CallFunction, |_data, ctx| async move {
//!     ctx.ack().await
//! });
//! ```

mod context;
mod registry;

pub use context::OperationContext;
pub use registry::{BoxFuture, HandlerResult, OperationHandler, OperationRegistry, TypedHandler};

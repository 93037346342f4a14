//! Context module - the remote proxy object model.
//!
//! Provides:
//! - [`RemoteContextManager`] - owns the proxy tree and routes events into it
//! - [`ProxyContext`] - one lazily populated remote context
//! - [`VariableCache`] - TTL cache with read coalescing
//! - definitions, events and path helpers
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use aggwire_client::{Connection, RemoteContextManager};
//! use aggwire_client::table::DataTable;
//!
//! let connection = Arc::new(Connection::builder().connect_tcp("127.0.0.1:6460").await?);
//! let manager = RemoteContextManager::for_connection(connection)?;
//!
//! if let Some(admin) = manager.get("users.admin").await? {
//!     let info = admin.get_variable("childInfo").await?;
//!     admin.call_function("logout", &DataTable::new()).await?;
//! }
//! ```

mod cache;
mod category;
pub mod definitions;
pub mod event;
mod manager;
pub mod path;
mod proxy;

pub use cache::{VariableCache, CANCELLED_READ_RETRIES};
pub use category::{Category, CategoryState};
pub use definitions::{
    ActionDefinition, ContextInfo, ContextStatus, Definition, EventDefinition, FunctionDefinition,
    VariableDefinition,
};
pub use event::{ContextEvent, ContextEventListener, EventKind, ListenerId, ListenerOptions};
pub use manager::RemoteContextManager;
pub use proxy::{DeferredTask, ProxyContext};

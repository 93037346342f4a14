//! # aggwire-client
//!
//! Rust client runtime for the AggreGate-style device server protocol.
//!
//! The crate covers the full client side of a session:
//!
//! - **Frame codec** - length-prefixed binary frames with optional zlib
//!   bodies, or legacy delimited frames
//! - **Command model** - positional string parameters in delimiter or
//!   JSON-array form, with chunked writes for large parameters
//! - **Per-queue dispatcher** - serialized execution per queue name on the
//!   shared tokio worker pool
//! - **Remote proxy object model** - a tree of lazily populated remote
//!   contexts with a TTL variable cache, read coalescing and event-driven
//!   invalidation
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use aggwire_client::{Connection, ProtocolVersion, RemoteContextManager};
//!
//! #[tokio::main]
//! async fn main() -> aggwire_client::Result<()> {
//!     let connection = Connection::builder()
//!         .protocol_version(ProtocolVersion::V3)
//!         .connect_tcp("127.0.0.1:6460")
//!         .await?;
//!
//!     let manager = RemoteContextManager::for_connection(Arc::new(connection))?;
//!     for child in manager.root().children().await? {
//!         println!("{}", child.path());
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod protocol;
pub mod table;
pub mod writer;

pub use codec::{JsonTableCodec, TableCodec};
pub use command::{Command, CommandBuilder, EventMessage, OperationCode, OutgoingCommand};
pub use config::{ProtocolConfig, ProtocolVersion};
pub use connection::{Connection, ConnectionBuilder, RemoteConnection};
pub use context::{ContextEvent, ProxyContext, RemoteContextManager};
pub use dispatch::QueueDispatcher;
pub use error::{AggError, Result};
pub use handler::OperationContext;
pub use metrics::ProtocolMetrics;
pub use table::{DataTable, Record};

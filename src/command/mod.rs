//! Command model - parameter lists and their two wire forms.
//!
//! - [`Command`] - decoded incoming command with positional accessors
//! - [`OutgoingCommand`] - escaped, chunk-written parameter buffer
//! - [`CommandBuilder`] - request id allocation and operation requests
//! - [`Reply`], [`EventMessage`], [`OperationMessage`] - typed views

pub mod fields;
mod incoming;
mod message;
mod outgoing;
pub mod transfer;

pub use incoming::{Command, CommandForm};
pub use message::{EventMessage, OperationCode, OperationMessage, Reply, ReplyCode};
pub use outgoing::{CommandBuilder, EncodeLimits, OutgoingCommand};

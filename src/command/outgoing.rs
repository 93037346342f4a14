//! Outgoing command construction.
//!
//! [`OutgoingCommand`] streams escaped parameters into a growable buffer.
//! Parameters at or above the large-data threshold are copied in fixed-size
//! chunks, growing the buffer per chunk. Growth doubles until the ceiling
//! and is exact beyond it; nothing may grow past the maximum command size.
//!
//! [`CommandBuilder`] allocates request ids and builds the operation
//! requests a client sends.
//!
//! # Example
//!
//! ```
//! use aggwire_client::command::{Command, CommandBuilder, EncodeLimits};
//!
//! let builder = CommandBuilder::new(EncodeLimits::default());
//! let out = builder.get_variable("users.admin", "info").unwrap();
//! let decoded = Command::decode(out.content()).unwrap();
//! assert_eq!(decoded.params()[3], "G");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use super::fields::*;
use super::transfer;
use crate::config::{
    ProtocolConfig, DEFAULT_CHUNK_SIZE, DEFAULT_GROWTH_CEILING, DEFAULT_LARGE_DATA_SIZE,
    DEFAULT_MAX_COMMAND_SIZE,
};
use crate::error::{AggError, Result};

const INITIAL_CAPACITY: usize = 256;

/// Size limits applied while building a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeLimits {
    pub max_command_size: usize,
    pub growth_ceiling: usize,
    pub large_data_size: usize,
    pub chunk_size: usize,
}

impl Default for EncodeLimits {
    fn default() -> Self {
        Self {
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            growth_ceiling: DEFAULT_GROWTH_CEILING,
            large_data_size: DEFAULT_LARGE_DATA_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl From<&ProtocolConfig> for EncodeLimits {
    fn from(config: &ProtocolConfig) -> Self {
        Self {
            max_command_size: config.max_command_size,
            growth_ceiling: config.growth_ceiling,
            large_data_size: config.large_data_size,
            chunk_size: config.chunk_size.max(1),
        }
    }
}

/// A command being built for sending.
#[derive(Debug)]
pub struct OutgoingCommand {
    content: BytesMut,
    param_count: usize,
    id: Option<String>,
    timeout: Option<Duration>,
    limits: EncodeLimits,
    beyond_ceiling: bool,
}

impl OutgoingCommand {
    pub fn new() -> Self {
        Self::with_limits(EncodeLimits::default())
    }

    pub fn with_limits(limits: EncodeLimits) -> Self {
        Self {
            content: BytesMut::new(),
            param_count: 0,
            id: None,
            timeout: None,
            limits,
            beyond_ceiling: false,
        }
    }

    /// Build the JSON-array form from complete parameters.
    pub fn json<S: AsRef<str>>(params: &[S], limits: EncodeLimits) -> Result<Self> {
        let values: Vec<&str> = params.iter().map(AsRef::as_ref).collect();
        let encoded = serde_json::to_vec(&values)?;
        if encoded.len() > limits.max_command_size {
            return Err(AggError::CommandTooLarge {
                size: encoded.len(),
                max: limits.max_command_size,
            });
        }
        let mut cmd = Self::with_limits(limits);
        cmd.content = BytesMut::from(&encoded[..]);
        cmd.param_count = values.len();
        if values.len() > INDEX_ID && !values[INDEX_ID].is_empty() {
            cmd.id = Some(values[INDEX_ID].to_string());
        }
        Ok(cmd)
    }

    /// Append one parameter (escaped, preceded by the separator).
    pub fn add_param(&mut self, param: &str) -> Result<&mut Self> {
        let escaped = transfer::encode(param, self.param_count == 0);
        let bytes = escaped.as_bytes();

        if self.param_count > 0 {
            self.ensure_capacity(self.content.len() + 1)?;
            self.content.extend_from_slice(&[SEPARATOR]);
        }

        if bytes.len() >= self.limits.large_data_size {
            for chunk in bytes.chunks(self.limits.chunk_size) {
                self.ensure_capacity(self.content.len() + chunk.len())?;
                self.content.extend_from_slice(chunk);
            }
        } else {
            self.ensure_capacity(self.content.len() + bytes.len())?;
            self.content.extend_from_slice(bytes);
        }

        if self.param_count == INDEX_ID && !param.is_empty() {
            self.id = Some(param.to_string());
        }
        self.param_count += 1;
        Ok(self)
    }

    /// Append a parameter, writing an empty one for `None`.
    pub fn add_optional(&mut self, param: Option<&str>) -> Result<&mut Self> {
        self.add_param(param.unwrap_or(""))
    }

    fn ensure_capacity(&mut self, min_capacity: usize) -> Result<()> {
        if min_capacity > self.limits.max_command_size {
            return Err(AggError::CommandTooLarge {
                size: min_capacity,
                max: self.limits.max_command_size,
            });
        }

        let capacity = self.content.capacity();
        if min_capacity <= capacity {
            return Ok(());
        }

        let mut target = capacity.saturating_mul(2).max(INITIAL_CAPACITY).max(min_capacity);
        if target > self.limits.growth_ceiling {
            target = min_capacity.max(self.limits.growth_ceiling);
        }
        if min_capacity > self.limits.growth_ceiling {
            self.beyond_ceiling = true;
        }
        target = target.min(self.limits.max_command_size);

        self.content.reserve(target - self.content.len());
        Ok(())
    }

    #[inline]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Bytes {
        self.content.freeze()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.content.capacity()
    }

    #[inline]
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Request id (parameter 1) when one was written.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Reply timeout overriding the connection default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// True once some growth had to go past the doubling ceiling.
    ///
    /// A single oversized parameter sets this; callers that see it on
    /// repeated commands are facing sustained growth rather than one outlier.
    pub fn beyond_growth_ceiling(&self) -> bool {
        self.beyond_ceiling
    }

    pub fn reply_ok(id: &str, data: Option<&str>, limits: EncodeLimits) -> Result<Self> {
        let mut cmd = Self::with_limits(limits);
        cmd.add_param(COMMAND_CODE_REPLY)?
            .add_param(id)?
            .add_param(REPLY_CODE_OK)?;
        if let Some(data) = data {
            cmd.add_param(data)?;
        }
        Ok(cmd)
    }

    pub fn reply_error(
        id: &str,
        code: &str,
        message: &str,
        details: Option<&str>,
        limits: EncodeLimits,
    ) -> Result<Self> {
        let mut cmd = Self::with_limits(limits);
        cmd.add_param(COMMAND_CODE_REPLY)?
            .add_param(id)?
            .add_param(code)?
            .add_param(message)?;
        if let Some(details) = details {
            cmd.add_param(details)?;
        }
        Ok(cmd)
    }
}

impl Default for OutgoingCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates request ids and builds operation requests.
#[derive(Debug)]
pub struct CommandBuilder {
    next_id: AtomicU64,
    limits: EncodeLimits,
}

impl CommandBuilder {
    pub fn new(limits: EncodeLimits) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            limits,
        }
    }

    #[inline]
    pub fn limits(&self) -> EncodeLimits {
        self.limits
    }

    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn operation(&self, code: &str, context: &str, target: &str) -> Result<OutgoingCommand> {
        let mut cmd = OutgoingCommand::with_limits(self.limits);
        cmd.add_param(COMMAND_CODE_MESSAGE)?
            .add_param(&self.next_id())?
            .add_param(MESSAGE_CODE_OPERATION)?
            .add_param(code)?
            .add_param(context)?
            .add_param(target)?;
        Ok(cmd)
    }

    pub fn get_variable(&self, context: &str, name: &str) -> Result<OutgoingCommand> {
        self.operation(OPERATION_GET_VARIABLE, context, name)
    }

    pub fn set_variable(
        &self,
        context: &str,
        name: &str,
        encoded_value: &str,
        queue: Option<&str>,
    ) -> Result<OutgoingCommand> {
        let mut cmd = self.operation(OPERATION_SET_VARIABLE, context, name)?;
        cmd.add_param(encoded_value)?;
        if let Some(queue) = queue {
            cmd.add_param(queue)?;
        }
        Ok(cmd)
    }

    pub fn call_function(
        &self,
        context: &str,
        name: &str,
        encoded_params: &str,
        queue: Option<&str>,
        reply_required: bool,
    ) -> Result<OutgoingCommand> {
        let mut cmd = self.operation(OPERATION_CALL_FUNCTION, context, name)?;
        cmd.add_param(encoded_params)?;
        if queue.is_some() || !reply_required {
            cmd.add_optional(queue)?;
            cmd.add_param(if reply_required { "R" } else { "" })?;
        }
        Ok(cmd)
    }

    pub fn add_event_listener(
        &self,
        context: &str,
        event: &str,
        listener_code: Option<i64>,
        filter: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<OutgoingCommand> {
        self.listener_operation(
            OPERATION_ADD_EVENT_LISTENER,
            context,
            event,
            listener_code,
            filter,
            fingerprint,
        )
    }

    pub fn remove_event_listener(
        &self,
        context: &str,
        event: &str,
        listener_code: Option<i64>,
        filter: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<OutgoingCommand> {
        self.listener_operation(
            OPERATION_REMOVE_EVENT_LISTENER,
            context,
            event,
            listener_code,
            filter,
            fingerprint,
        )
    }

    fn listener_operation(
        &self,
        code: &str,
        context: &str,
        event: &str,
        listener_code: Option<i64>,
        filter: Option<&str>,
        fingerprint: Option<&str>,
    ) -> Result<OutgoingCommand> {
        let mut cmd = self.operation(code, context, event)?;
        let listener = listener_code.map(|c| c.to_string());
        cmd.add_optional(listener.as_deref())?
            .add_optional(filter)?
            .add_optional(fingerprint)?;
        Ok(cmd)
    }
}

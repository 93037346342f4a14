//! Operation context for handlers.
//!
//! Provides methods for answering an operation pushed by the peer:
//! - `respond` - OK reply carrying a data table
//! - `ack` - OK reply without data
//! - `deny` - denied reply
//! - `error` - error reply
//!
//! Only the first reply is sent; later calls are ignored. Operations that do
//! not require a reply (call-function without the `R` flag) never write.
//!
//! # Example
//!
//! ```ignore
//! async fn read_uptime(_data: DataTable, ctx: OperationContext) -> Result<()> {
//!     let table = DataTable::single(Record::new().with("uptime", 42));
//!     ctx.respond(&table).await
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::{JsonTableCodec, TableCodec};
use crate::command::fields::{REPLY_CODE_DENIED, REPLY_CODE_ERROR};
use crate::command::{EncodeLimits, OperationCode, OperationMessage, OutgoingCommand};
use crate::error::Result;
use crate::table::DataTable;
use crate::writer::WriterHandle;

/// Context passed to operation handlers.
///
/// `Clone`; all clones share the "already replied" flag.
#[derive(Clone)]
pub struct OperationContext {
    request_id: String,
    code: OperationCode,
    context: String,
    target: String,
    reply_required: bool,
    writer: Option<WriterHandle>,
    codec: Arc<dyn TableCodec>,
    limits: EncodeLimits,
    replied: Arc<AtomicBool>,
}

impl OperationContext {
    /// Context without a writer (testing mode): replies are dropped.
    pub fn detached(operation: &OperationMessage) -> Self {
        Self::build(
            operation,
            None,
            Arc::new(JsonTableCodec),
            EncodeLimits::default(),
        )
    }

    pub fn with_writer(
        operation: &OperationMessage,
        writer: WriterHandle,
        codec: Arc<dyn TableCodec>,
        limits: EncodeLimits,
    ) -> Self {
        Self::build(operation, Some(writer), codec, limits)
    }

    fn build(
        operation: &OperationMessage,
        writer: Option<WriterHandle>,
        codec: Arc<dyn TableCodec>,
        limits: EncodeLimits,
    ) -> Self {
        Self {
            request_id: operation.id.clone(),
            code: operation.code,
            context: operation.context.clone(),
            target: operation.target.clone(),
            reply_required: operation.reply_required(),
            writer,
            codec,
            limits,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[inline]
    pub fn code(&self) -> OperationCode {
        self.code
    }

    /// Remote path of the addressed context.
    #[inline]
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Variable, function or event name.
    #[inline]
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn codec(&self) -> &Arc<dyn TableCodec> {
        &self.codec
    }

    /// True once a reply was sent (or claimed) through any clone.
    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::Acquire)
    }

    /// Send an OK reply with an encoded table.
    pub async fn respond(&self, table: &DataTable) -> Result<()> {
        let encoded = self.codec.encode(table)?;
        self.send_reply(|id, limits| OutgoingCommand::reply_ok(id, Some(&encoded), limits))
            .await
    }

    /// Send an OK reply without data.
    pub async fn ack(&self) -> Result<()> {
        self.send_reply(|id, limits| OutgoingCommand::reply_ok(id, None, limits))
            .await
    }

    /// Send a denied reply.
    pub async fn deny(&self, message: &str) -> Result<()> {
        self.send_reply(|id, limits| {
            OutgoingCommand::reply_error(id, REPLY_CODE_DENIED, message, None, limits)
        })
        .await
    }

    /// Send an error reply.
    pub async fn error(&self, message: &str) -> Result<()> {
        self.send_reply(|id, limits| {
            OutgoingCommand::reply_error(id, REPLY_CODE_ERROR, message, None, limits)
        })
        .await
    }

    async fn send_reply<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(&str, EncodeLimits) -> Result<OutgoingCommand>,
    {
        if !self.reply_required || self.replied.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let writer = match &self.writer {
            Some(w) => w,
            None => {
                // No writer configured (testing mode)
                return Ok(());
            }
        };

        writer.send(build(&self.request_id, self.limits)?).await
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("request_id", &self.request_id)
            .field("code", &self.code)
            .field("context", &self.context)
            .field("target", &self.target)
            .field("replied", &self.has_replied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::ProtocolVersion;
    use crate::metrics::ProtocolMetrics;
    use crate::protocol::{FrameDecoder, FrameEncoder};
    use crate::table::Record;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use tokio::io::{duplex, AsyncReadExt};

    fn operation(code: &str, flags: Option<&str>) -> OperationMessage {
        let mut params = vec!["M", "7", "O", code, "users.admin", "uptime", ""];
        if let Some(flags) = flags {
            params.push("");
            params.push(flags);
        }
        Command::from_params(params).operation().unwrap()
    }

    #[test]
    fn test_context_accessors() {
        let ctx = OperationContext::detached(&operation("G", None));
        assert_eq!(ctx.request_id(), "7");
        assert_eq!(ctx.code(), OperationCode::GetVariable);
        assert_eq!(ctx.context(), "users.admin");
        assert_eq!(ctx.target(), "uptime");
        assert!(!ctx.has_replied());
    }

    #[tokio::test]
    async fn test_respond_without_writer() {
        let ctx = OperationContext::detached(&operation("G", None));
        assert!(ctx.respond(&DataTable::new()).await.is_ok());
        assert!(ctx.has_replied());
    }

    #[tokio::test]
    async fn test_clones_share_replied_flag() {
        let ctx = OperationContext::detached(&operation("S", None));
        let clone = ctx.clone();
        clone.ack().await.unwrap();
        assert!(ctx.has_replied());
    }

    #[tokio::test]
    async fn test_no_reply_when_not_required() {
        let ctx = OperationContext::detached(&operation("C", Some("")));
        ctx.ack().await.unwrap();
        assert!(!ctx.has_replied());
    }

    #[tokio::test]
    async fn test_respond_writes_single_reply_frame() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task(
            client,
            FrameEncoder::new(ProtocolVersion::V3),
            WriterConfig::default(),
            Arc::new(ProtocolMetrics::new()),
        );
        let ctx = OperationContext::with_writer(
            &operation("G", None),
            writer,
            Arc::new(JsonTableCodec),
            EncodeLimits::default(),
        );

        let table = DataTable::single(Record::new().with("uptime", 42));
        ctx.respond(&table).await.unwrap();
        // Second reply is ignored.
        ctx.error("late").await.unwrap();

        let mut decoder = FrameDecoder::with_defaults(ProtocolVersion::V3);
        let mut buf = vec![0u8; 4096];
        let mut commands = Vec::new();
        while commands.is_empty() {
            let n = server.read(&mut buf).await.unwrap();
            commands.extend(decoder.push(&buf[..n]).unwrap());
        }

        let reply = commands[0].reply().unwrap();
        assert_eq!(reply.id, "7");
        assert!(reply.is_ok());
        let decoded = JsonTableCodec.decode(reply.data().unwrap()).unwrap();
        assert_eq!(decoded, table);
    }
}

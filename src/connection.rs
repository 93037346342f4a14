//! Connection builder and runtime loop.
//!
//! The [`ConnectionBuilder`] provides a fluent API for configuring the
//! protocol, limits and operation handlers. The [`Connection`] manages the
//! lifecycle of one session:
//! 1. Split the transport into read and write halves
//! 2. Spawn the writer task
//! 3. Read frames, decode commands and route them:
//!    replies to waiting requests, events to the event channel, operations
//!    to handlers through the per-queue dispatcher
//! 4. On close, fail every waiting request with a disconnection error
//!
//! # Example
//!
//! ```ignore
//! use aggwire_client::{Connection, ProtocolVersion};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::builder()
//!         .protocol_version(ProtocolVersion::V3)
//!         .connect_tcp("127.0.0.1:6460")
//!         .await?;
//!
//!     let cmd = connection.command_builder().get_variable("users.admin", "info")?;
//!     let reply = connection.send_command(cmd, None).await?;
//!     println!("{:?}", reply.reply()?);
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{JsonTableCodec, TableCodec};
use crate::command::{
    Command, CommandBuilder, EncodeLimits, EventMessage, OperationCode, OutgoingCommand,
};
use crate::config::{ProtocolConfig, ProtocolVersion};
use crate::dispatch::QueueDispatcher;
use crate::error::{AggError, Result};
use crate::handler::{BoxFuture, HandlerResult, OperationContext, OperationRegistry};
use crate::metrics::ProtocolMetrics;
use crate::protocol::{FrameDecoder, FrameEncoder};
use crate::table::DataTable;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Session seam used by the proxy layer.
///
/// [`Connection`] is the production implementation; tests substitute a mock.
pub trait RemoteConnection: Send + Sync + 'static {
    /// Send a request and wait for its reply.
    ///
    /// `timeout` overrides the connection default; a timeout set on the
    /// command itself wins over both.
    fn send_command(
        &self,
        command: OutgoingCommand,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Command>>;

    /// Send a command that expects no reply.
    fn send_no_reply(&self, command: OutgoingCommand) -> BoxFuture<'_, Result<()>>;

    fn is_connected(&self) -> bool;

    fn protocol_version(&self) -> ProtocolVersion;

    fn command_builder(&self) -> &CommandBuilder;
}

/// Send `command` and turn denied/error replies into
/// [`AggError::RemoteDevice`]. Returns the reply's encoded data table.
pub async fn send_command_and_check_reply(
    connection: &dyn RemoteConnection,
    command: OutgoingCommand,
    timeout: Option<Duration>,
) -> Result<Option<String>> {
    let reply = connection.send_command(command, timeout).await?;
    reply.reply()?.into_result()
}

/// Builder for configuring and creating a [`Connection`].
pub struct ConnectionBuilder {
    version: ProtocolVersion,
    config: ProtocolConfig,
    registry: OperationRegistry,
    writer_config: WriterConfig,
    codec: Arc<dyn TableCodec>,
    metrics: Option<Arc<ProtocolMetrics>>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            version: ProtocolVersion::default(),
            config: ProtocolConfig::default(),
            registry: OperationRegistry::new(),
            writer_config: WriterConfig::default(),
            codec: Arc::new(JsonTableCodec),
            metrics: None,
        }
    }

    /// Default: V3
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    /// Table codec for operation data and replies. Default: JSON.
    pub fn codec(mut self, codec: Arc<dyn TableCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Share metrics with other connections.
    pub fn metrics(mut self, metrics: Arc<ProtocolMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register a handler for an operation the peer may push.
    pub fn handle<F, Fut>(mut self, code: OperationCode, target: &str, handler: F) -> Self
    where
        F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register(code, target, handler);
        self
    }

    /// Register a handler for every target of `code` without its own handler.
    pub fn handle_any<F, Fut>(mut self, code: OperationCode, handler: F) -> Self
    where
        F: Fn(DataTable, OperationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register_fallback(code, handler);
        self
    }

    /// Set the maximum pending frames for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Connect over TCP. The transport is used as is; authentication is
    /// left to the caller.
    pub async fn connect_tcp<A: ToSocketAddrs>(self, addr: A) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        self.connect(reader, writer)
    }

    /// Start the session over an already established transport.
    ///
    /// Must be called inside a tokio runtime.
    pub fn connect<R, W>(self, reader: R, writer: W) -> Result<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Connection::start(self, reader, writer)
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the connection handle and its read loop.
struct Shared {
    version: ProtocolVersion,
    config: ProtocolConfig,
    limits: EncodeLimits,
    builder: CommandBuilder,
    writer: WriterHandle,
    codec: Arc<dyn TableCodec>,
    registry: OperationRegistry,
    dispatcher: QueueDispatcher,
    metrics: Arc<ProtocolMetrics>,
    /// Reply waiters by request id.
    pending: DashMap<String, oneshot::Sender<Command>>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn mark_disconnected(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!("Connection closed: {}", reason);
        }
        // Dropping the senders wakes every waiter with a disconnection error.
        self.pending.clear();
        self.dispatcher.close();
        let _ = self.closed_tx.send(true);
    }
}

/// A running session with a remote peer.
pub struct Connection {
    shared: Arc<Shared>,
    event_rx: Mutex<Option<mpsc::Receiver<EventMessage>>>,
    closed_rx: watch::Receiver<bool>,
    read_task: JoinHandle<()>,
    _writer_watch: JoinHandle<()>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    fn start<R, W>(builder: ConnectionBuilder, reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let ConnectionBuilder {
            version,
            config,
            registry,
            writer_config,
            codec,
            metrics,
        } = builder;

        let dispatcher = QueueDispatcher::new()?;
        let metrics = metrics.unwrap_or_else(|| Arc::new(ProtocolMetrics::new()));
        let (writer, writer_task) = spawn_writer_task(
            writer,
            FrameEncoder::from_config(version, &config),
            writer_config,
            metrics.clone(),
        );
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (closed_tx, closed_rx) = watch::channel(false);
        let limits = EncodeLimits::from(&config);

        let shared = Arc::new(Shared {
            version,
            builder: CommandBuilder::new(limits),
            limits,
            config,
            writer,
            codec,
            registry,
            dispatcher,
            metrics,
            pending: DashMap::new(),
            connected: AtomicBool::new(true),
            closed_tx,
        });

        let loop_shared = shared.clone();
        let read_task = tokio::spawn(async move {
            let reason = match read_loop(reader, &loop_shared, event_tx).await {
                Ok(()) => "peer closed the connection".to_string(),
                Err(e) if e.is_disconnection() => e.to_string(),
                Err(e) => {
                    tracing::error!("Read loop error: {}", e);
                    e.to_string()
                }
            };
            loop_shared.mark_disconnected(&reason);
        });
        let writer_watch = tokio::spawn(watch_writer(writer_task, Arc::downgrade(&shared)));

        Ok(Self {
            shared,
            event_rx: Mutex::new(Some(event_rx)),
            closed_rx,
            read_task,
            _writer_watch: writer_watch,
        })
    }

    /// Take the receiver of incoming events. Only the first call gets it.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<EventMessage>> {
        self.event_rx.lock().take()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.shared.config
    }

    pub fn codec(&self) -> &Arc<dyn TableCodec> {
        &self.shared.codec
    }

    pub fn metrics(&self) -> &Arc<ProtocolMetrics> {
        &self.shared.metrics
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.shared.writer.is_backpressure_active()
    }

    pub fn pending_frames(&self) -> usize {
        self.shared.writer.pending_count()
    }

    async fn write_command(&self, command: OutgoingCommand) -> Result<()> {
        self.ensure_connected()?;
        self.shared.writer.send(command).await
    }

    /// Send an event to the peer.
    pub async fn send_event(&self, event: &EventMessage) -> Result<()> {
        self.write_command(event.to_command(self.shared.limits)?).await
    }

    async fn request(&self, command: OutgoingCommand, timeout: Option<Duration>) -> Result<Command> {
        self.ensure_connected()?;

        let id = command
            .id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AggError::Usage("Request has no id".to_string()))?
            .to_string();
        let timeout = command
            .timeout()
            .or(timeout)
            .unwrap_or(self.shared.config.reply_timeout);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id.clone(), tx);
        // Disconnect may have cleared the waiters just before the insert.
        if let Err(e) = self.ensure_connected() {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        if let Err(e) = self.shared.writer.send(command).await {
            self.shared.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(AggError::Disconnected(format!(
                "Connection lost while waiting for reply to request {}",
                id
            ))),
            Err(_) => {
                self.shared.pending.remove(&id);
                Err(AggError::Timeout(timeout))
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(AggError::Disconnected("Not connected".to_string()))
        }
    }

    /// Stop reading and fail every waiting request.
    pub fn close(&self) {
        self.read_task.abort();
        self.shared.mark_disconnected("closed locally");
    }

    /// Wait until the session ends (peer close, read error or [`close`](Self::close)).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl RemoteConnection for Connection {
    fn send_command(
        &self,
        command: OutgoingCommand,
        timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Command>> {
        Box::pin(self.request(command, timeout))
    }

    fn send_no_reply(&self, command: OutgoingCommand) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.write_command(command))
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.shared.version
    }

    fn command_builder(&self) -> &CommandBuilder {
        &self.shared.builder
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.read_task.abort();
        self.shared.mark_disconnected("connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("version", &self.shared.version)
            .field("connected", &self.shared.connected.load(Ordering::Acquire))
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

/// A failed write ends the session just like a failed read.
///
/// Holds the shared state weakly: the writer only stops cleanly once every
/// handle, including the one inside `Shared`, is gone.
async fn watch_writer(task: JoinHandle<Result<()>>, shared: Weak<Shared>) {
    let reason = match task.await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => format!("write failed: {}", e),
        Err(e) => format!("writer task failed: {}", e),
    };
    if let Some(shared) = shared.upgrade() {
        shared.mark_disconnected(&reason);
    }
}

/// Main read loop - decodes commands and routes them.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: &Arc<Shared>,
    events: mpsc::Sender<EventMessage>,
) -> Result<()> {
    let mut decoder = FrameDecoder::new(shared.version, &shared.config, shared.metrics.clone());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()), // Connection closed
            Ok(n) => n,
            Err(e) => return Err(AggError::Io(e)),
        };

        for command in decoder.push(&buf[..n])? {
            route_command(command, shared, &events);
        }
    }
}

fn route_command(command: Command, shared: &Arc<Shared>, events: &mpsc::Sender<EventMessage>) {
    let routed = if command.is_reply().unwrap_or(false) {
        route_reply(command, shared)
    } else if command.is_event().unwrap_or(false) {
        command.event().map(|event| route_event(event, events, &shared.metrics))
    } else if command.is_operation().unwrap_or(false) {
        route_operation(&command, shared)
    } else {
        Err(AggError::Protocol(format!(
            "Unexpected command with {} parameters",
            command.len()
        )))
    };

    if let Err(e) = routed {
        tracing::warn!("Dropping incoming command: {}", e);
    }
}

fn route_reply(command: Command, shared: &Shared) -> Result<()> {
    let id = command.id()?.to_string();
    match shared.pending.remove(&id) {
        Some((_, waiter)) => {
            // The waiter may have timed out in the meantime.
            let _ = waiter.send(command);
        }
        None => tracing::debug!("Reply to unknown request {}", id),
    }
    Ok(())
}

fn route_event(
    event: EventMessage,
    events: &mpsc::Sender<EventMessage>,
    metrics: &ProtocolMetrics,
) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(event)) => {
            metrics.record_event_dropped();
            tracing::warn!(
                "Event channel full, dropping '{}' from '{}'",
                event.name,
                event.context
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

fn route_operation(command: &Command, shared: &Arc<Shared>) -> Result<()> {
    let operation = command.operation()?;
    let ctx = OperationContext::with_writer(
        &operation,
        shared.writer.clone(),
        shared.codec.clone(),
        shared.limits,
    );
    let queue = operation.dispatch_queue();
    let task_shared = shared.clone();

    shared.dispatcher.submit(&queue, async move {
        task_shared.registry.dispatch(&operation, ctx).await
    })
}

//! Remote context manager - owns the proxy tree of one session.
//!
//! The manager creates the root proxy and pumps incoming events into the
//! tree. Event contexts are remote paths; they are translated to local
//! paths through the root's info before the target node is looked up.
//! Only nodes that are already loaded receive events; routing never
//! triggers a fetch.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::event::ContextEvent;
use super::proxy::{DeferredTask, ProxyContext, Runtime};
use crate::codec::{JsonTableCodec, TableCodec};
use crate::command::EventMessage;
use crate::config::ProtocolConfig;
use crate::connection::{Connection, RemoteConnection};
use crate::dispatch::QueueDispatcher;
use crate::error::Result;
use crate::table::DataTable;

pub struct RemoteContextManager {
    runtime: Arc<Runtime>,
    root: Arc<ProxyContext>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteContextManager {
    /// Manager with the default table codec. Must be created inside a
    /// tokio runtime.
    pub fn new(connection: Arc<dyn RemoteConnection>, config: ProtocolConfig) -> Result<Self> {
        Self::with_codec(connection, Arc::new(JsonTableCodec), config)
    }

    pub fn with_codec(
        connection: Arc<dyn RemoteConnection>,
        codec: Arc<dyn TableCodec>,
        config: ProtocolConfig,
    ) -> Result<Self> {
        let dispatcher = Arc::new(QueueDispatcher::new()?);
        let runtime = Arc::new(Runtime::new(connection, codec, dispatcher, config));
        let root = ProxyContext::new_root(runtime.clone());
        tracing::debug!("Remote context manager initialized");
        Ok(Self {
            runtime,
            root,
            pump: Mutex::new(None),
        })
    }

    /// Manager fed by the events of `connection`.
    pub fn for_connection(connection: Arc<Connection>) -> Result<Self> {
        let events = connection.take_event_receiver();
        let codec = connection.codec().clone();
        let config = connection.config().clone();
        let manager = Self::with_codec(connection, codec, config)?;
        match events {
            Some(events) => manager.start(events),
            None => tracing::warn!("Event receiver already taken; events will not be routed"),
        }
        Ok(manager)
    }

    /// Start routing events from `events` into the tree.
    pub fn start(&self, mut events: mpsc::Receiver<EventMessage>) {
        let root = self.root.clone();
        let codec = self.runtime.codec.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                route_event(&root, codec.as_ref(), message);
            }
            tracing::debug!("Event stream ended");
        });

        if let Some(previous) = self.pump.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn root(&self) -> &Arc<ProxyContext> {
        &self.root
    }

    /// Resolve a context, loading intermediate nodes as needed.
    pub async fn get(&self, path: &str) -> Result<Option<Arc<ProxyContext>>> {
        self.root.get(path).await
    }

    /// Node at local `path` if it is already loaded.
    pub fn find_loaded(&self, path: &str) -> Option<Arc<ProxyContext>> {
        self.root.find_loaded(path)
    }

    pub fn dispatcher(&self) -> &Arc<QueueDispatcher> {
        &self.runtime.dispatcher
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.runtime.config
    }

    /// Run `task` with the proxy at `path` as soon as it is loaded, which
    /// may be right away.
    pub fn execute_when_available<F>(&self, path: &str, task: F)
    where
        F: FnOnce(Arc<ProxyContext>) + Send + 'static,
    {
        if let Some(node) = self.root.find_loaded(path) {
            task(node);
            return;
        }

        let task: DeferredTask = Box::new(task);
        self.runtime.defer(path, task);
        // The node may have been created between the lookup and the defer.
        if let Some(node) = self.root.find_loaded(path) {
            self.runtime.run_deferred(&node);
        }
    }

    /// Tasks still waiting for their context.
    pub fn deferred_tasks(&self) -> usize {
        self.runtime.deferred_count()
    }

    /// Route one event synchronously.
    pub fn handle_event(&self, message: EventMessage) {
        route_event(&self.root, self.runtime.codec.as_ref(), message);
    }

    /// Stop routing events.
    pub fn stop(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.runtime.dispatcher.close();
    }
}

impl Drop for RemoteContextManager {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for RemoteContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteContextManager")
            .field("root", &self.root)
            .finish()
    }
}

fn route_event(root: &Arc<ProxyContext>, codec: &dyn TableCodec, message: EventMessage) {
    let local = root
        .cached_info()
        .and_then(|info| info.local_path(&message.context, false))
        .unwrap_or_else(|| message.context.clone());

    let node = match root.find_loaded(&local) {
        Some(node) => node,
        None => {
            tracing::trace!(
                "Dropping event '{}' for unloaded context '{}'",
                message.name,
                local
            );
            return;
        }
    };

    let data = match message.data.as_deref() {
        None | Some("") => DataTable::new(),
        Some(encoded) => codec.decode(encoded).unwrap_or_else(|e| {
            tracing::warn!(
                "Could not decode data of event '{}' for '{}': {}",
                message.name,
                local,
                e
            );
            DataTable::new()
        }),
    };

    let mut event = ContextEvent::new(local, message.name, data);
    event.level = message.level;
    event.id = message.event_id;
    event.listener = message.listener;
    event.creation_time = message.creation_time;
    node.handle_event(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandBuilder, EncodeLimits, OutgoingCommand};
    use crate::config::ProtocolVersion;
    use crate::error::AggError;
    use crate::handler::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Offline {
        builder: CommandBuilder,
    }

    impl RemoteConnection for Offline {
        fn send_command(
            &self,
            _command: OutgoingCommand,
            _timeout: Option<Duration>,
        ) -> BoxFuture<'_, Result<Command>> {
            Box::pin(async { Err(AggError::Disconnected("offline".into())) })
        }

        fn send_no_reply(&self, _command: OutgoingCommand) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(AggError::Disconnected("offline".into())) })
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn protocol_version(&self) -> ProtocolVersion {
            ProtocolVersion::V3
        }

        fn command_builder(&self) -> &CommandBuilder {
            &self.builder
        }
    }

    fn manager() -> RemoteContextManager {
        let connection = Arc::new(Offline {
            builder: CommandBuilder::new(EncodeLimits::default()),
        });
        RemoteContextManager::new(connection, ProtocolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_when_available_runs_for_loaded_root() {
        let manager = manager();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        manager.execute_when_available("", move |node| {
            assert_eq!(node.path(), "");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.deferred_tasks(), 0);
    }

    #[tokio::test]
    async fn test_execute_when_available_defers_unknown_path() {
        let manager = manager();
        manager.execute_when_available("users.admin", |_| {});
        assert_eq!(manager.deferred_tasks(), 1);
    }

    #[tokio::test]
    async fn test_event_for_unloaded_context_is_dropped() {
        let manager = manager();
        manager.handle_event(EventMessage::new("users.admin", "change").with_data("not a table"));
        assert!(manager.find_loaded("users.admin").is_none());
    }

    #[tokio::test]
    async fn test_stop_closes_dispatcher() {
        let manager = manager();
        manager
            .dispatcher()
            .submit("q", async { Ok(()) })
            .unwrap();
        manager.stop();
        tokio::task::yield_now().await;
        assert!(matches!(
            manager.dispatcher().submit("q", async { Ok(()) }),
            Err(AggError::QueueClosed(_))
        ));
    }
}

//! Proxy node mirroring one remote context.
//!
//! A [`ProxyContext`] is populated lazily, category by category, from the
//! metadata variables its peer publishes. Each category initializes at most
//! once until the node is reinitialized, and a stalled category never holds
//! up another one. Structural events received afterwards update the mirror
//! in place; variable change notifications invalidate the value cache.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use super::cache::VariableCache;
use super::category::{Begin, Category, CategoryCell};
use super::definitions::*;
use super::event::*;
use super::path;
use crate::codec::TableCodec;
use crate::command::OutgoingCommand;
use crate::config::ProtocolConfig;
use crate::connection::{send_command_and_check_reply, RemoteConnection};
use crate::dispatch::QueueDispatcher;
use crate::error::{AggError, Result};
use crate::handler::BoxFuture;
use crate::table::DataTable;

/// Task waiting for a context to appear.
pub type DeferredTask = Box<dyn FnOnce(Arc<ProxyContext>) + Send + 'static>;

const NOT_AVAILABLE: &str = "not available";

/// State shared by every node of one proxy tree.
pub(crate) struct Runtime {
    pub(crate) connection: Arc<dyn RemoteConnection>,
    pub(crate) codec: Arc<dyn TableCodec>,
    pub(crate) dispatcher: Arc<QueueDispatcher>,
    pub(crate) config: ProtocolConfig,
    deferred: Mutex<HashMap<String, Vec<DeferredTask>>>,
    next_listener_id: AtomicU64,
}

impl Runtime {
    pub(crate) fn new(
        connection: Arc<dyn RemoteConnection>,
        codec: Arc<dyn TableCodec>,
        dispatcher: Arc<QueueDispatcher>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            connection,
            codec,
            dispatcher,
            config,
            deferred: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn defer(&self, path: &str, task: DeferredTask) {
        self.deferred
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(task);
    }

    /// Run every task waiting for `node`'s path.
    pub(crate) fn run_deferred(&self, node: &Arc<ProxyContext>) {
        let tasks = self.deferred.lock().remove(node.path());
        for task in tasks.into_iter().flatten() {
            tracing::debug!("Running deferred task for '{}'", node.path());
            task(node.clone());
        }
    }

    pub(crate) fn deferred_count(&self) -> usize {
        self.deferred.lock().values().map(Vec::len).sum()
    }

    fn remote_listeners_enabled(&self) -> bool {
        self.config.manage_remote_listeners
            && self.connection.protocol_version().supports_listener_commands()
            && self.connection.is_connected()
    }

    fn decode(&self, data: Option<String>) -> Result<DataTable> {
        match data.as_deref() {
            None | Some("") => Ok(DataTable::new()),
            Some(encoded) => self.codec.decode(encoded),
        }
    }
}

pub struct ProxyContext {
    name: String,
    path: String,
    remote_path: RwLock<String>,
    parent: Weak<ProxyContext>,
    this: Weak<ProxyContext>,
    runtime: Arc<Runtime>,
    cells: [CategoryCell; 8],
    info: RwLock<Option<ContextInfo>>,
    children: RwLock<Vec<Arc<ProxyContext>>>,
    variables: RwLock<Vec<VariableDefinition>>,
    functions: RwLock<Vec<FunctionDefinition>>,
    events: RwLock<Vec<EventDefinition>>,
    actions: RwLock<Vec<ActionDefinition>>,
    status: RwLock<Option<ContextStatus>>,
    visible_children: RwLock<Vec<String>>,
    cache: VariableCache,
    listeners: Mutex<HashMap<String, Vec<ListenerEntry>>>,
    /// Events this node subscribed to for its own bookkeeping.
    internal_subscriptions: Mutex<HashSet<String>>,
}

impl ProxyContext {
    pub(crate) fn new_root(runtime: Arc<Runtime>) -> Arc<Self> {
        Self::create(path::ROOT, path::ROOT, path::ROOT, Weak::new(), runtime)
    }

    fn create(
        name: &str,
        local_path: &str,
        remote_path: &str,
        parent: Weak<ProxyContext>,
        runtime: Arc<Runtime>,
    ) -> Arc<Self> {
        let capacity = runtime.config.variable_cache_capacity;
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            path: local_path.to_string(),
            remote_path: RwLock::new(remote_path.to_string()),
            parent,
            this: this.clone(),
            runtime,
            cells: std::array::from_fn(|_| CategoryCell::new()),
            info: RwLock::new(None),
            children: RwLock::new(Vec::new()),
            variables: RwLock::new(Vec::new()),
            functions: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            actions: RwLock::new(Vec::new()),
            status: RwLock::new(None),
            visible_children: RwLock::new(Vec::new()),
            cache: VariableCache::new(capacity),
            listeners: Mutex::new(HashMap::new()),
            internal_subscriptions: Mutex::new(HashSet::new()),
        })
    }

    fn create_child(&self, name: &str) -> Arc<Self> {
        let remote = path::join(&self.remote_path(), name);
        Self::create(
            name,
            &path::join(&self.path, name),
            &remote,
            self.this.clone(),
            self.runtime.clone(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path the peer knows this context by.
    pub fn remote_path(&self) -> String {
        self.remote_path.read().clone()
    }

    pub fn parent(&self) -> Option<Arc<ProxyContext>> {
        self.parent.upgrade()
    }

    /// Info loaded so far, without fetching.
    pub fn cached_info(&self) -> Option<ContextInfo> {
        self.info.read().clone()
    }

    pub fn is_initialized(&self, category: Category) -> bool {
        self.cell(category).is_initialized()
    }

    /// Values currently held in the variable cache.
    pub fn cached_values(&self) -> usize {
        self.cache.len()
    }

    fn cell(&self, category: Category) -> &CategoryCell {
        &self.cells[category.index()]
    }

    fn root(&self) -> Option<Arc<ProxyContext>> {
        let mut node = self.this.upgrade()?;
        while let Some(parent) = node.parent() {
            node = parent;
        }
        Some(node)
    }

    // =========================================================================
    // Category initialization
    // =========================================================================

    /// Initialize `category` unless it is initialized or being initialized
    /// by another caller, in which case this returns at once.
    pub async fn ensure(&self, category: Category) -> Result<()> {
        let guard = match self.cell(category).begin() {
            Begin::AlreadyInitialized | Begin::InProgress => return Ok(()),
            Begin::Started(guard) => guard,
        };

        tracing::trace!("Initializing {} of '{}'", category, self.path);
        match self.init(category).await {
            Ok(()) => {
                if !guard.complete() {
                    tracing::debug!(
                        "{} of '{}' was reset during initialization",
                        category,
                        self.path
                    );
                }
                Ok(())
            }
            Err(e) => {
                drop(guard);
                if e.is_disconnection() {
                    tracing::debug!("Error initializing {} of '{}': {}", category, self.path, e);
                    Err(e)
                } else {
                    tracing::warn!("Error initializing {} of '{}': {}", category, self.path, e);
                    Err(AggError::Context(format!(
                        "Error initializing {} of context '{}': {}",
                        category, self.path, e
                    )))
                }
            }
        }
    }

    /// Like [`ensure`](Self::ensure), but waits for an initialization in
    /// progress elsewhere and retries once if that one failed.
    pub async fn require(&self, category: Category) -> Result<()> {
        let timeout = self.runtime.config.metadata_timeout;
        for _ in 0..2 {
            self.ensure(category).await?;
            let cell = self.cell(category);
            if cell.is_initialized() {
                return Ok(());
            }
            if !cell.wait_settled_for(timeout).await {
                return Err(AggError::Timeout(timeout));
            }
            if cell.is_initialized() {
                return Ok(());
            }
        }
        Err(AggError::Context(format!(
            "{} of context '{}' is not available",
            category, self.path
        )))
    }

    fn init(&self, category: Category) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            match category {
                Category::Info => self.init_info().await,
                Category::Children => self.init_children().await,
                Category::Variables => {
                    let table = self.read_definitions(V_VARIABLES, V_MODEL_VARIABLES).await?;
                    *self.variables.write() = parse_definitions(&table)?;
                    self.subscribe_internal(E_CHANGE).await;
                    self.subscribe_internal(E_UPDATED).await;
                    Ok(())
                }
                Category::Functions => {
                    let table = self.read_definitions(V_FUNCTIONS, V_MODEL_FUNCTIONS).await?;
                    *self.functions.write() = parse_definitions(&table)?;
                    Ok(())
                }
                Category::Events => {
                    let table = self.read_definitions(V_EVENTS, V_MODEL_EVENTS).await?;
                    *self.events.write() = parse_definitions(&table)?;
                    Ok(())
                }
                Category::Actions => {
                    let table = self.read_metadata(V_ACTIONS).await?;
                    *self.actions.write() = parse_definitions(&table)?;
                    Ok(())
                }
                Category::Status => self.init_status().await,
                Category::VisibleChildren => self.init_visible_children().await,
            }
        })
    }

    async fn init_info(&self) -> Result<()> {
        let table = self.read_metadata(V_INFO).await?;
        let info = ContextInfo::from_table(&table)?;
        if let Some(remote_path) = &info.remote_path {
            *self.remote_path.write() = remote_path.clone();
        }
        *self.info.write() = Some(info);
        Ok(())
    }

    async fn init_children(&self) -> Result<()> {
        let table = self.read_metadata(V_CHILDREN).await?;
        let created = {
            let mut children = self.children.write();
            let mut next = Vec::with_capacity(table.len());
            let mut created = Vec::new();
            for name in table.iter().filter_map(|r| r.string(VF_CHILDREN_NAME)) {
                match children.iter().find(|c| c.name == name) {
                    Some(existing) => next.push(existing.clone()),
                    None => {
                        let child = self.create_child(name);
                        created.push(child.clone());
                        next.push(child);
                    }
                }
            }
            *children = next;
            created
        };
        for child in &created {
            self.runtime.run_deferred(child);
        }
        Ok(())
    }

    async fn init_status(&self) -> Result<()> {
        self.require(Category::Variables).await?;
        if !self.has_variable(V_CONTEXT_STATUS) {
            *self.status.write() = None;
            return Ok(());
        }
        let table = self.read_metadata(V_CONTEXT_STATUS).await?;
        *self.status.write() = table.rec().map(ContextStatus::from_record);
        self.subscribe_internal(E_CONTEXT_STATUS_CHANGED).await;
        Ok(())
    }

    async fn init_visible_children(&self) -> Result<()> {
        self.require(Category::Variables).await?;
        let paths = if self.has_variable(V_VISIBLE_CHILDREN) {
            let table = self.read_metadata(V_VISIBLE_CHILDREN).await?;
            table
                .iter()
                .filter_map(|r| r.string(VF_VISIBLE_CHILDREN_PATH))
                .map(str::to_string)
                .collect()
        } else {
            Vec::new()
        };
        *self.visible_children.write() = paths;
        Ok(())
    }

    fn has_variable(&self, name: &str) -> bool {
        self.variables.read().iter().any(|d| d.name == name)
    }

    /// Read a definitions table, falling back to the model variant for
    /// model contexts that do not publish the standard one.
    async fn read_definitions(&self, standard: &str, model: &str) -> Result<DataTable> {
        match self.read_metadata(standard).await {
            Err(AggError::RemoteDevice { message, .. }) if message.contains(NOT_AVAILABLE) => {
                self.require(Category::Info).await?;
                let is_model = self.info.read().as_ref().map_or(false, ContextInfo::is_model);
                if !is_model {
                    return Err(AggError::Context(format!(
                        "Variable '{}' of context '{}' is {}",
                        standard, self.path, NOT_AVAILABLE
                    )));
                }
                tracing::debug!("Reading '{}' of model context '{}'", model, self.path);
                self.read_metadata(model).await
            }
            other => other,
        }
    }

    /// Uncached read with the metadata timeout.
    async fn read_metadata(&self, name: &str) -> Result<DataTable> {
        let mut cmd = self
            .runtime
            .connection
            .command_builder()
            .get_variable(&self.remote_path(), name)?;
        cmd.set_timeout(Some(self.runtime.config.metadata_timeout));
        self.request(cmd, None).await
    }

    async fn request(&self, cmd: OutgoingCommand, timeout: Option<Duration>) -> Result<DataTable> {
        let data =
            send_command_and_check_reply(self.runtime.connection.as_ref(), cmd, timeout).await?;
        self.runtime.decode(data)
    }

    // =========================================================================
    // Metadata accessors
    // =========================================================================

    pub async fn info(&self) -> Result<ContextInfo> {
        self.require(Category::Info).await?;
        Ok(self.info.read().clone().unwrap_or_default())
    }

    /// Translate a remote absolute path into this node's local namespace.
    pub async fn local_path(&self, remote_full_path: &str, visible: bool) -> Result<Option<String>> {
        Ok(self.info().await?.local_path(remote_full_path, visible))
    }

    pub async fn local_primary_path(&self, remote_full_path: &str) -> Result<Option<String>> {
        Ok(self.info().await?.local_primary_path(remote_full_path))
    }

    pub async fn children(&self) -> Result<Vec<Arc<ProxyContext>>> {
        self.require(Category::Children).await?;
        Ok(self.children.read().clone())
    }

    pub async fn child(&self, name: &str) -> Result<Option<Arc<ProxyContext>>> {
        self.require(Category::Children).await?;
        Ok(self.loaded_child(name))
    }

    fn loaded_child(&self, name: &str) -> Option<Arc<ProxyContext>> {
        self.children.read().iter().find(|c| c.name == name).cloned()
    }

    /// Resolve a context path. Paths starting with the separator are
    /// relative to this node; others are absolute remote paths.
    pub async fn get(&self, context_path: &str) -> Result<Option<Arc<ProxyContext>>> {
        let (start, relative) = if path::is_relative(context_path) {
            match self.this.upgrade() {
                Some(node) => (node, context_path.to_string()),
                None => return Ok(None),
            }
        } else {
            let root = match self.root() {
                Some(root) => root,
                None => return Ok(None),
            };
            let local = root
                .local_path(context_path, false)
                .await?
                .unwrap_or_else(|| context_path.to_string());
            (root, local)
        };

        let mut node = start;
        for segment in path::segments(&relative) {
            node = match node.child(segment).await? {
                Some(child) => child,
                None => return Ok(None),
            };
        }
        Ok(Some(node))
    }

    /// Node at local `context_path` if already loaded. Never fetches.
    pub fn find_loaded(&self, context_path: &str) -> Option<Arc<ProxyContext>> {
        let mut node = self.this.upgrade()?;
        let relative = context_path
            .strip_prefix(self.path.as_str())
            .unwrap_or(context_path);
        for segment in path::segments(relative) {
            node = node.loaded_child(segment)?;
        }
        Some(node)
    }

    pub async fn variable_definitions(&self) -> Result<Vec<VariableDefinition>> {
        self.require(Category::Variables).await?;
        Ok(self.variables.read().clone())
    }

    pub async fn variable_definition(&self, name: &str) -> Result<Option<VariableDefinition>> {
        self.require(Category::Variables).await?;
        Ok(self.variables.read().iter().find(|d| d.name == name).cloned())
    }

    pub async fn function_definitions(&self) -> Result<Vec<FunctionDefinition>> {
        self.require(Category::Functions).await?;
        Ok(self.functions.read().clone())
    }

    pub async fn function_definition(&self, name: &str) -> Result<Option<FunctionDefinition>> {
        self.require(Category::Functions).await?;
        Ok(self.functions.read().iter().find(|d| d.name == name).cloned())
    }

    pub async fn event_definitions(&self) -> Result<Vec<EventDefinition>> {
        self.require(Category::Events).await?;
        Ok(self.events.read().clone())
    }

    pub async fn event_definition(&self, name: &str) -> Result<Option<EventDefinition>> {
        self.require(Category::Events).await?;
        Ok(self.events.read().iter().find(|d| d.name == name).cloned())
    }

    pub async fn action_definitions(&self) -> Result<Vec<ActionDefinition>> {
        self.require(Category::Actions).await?;
        Ok(self.actions.read().clone())
    }

    pub async fn action_definition(&self, name: &str) -> Result<Option<ActionDefinition>> {
        self.require(Category::Actions).await?;
        Ok(self.actions.read().iter().find(|d| d.name == name).cloned())
    }

    /// `None` when the context publishes no status.
    pub async fn status(&self) -> Result<Option<ContextStatus>> {
        self.require(Category::Status).await?;
        Ok(self.status.read().clone())
    }

    pub async fn visible_children(&self) -> Result<Vec<String>> {
        self.require(Category::VisibleChildren).await?;
        Ok(self.visible_children.read().clone())
    }

    // =========================================================================
    // Variables and functions
    // =========================================================================

    /// Read a variable. Metadata variables are read directly; defined
    /// variables go through the cache.
    pub async fn get_variable(&self, name: &str) -> Result<DataTable> {
        if is_metadata_variable(name) {
            return self.read_metadata(name).await;
        }

        let def = self
            .variable_definition(name)
            .await?
            .ok_or_else(|| self.not_found("Variable", name))?;
        if !def.readable {
            return Err(AggError::Context(format!(
                "Variable '{}' of context '{}' is not readable",
                name, self.path
            )));
        }
        self.get_remote_variable(&def).await
    }

    /// Coalesced read of a defined variable, cached for its TTL.
    pub async fn get_remote_variable(&self, def: &VariableDefinition) -> Result<DataTable> {
        self.cache
            .read_through(&def.name, def.cache_ttl, || self.fetch_variable(&def.name))
            .await
    }

    async fn fetch_variable(&self, name: &str) -> Result<DataTable> {
        tracing::trace!("Reading variable '{}' of '{}'", name, self.path);
        let cmd = self
            .runtime
            .connection
            .command_builder()
            .get_variable(&self.remote_path(), name)?;
        self.request(cmd, None).await
    }

    /// Write a variable. The cached value is invalidated once the peer
    /// acknowledged the write.
    pub async fn set_variable(&self, name: &str, value: &DataTable) -> Result<()> {
        self.write_variable(name, value, None).await
    }

    /// Write through the per-queue dispatcher, serialized with other work
    /// submitted to `queue`.
    pub async fn set_variable_in_queue(
        &self,
        name: &str,
        value: DataTable,
        queue: &str,
    ) -> Result<()> {
        let this = self.arc()?;
        let name = name.to_string();
        let queue_name = queue.to_string();
        self.run_in_queue(queue, async move {
            this.write_variable(&name, &value, Some(&queue_name)).await
        })
        .await
    }

    async fn write_variable(&self, name: &str, value: &DataTable, queue: Option<&str>) -> Result<()> {
        let def = self
            .variable_definition(name)
            .await?
            .ok_or_else(|| self.not_found("Variable", name))?;
        if !def.writable {
            return Err(AggError::Context(format!(
                "Variable '{}' of context '{}' is not writable",
                name, self.path
            )));
        }

        let encoded = self.runtime.codec.encode(value)?;
        let cmd = self.runtime.connection.command_builder().set_variable(
            &self.remote_path(),
            name,
            &encoded,
            queue,
        )?;
        send_command_and_check_reply(self.runtime.connection.as_ref(), cmd, None).await?;
        self.cache.invalidate(name);
        Ok(())
    }

    /// Call a function and wait for its output.
    pub async fn call_function(&self, name: &str, params: &DataTable) -> Result<DataTable> {
        if name == F_LOCAL_REINITIALIZE {
            self.reinitialize().await;
            return Ok(DataTable::new());
        }
        self.invoke_function(name, params, None).await
    }

    /// Call a function without waiting for a reply.
    pub async fn call_function_no_reply(&self, name: &str, params: &DataTable) -> Result<()> {
        if name == F_LOCAL_REINITIALIZE {
            self.reinitialize().await;
            return Ok(());
        }
        self.require_function(name).await?;
        let encoded = self.runtime.codec.encode(params)?;
        let cmd = self.runtime.connection.command_builder().call_function(
            &self.remote_path(),
            name,
            &encoded,
            None,
            false,
        )?;
        self.runtime.connection.send_no_reply(cmd).await
    }

    pub async fn call_function_in_queue(
        &self,
        name: &str,
        params: DataTable,
        queue: &str,
    ) -> Result<DataTable> {
        let this = self.arc()?;
        let name = name.to_string();
        let queue_name = queue.to_string();
        self.run_in_queue(queue, async move {
            this.invoke_function(&name, &params, Some(&queue_name)).await
        })
        .await
    }

    async fn invoke_function(
        &self,
        name: &str,
        params: &DataTable,
        queue: Option<&str>,
    ) -> Result<DataTable> {
        self.require_function(name).await?;
        let encoded = self.runtime.codec.encode(params)?;
        let cmd = self.runtime.connection.command_builder().call_function(
            &self.remote_path(),
            name,
            &encoded,
            queue,
            true,
        )?;
        self.request(cmd, None).await
    }

    async fn require_function(&self, name: &str) -> Result<FunctionDefinition> {
        self.function_definition(name)
            .await?
            .ok_or_else(|| self.not_found("Function", name))
    }

    async fn run_in_queue<T, F>(&self, queue: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.runtime.dispatcher.submit(queue, async move {
            let _ = tx.send(work.await);
            Ok(())
        })?;
        rx.await
            .map_err(|_| AggError::QueueClosed(queue.to_string()))?
    }

    fn arc(&self) -> Result<Arc<ProxyContext>> {
        self.this
            .upgrade()
            .ok_or_else(|| AggError::Context(format!("Context '{}' was dropped", self.path)))
    }

    fn not_found(&self, what: &str, name: &str) -> AggError {
        AggError::Context(format!(
            "{} '{}' not found in context '{}'",
            what, name, self.path
        ))
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a listener for event `name`.
    ///
    /// The peer is asked to deliver the event unless it does so for every
    /// client anyway.
    pub async fn add_event_listener<L>(
        &self,
        name: &str,
        listener: L,
        options: ListenerOptions,
    ) -> Result<ListenerId>
    where
        L: ContextEventListener,
    {
        self.event_definition(name)
            .await?
            .ok_or_else(|| self.not_found("Event", name))?;

        let id = ListenerId(self.runtime.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let entry = ListenerEntry {
            id,
            options,
            listener: Arc::new(listener),
        };
        let needs_remote = needs_remote_subscription(name, &entry.options);
        let options = entry.options.clone();
        self.listeners
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(entry);

        if needs_remote {
            if let Err(e) = self.subscribe_remote(name, &options).await {
                self.detach_listener(name, id);
                return Err(e);
            }
        }
        tracing::debug!("Added {} for '{}' of '{}'", id, name, self.path);
        Ok(id)
    }

    /// Remove a listener. Returns false when nothing was removed or the
    /// peer could not be told because the session dropped.
    pub async fn remove_event_listener(&self, name: &str, id: ListenerId) -> Result<bool> {
        if !self.is_initialized(Category::Events) {
            return Ok(false);
        }

        let (removed, remaining) = match self.detach_listener(name, id) {
            Some(found) => found,
            None => return Ok(false),
        };

        let defined = self.events.read().iter().any(|d| d.name == name);
        if remaining == 0
            && defined
            && needs_remote_subscription(name, &removed.options)
            && self.runtime.remote_listeners_enabled()
        {
            let cmd = self.runtime.connection.command_builder().remove_event_listener(
                &self.remote_path(),
                name,
                removed.options.code,
                removed.options.filter.as_deref(),
                removed.options.fingerprint.as_deref(),
            )?;
            let timeout = Some(self.runtime.config.listener_timeout);
            match send_command_and_check_reply(self.runtime.connection.as_ref(), cmd, timeout).await
            {
                Ok(_) => {}
                Err(e) if e.is_disconnection() => {
                    tracing::debug!(
                        "Disconnected while removing listener for '{}' of '{}': {}",
                        name,
                        self.path,
                        e
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.listeners.lock().get(name).map_or(0, Vec::len)
    }

    /// Remove a listener locally; returns it with the number left for `name`.
    fn detach_listener(&self, name: &str, id: ListenerId) -> Option<(ListenerEntry, usize)> {
        let mut listeners = self.listeners.lock();
        let entries = listeners.get_mut(name)?;
        let index = entries.iter().position(|e| e.id == id)?;
        let removed = entries.remove(index);
        let remaining = entries.len();
        if remaining == 0 {
            listeners.remove(name);
        }
        Some((removed, remaining))
    }

    async fn subscribe_remote(&self, name: &str, options: &ListenerOptions) -> Result<()> {
        if !self.runtime.remote_listeners_enabled() {
            return Ok(());
        }
        let cmd = self.runtime.connection.command_builder().add_event_listener(
            &self.remote_path(),
            name,
            options.code,
            options.filter.as_deref(),
            options.fingerprint.as_deref(),
        )?;
        let timeout = Some(self.runtime.config.listener_timeout);
        send_command_and_check_reply(self.runtime.connection.as_ref(), cmd, timeout).await?;
        Ok(())
    }

    /// Best-effort subscription for events the node handles itself.
    async fn subscribe_internal(&self, name: &str) {
        if !self.internal_subscriptions.lock().insert(name.to_string()) {
            return;
        }
        if let Err(e) = self.subscribe_remote(name, &ListenerOptions::default()).await {
            self.internal_subscriptions.lock().remove(name);
            if e.is_disconnection() {
                tracing::debug!("Could not subscribe '{}' of '{}': {}", name, self.path, e);
            } else {
                tracing::warn!("Could not subscribe '{}' of '{}': {}", name, self.path, e);
            }
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Apply an event to the mirror, then pass it to the registered listeners.
    pub fn handle_event(&self, event: &ContextEvent) {
        match event.kind {
            EventKind::ChildAdded => {
                if let Some(child) = event.field(EF_CHILD) {
                    self.on_child_added(child);
                }
            }
            EventKind::ChildRemoved => {
                if let Some(child) = event.field(EF_CHILD) {
                    self.on_child_removed(child);
                }
            }
            EventKind::VariableAdded => {
                self.on_definition_added(Category::Variables, &self.variables, event);
                if let Some(name) = event.field(EF_NAME) {
                    self.cache.invalidate(name);
                }
            }
            EventKind::VariableRemoved => {
                self.on_definition_removed(Category::Variables, &self.variables, event);
                if let Some(name) = event.field(EF_NAME) {
                    self.cache.invalidate(name);
                }
            }
            EventKind::FunctionAdded => {
                self.on_definition_added(Category::Functions, &self.functions, event)
            }
            EventKind::FunctionRemoved => {
                self.on_definition_removed(Category::Functions, &self.functions, event)
            }
            EventKind::EventAdded => self.on_definition_added(Category::Events, &self.events, event),
            EventKind::EventRemoved => {
                self.on_definition_removed(Category::Events, &self.events, event)
            }
            EventKind::ActionAdded | EventKind::ActionStateChanged => {
                self.on_definition_added(Category::Actions, &self.actions, event)
            }
            EventKind::ActionRemoved => {
                self.on_definition_removed(Category::Actions, &self.actions, event)
            }
            EventKind::InfoChanged => {
                if self.is_initialized(Category::Info) {
                    if let Some(rec) = event.data.rec() {
                        *self.info.write() = Some(ContextInfo::from_record(rec));
                    }
                }
            }
            EventKind::Destroyed => self.on_destroyed(),
            EventKind::VisibleChildAdded => {
                if self.is_initialized(Category::VisibleChildren) {
                    if let Some(p) = event.field(EF_PATH) {
                        let mut visible = self.visible_children.write();
                        if !visible.iter().any(|v| v == p) {
                            visible.push(p.to_string());
                        }
                    }
                }
            }
            EventKind::VisibleChildRemoved => {
                if self.is_initialized(Category::VisibleChildren) {
                    if let Some(p) = event.field(EF_PATH) {
                        self.visible_children.write().retain(|v| v != p);
                    }
                }
            }
            EventKind::Change | EventKind::Updated => {
                if let Some(variable) = event.field(EF_VARIABLE) {
                    tracing::trace!("Invalidating '{}' of '{}'", variable, self.path);
                    self.cache.invalidate(variable);
                }
            }
            EventKind::ContextStatusChanged => {
                if self.is_initialized(Category::Status) {
                    if let Some(rec) = event.data.rec() {
                        *self.status.write() = Some(ContextStatus {
                            status: rec.int32(EF_STATUS).unwrap_or_default(),
                            comment: rec.string(EF_COMMENT).map(str::to_string),
                        });
                    }
                }
            }
            EventKind::Custom => {}
        }

        self.notify_listeners(event);
    }

    fn notify_listeners(&self, event: &ContextEvent) {
        let entries: Vec<ListenerEntry> = match self.listeners.lock().get(&event.name) {
            Some(entries) => entries.iter().filter(|e| e.accepts(event)).cloned().collect(),
            None => return,
        };
        for entry in entries {
            entry.listener.handle(event);
        }
    }

    fn on_child_added(&self, name: &str) {
        if !self.is_initialized(Category::Children) {
            return;
        }
        let child = {
            let mut children = self.children.write();
            if children.iter().any(|c| c.name == name) {
                return;
            }
            let child = self.create_child(name);
            children.push(child.clone());
            child
        };
        tracing::debug!("Child '{}' added to '{}'", name, self.path);
        self.runtime.run_deferred(&child);
    }

    fn on_child_removed(&self, name: &str) {
        if !self.is_initialized(Category::Children) {
            return;
        }
        let removed = {
            let mut children = self.children.write();
            let before = children.len();
            children.retain(|c| c.name != name);
            children.len() != before
        };
        if removed {
            tracing::debug!("Child '{}' removed from '{}'", name, self.path);
        }
    }

    fn on_destroyed(&self) {
        tracing::debug!("Context '{}' destroyed", self.path);
        self.cache.clear();
        if let Some(parent) = self.parent() {
            parent.on_child_removed(&self.name);
        }
    }

    fn on_definition_added<T: Definition>(
        &self,
        category: Category,
        list: &RwLock<Vec<T>>,
        event: &ContextEvent,
    ) {
        if !self.is_initialized(category) {
            return;
        }
        let rec = match event.data.rec() {
            Some(rec) => rec,
            None => return,
        };
        match T::from_record(rec) {
            Ok(def) => upsert(&mut list.write(), def),
            Err(e) => tracing::warn!(
                "Ignoring {} on '{}': {}",
                event.name,
                self.path,
                e
            ),
        }
    }

    fn on_definition_removed<T: Definition>(
        &self,
        category: Category,
        list: &RwLock<Vec<T>>,
        event: &ContextEvent,
    ) {
        if !self.is_initialized(category) {
            return;
        }
        if let Some(name) = event.field(EF_NAME) {
            remove_named(&mut list.write(), name);
        }
    }

    // =========================================================================
    // Reinitialization
    // =========================================================================

    /// Forget everything loaded for this node and its loaded descendants,
    /// then re-subscribe the listeners they hold.
    pub async fn reinitialize(&self) {
        let mut nodes = Vec::new();
        if let Some(this) = self.this.upgrade() {
            this.collect_loaded(&mut nodes);
        }

        for node in &nodes {
            node.reset();
        }
        tracing::debug!("Reinitialized {} context(s) under '{}'", nodes.len(), self.path);

        for node in &nodes {
            node.restore_listeners().await;
        }
    }

    fn collect_loaded(self: &Arc<Self>, out: &mut Vec<Arc<ProxyContext>>) {
        out.push(self.clone());
        let children = self.children.read().clone();
        for child in &children {
            child.collect_loaded(out);
        }
    }

    fn reset(&self) {
        for cell in &self.cells {
            cell.clear();
        }
        self.cache.clear();
        self.internal_subscriptions.lock().clear();
    }

    async fn restore_listeners(&self) {
        let subscriptions: Vec<(String, ListenerOptions)> = self
            .listeners
            .lock()
            .iter()
            .flat_map(|(name, entries)| {
                entries
                    .iter()
                    .filter(move |e| needs_remote_subscription(name, &e.options))
                    .map(move |e| (name.clone(), e.options.clone()))
            })
            .collect();

        for (name, options) in subscriptions {
            if let Err(e) = self.subscribe_remote(&name, &options).await {
                tracing::debug!(
                    "Could not restore listener for '{}' of '{}': {}",
                    name,
                    self.path,
                    e
                );
            }
        }
    }
}

impl fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("path", &self.path)
            .field("remote_path", &*self.remote_path.read())
            .finish()
    }
}

fn needs_remote_subscription(name: &str, options: &ListenerOptions) -> bool {
    options.code.is_some() || !EventKind::from_name(name).is_auto_listened()
}

fn is_metadata_variable(name: &str) -> bool {
    matches!(
        name,
        V_INFO
            | V_CHILDREN
            | V_VARIABLES
            | V_FUNCTIONS
            | V_EVENTS
            | V_ACTIONS
            | V_CONTEXT_STATUS
            | V_VISIBLE_CHILDREN
            | V_MODEL_VARIABLES
            | V_MODEL_FUNCTIONS
            | V_MODEL_EVENTS
    )
}

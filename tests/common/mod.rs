//! Shared test helpers: an in-memory peer implementing `RemoteConnection`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aggwire_client::codec::{JsonTableCodec, TableCodec};
use aggwire_client::command::fields::{
    INDEX_OPERATION_CODE, INDEX_OPERATION_CONTEXT, INDEX_OPERATION_DATA_TABLE,
    INDEX_OPERATION_TARGET,
};
use aggwire_client::command::{Command, CommandBuilder, EncodeLimits, OutgoingCommand};
use aggwire_client::context::VariableDefinition;
use aggwire_client::handler::BoxFuture;
use aggwire_client::{AggError, DataTable, ProtocolVersion, Record, RemoteConnection, Result};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Holds one read until released. `entered` fires when the read arrives.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

type Key = (String, String);

/// Peer that serves variables from memory and records every command.
pub struct MockServer {
    builder: CommandBuilder,
    codec: JsonTableCodec,
    connected: AtomicBool,
    version: ProtocolVersion,
    values: Mutex<HashMap<Key, DataTable>>,
    functions: Mutex<HashMap<Key, DataTable>>,
    reads: Mutex<HashMap<Key, usize>>,
    gates: Mutex<HashMap<Key, Arc<Gate>>>,
    commands: Mutex<Vec<Vec<String>>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Self::with_version(ProtocolVersion::V3)
    }

    pub fn with_version(version: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self {
            builder: CommandBuilder::new(EncodeLimits::default()),
            codec: JsonTableCodec,
            connected: AtomicBool::new(true),
            version,
            values: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            reads: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    /// Publish a context with the metadata tables a server would expose.
    pub fn add_context(
        &self,
        path: &str,
        children: &[&str],
        variables: &[VariableDefinition],
        functions: &[&str],
        events: &[&str],
    ) {
        self.set_value(
            path,
            "info",
            DataTable::single(
                Record::new()
                    .with("description", path)
                    .with("type", "default"),
            ),
        );
        self.set_value(path, "children", names_table("name", children));
        self.set_value(
            path,
            "variables",
            variables.iter().map(VariableDefinition::to_record).collect(),
        );
        self.set_value(path, "functions", names_table("name", functions));
        self.set_value(path, "events", names_table("name", events));
        self.set_value(path, "actions", DataTable::new());
    }

    pub fn set_value(&self, path: &str, name: &str, value: DataTable) {
        self.values.lock().insert(key(path, name), value);
    }

    pub fn remove_value(&self, path: &str, name: &str) {
        self.values.lock().remove(&key(path, name));
    }

    pub fn value(&self, path: &str, name: &str) -> Option<DataTable> {
        self.values.lock().get(&key(path, name)).cloned()
    }

    pub fn set_function(&self, path: &str, name: &str, output: DataTable) {
        self.functions.lock().insert(key(path, name), output);
    }

    /// Hold the next read of `path`/`name` until the gate is released.
    pub fn gate(&self, path: &str, name: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates.lock().insert(key(path, name), gate.clone());
        gate
    }

    /// Reads of `path`/`name` received so far.
    pub fn reads(&self, path: &str, name: &str) -> usize {
        self.reads.lock().get(&key(path, name)).copied().unwrap_or(0)
    }

    /// Recorded operations with code `code` (`G`, `S`, `C`, `L`, `U`).
    pub fn operations(&self, code: &str) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .iter()
            .filter(|p| p.get(INDEX_OPERATION_CODE).map(String::as_str) == Some(code))
            .cloned()
            .collect()
    }

    /// Listener operations with code `code` for event `event`.
    pub fn listener_operations(&self, code: &str, event: &str) -> usize {
        self.operations(code)
            .iter()
            .filter(|p| p.get(INDEX_OPERATION_TARGET).map(String::as_str) == Some(event))
            .count()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn encode(&self, table: &DataTable) -> String {
        self.codec.encode(table).unwrap()
    }

    async fn serve(&self, command: OutgoingCommand) -> Result<Command> {
        if !self.is_connected() {
            return Err(AggError::Disconnected("mock peer offline".into()));
        }
        let request = Command::decode(command.content())?;
        let params = request.params().to_vec();
        self.commands.lock().push(params.clone());

        let id = request.id()?.to_string();
        let code = request.param(INDEX_OPERATION_CODE)?;
        let context = request.param(INDEX_OPERATION_CONTEXT)?.to_string();
        let target = request.param(INDEX_OPERATION_TARGET)?.to_string();
        let limits = EncodeLimits::default();

        let reply = match code {
            "G" => {
                *self.reads.lock().entry(key(&context, &target)).or_insert(0) += 1;
                let value = self.value(&context, &target);
                let gate = self.gates.lock().remove(&key(&context, &target));
                if let Some(gate) = gate {
                    gate.entered.notify_one();
                    gate.release.notified().await;
                }
                match value {
                    Some(value) => {
                        OutgoingCommand::reply_ok(&id, Some(&self.encode(&value)), limits)?
                    }
                    None => OutgoingCommand::reply_error(
                        &id,
                        "E",
                        &format!("Variable '{}' not available", target),
                        None,
                        limits,
                    )?,
                }
            }
            "S" => {
                let data = request.param(INDEX_OPERATION_DATA_TABLE)?;
                let value = self.codec.decode(data)?;
                self.set_value(&context, &target, value);
                OutgoingCommand::reply_ok(&id, None, limits)?
            }
            "C" => {
                let output = self.functions.lock().get(&key(&context, &target)).cloned();
                match output {
                    Some(output) => {
                        OutgoingCommand::reply_ok(&id, Some(&self.encode(&output)), limits)?
                    }
                    None => OutgoingCommand::reply_error(
                        &id,
                        "D",
                        "Function not available",
                        Some("no such function"),
                        limits,
                    )?,
                }
            }
            _ => OutgoingCommand::reply_ok(&id, None, limits)?,
        };

        Command::decode(reply.content())
    }
}

impl RemoteConnection for MockServer {
    fn send_command(
        &self,
        command: OutgoingCommand,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'_, Result<Command>> {
        Box::pin(self.serve(command))
    }

    fn send_no_reply(&self, command: OutgoingCommand) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(AggError::Disconnected("mock peer offline".into()));
            }
            let request = Command::decode(command.content())?;
            self.commands.lock().push(request.params().to_vec());
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn command_builder(&self) -> &CommandBuilder {
        &self.builder
    }
}

fn key(path: &str, name: &str) -> Key {
    (path.to_string(), name.to_string())
}

pub fn names_table(field: &str, names: &[&str]) -> DataTable {
    names
        .iter()
        .map(|n| Record::new().with(field, *n))
        .collect()
}

pub fn value_table(value: &str) -> DataTable {
    DataTable::single(Record::new().with("value", value))
}

//! Definitions and metadata read from remote contexts.
//!
//! Every category of a context is published by the peer as a metadata
//! variable holding one record per definition.

use std::time::Duration;

use super::path;
use crate::error::{AggError, Result};
use crate::table::{DataTable, Record};

pub const V_INFO: &str = "info";
pub const V_CHILDREN: &str = "children";
pub const V_VARIABLES: &str = "variables";
pub const V_FUNCTIONS: &str = "functions";
pub const V_EVENTS: &str = "events";
pub const V_ACTIONS: &str = "actions";
pub const V_CONTEXT_STATUS: &str = "contextStatus";
pub const V_VISIBLE_CHILDREN: &str = "visibleChildren";

/// Model contexts may publish their definitions under these names instead.
pub const V_MODEL_VARIABLES: &str = "modelVariables";
pub const V_MODEL_FUNCTIONS: &str = "modelFunctions";
pub const V_MODEL_EVENTS: &str = "modelEvents";

/// Function handled locally by every proxy.
pub const F_LOCAL_REINITIALIZE: &str = "localReinitialize";

pub const FIELD_NAME: &str = "name";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_GROUP: &str = "group";
pub const FIELD_READABLE: &str = "readable";
pub const FIELD_WRITABLE: &str = "writable";
pub const FIELD_CACHE_TIME: &str = "remoteCacheTime";
pub const FIELD_LEVEL: &str = "level";
pub const FIELD_ENABLED: &str = "enabled";

pub const VF_INFO_DESCRIPTION: &str = "description";
pub const VF_INFO_TYPE: &str = "type";
pub const VF_INFO_GROUP: &str = "group";
pub const VF_INFO_ICON: &str = "icon";
pub const VF_INFO_LOCAL_ROOT: &str = "localRoot";
pub const VF_INFO_PEER_ROOT: &str = "peerRoot";
pub const VF_INFO_PEER_PRIMARY_ROOT: &str = "peerPrimaryRoot";
pub const VF_INFO_REMOTE_ROOT: &str = "remoteRoot";
pub const VF_INFO_REMOTE_PATH: &str = "remotePath";
pub const VF_INFO_MAPPED: &str = "mapped";

pub const VF_CHILDREN_NAME: &str = "name";
pub const VF_VISIBLE_CHILDREN_PATH: &str = "path";
pub const VF_CONTEXT_STATUS_STATUS: &str = "status";
pub const VF_CONTEXT_STATUS_COMMENT: &str = "comment";

const MODEL_TYPES: [&str; 2] = ["model", "models"];

/// A definition parsed from one metadata record.
pub trait Definition: Sized + Clone + PartialEq + Send + Sync + 'static {
    fn name(&self) -> &str;

    fn from_record(record: &Record) -> Result<Self>;
}

fn required_name(record: &Record) -> Result<String> {
    record
        .string(FIELD_NAME)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AggError::Context("Definition record has no name".to_string()))
}

fn optional_string(record: &Record, field: &str) -> Option<String> {
    record.string(field).map(str::to_string)
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableDefinition {
    pub name: String,
    pub description: Option<String>,
    pub readable: bool,
    pub writable: bool,
    pub group: Option<String>,
    /// Values are cached for this long; `None` disables caching.
    pub cache_ttl: Option<Duration>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            readable: true,
            writable: false,
            group: None,
            cache_ttl: None,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Wire record, as published in the `variables` metadata table.
    pub fn to_record(&self) -> Record {
        let mut rec = Record::new()
            .with(FIELD_NAME, self.name.as_str())
            .with(FIELD_READABLE, self.readable)
            .with(FIELD_WRITABLE, self.writable);
        if let Some(description) = &self.description {
            rec.set(FIELD_DESCRIPTION, description.as_str());
        }
        if let Some(group) = &self.group {
            rec.set(FIELD_GROUP, group.as_str());
        }
        if let Some(ttl) = self.cache_ttl {
            rec.set(FIELD_CACHE_TIME, ttl.as_millis() as u64);
        }
        rec
    }
}

impl Definition for VariableDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            name: required_name(record)?,
            description: optional_string(record, FIELD_DESCRIPTION),
            readable: record.boolean(FIELD_READABLE).unwrap_or(true),
            writable: record.boolean(FIELD_WRITABLE).unwrap_or(false),
            group: optional_string(record, FIELD_GROUP),
            cache_ttl: record.duration_ms(FIELD_CACHE_TIME),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: Option<String>,
    pub group: Option<String>,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            group: None,
        }
    }
}

impl Definition for FunctionDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            name: required_name(record)?,
            description: optional_string(record, FIELD_DESCRIPTION),
            group: optional_string(record, FIELD_GROUP),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDefinition {
    pub name: String,
    pub description: Option<String>,
    pub level: i32,
    pub group: Option<String>,
}

impl Definition for EventDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            name: required_name(record)?,
            description: optional_string(record, FIELD_DESCRIPTION),
            level: record.int32(FIELD_LEVEL).unwrap_or_default(),
            group: optional_string(record, FIELD_GROUP),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDefinition {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub group: Option<String>,
}

impl Definition for ActionDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            name: required_name(record)?,
            description: optional_string(record, FIELD_DESCRIPTION),
            enabled: record.boolean(FIELD_ENABLED).unwrap_or(true),
            group: optional_string(record, FIELD_GROUP),
        })
    }
}

/// Parse every record of a metadata table.
pub fn parse_definitions<T: Definition>(table: &DataTable) -> Result<Vec<T>> {
    table.iter().map(T::from_record).collect()
}

/// Insert or replace a definition, keeping its position when replaced.
pub(crate) fn upsert<T: Definition>(list: &mut Vec<T>, def: T) {
    match list.iter_mut().find(|d| d.name() == def.name()) {
        Some(existing) if *existing == def => {}
        Some(existing) => *existing = def,
        None => list.push(def),
    }
}

pub(crate) fn remove_named<T: Definition>(list: &mut Vec<T>, name: &str) -> bool {
    let before = list.len();
    list.retain(|d| d.name() != name);
    list.len() != before
}

/// Descriptive metadata of a context, including its path mapping roots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextInfo {
    pub description: Option<String>,
    pub context_type: Option<String>,
    pub group: Option<String>,
    pub icon: Option<String>,
    pub local_root: Option<String>,
    pub peer_root: Option<String>,
    pub peer_primary_root: Option<String>,
    pub remote_root: Option<String>,
    pub remote_path: Option<String>,
    pub mapped: bool,
}

impl ContextInfo {
    pub fn from_table(table: &DataTable) -> Result<Self> {
        let rec = table
            .rec()
            .ok_or_else(|| AggError::Context("Context info table is empty".to_string()))?;
        Ok(Self::from_record(rec))
    }

    pub fn from_record(rec: &Record) -> Self {
        Self {
            description: optional_string(rec, VF_INFO_DESCRIPTION),
            context_type: optional_string(rec, VF_INFO_TYPE),
            group: optional_string(rec, VF_INFO_GROUP),
            icon: optional_string(rec, VF_INFO_ICON),
            local_root: optional_string(rec, VF_INFO_LOCAL_ROOT),
            peer_root: optional_string(rec, VF_INFO_PEER_ROOT),
            peer_primary_root: optional_string(rec, VF_INFO_PEER_PRIMARY_ROOT),
            remote_root: optional_string(rec, VF_INFO_REMOTE_ROOT),
            remote_path: optional_string(rec, VF_INFO_REMOTE_PATH),
            mapped: rec.boolean(VF_INFO_MAPPED).unwrap_or(false),
        }
    }

    /// Model contexts publish definitions under the model metadata names.
    pub fn is_model(&self) -> bool {
        self.context_type
            .as_deref()
            .map_or(false, |t| MODEL_TYPES.contains(&t))
    }

    /// Translate a remote absolute path into the local one.
    ///
    /// `visible` selects the peer root instead of the remote root. Without a
    /// root mapping the remote path is already local. Paths outside the
    /// mapped subtree fall back to the primary root; `None` means the path
    /// has no local equivalent.
    pub fn local_path(&self, remote_full_path: &str, visible: bool) -> Option<String> {
        let remote_root = if visible {
            self.peer_root.as_deref()
        } else {
            self.remote_root.as_deref()
        };

        let remote_root = match remote_root {
            Some(root) => root,
            None => return Some(remote_full_path.to_string()),
        };

        let converted = if remote_root == path::ROOT {
            remote_full_path
        } else if remote_full_path == remote_root {
            ""
        } else if let Some(rest) = remote_full_path
            .strip_prefix(remote_root)
            .and_then(|r| r.strip_prefix(path::SEPARATOR))
        {
            rest
        } else {
            return self.local_primary_path(remote_full_path);
        };

        let local_root = self.local_root.as_deref().unwrap_or(path::ROOT);
        Some(path::join(local_root, converted))
    }

    /// Remote path placed under the primary mount root, if one is known.
    pub fn local_primary_path(&self, remote_full_path: &str) -> Option<String> {
        let primary = self.peer_primary_root.as_deref()?;
        Some(path::join(primary, remote_full_path))
    }
}

/// Operational status published by some contexts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextStatus {
    pub status: i32,
    pub comment: Option<String>,
}

impl ContextStatus {
    pub fn from_record(rec: &Record) -> Self {
        Self {
            status: rec.int32(VF_CONTEXT_STATUS_STATUS).unwrap_or_default(),
            comment: optional_string(rec, VF_CONTEXT_STATUS_COMMENT),
        }
    }
}

//! Typed views over replies, events and operations.

use super::fields::*;
use super::incoming::Command;
use super::outgoing::{EncodeLimits, OutgoingCommand};
use crate::error::{AggError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCode {
    Ok,
    Denied,
    Error,
    Other(String),
}

impl ReplyCode {
    pub fn parse(code: &str) -> Self {
        match code {
            REPLY_CODE_OK => ReplyCode::Ok,
            REPLY_CODE_DENIED => ReplyCode::Denied,
            REPLY_CODE_ERROR => ReplyCode::Error,
            other => ReplyCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReplyCode::Ok => REPLY_CODE_OK,
            ReplyCode::Denied => REPLY_CODE_DENIED,
            ReplyCode::Error => REPLY_CODE_ERROR,
            ReplyCode::Other(code) => code,
        }
    }
}

/// Reply to a request: `[R, id, code, message-or-data?, details?]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: String,
    pub code: ReplyCode,
    /// Encoded data table for OK replies, error message otherwise.
    pub message: Option<String>,
    pub details: Option<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.code == ReplyCode::Ok
    }

    /// Encoded data table carried by an OK reply.
    pub fn data(&self) -> Option<&str> {
        if self.is_ok() {
            self.message.as_deref()
        } else {
            None
        }
    }

    /// OK replies yield their data, anything else becomes a remote-device error.
    pub fn into_result(self) -> Result<Option<String>> {
        match self.code {
            ReplyCode::Ok => Ok(self.message),
            code => Err(AggError::RemoteDevice {
                code: code.as_str().to_string(),
                message: self.message.unwrap_or_default(),
                details: self.details,
            }),
        }
    }
}

/// Asynchronous event notification from the server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventMessage {
    /// Remote absolute context path.
    pub context: String,
    pub name: String,
    pub level: i32,
    pub event_id: Option<i64>,
    /// Listener code this event was delivered for, if any.
    pub listener: Option<i64>,
    pub data: Option<String>,
    /// Milliseconds since the epoch.
    pub creation_time: Option<i64>,
}

impl EventMessage {
    pub fn new(context: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Build the wire form, as sent by a server or an agent.
    pub fn to_command(&self, limits: EncodeLimits) -> Result<OutgoingCommand> {
        let mut cmd = OutgoingCommand::with_limits(limits);
        cmd.add_param(COMMAND_CODE_MESSAGE)?
            .add_param("")?
            .add_param(MESSAGE_CODE_EVENT)?
            .add_param(&self.context)?
            .add_param(&self.name)?
            .add_param(&self.level.to_string())?
            .add_param(&opt_num(self.event_id))?
            .add_param(&opt_num(self.listener))?
            .add_param(self.data.as_deref().unwrap_or(""))?
            .add_param(&opt_num(self.creation_time))?;
        Ok(cmd)
    }
}

fn opt_num(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCode {
    GetVariable,
    SetVariable,
    CallFunction,
    AddEventListener,
    RemoveEventListener,
}

impl OperationCode {
    pub fn parse(code: &str) -> Result<Self> {
        match code {
            OPERATION_GET_VARIABLE => Ok(OperationCode::GetVariable),
            OPERATION_SET_VARIABLE => Ok(OperationCode::SetVariable),
            OPERATION_CALL_FUNCTION => Ok(OperationCode::CallFunction),
            OPERATION_ADD_EVENT_LISTENER => Ok(OperationCode::AddEventListener),
            OPERATION_REMOVE_EVENT_LISTENER => Ok(OperationCode::RemoveEventListener),
            other => Err(AggError::Protocol(format!("Unknown operation code '{}'", other))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationCode::GetVariable => OPERATION_GET_VARIABLE,
            OperationCode::SetVariable => OPERATION_SET_VARIABLE,
            OperationCode::CallFunction => OPERATION_CALL_FUNCTION,
            OperationCode::AddEventListener => OPERATION_ADD_EVENT_LISTENER,
            OperationCode::RemoveEventListener => OPERATION_REMOVE_EVENT_LISTENER,
        }
    }
}

/// Operation request pushed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationMessage {
    pub id: String,
    pub code: OperationCode,
    pub context: String,
    /// Variable, function or event name.
    pub target: String,
    pub data: Option<String>,
    pub queue_name: Option<String>,
    pub flags: Option<String>,
}

impl OperationMessage {
    pub fn reply_required(&self) -> bool {
        match self.code {
            OperationCode::CallFunction => self
                .flags
                .as_deref()
                .map_or(true, |f| f.contains(FLAG_REPLY_REQUIRED)),
            _ => true,
        }
    }

    /// Queue that serializes this operation: the explicit queue name, else
    /// one queue per target.
    pub fn dispatch_queue(&self) -> String {
        match &self.queue_name {
            Some(queue) => queue.clone(),
            None => format!("{}/{}", self.context, self.target),
        }
    }
}

impl Command {
    pub fn reply(&self) -> Result<Reply> {
        let code = self.reply_code()?;
        Ok(Reply {
            id: self.id()?.to_string(),
            code: ReplyCode::parse(code),
            message: self.params().get(INDEX_REPLY_MESSAGE).cloned(),
            details: self.optional_param(INDEX_REPLY_DETAILS).map(str::to_string),
        })
    }

    pub fn event(&self) -> Result<EventMessage> {
        if !self.is_event()? {
            return Err(AggError::Usage("Command is not an event".to_string()));
        }
        Ok(EventMessage {
            context: self.param(INDEX_EVENT_CONTEXT)?.to_string(),
            name: self.param(INDEX_EVENT_NAME)?.to_string(),
            level: parse_num(self.optional_param(INDEX_EVENT_LEVEL), "event level")?.unwrap_or(0),
            event_id: parse_num(self.optional_param(INDEX_EVENT_ID), "event id")?,
            listener: parse_num(self.optional_param(INDEX_EVENT_LISTENER), "listener")?,
            data: self.optional_param(INDEX_EVENT_DATA_TABLE).map(str::to_string),
            creation_time: parse_num(
                self.optional_param(INDEX_EVENT_CREATION_TIME),
                "creation time",
            )?,
        })
    }

    pub fn operation(&self) -> Result<OperationMessage> {
        if !self.is_operation()? {
            return Err(AggError::Usage("Command is not an operation".to_string()));
        }
        let code = OperationCode::parse(self.param(INDEX_OPERATION_CODE)?)?;
        let data = match code {
            OperationCode::AddEventListener | OperationCode::RemoveEventListener => None,
            _ => self.optional_param(INDEX_OPERATION_DATA_TABLE).map(str::to_string),
        };
        Ok(OperationMessage {
            id: self.id()?.to_string(),
            code,
            context: self.param(INDEX_OPERATION_CONTEXT)?.to_string(),
            target: self.param(INDEX_OPERATION_TARGET)?.to_string(),
            data,
            queue_name: self.queue_name().map(str::to_string),
            flags: self.flags().map(str::to_string),
        })
    }
}

fn parse_num<T: std::str::FromStr>(value: Option<&str>, what: &str) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|_| AggError::Protocol(format!("Invalid {} '{}'", what, v)))
        })
        .transpose()
}

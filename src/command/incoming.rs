//! Decoded command: an ordered list of string parameters.
//!
//! # Example
//!
//! ```
//! use aggwire_client::command::Command;
//!
//! let command = Command::decode(b"R\x1742\x17A").unwrap();
//! assert!(command.is_reply().unwrap());
//! assert_eq!(command.id().unwrap(), "42");
//! assert_eq!(command.reply_code().unwrap(), "A");
//! ```

use serde_json::Value;

use super::fields::*;
use super::transfer;
use crate::config::DEFAULT_LARGE_DATA_SIZE;
use crate::error::{AggError, Result};

/// Which wire form a command arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandForm {
    /// Parameters joined by [`SEPARATOR`].
    Delimited,
    /// JSON array of strings.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    params: Vec<String>,
    form: CommandForm,
}

impl Command {
    /// Wrap already-split parameters.
    pub fn from_params<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            form: CommandForm::Delimited,
        }
    }

    /// Decode command content (the frame body after decompression).
    pub fn decode(content: &[u8]) -> Result<Self> {
        Self::decode_with(content, DEFAULT_LARGE_DATA_SIZE)
    }

    /// Decode with an explicit large-command threshold. Delimited content at
    /// or above it has trailing NUL padding stripped first.
    pub fn decode_with(content: &[u8], large_data_size: usize) -> Result<Self> {
        match content.first() {
            None => Err(AggError::ZeroLengthCommand),
            Some(&JSON_START_ARRAY) => Self::decode_json(content),
            Some(_) => {
                let content = if content.len() >= large_data_size {
                    trim_trailing_nul(content)
                } else {
                    content
                };
                Self::decode_delimited(content)
            }
        }
    }

    fn decode_json(content: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(content)?;
        let Value::Array(items) = value else {
            return Err(AggError::Protocol(
                "Unknown JSON object received".to_string(),
            ));
        };

        let params = items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s,
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect();

        Ok(Self {
            params,
            form: CommandForm::Json,
        })
    }

    fn decode_delimited(content: &[u8]) -> Result<Self> {
        if content.is_empty() {
            return Err(AggError::ZeroLengthCommand);
        }
        let text = std::str::from_utf8(content)
            .map_err(|e| AggError::Protocol(format!("Command is not valid UTF-8: {}", e)))?;

        let params = text
            .split(SEPARATOR as char)
            .map(|p| transfer::decode(p).map(|d| d.into_owned()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            params,
            form: CommandForm::Delimited,
        })
    }

    #[inline]
    pub fn form(&self) -> CommandForm {
        self.form
    }

    #[inline]
    pub fn is_json(&self) -> bool {
        self.form == CommandForm::Json
    }

    #[inline]
    pub fn params(&self) -> &[String] {
        &self.params
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameter at `index`; out of range is a usage error.
    pub fn param(&self, index: usize) -> Result<&str> {
        self.params.get(index).map(String::as_str).ok_or_else(|| {
            AggError::Usage(format!(
                "Parameter {} requested from command with {} parameters",
                index,
                self.params.len()
            ))
        })
    }

    /// Parameter at `index`, treating a missing or empty value as absent.
    pub fn optional_param(&self, index: usize) -> Option<&str> {
        self.params
            .get(index)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Single-character command kind at index 0.
    pub fn kind(&self) -> Result<&str> {
        let code = self
            .params
            .first()
            .ok_or_else(|| AggError::Usage("Command has no parameters".to_string()))?;
        if code.chars().count() != 1 {
            return Err(AggError::Usage(format!("Invalid command code '{}'", code)));
        }
        Ok(code)
    }

    pub fn is_reply(&self) -> Result<bool> {
        Ok(self.kind()? == COMMAND_CODE_REPLY)
    }

    pub fn is_message(&self) -> Result<bool> {
        Ok(self.kind()? == COMMAND_CODE_MESSAGE)
    }

    pub fn id(&self) -> Result<&str> {
        self.param(INDEX_ID)
    }

    pub fn reply_code(&self) -> Result<&str> {
        if !self.is_reply()? {
            return Err(AggError::Usage("Command is not a reply".to_string()));
        }
        self.param(INDEX_REPLY_CODE)
    }

    pub fn message_code(&self) -> Result<&str> {
        if !self.is_message()? {
            return Err(AggError::Usage("Command is not a message".to_string()));
        }
        self.param(INDEX_MESSAGE_CODE)
    }

    pub fn is_event(&self) -> Result<bool> {
        Ok(self.is_message()? && self.message_code()? == MESSAGE_CODE_EVENT)
    }

    pub fn is_operation(&self) -> Result<bool> {
        Ok(self.is_message()? && self.message_code()? == MESSAGE_CODE_OPERATION)
    }

    /// Queue name of a set-variable or call-function operation.
    pub fn queue_name(&self) -> Option<&str> {
        match self.optional_param(INDEX_OPERATION_CODE) {
            Some(OPERATION_SET_VARIABLE) | Some(OPERATION_CALL_FUNCTION) => {
                self.optional_param(INDEX_OPERATION_QUEUE_NAME)
            }
            _ => None,
        }
    }

    /// Flags of a call-function operation. A present but empty field is
    /// `Some("")`: the caller asked for no reply.
    pub fn flags(&self) -> Option<&str> {
        match self.optional_param(INDEX_OPERATION_CODE) {
            Some(OPERATION_CALL_FUNCTION) => {
                self.params.get(INDEX_OPERATION_FLAGS).map(String::as_str)
            }
            _ => None,
        }
    }
}

fn trim_trailing_nul(content: &[u8]) -> &[u8] {
    let end = content
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |pos| pos + 1);
    &content[..end]
}

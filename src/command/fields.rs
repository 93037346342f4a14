//! Command codes and positional field indices.
//!
//! Every command is an ordered list of string parameters. Index 0 is the
//! command kind, index 1 the request id; the remaining positions depend on
//! the kind and message subtype.

/// Separates parameters in the delimiter form.
pub const SEPARATOR: u8 = 0x17;

/// First content byte of the JSON-array form.
pub const JSON_START_ARRAY: u8 = b'[';

pub const COMMAND_CODE_REPLY: &str = "R";
pub const COMMAND_CODE_MESSAGE: &str = "M";

pub const MESSAGE_CODE_EVENT: &str = "E";
pub const MESSAGE_CODE_OPERATION: &str = "O";

pub const OPERATION_GET_VARIABLE: &str = "G";
pub const OPERATION_SET_VARIABLE: &str = "S";
pub const OPERATION_CALL_FUNCTION: &str = "C";
pub const OPERATION_ADD_EVENT_LISTENER: &str = "L";
pub const OPERATION_REMOVE_EVENT_LISTENER: &str = "U";

pub const REPLY_CODE_OK: &str = "A";
pub const REPLY_CODE_DENIED: &str = "D";
pub const REPLY_CODE_ERROR: &str = "E";

pub const INDEX_COMMAND_CODE: usize = 0;
pub const INDEX_ID: usize = 1;

pub const INDEX_REPLY_CODE: usize = 2;
pub const INDEX_REPLY_MESSAGE: usize = 3;
pub const INDEX_REPLY_DETAILS: usize = 4;
pub const INDEX_DATA_TABLE_IN_REPLY: usize = 3;

pub const INDEX_MESSAGE_CODE: usize = 2;

pub const INDEX_EVENT_CONTEXT: usize = 3;
pub const INDEX_EVENT_NAME: usize = 4;
pub const INDEX_EVENT_LEVEL: usize = 5;
pub const INDEX_EVENT_ID: usize = 6;
pub const INDEX_EVENT_LISTENER: usize = 7;
pub const INDEX_EVENT_DATA_TABLE: usize = 8;
pub const INDEX_EVENT_CREATION_TIME: usize = 9;

pub const INDEX_OPERATION_CODE: usize = 3;
pub const INDEX_OPERATION_CONTEXT: usize = 4;
pub const INDEX_OPERATION_TARGET: usize = 5;
pub const INDEX_OPERATION_DATA_TABLE: usize = 6;
pub const INDEX_OPERATION_QUEUE_NAME: usize = 7;
pub const INDEX_OPERATION_FLAGS: usize = 8;

pub const INDEX_LISTENER_CONTEXT: usize = 4;
pub const INDEX_LISTENER_EVENT: usize = 5;
pub const INDEX_LISTENER_CODE: usize = 6;
pub const INDEX_LISTENER_FILTER: usize = 7;
pub const INDEX_LISTENER_FINGERPRINT: usize = 8;

/// Flag in the call-function flags field requesting a reply.
pub const FLAG_REPLY_REQUIRED: char = 'R';

//! Codec module - data table encoding for command parameters.
//!
//! Tables travel as a single string parameter. The encoding is opaque to
//! the rest of the crate and pluggable through [`TableCodec`]:
//!
//! - [`JsonTableCodec`] - JSON using `serde_json` (the default)
//!
//! # Example
//!
//! ```
//! use aggwire_client::codec::{JsonTableCodec, TableCodec};
//! use aggwire_client::table::{DataTable, Record};
//!
//! let codec = JsonTableCodec;
//! let table = DataTable::single(Record::new().with("value", 42));
//! let encoded = codec.encode(&table).unwrap();
//! assert_eq!(codec.decode(&encoded).unwrap(), table);
//! ```

mod json;

pub use json::JsonTableCodec;

use crate::error::Result;
use crate::table::DataTable;

/// Translates between the wire table string and [`DataTable`].
pub trait TableCodec: Send + Sync + 'static {
    fn encode(&self, table: &DataTable) -> Result<String>;

    fn decode(&self, encoded: &str) -> Result<DataTable>;
}

//! JSON table codec.
//!
//! Wire shape: `{"records":[{"field":value,...},...]}`. An empty parameter
//! decodes to an empty table.

use super::TableCodec;
use crate::error::Result;
use crate::table::DataTable;

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTableCodec;

impl TableCodec for JsonTableCodec {
    fn encode(&self, table: &DataTable) -> Result<String> {
        Ok(serde_json::to_string(table)?)
    }

    fn decode(&self, encoded: &str) -> Result<DataTable> {
        if encoded.trim().is_empty() {
            return Ok(DataTable::new());
        }
        Ok(serde_json::from_str(encoded)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AggError;
    use crate::table::Record;

    #[test]
    fn test_wire_shape() {
        let table = DataTable::single(Record::new().with("name", "x"));
        assert_eq!(
            JsonTableCodec.encode(&table).unwrap(),
            r#"{"records":[{"name":"x"}]}"#
        );
    }

    #[test]
    fn test_empty_parameter_is_empty_table() {
        assert!(JsonTableCodec.decode("").unwrap().is_empty());
        assert!(JsonTableCodec.decode("{}").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            JsonTableCodec.decode("{records"),
            Err(AggError::Json(_))
        ));
    }

    #[test]
    fn test_separator_inside_values() {
        let table = DataTable::single(Record::new().with("text", "a\u{17}b"));
        let encoded = JsonTableCodec.encode(&table).unwrap();
        assert_eq!(JsonTableCodec.decode(&encoded).unwrap(), table);
    }
}

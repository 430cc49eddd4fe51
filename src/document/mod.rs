// ABOUTME: Derived documents - identity, index and transformed source with _meta
// ABOUTME: Fetching builds row trees from a session; compiling turns them into documents

pub mod compiler;
pub mod fetch;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use compiler::compile;
pub use fetch::{fetch_roots, RootScan, RowTree};

/// Separator between primary-key values in a composite identity.
pub const IDENTITY_SEPARATOR: &str = "|";

/// A compiled document ready for the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub identity: String,
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_source")]
    pub source: Map<String, Value>,
}

impl Document {
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        out.insert("_id".into(), Value::String(self.identity.clone()));
        out.insert("_index".into(), Value::String(self.index.clone()));
        out.insert("_source".into(), Value::Object(self.source.clone()));
        Value::Object(out)
    }

    /// The `_meta` mapping of the source.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        self.source
            .get(crate::node::META_FIELD)
            .and_then(Value::as_object)
    }
}

/// Render primary-key values, in primary-key column order, as an identity.
pub fn identity_of(values: &[Value]) -> String {
    values
        .iter()
        .map(identity_part)
        .collect::<Vec<_>>()
        .join(IDENTITY_SEPARATOR)
}

fn identity_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

//! Record model for forwarded log entries.
//!
//! Records are schemaless string-keyed JSON maps exactly as they arrive from
//! OCI Logging. A [`LogBatch`] groups records with the attributes shared by a
//! whole run and serializes to the New Relic "detailed JSON" payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One log entry: arbitrary keys, arbitrary values, no required fields.
pub type Record = Map<String, Value>;

/// Instrumentation provider reported with every batch.
pub const INSTRUMENTATION_PROVIDER: &str = "oci";

/// Instrumentation name reported with every batch.
pub const INSTRUMENTATION_NAME: &str = "oci-log-forwarder";

/// Instrumentation version reported with every batch.
pub const INSTRUMENTATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Attributes shared by all records of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(Map<String, Value>);

impl Attributes {
    /// Create an empty attribute set.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// The instrumentation attributes New Relic uses for entity synthesis.
    pub fn instrumentation() -> Self {
        let mut attributes = Self::new();
        attributes.insert("instrumentation.provider", INSTRUMENTATION_PROVIDER);
        attributes.insert("instrumentation.name", INSTRUMENTATION_NAME);
        attributes.insert("instrumentation.version", INSTRUMENTATION_VERSION);
        attributes
    }

    /// Build the run attributes: instrumentation keys plus custom metadata.
    ///
    /// Custom metadata never overrides an instrumentation key.
    pub fn for_run<'a, I>(custom: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut attributes = Self::instrumentation();
        for (key, value) in custom {
            if !attributes.contains_key(key) {
                attributes.insert(key.clone(), value.clone());
            }
        }
        attributes
    }

    /// Insert or replace an attribute.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up an attribute.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Check whether an attribute is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A size-bounded group of records delivered to the sink in one call.
///
/// Batches are only built by the batcher, which guarantees they are never
/// empty.
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    /// Records in arrival order
    pub records: Vec<Record>,

    /// Attributes shared by every record of the batch
    pub attributes: Attributes,

    /// Identifier used to correlate log lines about this batch
    pub batch_id: Uuid,
}

impl LogBatch {
    /// Create a new batch from records and shared attributes.
    pub fn new(records: Vec<Record>, attributes: Attributes) -> Self {
        Self {
            records,
            attributes,
            batch_id: Uuid::new_v4(),
        }
    }

    /// Get the number of records in the batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Borrow the batch as the Log API "detailed JSON" body.
    pub fn payload(&self) -> DetailedLogs<'_> {
        DetailedLogs([DetailedLog {
            common: Common {
                attributes: &self.attributes,
            },
            logs: &self.records,
        }])
    }
}

/// Request body accepted by the Log API: a one-element list of detailed logs.
#[derive(Debug, Serialize)]
pub struct DetailedLogs<'a>([DetailedLog<'a>; 1]);

/// One detailed-log block.
#[derive(Debug, Serialize)]
pub struct DetailedLog<'a> {
    common: Common<'a>,
    logs: &'a [Record],
}

/// Data shared by all logs of a detailed-log block.
#[derive(Debug, Serialize)]
struct Common<'a> {
    attributes: &'a Attributes,
}

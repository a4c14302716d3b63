//! User-facing opaque values with locality hints, and scoped key-value rows.

use uuid::Uuid;

/// Type tag reserved for inputs/outputs that carry a data id instead of an
/// inline value.
pub const DATA_TAG: &str = "data";

/// An opaque user value stored out of band and passed between tasks by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub id: Uuid,
    pub value: Vec<u8>,
    pub localities: Vec<String>,
    pub hard_locality: bool,
}

impl Data {
    pub fn new(value: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            value,
            localities: Vec::new(),
            hard_locality: false,
        }
    }

    pub fn with_id(id: Uuid, value: Vec<u8>) -> Self {
        Self {
            id,
            value,
            localities: Vec::new(),
            hard_locality: false,
        }
    }
}

/// One row of a driver- or task-scoped key-value namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueData {
    pub owner_id: Uuid,
    pub key: String,
    pub value: String,
}

impl KeyValueData {
    pub fn new(owner_id: Uuid, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            owner_id,
            key: key.into(),
            value: value.into(),
        }
    }
}

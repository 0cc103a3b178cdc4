//! Shared protocol data model: messages, namespaced names, and the AMQP
//! field-table value type used by both wire formats.

pub mod amqp0;
pub mod amqp1;
pub mod sasl;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// AMQP field-table, ordered by nothing in particular on the wire.
pub type FieldTable = HashMap<String, FieldValue>;

/// A single AMQP field-table value.
///
/// Closed sum so that header matching and codecs dispatch exhaustively.
/// Equality is structural, which is exactly what headers-exchange matching
/// requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    Timestamp(u64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<FieldValue>),
    Table(FieldTable),
    Void,
}

/// Namespace-qualified entity name, rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceName {
    pub namespace: String,
    pub name: String,
}

impl NamespaceName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A published message as it travels from a protocol session through routing
/// into segments and consumer groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub routing_key: String,
    pub headers: FieldTable,
    pub body: Bytes,
    /// Publish time in unix milliseconds. Compared against the consumer
    /// group's `since` cutoff during routing.
    pub timestamp: u64,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

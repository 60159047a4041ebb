//! Messages carried by the bus.
//!
//! Every message has an ID that is generated lazily on first access and never
//! changes afterwards. Two shapes are provided:
//! - [`ArbitraryMessage`]: a free-form JSON object; the ID lives under `"id"`.
//! - [`MessageId`]: an ID field to embed in application structs.
//!
//! Structured messages embed [`MessageId`] flattened so it serializes as `"id"`:
//!
//! ```
//! use relaybus::message::{Message, MessageId};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Default, Serialize, Deserialize)]
//! struct Tick {
//!     #[serde(flatten)]
//!     mq: MessageId,
//!     name: String,
//! }
//!
//! impl Message for Tick {
//!     fn id(&mut self) -> &str {
//!         self.mq.get_or_init()
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Key holding the ID inside an [`ArbitraryMessage`].
pub const ID_FIELD: &str = "id";

/// A payload that can be published on the bus.
///
/// The type parameter of a subscription selects the shape incoming payloads
/// are decoded into.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Return the message ID, generating and storing one on first call.
    ///
    /// Repeated calls return the same value.
    fn id(&mut self) -> &str;
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Free-form keyed message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArbitraryMessage(Map<String, Value>);

impl ArbitraryMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert a field. Writes to the ID field are ignored once an ID exists.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let key = key.into();
        if key == ID_FIELD && self.has_id() {
            return None;
        }
        self.0.insert(key, value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }

    fn has_id(&self) -> bool {
        matches!(self.0.get(ID_FIELD), Some(Value::String(s)) if !s.is_empty())
    }
}

impl From<Map<String, Value>> for ArbitraryMessage {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ArbitraryMessage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Message for ArbitraryMessage {
    fn id(&mut self) -> &str {
        let slot = self.0.entry(ID_FIELD).or_insert(Value::Null);
        let fresh = match &*slot {
            Value::String(s) if !s.is_empty() => None,
            Value::Null | Value::String(_) => Some(new_id()),
            // A non-string ID is normalised to its JSON text once.
            other => Some(other.to_string()),
        };
        if let Some(id) = fresh {
            *slot = Value::String(id);
        }

        let Value::String(id) = slot else {
            unreachable!("id field holds a string after materialization");
        };
        id
    }
}

/// ID field for structured messages.
///
/// Empty until [`MessageId::get_or_init`] is called; immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    #[serde(rename = "id", default)]
    id: String,
}

impl MessageId {
    /// Return the ID, generating it if unset.
    pub fn get_or_init(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = new_id();
        }
        &self.id
    }

    /// Current value without generating one.
    pub fn get(&self) -> Option<&str> {
        (!self.id.is_empty()).then_some(self.id.as_str())
    }

    pub fn is_set(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Serialize a message for the queue, materializing its ID first.
pub(crate) fn encode<M: Message>(message: &mut M) -> serde_json::Result<(String, Vec<u8>)> {
    let id = message.id().to_string();
    let payload = serde_json::to_vec(message)?;
    Ok((id, payload))
}

#[cfg(test)]
mod tests;

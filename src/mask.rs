//! Generic field-mask filtering.
//!
//! A `FieldMask` is an allow-list of field names. Applying it clears every
//! field not on the list to its zero/absent value. The enumeration is
//! schema-driven: the message is serialized to a JSON object, keys not on the
//! allow-list are dropped, and the result is deserialized back so cleared
//! fields take their serde defaults. No per-type field-name match arms —
//! new fields on a message are filtered automatically.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Allow-list of field names. Order irrelevant, duplicates ignored, unknown
/// names ignored. Empty = identity (no filtering).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask(pub Vec<String>);

impl FieldMask {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn allows(&self, name: &str) -> bool {
        self.0.iter().any(|n| n == name)
    }
}

#[derive(Debug, Error)]
pub enum MaskError {
    #[error("failed to serialize message for filtering: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to rebuild message after filtering: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Return a copy of `msg` with every field not named by `mask` cleared to its
/// default value. Empty mask returns the message unchanged. Messages that do
/// not serialize to a JSON object pass through unchanged.
pub fn apply<T>(msg: &T, mask: &FieldMask) -> Result<T, MaskError>
where
    T: Serialize + DeserializeOwned + Clone,
{
    if mask.is_empty() {
        return Ok(msg.clone());
    }

    let value = serde_json::to_value(msg).map_err(MaskError::Serialize)?;
    let filtered = match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(name, _)| mask.allows(name))
                .collect(),
        ),
        other => other,
    };

    serde_json::from_value(filtered).map_err(MaskError::Deserialize)
}

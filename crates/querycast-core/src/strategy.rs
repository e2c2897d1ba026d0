//! Realtime message envelope and update strategies.
//!
//! Strategies are pure: they take the current cached value and a message
//! and return the value to write back. They never touch the cache.
//!
//! Collections are either plain JSON arrays or paginated values of the form
//! `{"pages": [[..], [..]], ..}` as written by infinite queries. For the
//! latter, `prepend` targets the first page, `append` the last page, and
//! `merge`/`remove` search every page.

use crate::error::{CacheError, MergeError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Merge policy applied when a realtime message updates a cached value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Payload supersedes the cached value
    #[default]
    Replace,
    /// Shallow field merge, or update-by-identity for collections
    Merge,
    /// Add payload to the end of a collection
    Append,
    /// Add payload to the front of a collection
    Prepend,
    /// Drop the element matching the message identity
    Remove,
}

impl UpdateStrategy {
    /// Every strategy.
    pub const ALL: [Self; 5] = [
        Self::Replace,
        Self::Merge,
        Self::Append,
        Self::Prepend,
        Self::Remove,
    ];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Merge => "merge",
            Self::Append => "append",
            Self::Prepend => "prepend",
            Self::Remove => "remove",
        }
    }

    /// Apply this strategy. See [`apply`].
    pub fn apply(
        self,
        existing: Option<&Value>,
        message: &RealtimeMessage,
        identity_field: &str,
    ) -> Result<Option<Value>, MergeError> {
        apply(self, existing, message, identity_field)
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == lower)
            .ok_or_else(|| CacheError::UnknownStrategy(s.to_string()))
    }
}

/// Decoded realtime frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeMessage {
    /// Message `type`
    pub kind: Option<String>,
    /// Identity of the element the message is about (`contentId`)
    pub target_id: Option<Value>,
    /// Message body
    pub payload: Value,
}

impl RealtimeMessage {
    /// Message with only a payload.
    #[must_use]
    pub const fn new(payload: Value) -> Self {
        Self {
            kind: None,
            target_id: None,
            payload,
        }
    }

    /// Set the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the target identity.
    #[must_use]
    pub fn with_target_id(mut self, id: impl Into<Value>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    /// Decode a JSON frame.
    ///
    /// `type` becomes the kind and `contentId` the target identity. The
    /// payload is the `data` field when present, otherwise every remaining
    /// field. Non-object frames become the payload as-is.
    #[must_use]
    pub fn from_value(frame: &Value) -> Self {
        let Value::Object(fields) = frame else {
            return Self::new(frame.clone());
        };

        let kind = fields.get("type").and_then(Value::as_str).map(String::from);
        let target_id = fields.get("contentId").filter(|v| !v.is_null()).cloned();
        let payload = match fields.get("data") {
            Some(data) => data.clone(),
            None => Value::Object(
                fields
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "type" | "contentId"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        };

        Self {
            kind,
            target_id,
            payload,
        }
    }

    /// Strategy named by the message type, if it names one.
    #[must_use]
    pub fn strategy(&self) -> Option<UpdateStrategy> {
        self.kind.as_deref().and_then(|k| k.parse().ok())
    }

    /// Identity of the element this message concerns.
    ///
    /// `target_id`, else `payload[identity_field]`, else a scalar payload.
    #[must_use]
    pub fn identity(&self, identity_field: &str) -> Option<Value> {
        if let Some(id) = &self.target_id {
            return Some(id.clone());
        }
        match &self.payload {
            Value::Object(map) => map.get(identity_field).filter(|v| !v.is_null()).cloned(),
            v @ (Value::String(_) | Value::Number(_)) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Merge `message` into `existing` using `strategy`.
///
/// `Ok(None)` means there is nothing to write. On error the caller must
/// leave the cached value untouched.
pub fn apply(
    strategy: UpdateStrategy,
    existing: Option<&Value>,
    message: &RealtimeMessage,
    identity_field: &str,
) -> Result<Option<Value>, MergeError> {
    let existing = existing.filter(|v| !v.is_null());
    let payload = &message.payload;

    match strategy {
        UpdateStrategy::Replace => Ok(Some(payload.clone())),

        UpdateStrategy::Merge => match existing {
            None => Ok(Some(payload.clone())),
            Some(Value::Array(items)) => {
                let id = require_identity("merge", message, identity_field)?;
                let mut items = items.clone();
                upsert(&mut items, &id, payload, identity_field);
                Ok(Some(Value::Array(items)))
            }
            Some(current) if is_paginated(current) => {
                let id = require_identity("merge", message, identity_field)?;
                let mut current = current.clone();
                let mut found = false;
                for page in pages_mut(&mut current) {
                    if let Some(item) = find_mut(page, &id, identity_field) {
                        merge_element(item, payload);
                        found = true;
                    }
                }
                if !found {
                    if let Some(last) = pages_mut(&mut current).last() {
                        last.push(payload.clone());
                    }
                }
                Ok(Some(current))
            }
            Some(Value::Object(fields)) => {
                let Value::Object(incoming) = payload else {
                    return Err(shape("merge", "object payload", payload));
                };
                let mut fields = fields.clone();
                merge_fields(&mut fields, incoming);
                Ok(Some(Value::Object(fields)))
            }
            Some(other) => Err(shape("merge", "object or array", other)),
        },

        UpdateStrategy::Append | UpdateStrategy::Prepend => {
            let front = strategy == UpdateStrategy::Prepend;
            match existing {
                None => Ok(Some(Value::Array(vec![payload.clone()]))),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    insert(&mut items, payload.clone(), front);
                    Ok(Some(Value::Array(items)))
                }
                Some(current) if is_paginated(current) => {
                    let mut current = current.clone();
                    if let Some(pages) = pages_array_mut(&mut current) {
                        if pages.is_empty() {
                            pages.push(Value::Array(Vec::new()));
                        }
                        let page = if front { pages.first_mut() } else { pages.last_mut() };
                        if let Some(Value::Array(items)) = page {
                            insert(items, payload.clone(), front);
                        }
                    }
                    Ok(Some(current))
                }
                Some(other) => Err(shape(strategy.as_str(), "array", other)),
            }
        }

        UpdateStrategy::Remove => match existing {
            None => Ok(None),
            Some(Value::Array(items)) => {
                let id = require_identity("remove", message, identity_field)?;
                let mut items = items.clone();
                items.retain(|item| !matches_identity(item, &id, identity_field));
                Ok(Some(Value::Array(items)))
            }
            Some(current) if is_paginated(current) => {
                let id = require_identity("remove", message, identity_field)?;
                let mut current = current.clone();
                for page in pages_mut(&mut current) {
                    page.retain(|item| !matches_identity(item, &id, identity_field));
                }
                Ok(Some(current))
            }
            Some(other) => Err(shape("remove", "array", other)),
        },
    }
}

/// Compare identities, treating `1` and `"1"` as equal.
#[must_use]
pub fn ids_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (id_text(a), id_text(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn id_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn matches_identity(item: &Value, id: &Value, identity_field: &str) -> bool {
    match item {
        Value::Object(map) => map.get(identity_field).is_some_and(|v| ids_equal(v, id)),
        scalar => ids_equal(scalar, id),
    }
}

fn find_mut<'a>(items: &'a mut [Value], id: &Value, identity_field: &str) -> Option<&'a mut Value> {
    items
        .iter_mut()
        .find(|item| matches_identity(item, id, identity_field))
}

fn upsert(items: &mut Vec<Value>, id: &Value, payload: &Value, identity_field: &str) {
    match find_mut(items, id, identity_field) {
        Some(item) => merge_element(item, payload),
        None => items.push(payload.clone()),
    }
}

fn merge_element(item: &mut Value, payload: &Value) {
    match (item, payload) {
        (Value::Object(fields), Value::Object(incoming)) => merge_fields(fields, incoming),
        (item, payload) => *item = payload.clone(),
    }
}

fn merge_fields(fields: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (k, v) in incoming {
        fields.insert(k.clone(), v.clone());
    }
}

fn insert(items: &mut Vec<Value>, value: Value, front: bool) {
    if front {
        items.insert(0, value);
    } else {
        items.push(value);
    }
}

fn require_identity(
    strategy: &'static str,
    message: &RealtimeMessage,
    identity_field: &str,
) -> Result<Value, MergeError> {
    message
        .identity(identity_field)
        .ok_or_else(|| MergeError::MissingIdentity {
            strategy,
            field: identity_field.to_string(),
        })
}

/// Whether `value` has the paginated `{"pages": [[..], ..]}` shape.
#[must_use]
pub fn is_paginated(value: &Value) -> bool {
    value
        .get("pages")
        .and_then(Value::as_array)
        .is_some_and(|pages| pages.iter().all(Value::is_array))
}

fn pages_array_mut(value: &mut Value) -> Option<&mut Vec<Value>> {
    value.get_mut("pages").and_then(Value::as_array_mut)
}

fn pages_mut(value: &mut Value) -> impl Iterator<Item = &mut Vec<Value>> + '_ {
    pages_array_mut(value)
        .into_iter()
        .flatten()
        .filter_map(Value::as_array_mut)
}

fn shape(strategy: &'static str, expected: &'static str, found: &Value) -> MergeError {
    MergeError::Shape {
        strategy,
        expected,
        found: shape_name(found),
    }
}

const fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

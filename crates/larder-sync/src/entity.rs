//! Entities, identifiers and correlation ids.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved prefix marking an id issued locally for an unacknowledged insert.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Field name of the identifier inside every record.
pub(crate) const ID_FIELD: &str = "id";

/// A JSON object as exchanged with the remote store.
pub type Record = serde_json::Map<String, Value>;

/// Identifier of an entity, either persisted or temporary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was synthesized locally and is still awaiting the store.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifies one mutation from optimistic apply to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Render a scalar JSON value the way it appears in ids and equality filters.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Current time in the format the store uses for `created_at`/`updated_at`.
pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A record that is guaranteed to carry an identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Record", into = "Record")]
pub struct Entity {
    id: EntityId,
    fields: Record,
}

impl Entity {
    /// Build an entity from an id and its remaining fields.
    ///
    /// Any `id` already present in `fields` is overwritten.
    pub fn new(id: EntityId, mut fields: Record) -> Self {
        fields.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        Self { id, fields }
    }

    /// Wrap a record, returning `None` if it has no usable `id`.
    pub fn from_record(record: Record) -> Option<Self> {
        let id = record.get(ID_FIELD).and_then(scalar_to_string)?;
        Some(Self {
            id: EntityId(id),
            fields: record,
        })
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> &Record {
        &self.fields
    }

    pub fn into_record(self) -> Record {
        self.fields
    }

    /// Set a field. Setting `id` is ignored.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        if field != ID_FIELD {
            self.fields.insert(field, value);
        }
    }

    /// Builder-style [`Entity::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value.into());
        self
    }

    /// Merge `patch` into this entity. The id never changes.
    pub fn merge(&mut self, patch: &Record) {
        for (field, value) in patch {
            if field != ID_FIELD {
                self.fields.insert(field.clone(), value.clone());
            }
        }
    }

    /// Stamp `updated_at` with the current time.
    pub fn touch(&mut self) {
        self.fields
            .insert("updated_at".to_string(), Value::String(timestamp_now()));
    }
}

impl TryFrom<Record> for Entity {
    type Error = String;

    fn try_from(record: Record) -> Result<Self, Self::Error> {
        Entity::from_record(record).ok_or_else(|| "record has no id".to_string())
    }
}

impl From<Entity> for Record {
    fn from(entity: Entity) -> Self {
        entity.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_temporary_ids() {
        assert!(EntityId::new("temp-1700000000000-0").is_temporary());
        assert!(!EntityId::new("42").is_temporary());
        assert!(!EntityId::new("template").is_temporary());
    }

    #[test]
    fn test_numeric_ids_are_normalized() {
        let entity = Entity::from_record(record(json!({"id": 7, "name": "Milk"}))).unwrap();
        assert_eq!(entity.id().as_str(), "7");
        assert_eq!(entity.get("id"), Some(&json!(7)));
    }

    #[test]
    fn test_record_without_id_is_rejected() {
        assert!(Entity::from_record(record(json!({"name": "Milk"}))).is_none());
        assert!(serde_json::from_value::<Entity>(json!({"name": "Milk"})).is_err());
    }

    #[test]
    fn test_merge_keeps_id() {
        let mut entity = Entity::new(EntityId::new("1"), record(json!({"name": "Milk"})));
        entity.merge(&record(json!({"id": "2", "name": "Oat milk", "quantity": 2})));

        assert_eq!(entity.id().as_str(), "1");
        assert_eq!(entity.get_str("name"), Some("Oat milk"));
        assert_eq!(entity.get("quantity"), Some(&json!(2)));
        assert_eq!(entity.get_str("id"), Some("1"));
    }

    #[test]
    fn test_serde_roundtrip_is_transparent() {
        let entity = Entity::new(EntityId::new("1"), Record::new()).with("name", "Milk");
        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value, json!({"id": "1", "name": "Milk"}));
    }

    #[test]
    fn test_correlation_id_parse() {
        let id = CorrelationId::new();
        assert_eq!(CorrelationId::parse(&id.to_string()), Some(id));
        assert_eq!(CorrelationId::parse("not-a-uuid"), None);
    }
}

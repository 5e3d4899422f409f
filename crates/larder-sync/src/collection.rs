//! Collection definitions: ordering, labels and feed availability.
//!
//! Every cache entry is kept sorted by its collection's comparator. The
//! comparator is applied after fetches and after every local edit, so the
//! order seen by readers never depends on which path last wrote the entry.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::Entity;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }
}

/// How string values of a sort field are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKind {
    /// Case-insensitive, then byte order.
    #[default]
    Text,
    /// RFC 3339 timestamps by instant. Values that do not parse sort after
    /// every timestamp and compare as text among themselves.
    Timestamp,
}

/// One field of a collection's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
    #[serde(default)]
    pub kind: SortKind,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
            kind: SortKind::Text,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
            kind: SortKind::Text,
        }
    }

    /// Compare this field's strings as timestamps.
    pub fn timestamps(mut self) -> Self {
        self.kind = SortKind::Timestamp;
        self
    }
}

/// Definition of one remote collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Table name in the remote store.
    pub name: String,
    /// Singular, human-readable name ("category").
    pub label: String,
    /// Ordering, most significant key first. Empty keeps insertion order.
    pub order: Vec<SortKey>,
    /// Whether the change feed publishes events for this collection.
    pub has_feed: bool,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            order: Vec::new(),
            has_feed: true,
        }
    }

    pub fn order_by(mut self, key: SortKey) -> Self {
        self.order.push(key);
        self
    }

    pub fn without_feed(mut self) -> Self {
        self.has_feed = false;
        self
    }

    /// Domain message for a uniqueness violation in this collection.
    pub fn duplicate_message(&self) -> String {
        format!("A {} with this name already exists", self.label)
    }

    /// Compare two entities by this collection's ordering.
    pub fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        compare_by_keys(&self.order, a, b)
    }

    /// Stable sort, so ties keep their current relative order.
    pub fn sort(&self, items: &mut [Entity]) {
        sort_by_keys(&self.order, items);
    }

    pub fn is_sorted(&self, items: &[Entity]) -> bool {
        items
            .windows(2)
            .all(|w| self.compare(&w[0], &w[1]) != Ordering::Greater)
    }

    /// Position at which `entity` keeps `items` sorted, after any equal entries.
    pub fn insertion_index(&self, items: &[Entity], entity: &Entity) -> usize {
        items.partition_point(|existing| self.compare(existing, entity) != Ordering::Greater)
    }
}

/// Stable sort by an explicit list of keys.
pub fn sort_by_keys(order: &[SortKey], items: &mut [Entity]) {
    if !order.is_empty() {
        items.sort_by(|a, b| compare_by_keys(order, a, b));
    }
}

fn compare_by_keys(order: &[SortKey], a: &Entity, b: &Entity) -> Ordering {
    for key in order {
        let ordering = compare_values(a.get(&key.field), b.get(&key.field), key);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Missing and null values sort last in either direction.
fn compare_values(a: Option<&Value>, b: Option<&Value>, key: &SortKey) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());

    let ordering = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return Ordering::Greater,
        (Some(_), None) => return Ordering::Less,
        (Some(a), Some(b)) => compare_present(a, b, key.kind),
    };

    match key.direction {
        Direction::Asc => ordering,
        Direction::Desc => ordering.reverse(),
    }
}

fn compare_present(a: &Value, b: &Value, kind: SortKind) -> Ordering {
    match (a, b) {
        (Value::String(a), Value::String(b)) => match kind {
            SortKind::Text => compare_text(a, b),
            SortKind::Timestamp => {
                match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                    // Different offsets and precisions still compare by instant.
                    (Ok(ta), Ok(tb)) => ta.cmp(&tb),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => compare_text(a, b),
                }
            }
        },
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Known collections by name.
#[derive(Debug, Clone)]
pub struct CollectionRegistry {
    specs: HashMap<String, Arc<CollectionSpec>>,
}

impl CollectionRegistry {
    /// An empty registry; every lookup falls back to ordering by id.
    pub fn empty() -> Self {
        Self {
            specs: HashMap::new(),
        }
    }

    /// The application's collections.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(CollectionSpec::new("categories", "category").order_by(SortKey::asc("name")));
        registry.register(
            CollectionSpec::new("food_items", "food item").order_by(SortKey::desc("created_at").timestamps()),
        );
        registry.register(
            CollectionSpec::new("cosmetics", "cosmetic").order_by(SortKey::desc("created_at").timestamps()),
        );
        registry.register(CollectionSpec::new("recipes", "recipe").order_by(SortKey::asc("name")));
        registry.register(
            CollectionSpec::new("meal_plans", "meal plan")
                .order_by(SortKey::asc("planned_for"))
                .order_by(SortKey::asc("created_at").timestamps()),
        );
        registry.register(CollectionSpec::new("user_preferences", "preference set").without_feed());
        registry
    }

    /// Add or replace a collection definition.
    pub fn register(&mut self, spec: CollectionSpec) {
        self.specs.insert(spec.name.clone(), Arc::new(spec));
    }

    /// Definition for `name`, or an id-ordered fallback for unknown collections.
    pub fn spec(&self, name: &str) -> Arc<CollectionSpec> {
        match self.specs.get(name) {
            Some(spec) => Arc::clone(spec),
            None => Arc::new(CollectionSpec::new(name, "record").order_by(SortKey::asc("id"))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Registered collection names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CollectionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, Record};
    use chrono::{FixedOffset, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn item(id: &str, fields: Value) -> Entity {
        let record: Record = fields.as_object().cloned().unwrap_or_default();
        Entity::new(EntityId::new(id), record)
    }

    fn ids(items: &[Entity]) -> Vec<&str> {
        items.iter().map(|e| e.id().as_str()).collect()
    }

    #[test]
    fn test_name_ascending_is_case_insensitive() {
        let spec = CollectionRegistry::default().spec("categories");
        let mut items = vec![
            item("1", json!({"name": "produce"})),
            item("2", json!({"name": "Dairy"})),
            item("3", json!({"name": "bakery"})),
        ];
        spec.sort(&mut items);
        assert_eq!(ids(&items), vec!["3", "2", "1"]);
        assert!(spec.is_sorted(&items));
    }

    #[test]
    fn test_created_at_descending_compares_instants() {
        let spec = CollectionRegistry::default().spec("food_items");
        let mut items = vec![
            item("old", json!({"created_at": "2024-01-01T00:00:00+00:00"})),
            item("new", json!({"created_at": "2024-03-01T10:00:00.123456Z"})),
            item("mid", json!({"created_at": "2024-02-01T01:00:00+01:00"})),
        ];
        spec.sort(&mut items);
        assert_eq!(ids(&items), vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_mixed_timestamp_and_text_values_do_not_cycle() {
        let values = [
            ("a", "2024-01-01T00:00:00+05:00"),
            ("b", "2023-12-31T20:00:00Z"),
            ("x", "2023-12-31T20:30"),
        ];
        let items: Vec<_> = values.iter().map(|(id, at)| item(id, json!({ "at": at }))).collect();

        let text = CollectionSpec::new("t", "t").order_by(SortKey::asc("at"));
        let mut by_text = items.clone();
        text.sort(&mut by_text);
        assert_eq!(ids(&by_text), vec!["b", "x", "a"]);

        let instants = CollectionSpec::new("t", "t").order_by(SortKey::asc("at").timestamps());
        let mut by_instant = items.clone();
        instants.sort(&mut by_instant);
        // a is 19:00Z; the value without an offset does not parse and goes last.
        assert_eq!(ids(&by_instant), vec!["a", "b", "x"]);
        assert_eq!(instants.compare(&items[2], &items[0]), Ordering::Greater);
        assert!(instants.is_sorted(&by_instant));
    }

    #[test]
    fn test_missing_values_sort_last_both_ways() {
        let asc = CollectionSpec::new("t", "t").order_by(SortKey::asc("rank"));
        let desc = CollectionSpec::new("t", "t").order_by(SortKey::desc("rank"));
        let mut a = vec![item("none", json!({})), item("1", json!({"rank": 1})), item("2", json!({"rank": 2}))];
        let mut b = a.clone();

        asc.sort(&mut a);
        desc.sort(&mut b);
        assert_eq!(ids(&a), vec!["1", "2", "none"]);
        assert_eq!(ids(&b), vec!["2", "1", "none"]);
    }

    #[test]
    fn test_insertion_index_keeps_order() {
        let spec = CollectionRegistry::default().spec("categories");
        let items = vec![item("1", json!({"name": "Bakery"})), item("2", json!({"name": "Produce"}))];

        assert_eq!(spec.insertion_index(&items, &item("t", json!({"name": "Dairy"}))), 1);
        assert_eq!(spec.insertion_index(&items, &item("t", json!({"name": "Zucchini"}))), 2);
        assert_eq!(spec.insertion_index(&items, &item("t", json!({"name": "Apples"}))), 0);
        // Case-only differences fall back to a byte comparison.
        assert_eq!(spec.insertion_index(&items, &item("t", json!({"name": "bakery"}))), 1);
    }

    #[test]
    fn test_unknown_collection_falls_back_to_id() {
        let registry = CollectionRegistry::default();
        assert!(!registry.contains("pantry_notes"));
        let spec = registry.spec("pantry_notes");
        assert_eq!(spec.order, vec![SortKey::asc("id")]);
        assert_eq!(spec.duplicate_message(), "A record with this name already exists");
    }

    #[test]
    fn test_preferences_have_no_feed() {
        let registry = CollectionRegistry::default();
        assert!(!registry.spec("user_preferences").has_feed);
        assert!(registry.spec("food_items").has_feed);
        assert!(registry.names().contains(&"meal_plans".to_string()));
    }

    fn sort_value() -> impl Strategy<Value = String> {
        prop_oneof![
            (0i64..200_000, -11i32..=11).prop_map(|(secs, hours)| {
                let offset = FixedOffset::east_opt(hours * 3600).unwrap();
                Utc.timestamp_opt(secs, 0).unwrap().with_timezone(&offset).to_rfc3339()
            }),
            (0i64..200_000).prop_map(|secs| {
                Utc.timestamp_opt(secs, 0).unwrap().format("%Y-%m-%dT%H:%M").to_string()
            }),
            "[a-cA-C0-9 :T-]{0,6}",
        ]
    }

    proptest! {
        #[test]
        fn string_ordering_is_total(
            values in prop::collection::vec(sort_value(), 2..10),
            timestamps in any::<bool>(),
        ) {
            let key = if timestamps { SortKey::asc("at").timestamps() } else { SortKey::asc("at") };
            let spec = CollectionSpec::new("t", "t").order_by(key);
            let items: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, at)| item(&i.to_string(), json!({ "at": at })))
                .collect();

            for a in &items {
                for b in &items {
                    prop_assert_eq!(spec.compare(a, b), spec.compare(b, a).reverse());
                    for c in &items {
                        if spec.compare(a, b) != Ordering::Greater && spec.compare(b, c) != Ordering::Greater {
                            prop_assert_ne!(spec.compare(a, c), Ordering::Greater);
                        }
                    }
                }
            }

            let mut sorted = items.clone();
            spec.sort(&mut sorted);
            prop_assert!(spec.is_sorted(&sorted));
        }
    }
}

//! Typed user preferences.
//!
//! The `user_preferences` collection stores a loosely shaped bag per user.
//! Known keys are validated here; unknown keys are carried along untouched
//! so a newer client's settings survive a round trip through this one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{Entity, ID_FIELD, Record};
use crate::error::ValidationError;

/// Collection holding one preference record per user.
pub const PREFERENCES_COLLECTION: &str = "user_preferences";

// Fields that belong to the row rather than the preference bag.
const ROW_FIELDS: &[&str] = &[ID_FIELD, "user_id", "created_at", "updated_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preferences {
    /// Days before expiry at which food items are flagged.
    pub expiry_warning_days: u32,
    /// Days before the period-after-opening ends at which cosmetics are flagged.
    pub pao_reminder_days: u32,
    pub week_start: WeekStart,
    pub units: Units,
    pub default_category_id: Option<String>,
    extra: Record,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            expiry_warning_days: 3,
            pao_reminder_days: 14,
            week_start: WeekStart::Monday,
            units: Units::Metric,
            default_category_id: None,
            extra: Record::new(),
        }
    }
}

impl Preferences {
    pub fn from_entity(entity: &Entity) -> Result<Self, ValidationError> {
        Self::from_record(entity.fields())
    }

    /// Validate a preference record. Missing keys take their defaults.
    pub fn from_record(record: &Record) -> Result<Self, ValidationError> {
        let mut prefs = Preferences::default();

        for (field, value) in record {
            match field.as_str() {
                "expiry_warning_days" => prefs.expiry_warning_days = days(field, value, 365)?,
                "pao_reminder_days" => prefs.pao_reminder_days = days(field, value, 90)?,
                "week_start" => prefs.week_start = variant(field, value)?,
                "units" => prefs.units = variant(field, value)?,
                "default_category_id" => {
                    prefs.default_category_id = match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        Value::Number(n) => Some(n.to_string()),
                        _ => return Err(invalid(field, "must be a category id")),
                    }
                }
                f if ROW_FIELDS.contains(&f) => {}
                _ => {
                    prefs.extra.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(prefs)
    }

    /// Fields to write back, unknown keys included.
    pub fn to_record(&self) -> Record {
        let mut record = self.extra.clone();
        record.insert("expiry_warning_days".into(), self.expiry_warning_days.into());
        record.insert("pao_reminder_days".into(), self.pao_reminder_days.into());
        record.insert("week_start".into(), to_value(self.week_start));
        record.insert("units".into(), to_value(self.units));
        record.insert(
            "default_category_id".into(),
            self.default_category_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        record
    }

    /// Keys this version does not know about.
    pub fn extra(&self) -> &Record {
        &self.extra
    }
}

fn invalid(field: &str, reason: &str) -> ValidationError {
    ValidationError::Invalid(format!("{} {}", field, reason))
}

fn days(field: &str, value: &Value, max: u64) -> Result<u32, ValidationError> {
    value
        .as_u64()
        .filter(|d| (1..=max).contains(d))
        .map(|d| d as u32)
        .ok_or_else(|| invalid(field, &format!("must be a whole number of days between 1 and {}", max)))
}

fn variant<T: for<'de> Deserialize<'de>>(field: &str, value: &Value) -> Result<T, ValidationError> {
    serde_json::from_value(value.clone()).map_err(|_| invalid(field, &format!("has unsupported value {}", value)))
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_defaults_for_missing_keys() {
        let prefs = Preferences::from_record(&Record::new()).unwrap();
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn test_known_keys_are_validated() {
        let prefs = Preferences::from_record(&record(json!({
            "expiry_warning_days": 5,
            "pao_reminder_days": 30,
            "week_start": "sunday",
            "units": "imperial",
            "default_category_id": 7
        })))
        .unwrap();

        assert_eq!(prefs.expiry_warning_days, 5);
        assert_eq!(prefs.week_start, WeekStart::Sunday);
        assert_eq!(prefs.units, Units::Imperial);
        assert_eq!(prefs.default_category_id.as_deref(), Some("7"));

        for bad in [
            json!({"expiry_warning_days": 0}),
            json!({"pao_reminder_days": 91}),
            json!({"week_start": "friday"}),
            json!({"units": 3}),
            json!({"expiry_warning_days": "soon"}),
        ] {
            assert!(Preferences::from_record(&record(bad)).is_err());
        }
    }

    #[test]
    fn test_unknown_keys_round_trip() {
        let entity = Entity::new(
            EntityId::new("p1"),
            record(json!({"user_id": "u1", "theme": "dark", "units": "metric"})),
        );
        let prefs = Preferences::from_entity(&entity).unwrap();
        assert_eq!(prefs.extra().get("theme"), Some(&json!("dark")));
        assert!(prefs.extra().get("user_id").is_none());

        let written = prefs.to_record();
        assert_eq!(written.get("theme"), Some(&json!("dark")));
        assert_eq!(written.get("week_start"), Some(&json!("monday")));
        assert_eq!(Preferences::from_record(&written).unwrap(), prefs);
    }
}

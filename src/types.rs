//! Data model (§3): the entities the store persists and the coordinator
//! reconciles. Plain structs — no CRDT merge logic here; the server owns
//! authoritative ordering.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single timestamped user activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub all_day: bool,
    pub notes: Option<String>,
    pub properties: BTreeMap<String, TypedValue>,
    /// Opaque provenance tag (e.g. "manual", "imported"). Preserved
    /// verbatim through create/update/pull — the coordinator never branches
    /// on its value (see DESIGN.md Open Question decisions).
    pub source: String,
    pub server_rev: Option<i64>,
    pub dirty: bool,
    pub deleted: bool,
}

impl Event {
    /// True if `timestamp` is further in the future than `clock`'s wall-clock
    /// time allows (I5). Does not rewrite the timestamp; callers report it.
    pub fn exceeds_future_drift(&self, clock: &dyn crate::clock::Clock, max_drift: std::time::Duration) -> bool {
        crate::clock::exceeds_future_drift(clock, self.timestamp, max_drift)
    }
}

/// A user-defined category of event (e.g. "Run", "Meal").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventType {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub icon: String,
    pub display_order: i32,
    pub server_rev: Option<i64>,
}

/// One field in an `EventType`'s schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: Uuid,
    pub event_type_id: Uuid,
    pub key: String,
    pub label: String,
    #[serde(rename = "type")]
    pub value_type: PropertyType,
    pub options: Vec<String>,
    pub default: Option<TypedValue>,
    pub display_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    Text,
    Number,
    Boolean,
    Date,
    Duration,
    Select,
    Url,
    Email,
}

impl PropertyType {
    /// Validates `value` against this property's declared type and, for
    /// `Select`, the definition's `options`. Structural validation only —
    /// not part of the HTTP/JSON boundary the Non-goals exclude.
    pub fn validate(self, value: &TypedValue, options: &[String]) -> Result<(), String> {
        use TypedValue::*;
        match (self, value) {
            (PropertyType::Text, Text(_)) => Ok(()),
            (PropertyType::Number, Number(_)) => Ok(()),
            (PropertyType::Boolean, Boolean(_)) => Ok(()),
            (PropertyType::Date, Date(_)) => Ok(()),
            (PropertyType::Duration, DurationSecs(_)) => Ok(()),
            (PropertyType::Select, Text(s)) => {
                if options.iter().any(|o| o == s) {
                    Ok(())
                } else {
                    Err(format!("{s:?} is not one of the declared options"))
                }
            }
            (PropertyType::Url, Text(s)) => url_pattern().is_match(s).then_some(()).ok_or_else(|| format!("{s:?} is not a valid url")),
            (PropertyType::Email, Text(s)) => email_pattern().is_match(s).then_some(()).ok_or_else(|| format!("{s:?} is not a valid email")),
            _ => Err("value type does not match property definition".to_string()),
        }
    }
}

fn url_pattern() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^https?://[^\s/$.?#].[^\s]*$").expect("valid regex"))
}

fn email_pattern() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"))
}

/// A value stored under an `Event`'s `properties` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    DurationSecs(i64),
}

/// A geofence the host app's location delegate watches (consumer lives
/// outside the core; this crate only models and bounds the set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: Uuid,
    pub name: String,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
    pub active: bool,
    pub notify_on_entry: bool,
    pub notify_on_exit: bool,
    pub region_identifier: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_rejects_value_outside_options() {
        let options = vec!["run".to_string(), "walk".to_string()];
        assert!(PropertyType::Select
            .validate(&TypedValue::Text("run".to_string()), &options)
            .is_ok());
        assert!(PropertyType::Select
            .validate(&TypedValue::Text("bike".to_string()), &options)
            .is_err());
    }

    #[test]
    fn email_and_url_validation() {
        assert!(PropertyType::Email.validate(&TypedValue::Text("a@b.com".into()), &[]).is_ok());
        assert!(PropertyType::Email.validate(&TypedValue::Text("not-an-email".into()), &[]).is_err());
        assert!(PropertyType::Url.validate(&TypedValue::Text("https://example.com/x".into()), &[]).is_ok());
        assert!(PropertyType::Url.validate(&TypedValue::Text("ftp nope".into()), &[]).is_err());
    }

    #[test]
    fn mismatched_variant_is_rejected() {
        assert!(PropertyType::Number.validate(&TypedValue::Text("5".into()), &[]).is_err());
    }
}

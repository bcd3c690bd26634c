//! Status condition helpers
//!
//! Conditions are built as JSON for merge patches. An existing condition's
//! `lastTransitionTime` is kept while its status does not flip, so repeated
//! reconciles produce identical patches.

use serde::Serialize;
use serde_json::{json, Value};

/// Accepted condition type
pub const ACCEPTED: &str = "Accepted";
/// Programmed condition type
pub const PROGRAMMED: &str = "Programmed";
/// ResolvedRefs condition type
pub const RESOLVED_REFS: &str = "ResolvedRefs";

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn status_str(status: bool) -> &'static str {
    if status {
        "True"
    } else {
        "False"
    }
}

/// The `status` of any serializable resource, `Null` when absent
pub fn status_value<K: Serialize>(object: &K) -> Value {
    serde_json::to_value(object)
        .ok()
        .and_then(|mut v| v.get_mut("status").map(Value::take))
        .unwrap_or(Value::Null)
}

fn find<'a>(conditions: &'a Value, type_: &str) -> Option<&'a Value> {
    conditions
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

/// Build a condition, reusing the transition time from `existing` when the
/// status is unchanged
pub fn condition(
    existing: &Value,
    type_: &str,
    status: bool,
    reason: &str,
    message: &str,
    generation: i64,
) -> Value {
    let status = status_str(status);
    let transition = find(existing, type_)
        .filter(|c| c.get("status").and_then(Value::as_str) == Some(status))
        .and_then(|c| c.get("lastTransitionTime").cloned())
        .unwrap_or_else(|| Value::String(now()));

    json!({
        "type": type_,
        "status": status,
        "reason": reason,
        "message": message,
        "observedGeneration": generation,
        "lastTransitionTime": transition,
    })
}

/// True when `conditions` holds `type_` with the given status observed at
/// `generation`
pub fn has_condition(conditions: &Value, type_: &str, status: bool, generation: i64) -> bool {
    find(conditions, type_).is_some_and(|c| {
        c.get("status").and_then(Value::as_str) == Some(status_str(status))
            && c.get("observedGeneration").and_then(Value::as_i64) == Some(generation)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_time_kept_while_status_stable() {
        let existing = json!([{
            "type": "Accepted",
            "status": "True",
            "lastTransitionTime": "2024-01-01T00:00:00Z",
        }]);

        let same = condition(&existing, ACCEPTED, true, "Accepted", "ok", 2);
        assert_eq!(same["lastTransitionTime"], "2024-01-01T00:00:00Z");
        assert_eq!(same["observedGeneration"], 2);

        let flipped = condition(&existing, ACCEPTED, false, "Invalid", "no", 2);
        assert_ne!(flipped["lastTransitionTime"], "2024-01-01T00:00:00Z");
        assert_eq!(flipped["status"], "False");
    }

    #[test]
    fn test_has_condition_checks_generation() {
        let conditions = json!([{
            "type": "Accepted",
            "status": "True",
            "observedGeneration": 3,
        }]);

        assert!(has_condition(&conditions, ACCEPTED, true, 3));
        assert!(!has_condition(&conditions, ACCEPTED, true, 4));
        assert!(!has_condition(&conditions, ACCEPTED, false, 3));
        assert!(!has_condition(&Value::Null, ACCEPTED, true, 3));
    }

    #[test]
    fn test_status_value_of_resource() {
        let value = json!({"spec": {}, "status": {"conditions": []}});
        assert_eq!(status_value(&value), json!({"conditions": []}));
        assert_eq!(status_value(&json!({"spec": {}})), Value::Null);
    }
}

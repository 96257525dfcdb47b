//! Timestamped status conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tri-state value of a condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One observation about an object, such as `Ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: 0,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Insert or update the condition of the same type.
///
/// The transition time of an existing condition moves only when its status
/// changes; reason, message and observed generation are always replaced.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status != condition.status {
                existing.status = condition.status;
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.observed_generation = condition.observed_generation;
        }
        None => conditions.push(condition),
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_set_condition_inserts() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Pending", "waiting"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(find_condition(&conditions, "Ready").unwrap().reason, "Pending");
    }

    #[test]
    fn test_transition_time_kept_when_status_unchanged() {
        let mut first = Condition::new("Ready", ConditionStatus::False, "A", "a");
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original_time = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "B", "b").with_observed_generation(3),
        );

        let ready = &conditions[0];
        assert_eq!(ready.last_transition_time, original_time);
        assert_eq!(ready.reason, "B");
        assert_eq!(ready.message, "b");
        assert_eq!(ready.observed_generation, 3);
    }

    #[test]
    fn test_transition_time_moves_on_status_change() {
        let mut first = Condition::new("Ready", ConditionStatus::False, "A", "a");
        first.last_transition_time = Utc::now() - Duration::hours(1);
        let original_time = first.last_transition_time;
        let mut conditions = vec![first];

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "B", "b"),
        );

        assert!(conditions[0].is_true());
        assert!(conditions[0].last_transition_time > original_time);
    }

    #[test]
    fn test_status_serializes_as_string() {
        let json = serde_json::to_value(Condition::new("Ready", ConditionStatus::True, "", ""))
            .unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Answer field that drives the derived `satisfied` flag.
pub const SATISFACTION_FIELD: &str = "attentes";

/// Answers to [`SATISFACTION_FIELD`] that count as a satisfied respondent.
pub const SATISFIED_ANSWERS: [&str; 2] = ["Très satisfait", "Plutôt satisfait"];

/// A filled survey form as handed over by the form layer, already validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormData {
    /// Training section the respondent belongs to.
    pub section: String,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
}

impl FormData {
    pub fn new(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            answers: BTreeMap::new(),
        }
    }

    pub fn with_answer(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.answers.insert(field.into(), value.into());
        self
    }

    pub fn satisfied(&self) -> bool {
        self.answers
            .get(SATISFACTION_FIELD)
            .map(|answer| SATISFIED_ANSWERS.contains(&answer.as_str()))
            .unwrap_or(false)
    }
}

/// A form stamped with identity and time, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormResponse {
    pub id: String,
    pub section: String,
    pub answers: BTreeMap<String, String>,
    pub satisfied: bool,
    pub submitted_at: DateTime<Utc>,
}

impl FormResponse {
    pub fn stamp(id: String, form: FormData, submitted_at: DateTime<Utc>) -> Self {
        let satisfied = form.satisfied();
        Self {
            id,
            section: form.section,
            answers: form.answers,
            satisfied,
            submitted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_follows_expectations_answer() {
        let happy = FormData::new("B1").with_answer(SATISFACTION_FIELD, "Plutôt satisfait");
        let unhappy = FormData::new("B1").with_answer(SATISFACTION_FIELD, "Très insatisfait");
        let blank = FormData::new("B1");

        assert!(happy.satisfied());
        assert!(!unhappy.satisfied());
        assert!(!blank.satisfied());
    }

    #[test]
    fn stamp_keeps_answers_and_derives_flag() {
        let now = Utc::now();
        let form = FormData::new("A2")
            .with_answer(SATISFACTION_FIELD, "Très satisfait")
            .with_answer("rythme", "Adapté");
        let response = FormResponse::stamp("response-1".into(), form, now);

        assert_eq!(response.id, "response-1");
        assert_eq!(response.section, "A2");
        assert!(response.satisfied);
        assert_eq!(response.answers.get("rythme").map(String::as_str), Some("Adapté"));
        assert_eq!(response.submitted_at, now);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["submittedAt"], serde_json::json!(now));
        assert_eq!(json["satisfied"], true);
    }
}

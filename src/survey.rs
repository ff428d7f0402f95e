//! Survey definitions and the survey-list codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

/// Organisation authorised to run a survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commissioner {
    /// Display name used by the trust policy.
    pub name: String,
}

impl Commissioner {
    /// Creates a commissioner with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One measurement request within a survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Query identifier, unique within its survey.
    pub id: String,
    /// Key selecting the locally stored data points this query counts.
    pub data_key: String,
    /// Ordered cohort labels: literal values or interval expressions.
    pub cohorts: Vec<String>,
    /// Discrete (textual equality) vs interval matching.
    pub discrete: bool,
}

impl Query {
    /// Creates a query definition.
    pub fn new(
        id: impl Into<String>,
        data_key: impl Into<String>,
        cohorts: Vec<String>,
        discrete: bool,
    ) -> Self {
        Self {
            id: id.into(),
            data_key: data_key.into(),
            cohorts,
            discrete,
        }
    }
}

/// Survey published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    /// Coordinator-assigned survey identifier.
    pub id: String,
    /// Human-readable survey name.
    pub name: String,
    /// Owning commissioner, absent for untrusted anonymous surveys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commissioner: Option<Commissioner>,
    /// Ordered queries; an absent array on the wire means no queries.
    #[serde(default)]
    pub queries: Vec<Query>,
}

/// Shared handle to an immutable survey.
pub type SharedSurvey = Arc<Survey>;

/// Stage at which a wire document failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The top-level survey list was not a JSON array.
    #[error("survey list: {0}")]
    SurveyList(String),
    /// A survey object was malformed.
    #[error("survey {index}: {reason}")]
    Survey {
        /// Position of the survey within the list.
        index: usize,
        /// Underlying failure.
        reason: String,
    },
    /// A query inside a survey was malformed.
    #[error("survey {survey}, query {index}: {reason}")]
    Query {
        /// Identifier of the enclosing survey.
        survey: String,
        /// Position of the query within the survey.
        index: usize,
        /// Underlying failure.
        reason: String,
    },
    /// A survey response document was malformed.
    #[error("response: {0}")]
    Response(String),
    /// A delegate message envelope was malformed.
    #[error("message: {0}")]
    Message(String),
}

impl Survey {
    /// Creates a survey without commissioner or queries.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            commissioner: None,
            queries: Vec::new(),
        }
    }

    /// Sets the owning commissioner.
    pub fn with_commissioner(mut self, name: impl Into<String>) -> Self {
        self.commissioner = Some(Commissioner::new(name));
        self
    }

    /// Appends a query.
    pub fn with_query(mut self, query: Query) -> Self {
        self.queries.push(query);
        self
    }

    /// Returns the commissioner name, if any.
    pub fn commissioner_name(&self) -> Option<&str> {
        self.commissioner.as_ref().map(|c| c.name.as_str())
    }

    /// Parses a JSON array of surveys.
    ///
    /// An empty array yields an empty list.  Each survey is decoded on its
    /// own so a failure names the offending survey or query.
    pub fn list_from_slice(data: &[u8]) -> Result<Vec<SharedSurvey>, DecodeError> {
        let root: Value =
            serde_json::from_slice(data).map_err(|err| DecodeError::SurveyList(err.to_string()))?;
        let items = match root {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::SurveyList(format!(
                    "expected array, found {}",
                    json_kind(&other)
                )))
            }
        };
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Self::from_value(index, item).map(Arc::new))
            .collect()
    }

    /// Parses a single survey object.
    pub fn from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(data).map_err(|err| DecodeError::Survey {
            index: 0,
            reason: err.to_string(),
        })?;
        Self::from_value(0, value)
    }

    /// Serialises the survey to its JSON wire form.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Serialises a list of surveys to a JSON array.
    pub fn list_to_json_vec(surveys: &[SharedSurvey]) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(surveys)
    }

    fn from_value(index: usize, value: Value) -> Result<Self, DecodeError> {
        let Value::Object(mut object) = value else {
            return Err(DecodeError::Survey {
                index,
                reason: "expected object".to_string(),
            });
        };
        let raw_queries = object.remove("queries");
        let mut survey: Survey =
            serde_json::from_value(Value::Object(object)).map_err(|err| DecodeError::Survey {
                index,
                reason: err.to_string(),
            })?;

        let raw_queries = match raw_queries {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items,
            Some(other) => {
                return Err(DecodeError::Survey {
                    index,
                    reason: format!("queries must be an array, found {}", json_kind(&other)),
                })
            }
        };
        let mut seen = HashSet::new();
        for (query_index, raw) in raw_queries.into_iter().enumerate() {
            let query: Query = serde_json::from_value(raw).map_err(|err| DecodeError::Query {
                survey: survey.id.clone(),
                index: query_index,
                reason: err.to_string(),
            })?;
            if !seen.insert(query.id.clone()) {
                return Err(DecodeError::Query {
                    survey: survey.id.clone(),
                    index: query_index,
                    reason: format!("duplicate query id {}", query.id),
                });
            }
            let mut labels = HashSet::new();
            if let Some(dup) = query.cohorts.iter().find(|label| !labels.insert(*label)) {
                return Err(DecodeError::Query {
                    survey: survey.id.clone(),
                    index: query_index,
                    reason: format!("duplicate cohort label {dup}"),
                });
            }
            survey.queries.push(query);
        }
        Ok(survey)
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_array_yields_no_surveys() {
        let surveys = Survey::list_from_slice(b"[]").unwrap();
        assert!(surveys.is_empty());
    }

    #[test]
    fn survey_without_queries() {
        let surveys = Survey::list_from_slice(br#"[{"id": "1234", "name": "test"}]"#).unwrap();
        assert_eq!(surveys.len(), 1);
        assert_eq!(surveys[0].id, "1234");
        assert_eq!(surveys[0].name, "test");
        assert!(surveys[0].queries.is_empty());
        assert!(surveys[0].commissioner.is_none());
    }

    #[test]
    fn survey_with_query_and_commissioner() {
        let data = br#"[{"id": "1234", "name": "test",
            "commissioner": {"name": "KDE"},
            "queries": [{"id": "1", "data_key": "timestamp",
                         "cohorts": ["1", "2"], "discrete": true}]}]"#;
        let surveys = Survey::list_from_slice(data).unwrap();
        let survey = &surveys[0];
        assert_eq!(survey.commissioner_name(), Some("KDE"));
        assert_eq!(survey.queries.len(), 1);
        assert_eq!(survey.queries[0].id, "1");
        assert_eq!(survey.queries[0].data_key, "timestamp");
        assert_eq!(survey.queries[0].cohorts, vec!["1", "2"]);
        assert!(survey.queries[0].discrete);
    }

    #[test]
    fn decode_errors_name_the_stage() {
        assert!(matches!(
            Survey::list_from_slice(b"{}"),
            Err(DecodeError::SurveyList(_))
        ));
        assert!(matches!(
            Survey::list_from_slice(b"not json"),
            Err(DecodeError::SurveyList(_))
        ));
        assert!(matches!(
            Survey::list_from_slice(br#"[{"id": "1"}]"#),
            Err(DecodeError::Survey { index: 0, .. })
        ));
        assert!(matches!(
            Survey::list_from_slice(br#"[{"id": "1", "name": "a"}, 7]"#),
            Err(DecodeError::Survey { index: 1, .. })
        ));
        let bad_query = br#"[{"id": "s", "name": "n",
            "queries": [{"id": "1", "data_key": "k", "cohorts": "x", "discrete": true}]}]"#;
        match Survey::list_from_slice(bad_query) {
            Err(DecodeError::Query { survey, index, .. }) => {
                assert_eq!(survey, "s");
                assert_eq!(index, 0);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_identifiers() {
        let dup_query = br#"[{"id": "s", "name": "n", "queries": [
            {"id": "1", "data_key": "k", "cohorts": [], "discrete": true},
            {"id": "1", "data_key": "j", "cohorts": [], "discrete": true}]}]"#;
        assert!(matches!(
            Survey::list_from_slice(dup_query),
            Err(DecodeError::Query { index: 1, .. })
        ));
        let dup_cohort = br#"[{"id": "s", "name": "n", "queries": [
            {"id": "1", "data_key": "k", "cohorts": ["a", "a"], "discrete": true}]}]"#;
        assert!(matches!(
            Survey::list_from_slice(dup_cohort),
            Err(DecodeError::Query { index: 0, .. })
        ));
    }

    #[test]
    fn encode_then_decode_reproduces_survey() {
        let survey = Survey::new("s-1", "Usage")
            .with_commissioner("KDE")
            .with_query(Query::new(
                "q1",
                "age",
                vec!["[0, 18)".into(), "[18, inf)".into()],
                false,
            ))
            .with_query(Query::new("q2", "distro", vec!["arch".into()], true));
        let bytes = survey.to_json_vec().unwrap();
        assert_eq!(Survey::from_slice(&bytes).unwrap(), survey);

        let list = vec![Arc::new(survey)];
        let bytes = Survey::list_to_json_vec(&list).unwrap();
        assert_eq!(Survey::list_from_slice(&bytes).unwrap(), list);
    }
}

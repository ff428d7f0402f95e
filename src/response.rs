//! Survey responses and the cohort binning that produces them.
//!
//! Responses are generic over the per-cohort value: plaintext counts
//! (`u64`) on the client before encryption and after the delegate decrypts
//! the aggregate, or [`Ciphertext`]s while in transit between group members.
//! Survey, query and cohort identifiers travel in the clear either way.

use crate::encryption::{Ciphertext, Encryption, EncryptionError};
use crate::interval::Interval;
use crate::survey::{DecodeError, Query, Survey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Per-cohort values answering one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse<V> {
    /// Identifier of the answered query.
    pub query_id: String,
    /// Value for every cohort label of the query.
    pub cohort_data: BTreeMap<String, V>,
}

/// Answers to the queries of one survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponse<V> {
    /// Identifier of the answered survey.
    pub survey_id: String,
    /// One entry per query that had local data.
    pub query_responses: Vec<QueryResponse<V>>,
}

/// Plaintext query response.
pub type PlainQueryResponse = QueryResponse<u64>;
/// Plaintext survey response.
pub type PlainSurveyResponse = SurveyResponse<u64>;
/// Query response with encrypted counts.
pub type EncryptedQueryResponse = QueryResponse<Ciphertext>;
/// Survey response with encrypted counts.
pub type EncryptedSurveyResponse = SurveyResponse<Ciphertext>;

impl<V> QueryResponse<V> {
    /// Creates a query response from cohort values.
    pub fn new(query_id: impl Into<String>, cohort_data: BTreeMap<String, V>) -> Self {
        Self {
            query_id: query_id.into(),
            cohort_data,
        }
    }
}

impl<V> SurveyResponse<V> {
    /// Creates an empty response for `survey_id`.
    pub fn new(survey_id: impl Into<String>) -> Self {
        Self {
            survey_id: survey_id.into(),
            query_responses: Vec::new(),
        }
    }

    /// Looks up the response for `query_id`.
    pub fn query(&self, query_id: &str) -> Option<&QueryResponse<V>> {
        self.query_responses.iter().find(|q| q.query_id == query_id)
    }
}

impl<V: Serialize + DeserializeOwned> SurveyResponse<V> {
    /// Serialises the response to its JSON wire form.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parses a response, rejecting duplicate query identifiers.
    pub fn from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let value = serde_json::from_slice(data).map_err(|err| DecodeError::Response(err.to_string()))?;
        Self::from_value(value)
    }

    /// Decodes a response from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, DecodeError> {
        let response: Self =
            serde_json::from_value(value).map_err(|err| DecodeError::Response(err.to_string()))?;
        let mut seen = HashSet::new();
        for query in &response.query_responses {
            if !seen.insert(query.query_id.as_str()) {
                return Err(DecodeError::Response(format!(
                    "duplicate query id {}",
                    query.query_id
                )));
            }
        }
        Ok(response)
    }
}

impl PlainSurveyResponse {
    /// Encrypts every count under the group's aggregation public key.
    pub fn encrypt(
        &self,
        encryption: &Encryption,
        public_key: &str,
    ) -> Result<EncryptedSurveyResponse, EncryptionError> {
        let mut query_responses = Vec::with_capacity(self.query_responses.len());
        for query in &self.query_responses {
            let mut cohort_data = BTreeMap::new();
            for (label, count) in &query.cohort_data {
                cohort_data.insert(label.clone(), encryption.encrypt(*count, public_key)?);
            }
            query_responses.push(QueryResponse::new(query.query_id.clone(), cohort_data));
        }
        Ok(SurveyResponse {
            survey_id: self.survey_id.clone(),
            query_responses,
        })
    }
}

impl EncryptedSurveyResponse {
    /// Decrypts every count with this client's key pair.
    pub fn decrypt(&self, encryption: &Encryption) -> Result<PlainSurveyResponse, EncryptionError> {
        let mut query_responses = Vec::with_capacity(self.query_responses.len());
        for query in &self.query_responses {
            let mut cohort_data = BTreeMap::new();
            for (label, ciphertext) in &query.cohort_data {
                cohort_data.insert(label.clone(), encryption.decrypt(ciphertext)?);
            }
            query_responses.push(QueryResponse::new(query.query_id.clone(), cohort_data));
        }
        Ok(SurveyResponse {
            survey_id: self.survey_id.clone(),
            query_responses,
        })
    }
}

/// Bins stored values into the cohorts of `query`.
///
/// Returns `None` when `values` is empty so that a missing data key is
/// distinguishable from a response full of zeros.  Every cohort appears in
/// the result, including those with a zero count.  In interval mode a
/// cohort label that fails to parse, or a stored value that is not a
/// number, simply never matches.
pub fn build_query_response<S: AsRef<str>>(query: &Query, values: &[S]) -> Option<PlainQueryResponse> {
    if values.is_empty() {
        return None;
    }
    let values: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
    let mut cohort_data = BTreeMap::new();
    if query.discrete {
        for cohort in &query.cohorts {
            let count = values.iter().filter(|v| **v == cohort.as_str()).count() as u64;
            cohort_data.insert(cohort.clone(), count);
        }
    } else {
        let numeric: Vec<f64> = values
            .iter()
            .filter_map(|v| v.trim().parse::<f64>().ok())
            .filter(|v| !v.is_nan())
            .collect();
        for cohort in &query.cohorts {
            let count = match cohort.parse::<Interval>() {
                Ok(interval) => numeric.iter().filter(|v| interval.contains(**v)).count() as u64,
                Err(err) => {
                    tracing::debug!(query = %query.id, cohort = %cohort, %err, "unparsable interval cohort");
                    0
                }
            };
            cohort_data.insert(cohort.clone(), count);
        }
    }
    Some(QueryResponse::new(query.id.clone(), cohort_data))
}

/// Builds a survey response, consulting `lookup` for each query's data key.
///
/// Queries without stored values are omitted.
pub fn build_survey_response<F>(survey: &Survey, mut lookup: F) -> PlainSurveyResponse
where
    F: FnMut(&str) -> Vec<String>,
{
    let mut response = SurveyResponse::new(survey.id.clone());
    for query in &survey.queries {
        let values = lookup(&query.data_key);
        if let Some(query_response) = build_query_response(query, &values) {
            response.query_responses.push(query_response);
        }
    }
    response
}

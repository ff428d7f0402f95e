//! Homomorphic aggregation of encrypted survey responses.

use crate::encryption::{Ciphertext, Encryption, EncryptionError};
use crate::response::{EncryptedSurveyResponse, QueryResponse, SurveyResponse};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Reasons an aggregation attempt is rejected.
#[derive(Debug, Error)]
pub enum AggregationError {
    /// No responses were supplied.
    #[error("nothing to aggregate")]
    Empty,
    /// A response belonged to a different survey than the first one.
    #[error("survey id mismatch: expected {expected}, found {found}")]
    SurveyIdMismatch {
        /// Survey id of the first response.
        expected: String,
        /// Conflicting survey id.
        found: String,
    },
    /// Two responses disagreed on the cohort labels of one query.
    #[error("inconsistent cohort sets for query {query_id}")]
    CohortMismatch {
        /// Query whose cohort sets differ.
        query_id: String,
    },
    /// A response listed the same query twice.
    #[error("query {query_id} appears more than once in one response")]
    DuplicateQuery {
        /// Repeated query id.
        query_id: String,
    },
    /// Homomorphic addition failed on a malformed ciphertext.
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// Combines same-survey encrypted responses into one.
///
/// For every query present in at least one input, each cohort value of the
/// result is the homomorphic sum of that cohort across the inputs carrying
/// the query.  A response without a query contributes nothing for it; no
/// encrypted zero is invented.  Query responses in the result are ordered by
/// query id so the output does not depend on input order.
pub fn aggregate(
    encryption: &Encryption,
    responses: &[EncryptedSurveyResponse],
) -> Result<EncryptedSurveyResponse, AggregationError> {
    let first = responses.first().ok_or(AggregationError::Empty)?;
    if let Some(other) = responses.iter().find(|r| r.survey_id != first.survey_id) {
        return Err(AggregationError::SurveyIdMismatch {
            expected: first.survey_id.clone(),
            found: other.survey_id.clone(),
        });
    }

    let mut sums: BTreeMap<String, BTreeMap<String, Ciphertext>> = BTreeMap::new();
    for response in responses {
        let mut seen = BTreeSet::new();
        for query in &response.query_responses {
            if !seen.insert(query.query_id.as_str()) {
                return Err(AggregationError::DuplicateQuery {
                    query_id: query.query_id.clone(),
                });
            }
            match sums.get_mut(&query.query_id) {
                None => {
                    sums.insert(query.query_id.clone(), query.cohort_data.clone());
                }
                Some(acc) => {
                    if !acc.keys().eq(query.cohort_data.keys()) {
                        return Err(AggregationError::CohortMismatch {
                            query_id: query.query_id.clone(),
                        });
                    }
                    for (label, ciphertext) in &query.cohort_data {
                        if let Some(current) = acc.get_mut(label) {
                            *current = encryption.add(current, ciphertext)?;
                        }
                    }
                }
            }
        }
    }

    Ok(SurveyResponse {
        survey_id: first.survey_id.clone(),
        query_responses: sums
            .into_iter()
            .map(|(query_id, cohort_data)| QueryResponse::new(query_id, cohort_data))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::AggregationKeyPair;
    use crate::response::PlainSurveyResponse;
    use proptest::prelude::*;

    fn plain(survey: &str, queries: &[(&str, &[(&str, u64)])]) -> PlainSurveyResponse {
        let mut response = SurveyResponse::new(survey);
        for (query_id, cohorts) in queries {
            let data = cohorts
                .iter()
                .map(|(label, count)| (label.to_string(), *count))
                .collect();
            response.query_responses.push(QueryResponse::new(*query_id, data));
        }
        response
    }

    fn identity(response: &PlainSurveyResponse) -> EncryptedSurveyResponse {
        response.encrypt(&Encryption::Identity, "").unwrap()
    }

    #[test]
    fn sums_single_query() {
        let enc = Encryption::Identity;
        let a = identity(&plain("s", &[("q", &[("x", 1), ("y", 2)])]));
        let b = identity(&plain("s", &[("q", &[("x", 3), ("y", 0)])]));
        let result = aggregate(&enc, &[a, b]).unwrap().decrypt(&enc).unwrap();
        assert_eq!(result, plain("s", &[("q", &[("x", 4), ("y", 2)])]));
    }

    #[test]
    fn sums_multiple_queries_and_skips_missing_ones() {
        let enc = Encryption::Identity;
        let a = identity(&plain("s", &[("q1", &[("x", 1)]), ("q2", &[("z", 5)])]));
        let b = identity(&plain("s", &[("q1", &[("x", 2)])]));
        let result = aggregate(&enc, &[a, b]).unwrap().decrypt(&enc).unwrap();
        assert_eq!(
            result,
            plain("s", &[("q1", &[("x", 3)]), ("q2", &[("z", 5)])])
        );
    }

    #[test]
    fn rejects_differing_survey_ids() {
        let enc = Encryption::Identity;
        let a = identity(&plain("s1", &[]));
        let b = identity(&plain("s2", &[]));
        match aggregate(&enc, &[a, b]) {
            Err(AggregationError::SurveyIdMismatch { expected, found }) => {
                assert_eq!(expected, "s1");
                assert_eq!(found, "s2");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_inconsistent_cohorts() {
        let enc = Encryption::Identity;
        let a = identity(&plain("s", &[("q", &[("x", 1)])]));
        let b = identity(&plain("s", &[("q", &[("x", 1), ("y", 1)])]));
        assert!(matches!(
            aggregate(&enc, &[a, b]),
            Err(AggregationError::CohortMismatch { .. })
        ));
    }

    #[test]
    fn rejects_empty_and_duplicate_input() {
        let enc = Encryption::Identity;
        assert!(matches!(aggregate(&enc, &[]), Err(AggregationError::Empty)));
        let dup = identity(&plain("s", &[("q", &[("x", 1)]), ("q", &[("x", 1)])]));
        assert!(matches!(
            aggregate(&enc, &[dup]),
            Err(AggregationError::DuplicateQuery { .. })
        ));
    }

    #[test]
    fn elgamal_aggregate_decrypts_to_sum() {
        let delegate = Encryption::ElGamal(AggregationKeyPair::generate());
        let key = delegate.public_key();
        let member = Encryption::ElGamal(AggregationKeyPair::generate());
        let a = plain("s", &[("q", &[("x", 2), ("y", 0)])])
            .encrypt(&member, &key)
            .unwrap();
        let b = plain("s", &[("q", &[("x", 5), ("y", 1)])])
            .encrypt(&delegate, &key)
            .unwrap();
        let forward = aggregate(&delegate, &[a.clone(), b.clone()]).unwrap();
        let backward = aggregate(&delegate, &[b, a]).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(
            forward.decrypt(&delegate).unwrap(),
            plain("s", &[("q", &[("x", 7), ("y", 1)])])
        );
    }

    fn arb_response() -> impl Strategy<Value = PlainSurveyResponse> {
        (any::<bool>(), 0u64..50, 0u64..50, any::<bool>(), 0u64..50).prop_map(
            |(has_q1, x, y, has_q2, z)| {
                let mut response = SurveyResponse::new("s");
                if has_q1 {
                    response.query_responses.push(QueryResponse::new(
                        "q1",
                        [("x".to_string(), x), ("y".to_string(), y)].into_iter().collect(),
                    ));
                }
                if has_q2 {
                    response
                        .query_responses
                        .push(QueryResponse::new("q2", [("z".to_string(), z)].into_iter().collect()));
                }
                response
            },
        )
    }

    proptest! {
        #[test]
        fn result_is_independent_of_input_order(
            (responses, shuffled) in prop::collection::vec(arb_response(), 1..6)
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let enc = Encryption::Identity;
            let forward: Vec<_> = responses.iter().map(identity).collect();
            let permuted: Vec<_> = shuffled.iter().map(identity).collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            let expected = aggregate(&enc, &forward).unwrap();
            prop_assert_eq!(&aggregate(&enc, &permuted).unwrap(), &expected);
            prop_assert_eq!(&aggregate(&enc, &reversed).unwrap(), &expected);

            // Grouping: aggregate(a ++ b) == aggregate([aggregate(a), aggregate(b)]).
            if forward.len() > 1 {
                let (left, right) = forward.split_at(forward.len() / 2);
                let nested = aggregate(
                    &enc,
                    &[aggregate(&enc, left).unwrap(), aggregate(&enc, right).unwrap()],
                )
                .unwrap();
                prop_assert_eq!(&nested, &expected);
            }
        }
    }
}

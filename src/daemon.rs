//! Protocol orchestrator.
//!
//! One cycle runs three phases in order: survey discovery, polling of
//! `Initial` signups (including delivery of non-delegate contributions), and
//! delegate aggregation.  Exchanges inside a phase run concurrently and are
//! joined before any record is mutated; the next phase starts only after the
//! previous one has fully settled.  Every per-record failure is logged and
//! counted, then treated as "no progress" until the next cycle.

use crate::aggregate::{aggregate, AggregationError};
use crate::encryption::{Encryption, EncryptionError};
use crate::network::{Network, TransportError};
use crate::policy::CommissionerPolicy;
use crate::response::{build_survey_response, EncryptedSurveyResponse, PlainSurveyResponse};
use crate::signup::{apply_status, SignupRecord, SignupState, SignupStatus, Transition};
use crate::storage::{Storage, StorageError};
use crate::survey::{DecodeError, SharedSurvey, Survey};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Default bound on a single coordinator exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Counters describing one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Surveys listed by the coordinator.
    pub surveys_fetched: usize,
    /// New signup records created.
    pub signups_created: usize,
    /// Signup state transitions applied.
    pub transitions: usize,
    /// Non-delegate contributions delivered to a delegate.
    pub contributions_delivered: usize,
    /// Peer messages parsed by a delegate.
    pub messages_accepted: usize,
    /// Peer messages skipped as malformed.
    pub messages_rejected: usize,
    /// Aggregates submitted to the coordinator.
    pub results_submitted: usize,
    /// Per-record failures downgraded to "no progress".
    pub failures: usize,
}

#[derive(Debug, Error)]
enum StepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
}

struct Delivery {
    record: SignupRecord,
    delegate_public_key: String,
    contribution: PlainSurveyResponse,
    body: Vec<u8>,
}

struct Submission {
    record: SignupRecord,
    body: Vec<u8>,
}

/// Drives the signup lifecycle of every survey this client takes part in.
pub struct Daemon {
    storage: Box<dyn Storage>,
    network: Arc<dyn Network>,
    encryption: Encryption,
    policy: CommissionerPolicy,
    exchange_timeout: Duration,
}

impl Daemon {
    /// Creates an orchestrator over the given collaborators.
    pub fn new(
        storage: Box<dyn Storage>,
        network: Arc<dyn Network>,
        encryption: Encryption,
        policy: CommissionerPolicy,
    ) -> Self {
        Self {
            storage,
            network,
            encryption,
            policy,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
        }
    }

    /// Overrides the per-exchange time budget.
    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Read access to the record store.
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Write access to the record store.
    pub fn storage_mut(&mut self) -> &mut dyn Storage {
        self.storage.as_mut()
    }

    /// Encryption provider in use.
    pub fn encryption(&self) -> &Encryption {
        &self.encryption
    }

    /// Runs one full cycle and reports what happened.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        debug!("cycle started");
        self.discover(&mut report).await;
        self.poll_initial(&mut report).await;
        self.aggregate_delegated(&mut report).await;
        info!(
            surveys = report.surveys_fetched,
            signups = report.signups_created,
            transitions = report.transitions,
            delivered = report.contributions_delivered,
            submitted = report.results_submitted,
            failures = report.failures,
            "cycle finished"
        );
        report
    }

    /// Repeats cycles every `interval` until `shutdown` resolves.
    ///
    /// Returns the number of cycles completed.
    pub async fn run_until<F>(&mut self, interval: Duration, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        let mut cycles = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!(cycles, "shutdown requested");
                    return cycles;
                }
                _ = ticker.tick() => {
                    self.run_cycle().await;
                    cycles += 1;
                }
            }
        }
    }

    /// Repeats cycles every `interval` until Ctrl+C.
    #[cfg(feature = "net")]
    pub async fn run_forever(&mut self, interval: Duration) -> usize {
        self.run_until(interval, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    async fn discover(&mut self, report: &mut CycleReport) {
        let timeout = self.exchange_timeout;
        let body = match bounded(timeout, self.network.list_surveys()).await {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "survey discovery failed");
                report.failures += 1;
                return;
            }
        };
        let surveys = match Survey::list_from_slice(&body) {
            Ok(surveys) => surveys,
            Err(err) => {
                warn!(%err, "survey list rejected");
                report.failures += 1;
                return;
            }
        };
        report.surveys_fetched = surveys.len();

        let mut known: HashSet<String> = match self.storage.list_signup_records() {
            Ok(records) => records.iter().map(|r| r.survey_id().to_string()).collect(),
            Err(err) => {
                error!(%err, "cannot read signup records");
                report.failures += 1;
                return;
            }
        };

        let mut eligible: Vec<SharedSurvey> = Vec::new();
        for survey in surveys {
            if !known.insert(survey.id.clone()) {
                continue;
            }
            if !self.policy.permits(&survey) {
                debug!(survey = %survey.id, commissioner = ?survey.commissioner_name(), "untrusted commissioner");
                continue;
            }
            match self.has_required_data(&survey) {
                Ok(true) => eligible.push(survey),
                Ok(false) => debug!(survey = %survey.id, "missing local data"),
                Err(err) => {
                    error!(survey = %survey.id, %err, "cannot read data points");
                    report.failures += 1;
                }
            }
        }

        let public_key = self.encryption.public_key();
        let network = Arc::clone(&self.network);
        let replies = join_all(
            eligible
                .iter()
                .map(|survey| bounded(timeout, network.sign_up(&survey.id, &public_key))),
        )
        .await;

        for (survey, reply) in eligible.into_iter().zip(replies) {
            let client_public_key = match reply {
                Ok(key) => key,
                Err(err) => {
                    warn!(survey = %survey.id, %err, "signup failed");
                    report.failures += 1;
                    continue;
                }
            };
            let survey_id = survey.id.clone();
            match self
                .storage
                .add_signup_record(SignupRecord::new(survey, client_public_key))
            {
                Ok(()) => {
                    info!(survey = %survey_id, "signed up");
                    report.signups_created += 1;
                }
                Err(err) => {
                    error!(survey = %survey_id, %err, "signup not recorded");
                    report.failures += 1;
                }
            }
        }
    }

    async fn poll_initial(&mut self, report: &mut CycleReport) {
        let records = match self.storage.list_signup_records_in_state(SignupState::Initial) {
            Ok(records) => records,
            Err(err) => {
                error!(%err, "cannot read initial signups");
                report.failures += 1;
                return;
            }
        };
        let timeout = self.exchange_timeout;
        let network = Arc::clone(&self.network);
        let replies = join_all(
            records
                .iter()
                .map(|r| bounded(timeout, network.get_signup_state(&r.client_public_key))),
        )
        .await;

        let mut deliveries = Vec::new();
        for (mut record, reply) in records.into_iter().zip(replies) {
            let status = match reply
                .map_err(|e| e.to_string())
                .and_then(|body| SignupStatus::from_slice(&body).map_err(|e| e.to_string()))
            {
                Ok(status) => status,
                Err(err) => {
                    warn!(survey = %record.survey_id(), %err, "signup status unavailable");
                    report.failures += 1;
                    continue;
                }
            };
            match apply_status(&mut record, &status) {
                Transition::Waiting | Transition::Ignored => {}
                Transition::BecameDelegate => {
                    info!(survey = %record.survey_id(), group_size = ?record.group_size, "elected delegate");
                    if self.save(&record, report) {
                        report.transitions += 1;
                    }
                }
                Transition::DeliverToDelegate {
                    delegate_public_key,
                    aggregation_public_key,
                } => {
                    if !self.save(&record, report) {
                        continue;
                    }
                    match self.prepare_contribution(&record, &aggregation_public_key) {
                        Ok((contribution, body)) => deliveries.push(Delivery {
                            record,
                            delegate_public_key,
                            contribution,
                            body,
                        }),
                        Err(err) => {
                            warn!(survey = %record.survey_id(), %err, "contribution not prepared");
                            report.failures += 1;
                        }
                    }
                }
            }
        }

        let outcomes = join_all(deliveries.iter().map(|d| {
            bounded(
                timeout,
                network.post_message_to_delegate(&d.delegate_public_key, d.body.clone()),
            )
        }))
        .await;

        for (delivery, outcome) in deliveries.into_iter().zip(outcomes) {
            let Delivery {
                mut record,
                contribution,
                ..
            } = delivery;
            if let Err(err) = outcome {
                warn!(survey = %record.survey_id(), %err, "delivery to delegate failed");
                report.failures += 1;
                continue;
            }
            if let Err(err) = self.storage.add_survey_response(&contribution) {
                error!(survey = %record.survey_id(), %err, "contribution not archived");
                report.failures += 1;
            }
            record.state = SignupState::Done;
            if self.save(&record, report) {
                info!(survey = %record.survey_id(), "contribution delivered");
                report.transitions += 1;
                report.contributions_delivered += 1;
            }
        }
    }

    async fn aggregate_delegated(&mut self, report: &mut CycleReport) {
        let records = match self.storage.list_active_delegate_records() {
            Ok(records) => records,
            Err(err) => {
                error!(%err, "cannot read delegate signups");
                report.failures += 1;
                return;
            }
        };
        let timeout = self.exchange_timeout;
        let network = Arc::clone(&self.network);

        let (resuming, collecting): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.pending_result.is_some());

        let mut submissions = Vec::new();
        for record in resuming {
            let encoded = record.pending_result.as_ref().map(|r| r.to_json_vec());
            match encoded {
                Some(Ok(body)) => {
                    debug!(survey = %record.survey_id(), "resubmitting pending result");
                    if let Err(err) = self.archive_own(&record.survey, None) {
                        error!(survey = %record.survey_id(), %err, "own contribution not archived");
                        report.failures += 1;
                    }
                    submissions.push(Submission { record, body });
                }
                Some(Err(err)) => {
                    error!(survey = %record.survey_id(), %err, "pending result not encodable");
                    report.failures += 1;
                }
                None => {}
            }
        }

        let inboxes = join_all(collecting.iter().map(|r| {
            bounded(timeout, network.get_messages_for_delegate(&r.client_public_key))
        }))
        .await;

        for (record, inbox) in collecting.into_iter().zip(inboxes) {
            let body = match inbox {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!(survey = %record.survey_id(), "no messages yet");
                    Vec::new()
                }
                Err(err) => {
                    warn!(survey = %record.survey_id(), %err, "message fetch failed");
                    report.failures += 1;
                    continue;
                }
            };
            let peers = if body.is_empty() {
                Vec::new()
            } else {
                match parse_messages(&body) {
                    Ok(values) => self.accept_messages(&record, values, report),
                    Err(err) => {
                        warn!(survey = %record.survey_id(), %err, "message envelope rejected");
                        report.failures += 1;
                        continue;
                    }
                }
            };

            let expected = record.group_size.filter(|n| *n > 0).unwrap_or(1);
            let collected = peers.len() + 1;
            if collected < expected {
                debug!(survey = %record.survey_id(), collected, expected, "group incomplete");
                continue;
            }
            if collected > expected {
                error!(
                    survey = %record.survey_id(),
                    collected,
                    expected,
                    "more contributions than group members; holding aggregation"
                );
                report.failures += 1;
                continue;
            }

            let survey_id = record.survey_id().to_string();
            match self.finalize(record, peers) {
                Ok(submission) => submissions.push(submission),
                Err(err) => {
                    error!(survey = %survey_id, %err, "aggregation failed");
                    report.failures += 1;
                }
            }
        }

        let outcomes = join_all(submissions.iter().map(|s| {
            bounded(
                timeout,
                network.post_aggregation_result(&s.record.client_public_key, s.body.clone()),
            )
        }))
        .await;

        for (submission, outcome) in submissions.into_iter().zip(outcomes) {
            let mut record = submission.record;
            if let Err(err) = outcome {
                warn!(survey = %record.survey_id(), %err, "result submission failed");
                report.failures += 1;
                continue;
            }
            record.pending_result = None;
            record.state = SignupState::Done;
            if self.save(&record, report) {
                info!(survey = %record.survey_id(), "aggregate submitted");
                report.transitions += 1;
                report.results_submitted += 1;
            }
        }
    }

    fn accept_messages(
        &self,
        record: &SignupRecord,
        values: Vec<serde_json::Value>,
        report: &mut CycleReport,
    ) -> Vec<EncryptedSurveyResponse> {
        let mut peers = Vec::with_capacity(values.len());
        for value in values {
            match decode_message(value) {
                Ok(message) => {
                    report.messages_accepted += 1;
                    peers.push(message);
                }
                Err(err) => {
                    warn!(survey = %record.survey_id(), %err, "skipping malformed message");
                    report.messages_rejected += 1;
                }
            }
        }
        peers
    }

    // Aggregates, decrypts and persists the result as pending before anything
    // is posted, so a crash after this point re-posts the same payload.
    fn finalize(
        &mut self,
        mut record: SignupRecord,
        peers: Vec<EncryptedSurveyResponse>,
    ) -> Result<Submission, StepError> {
        let (own, result) = self.combine(&record.survey, peers)?;
        let body = result.to_json_vec()?;
        record.pending_result = Some(result);
        self.storage.save_signup_record(&record)?;
        if let Err(err) = self.archive_own(&record.survey, Some(own)) {
            error!(survey = %record.survey_id(), %err, "own contribution not archived");
        }
        Ok(Submission { record, body })
    }

    // At most one archived contribution per survey.
    fn archive_own(
        &mut self,
        survey: &Survey,
        own: Option<PlainSurveyResponse>,
    ) -> Result<(), StepError> {
        let archived = self.storage.list_survey_responses()?;
        if archived.iter().any(|r| r.response.survey_id == survey.id) {
            return Ok(());
        }
        let own = match own {
            Some(own) => own,
            None => self.local_response(survey)?,
        };
        self.storage.add_survey_response(&own)?;
        Ok(())
    }

    fn combine(
        &self,
        survey: &Survey,
        peers: Vec<EncryptedSurveyResponse>,
    ) -> Result<(PlainSurveyResponse, PlainSurveyResponse), StepError> {
        let own = self.local_response(survey)?;
        let mut contributions = Vec::with_capacity(peers.len() + 1);
        contributions.push(own.encrypt(&self.encryption, &self.encryption.public_key())?);
        contributions.extend(peers);
        let combined = aggregate(&self.encryption, &contributions)?;
        Ok((own, combined.decrypt(&self.encryption)?))
    }

    fn prepare_contribution(
        &self,
        record: &SignupRecord,
        aggregation_public_key: &str,
    ) -> Result<(PlainSurveyResponse, Vec<u8>), StepError> {
        let plain = self.local_response(&record.survey)?;
        let body = plain
            .encrypt(&self.encryption, aggregation_public_key)?
            .to_json_vec()?;
        Ok((plain, body))
    }

    fn local_response(&self, survey: &Survey) -> Result<PlainSurveyResponse, StorageError> {
        let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for query in &survey.queries {
            if !values.contains_key(&query.data_key) {
                let points = self.storage.list_data_points(&query.data_key)?;
                values.insert(query.data_key.clone(), points);
            }
        }
        Ok(build_survey_response(survey, |key| {
            values.get(key).cloned().unwrap_or_default()
        }))
    }

    fn has_required_data(&self, survey: &Survey) -> Result<bool, StorageError> {
        for query in &survey.queries {
            if self.storage.list_data_points(&query.data_key)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn save(&mut self, record: &SignupRecord, report: &mut CycleReport) -> bool {
        match self.storage.save_signup_record(record) {
            Ok(()) => true,
            Err(err) => {
                error!(
                    survey = %record.survey_id(),
                    state = %record.state,
                    %err,
                    "signup state not persisted"
                );
                report.failures += 1;
                false
            }
        }
    }
}

async fn bounded<T, F>(timeout: Duration, exchange: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout),
    }
}

fn parse_messages(body: &[u8]) -> Result<Vec<serde_json::Value>, DecodeError> {
    serde_json::from_slice::<MessageEnvelope>(body)
        .map(|envelope| envelope.messages)
        .map_err(|err| DecodeError::Message(err.to_string()))
}

// Coordinators may store messages as JSON text rather than as objects.
fn decode_message(value: serde_json::Value) -> Result<EncryptedSurveyResponse, DecodeError> {
    match value {
        serde_json::Value::String(text) => EncryptedSurveyResponse::from_slice(text.as_bytes()),
        other => EncryptedSurveyResponse::from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_accepts_objects_and_embedded_text() {
        let body = br#"{"messages": [
            {"survey_id": "s", "query_responses": []},
            "{\"survey_id\": \"s\", \"query_responses\": []}",
            {"unexpected": true}
        ]}"#;
        let values = parse_messages(body).unwrap();
        assert_eq!(values.len(), 3);
        let decoded: Vec<_> = values.into_iter().map(decode_message).collect();
        assert!(decoded[0].is_ok());
        assert_eq!(decoded[1].as_ref().unwrap().survey_id, "s");
        assert!(matches!(decoded[2], Err(DecodeError::Response(_))));
    }

    #[test]
    fn envelope_without_messages_is_empty() {
        assert!(parse_messages(b"{}").unwrap().is_empty());
        assert!(matches!(
            parse_messages(b"[1, 2]"),
            Err(DecodeError::Message(_))
        ));
    }

    #[tokio::test]
    async fn bounded_exchange_times_out() {
        let slow = async {
            time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        };
        assert_eq!(
            bounded(Duration::from_millis(10), slow).await,
            Err(TransportError::Timeout)
        );
    }
}

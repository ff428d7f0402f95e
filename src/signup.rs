//! Per-survey participation records and their state machine.
//!
//! ```text
//!  (no record) --signup--> Initial --aggregation started, delegate------> Processing
//!                             |                                             |
//!                             +--aggregation started, not delegate--> Done <+ result submitted
//! ```

use crate::response::PlainSurveyResponse;
use crate::survey::{DecodeError, SharedSurvey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinator-facing status of one signup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignupState {
    /// Signed up, waiting for the coordinator to form a group.
    Initial,
    /// This client is the delegate and is collecting contributions.
    Processing,
    /// This client's contribution has been delivered.
    Done,
}

impl SignupState {
    /// Lowercase wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Processing => "processing",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for SignupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// This client's durable participation state for one survey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupRecord {
    /// Survey this record participates in.
    pub survey: SharedSurvey,
    /// Identity assigned to this client by the coordinator.
    pub client_public_key: String,
    /// Delegate identity, set once the coordinator announces a group.
    #[serde(default)]
    pub delegate_public_key: Option<String>,
    /// Number of contributions the delegate must combine.
    #[serde(default)]
    pub group_size: Option<usize>,
    /// Key under which contributions to this group are encrypted.
    #[serde(default)]
    pub aggregation_public_key: Option<String>,
    /// Current state.
    pub state: SignupState,
    /// Decrypted aggregate awaiting (re)submission by the delegate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_result: Option<PlainSurveyResponse>,
}

impl SignupRecord {
    /// Creates a fresh record in [`SignupState::Initial`].
    pub fn new(survey: SharedSurvey, client_public_key: impl Into<String>) -> Self {
        Self {
            survey,
            client_public_key: client_public_key.into(),
            delegate_public_key: None,
            group_size: None,
            aggregation_public_key: None,
            state: SignupState::Initial,
            pending_result: None,
        }
    }

    /// Survey identifier; records are keyed by it.
    pub fn survey_id(&self) -> &str {
        &self.survey.id
    }

    /// True when this client was announced as the group's delegate.
    pub fn is_delegate(&self) -> bool {
        self.delegate_public_key.as_deref() == Some(self.client_public_key.as_str())
    }

    /// True when the record awaits delegate aggregation.
    pub fn is_active_delegate(&self) -> bool {
        self.state == SignupState::Processing && self.is_delegate()
    }
}

/// Signup status as reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupStatus {
    /// Whether a group has been formed and aggregation has begun.
    pub aggregation_started: bool,
    /// Identity of the group's delegate.
    #[serde(default, alias = "delegate_id")]
    pub delegate_public_key: String,
    /// Number of group members; absent means a group of one.
    #[serde(default)]
    pub group_size: Option<usize>,
    /// Key material contributions must be encrypted under.
    #[serde(default, alias = "aggregation_public_key_material")]
    pub aggregation_public_key: String,
}

impl SignupStatus {
    /// Parses a signup-state document.
    ///
    /// A started aggregation announcing an empty group is rejected.
    pub fn from_slice(data: &[u8]) -> Result<Self, DecodeError> {
        let status: Self =
            serde_json::from_slice(data).map_err(|err| DecodeError::Response(err.to_string()))?;
        if status.aggregation_started && status.effective_group_size().is_none() {
            return Err(DecodeError::Response("group_size must be positive".into()));
        }
        Ok(status)
    }

    /// Announced group size, defaulting to one; `None` for an explicit zero.
    pub fn effective_group_size(&self) -> Option<usize> {
        match self.group_size {
            Some(0) => None,
            Some(n) => Some(n),
            None => Some(1),
        }
    }
}

/// What the orchestrator must do after applying a signup status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Aggregation has not started; poll again next cycle.
    Waiting,
    /// This client became the delegate; the record is now `Processing`.
    BecameDelegate,
    /// Another member is the delegate; deliver the contribution to it.
    DeliverToDelegate {
        /// Delegate identity to address.
        delegate_public_key: String,
        /// Key to encrypt the contribution under.
        aggregation_public_key: String,
    },
    /// The record is not in `Initial`; nothing applies.
    Ignored,
}

/// Applies a coordinator status to an `Initial` record.
///
/// The delegate branch updates the record in place.  The non-delegate
/// branch records the delegate identity and group parameters but leaves the
/// state at `Initial`; the orchestrator marks it `Done` once delivery
/// succeeds so the contribution cannot be lost.
pub fn apply_status(record: &mut SignupRecord, status: &SignupStatus) -> Transition {
    if record.state != SignupState::Initial {
        return Transition::Ignored;
    }
    let group_size = match status.effective_group_size() {
        Some(n) if status.aggregation_started => n,
        _ => return Transition::Waiting,
    };
    record.delegate_public_key = Some(status.delegate_public_key.clone());
    record.group_size = Some(group_size);
    record.aggregation_public_key = Some(status.aggregation_public_key.clone());
    if record.is_delegate() {
        record.state = SignupState::Processing;
        Transition::BecameDelegate
    } else {
        Transition::DeliverToDelegate {
            delegate_public_key: status.delegate_public_key.clone(),
            aggregation_public_key: status.aggregation_public_key.clone(),
        }
    }
}

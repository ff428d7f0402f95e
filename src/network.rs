//! Network collaborator consumed by the orchestrator.
//!
//! Implementations must bound every exchange in time; the orchestrator adds
//! its own timeout on top, so a hung peer costs one cycle at most.

use async_trait::async_trait;
use thiserror::Error;

/// Transport-level failure; always recoverable on the next cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request could not be sent or the body not read.
    #[error("request failed: {0}")]
    Request(String),
    /// The peer answered with a non-success status.
    #[error("unexpected status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The exchange exceeded its time budget.
    #[error("exchange timed out")]
    Timeout,
    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Coordinator-facing exchanges.
#[async_trait]
pub trait Network: Send + Sync {
    /// Raw JSON survey list.
    async fn list_surveys(&self) -> Result<Vec<u8>, TransportError>;

    /// Signs up for `survey_id`, advertising this client's aggregation key.
    /// Returns the client identity assigned by the coordinator.
    async fn sign_up(
        &self,
        survey_id: &str,
        aggregation_public_key: &str,
    ) -> Result<String, TransportError>;

    /// Raw JSON signup-state document for `client_public_key`.
    async fn get_signup_state(&self, client_public_key: &str) -> Result<Vec<u8>, TransportError>;

    /// Raw JSON message envelope for the delegate, or `None` when the
    /// coordinator holds no messages.
    async fn get_messages_for_delegate(
        &self,
        delegate_public_key: &str,
    ) -> Result<Option<Vec<u8>>, TransportError>;

    /// Delivers an encrypted contribution to the delegate.
    async fn post_message_to_delegate(
        &self,
        delegate_public_key: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Submits the decrypted group aggregate.
    async fn post_aggregation_result(
        &self,
        delegate_public_key: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError>;
}

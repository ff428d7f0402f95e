#![cfg(feature = "net")]

//! reqwest-backed coordinator client.

use crate::network::{Network, TransportError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_ERROR_BODY: usize = 512;

/// HTTP client for the coordinator's JSON API.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct SignupRequest<'a> {
    aggregation_public_key: &'a str,
}

#[derive(Deserialize)]
struct SignupReply {
    #[serde(alias = "client_public_key")]
    client_id: String,
}

impl HttpNetwork {
    /// Builds a client for `base_url` whose requests give up after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    async fn get(&self, path: &str) -> Result<(StatusCode, Vec<u8>), TransportError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(request_error)?;
        Ok((status, bytes.to_vec()))
    }

    async fn post(&self, path: &str, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let resp = self
            .client
            .post(self.url(path))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(request_error)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(request_error)?;
        if !status.is_success() {
            return Err(status_error(status, &bytes));
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn list_surveys(&self) -> Result<Vec<u8>, TransportError> {
        let (status, body) = self.get("surveys/").await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    async fn sign_up(
        &self,
        survey_id: &str,
        aggregation_public_key: &str,
    ) -> Result<String, TransportError> {
        let payload = serde_json::to_vec(&SignupRequest {
            aggregation_public_key,
        })
        .map_err(|e| TransportError::Decode(e.to_string()))?;
        let body = self
            .post(&format!("survey-signup/{survey_id}/"), payload)
            .await?;
        let reply: SignupReply =
            serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(reply.client_id)
    }

    async fn get_signup_state(&self, client_public_key: &str) -> Result<Vec<u8>, TransportError> {
        let (status, body) = self
            .get(&format!("signup-state/{client_public_key}/"))
            .await?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    async fn get_messages_for_delegate(
        &self,
        delegate_public_key: &str,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let (status, body) = self
            .get(&format!("messages-for-delegate/{delegate_public_key}/"))
            .await?;
        // The coordinator answers 400/404 when it holds no messages.
        if status == StatusCode::NOT_FOUND || status == StatusCode::BAD_REQUEST {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(Some(body))
    }

    async fn post_message_to_delegate(
        &self,
        delegate_public_key: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.post(&format!("message-to-delegate/{delegate_public_key}/"), body)
            .await
            .map(|_| ())
    }

    async fn post_aggregation_result(
        &self,
        delegate_public_key: &str,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        self.post(
            &format!("post-aggregation-result/{delegate_public_key}/"),
            body,
        )
        .await
        .map(|_| ())
    }
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> TransportError {
    let text = String::from_utf8_lossy(body);
    let body = text.chars().take(MAX_ERROR_BODY).collect();
    TransportError::Status {
        status: status.as_u16(),
        body,
    }
}

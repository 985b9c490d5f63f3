use crate::ndjson::{decode_stream, DecodeOutcome};
use crate::protocol::{ChatRequest, ErrorBody, StreamEvent, NDJSON_CONTENT_TYPE};
use reqwest::header::ACCEPT;
use reqwest::{Client as HttpClient, Response, StatusCode};
use std::future::Future;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message}")]
    Status { status: StatusCode, message: String },
}

/// HTTP client for the agent's streaming chat endpoint.
#[derive(Clone)]
pub struct RcaClient {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
}

impl RcaClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Sends the conversation and returns the response once its status
    /// has been checked. The body is left unread.
    pub async fn open_chat(&self, request: &ChatRequest) -> Result<Response, ClientError> {
        let mut builder = self
            .http
            .post(format!("{}/chat", self.base_url))
            .header(ACCEPT, NDJSON_CONTENT_TYPE)
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        Ok(response)
    }

    /// Streams the agent's reply, calling `on_event` for each event in
    /// arrival order.
    ///
    /// Cancelling `cancel` at any point, including before the response
    /// headers arrive, ends the call with [`DecodeOutcome::Cancelled`] and
    /// drops the connection.
    pub async fn stream_chat<F, Fut>(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<DecodeOutcome, ClientError>
    where
        F: FnMut(StreamEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(DecodeOutcome::Cancelled),
            response = self.open_chat(request) => response?,
        };

        let outcome = decode_stream(response.bytes_stream(), cancel, on_event).await?;
        tracing::debug!(?outcome, report_id = %request.context.report_id, "chat stream ended");
        Ok(outcome)
    }
}

async fn status_error(response: Response) -> ClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .map(|body| body.error)
        .filter(|error| !error.is_empty())
        .unwrap_or_else(|| status.to_string());

    ClientError::Status { status, message }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

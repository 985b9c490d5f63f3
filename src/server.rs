use crate::client::{ClientError, RcaClient};
use crate::ndjson::{decode_stream, DecodeOutcome};
use crate::protocol::{ChatRequest, ErrorBody, Role, StreamEvent, NDJSON_CONTENT_TYPE};
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub struct ServerConfig {
    pub listen: String,
    pub agent: RcaClient,
    pub auth_token: Option<String>,
}

struct ServerState {
    agent: RcaClient,
    auth_token: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("agent request failed: {0}")]
    Agent(#[from] ClientError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Unauthorized => StatusCode::UNAUTHORIZED,
            ServerError::BadRequest(_) | ServerError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ServerError::Agent(_) => StatusCode::BAD_GATEWAY,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let app = router(config.agent, config.auth_token);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(listen = %config.listen, "rca chat server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(agent: RcaClient, auth_token: Option<String>) -> Router {
    let state = Arc::new(ServerState { agent, auth_token });

    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ServerError> {
    authorize(&headers, state.auth_token.as_deref())?;
    let Json(payload) =
        payload.map_err(|rejection| ServerError::InvalidBody(rejection.body_text()))?;
    validate(&payload)?;

    let span = tracing::info_span!(
        "chat",
        request_id = %Uuid::new_v4(),
        report_id = %payload.context.report_id,
    );

    let upstream = state
        .agent
        .open_chat(&payload)
        .instrument(span.clone())
        .await
        .inspect_err(|err| span.in_scope(|| log_agent_failure(err)))?;

    let (tx, rx) = mpsc::channel::<Bytes>(64);
    tokio::spawn(forward(upstream, tx).instrument(span));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    Ok((
        [
            (CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (CONNECTION, "keep-alive"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// Relays the agent's events line by line. Dropping the response body closes
// `tx`, which cancels the upstream read.
async fn forward(upstream: reqwest::Response, tx: mpsc::Sender<Bytes>) {
    let cancel = CancellationToken::new();
    let watcher = {
        let tx = tx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tx.closed().await;
            cancel.cancel();
        })
    };

    let result = decode_stream(upstream.bytes_stream(), &cancel, |event: StreamEvent| {
        let tx = tx.clone();
        async move {
            if event == StreamEvent::Unknown {
                tracing::debug!("dropping unrecognized agent event");
                return;
            }
            send_event(&tx, &event).await;
        }
    })
    .await;

    match result {
        Ok(DecodeOutcome::Completed) => tracing::info!("chat stream completed"),
        Ok(DecodeOutcome::Cancelled) => tracing::info!("client disconnected, agent stream closed"),
        Err(err) => {
            tracing::warn!(error = %err, "agent stream interrupted");
            let event = StreamEvent::Error {
                message: format!("agent stream interrupted: {err}"),
            };
            send_event(&tx, &event).await;
        }
    }

    watcher.abort();
}

fn log_agent_failure(err: &ClientError) {
    match err {
        ClientError::Status { status, message } => {
            tracing::warn!(%status, %message, "agent rejected chat");
        }
        ClientError::Transport(err) => tracing::warn!(error = %err, "agent unreachable"),
    }
}

async fn send_event(tx: &mpsc::Sender<Bytes>, event: &StreamEvent) {
    match event.to_line() {
        Ok(line) => {
            let _ = tx.send(Bytes::from(line)).await;
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode event"),
    }
}

fn validate(payload: &ChatRequest) -> Result<(), ServerError> {
    let Some(last) = payload.messages.last() else {
        return Err(ServerError::BadRequest("messages must not be empty"));
    };
    if last.role != Role::User {
        return Err(ServerError::BadRequest("last message must come from the user"));
    }
    if payload.context.report_id.trim().is_empty() {
        return Err(ServerError::BadRequest("reportId is required"));
    }

    Ok(())
}

fn authorize(headers: &HeaderMap, token: Option<&str>) -> Result<(), ServerError> {
    let Some(token) = token else {
        return Ok(());
    };

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header {
        Some(value) if value == format!("Bearer {}", token) => Ok(()),
        _ => Err(ServerError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::protocol::{ChatContext, ChatMessage};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn spawn_server(agent_uri: String, auth_token: Option<&str>) -> String {
        let agent = RcaClient::new(ClientConfig {
            base_url: agent_uri,
            token: None,
        });
        let app = router(agent, auth_token.map(str::to_string));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    // An agent that answers with one line, then keeps the body open with a
    // status line every 50ms. Resolves `closed` once the relay hangs up.
    async fn endless_agent() -> (String, oneshot::Receiver<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                head.extend_from_slice(&buf[..n]);
            }

            let first = "{\"type\":\"message_chunk\",\"content\":\"Looking\"}\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: {NDJSON_CONTENT_TYPE}\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{first}\r\n",
                first.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();

            let status = "{\"type\":\"tool_call\",\"activeForm\":\"Still querying\"}\n";
            let frame = format!("{:x}\r\n{status}\r\n", status.len());
            let (mut reader, mut writer) = socket.split();
            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => {
                        if matches!(read, Ok(0) | Err(_)) {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {
                        if writer.write_all(frame.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = closed_tx.send(());
        });

        (format!("http://{addr}"), closed_rx)
    }

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            context: ChatContext {
                report_id: "rpt-9".to_string(),
                environment: Some("production".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn forwards_agent_events_in_order() {
        let agent = MockServer::start().await;
        let body = "{\"type\":\"tool_call\",\"activeForm\":\"Fetching traces\"}\n\
                    {\"type\":\"heartbeat\"}\n\
                    {\"type\":\"message_chunk\",\"content\":\"Latency \"}\n\
                    {\"type\":\"message_chunk\",\"content\":\"spike\"}\n\
                    {\"type\":\"done\",\"message\":\"Latency spike\"}\n";
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, NDJSON_CONTENT_TYPE))
            .expect(1)
            .mount(&agent)
            .await;

        let base = spawn_server(agent.uri(), None).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&request(vec![ChatMessage::user("what happened?")]))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE.as_str()],
            NDJSON_CONTENT_TYPE
        );

        let text = response.text().await.unwrap();
        let events: Vec<StreamEvent> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCall {
                    active_form: "Fetching traces".to_string()
                },
                StreamEvent::MessageChunk {
                    content: "Latency ".to_string()
                },
                StreamEvent::MessageChunk {
                    content: "spike".to_string()
                },
                StreamEvent::Done {
                    message: "Latency spike".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn rejects_invalid_conversations() {
        let agent = MockServer::start().await;
        let base = spawn_server(agent.uri(), None).await;
        let http = reqwest::Client::new();

        for (payload, expected) in [
            (request(vec![]), "messages must not be empty"),
            (
                request(vec![ChatMessage::assistant("hi")]),
                "last message must come from the user",
            ),
        ] {
            let response = http
                .post(format!("{base}/chat"))
                .json(&payload)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: ErrorBody = response.json().await.unwrap();
            assert_eq!(body.error, expected);
        }
    }

    #[tokio::test]
    async fn missing_report_id_is_a_json_bad_request() {
        let agent = MockServer::start().await;
        let base = spawn_server(agent.uri(), None).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, "reportId is required");
    }

    #[tokio::test]
    async fn unparseable_body_is_a_json_bad_request() {
        let agent = MockServer::start().await;
        let base = spawn_server(agent.uri(), None).await;
        let http = reqwest::Client::new();

        for body in ["{not json", "{\"reportId\":\"rpt-9\"}"] {
            let response = http
                .post(format!("{base}/chat"))
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let body: ErrorBody = response.json().await.unwrap();
            assert!(body.error.starts_with("invalid request body: "), "{}", body.error);
        }
    }

    #[tokio::test]
    async fn client_disconnect_closes_agent_stream() {
        let (agent_uri, closed) = endless_agent().await;
        let base = spawn_server(agent_uri, None).await;

        let mut response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&request(vec![ChatMessage::user("what happened?")]))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = response.chunk().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("Looking"));

        drop(response);

        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("agent connection still open after client left")
            .unwrap();
    }

    #[tokio::test]
    async fn requires_bearer_token_when_configured() {
        let agent = MockServer::start().await;
        let base = spawn_server(agent.uri(), Some("s3cret")).await;

        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&request(vec![ChatMessage::user("hi")]))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn agent_failure_maps_to_bad_gateway() {
        let agent = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(500).set_body_json(serde_json::json!({"error": "model unavailable"})),
            )
            .mount(&agent)
            .await;

        let base = spawn_server(agent.uri(), None).await;
        let response = reqwest::Client::new()
            .post(format!("{base}/chat"))
            .json(&request(vec![ChatMessage::user("hi")]))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.error, "agent request failed: model unavailable");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let agent = MockServer::start().await;
        let base = spawn_server(agent.uri(), None).await;

        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body, serde_json::json!({"status": "ok"}));
    }
}

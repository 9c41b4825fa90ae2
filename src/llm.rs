use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Event, EventSource};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub token_usage: Option<u64>,
}

/// A piece of streamed output. `seq` starts at 1 and increases by one per frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub text: String,
}

/// Transport to one AI provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single request/response completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    /// Stream a completion, sending frames as they arrive. Returns the token usage if reported.
    ///
    /// Dropping the returned future aborts the underlying request.
    async fn stream(
        &self,
        request: &CompletionRequest,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Result<Option<u64>, ProviderError>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint
/// (DeepSeek, Qwen compatible-mode, Moonshot, GLM, OpenAI itself, ...).
///
/// `timeout` is a total deadline for `complete`. For `stream` it bounds connecting
/// and each gap between reads, so a long but steady stream is never cut off.
pub struct OpenAiCompatible {
    name: String,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
    streaming: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let user_agent = concat!("quillcast/", env!("CARGO_PKG_VERSION"));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .with_context(|| format!("building HTTP client for provider '{name}'"))?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .user_agent(user_agent)
            .build()
            .with_context(|| format!("building streaming HTTP client for provider '{name}'"))?;
        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout,
            http,
            streaming,
        })
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    fn request(&self, request: &CompletionRequest, stream: bool) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured(self.name.clone()))?;
        let url = format!("{}/chat/completions", self.base_url);

        debug!(provider = %self.name, model = %request.model, stream, "sending completion request");

        let http = if stream { &self.streaming } else { &self.http };
        Ok(http.post(&url).bearer_auth(key).json(&self.body(request, stream)))
    }

    fn status_error(&self, status: reqwest::StatusCode, body: String) -> ProviderError {
        warn!(
            provider = %self.name,
            status = status.as_u16(),
            body = %body.chars().take(300).collect::<String>(),
            "provider returned error status"
        );
        classify_status(&self.name, status.as_u16(), body)
    }

    fn transport_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout {
                provider: self.name.clone(),
                after: self.timeout,
            }
        } else if e.is_connect() {
            ProviderError::Unreachable {
                provider: self.name.clone(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            ProviderError::Malformed {
                provider: self.name.clone(),
                message: e.to_string(),
            }
        } else {
            ProviderError::Transient {
                provider: self.name.clone(),
                message: e.to_string(),
            }
        }
    }

    async fn read_events(
        &self,
        source: &mut EventSource,
        frames: &mpsc::UnboundedSender<Frame>,
    ) -> Result<Option<u64>, ProviderError> {
        let mut seq = 0u64;
        let mut usage = None;

        while let Some(event) = source.next().await {
            let message = match event {
                Ok(Event::Open) => continue,
                Ok(Event::Message(message)) => message,
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(self.status_error(status, body));
                }
                Err(reqwest_eventsource::Error::Transport(e)) => return Err(self.transport_error(e)),
                Err(e) => {
                    return Err(ProviderError::Malformed {
                        provider: self.name.clone(),
                        message: e.to_string(),
                    });
                }
            };

            match parse_stream_data(&message.data) {
                Ok(StreamData::Done) => break,
                Ok(StreamData::Delta { text, total_tokens }) => {
                    if total_tokens.is_some() {
                        usage = total_tokens;
                    }
                    let Some(text) = text.filter(|t| !t.is_empty()) else {
                        continue;
                    };
                    seq += 1;
                    if frames.send(Frame { seq, text }).is_err() {
                        debug!(provider = %self.name, "frame receiver dropped, abandoning stream");
                        break;
                    }
                }
                Ok(StreamData::Failure(message)) => {
                    return Err(ProviderError::Transient {
                        provider: self.name.clone(),
                        message,
                    });
                }
                Err(message) => {
                    return Err(ProviderError::Malformed {
                        provider: self.name.clone(),
                        message,
                    });
                }
            }
        }
        Ok(usage)
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatible {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let response = self
            .request(request, false)?
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, body));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| self.transport_error(e))?;

        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed {
                provider: self.name.clone(),
                message: "missing choices[0].message.content".to_string(),
            })?;

        Ok(Completion {
            text: text.to_string(),
            token_usage: body["usage"]["total_tokens"].as_u64(),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        frames: mpsc::UnboundedSender<Frame>,
    ) -> Result<Option<u64>, ProviderError> {
        let mut source = EventSource::new(self.request(request, true)?).map_err(|e| ProviderError::Malformed {
            provider: self.name.clone(),
            message: e.to_string(),
        })?;
        // No transport-level reconnects; the generation session retries the stage.
        source.set_retry_policy(Box::new(Never));

        let result = self.read_events(&mut source, &frames).await;
        source.close();
        result
    }
}

/// Map a non-success HTTP status to a retry classification.
pub(crate) fn classify_status(provider: &str, status: u16, body: String) -> ProviderError {
    let provider = provider.to_string();
    match status {
        401 | 403 => ProviderError::Auth { provider, message: body },
        408 | 429 | 500..=599 => ProviderError::Transient {
            provider,
            message: format!("HTTP {status}: {body}"),
        },
        _ => ProviderError::Rejected {
            provider,
            status,
            message: body,
        },
    }
}

#[derive(Debug, PartialEq)]
enum StreamData {
    Done,
    Delta {
        text: Option<String>,
        total_tokens: Option<u64>,
    },
    Failure(String),
}

fn parse_stream_data(data: &str) -> Result<StreamData, String> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamData::Done);
    }
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| format!("invalid stream frame: {e}"))?;
    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown stream error").to_string();
        return Ok(StreamData::Failure(message));
    }
    Ok(StreamData::Delta {
        text: value["choices"][0]["delta"]["content"].as_str().map(str::to_string),
        total_tokens: value["usage"]["total_tokens"].as_u64(),
    })
}


#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::response::sse::Sse;
    use axum::routing::post;
    use tokio_stream::Stream;

    use super::*;

    fn delta(text: &str) -> axum::response::sse::Event {
        let chunk = serde_json::json!({ "choices": [{ "delta": { "content": text } }] });
        axum::response::sse::Event::default().data(chunk.to_string())
    }

    /// Ten deltas 100ms apart, a usage frame, then `[DONE]`.
    async fn steady_completion() -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
        let deltas = tokio_stream::iter(0..10)
            .throttle(Duration::from_millis(100))
            .map(|i| Ok::<_, Infallible>(delta(&format!("{i}"))));
        let tail = tokio_stream::iter([
            Ok(axum::response::sse::Event::default().data(r#"{"choices":[],"usage":{"total_tokens":42}}"#)),
            Ok(axum::response::sse::Event::default().data("[DONE]")),
        ]);
        Sse::new(deltas.chain(tail))
    }

    /// One delta, then nothing.
    async fn stalled_completion() -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
        let first = tokio_stream::iter([Ok::<_, Infallible>(delta("first"))]);
        Sse::new(first.chain(tokio_stream::pending()))
    }

    async fn unauthorized() -> impl IntoResponse {
        (StatusCode::UNAUTHORIZED, "invalid api key")
    }

    async fn provider(router: Router, timeout: Duration) -> OpenAiCompatible {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        OpenAiCompatible::new("a", &format!("http://{addr}/v1"), Some("k".into()), timeout).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            system: None,
            prompt: "hi".into(),
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn steady_stream_outlives_the_timeout() {
        let client = provider(
            Router::new().route("/v1/chat/completions", post(steady_completion)),
            Duration::from_millis(500),
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let usage = client.stream(&request(), tx).await.unwrap();
        assert_eq!(usage, Some(42));

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, (1..=10).collect::<Vec<_>>());
        let text: String = frames.into_iter().map(|f| f.text).collect();
        assert_eq!(text, "0123456789");
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let client = provider(
            Router::new().route("/v1/chat/completions", post(stalled_completion)),
            Duration::from_millis(300),
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let err = client.stream(&request(), tx).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout { .. }), "{err:?}");
        assert_eq!(rx.recv().await.map(|f| f.text).as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn stream_error_status_is_classified() {
        let client = provider(
            Router::new().route("/v1/chat/completions", post(unauthorized)),
            Duration::from_secs(5),
        )
        .await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = client.stream(&request(), tx).await.unwrap_err();
        assert_eq!(
            err,
            ProviderError::Auth {
                provider: "a".into(),
                message: "invalid api key".into()
            }
        );
    }

    #[test]
    fn status_classification() {
        assert!(matches!(classify_status("p", 401, String::new()), ProviderError::Auth { .. }));
        assert!(matches!(classify_status("p", 403, String::new()), ProviderError::Auth { .. }));
        assert!(classify_status("p", 429, String::new()).is_retryable());
        assert!(classify_status("p", 503, String::new()).is_retryable());
        let rejected = classify_status("p", 400, "bad model".into());
        assert!(!rejected.is_retryable());
        assert!(matches!(rejected, ProviderError::Rejected { status: 400, .. }));
    }

    #[test]
    fn parses_stream_frames() {
        assert_eq!(parse_stream_data("[DONE]").unwrap(), StreamData::Done);
        assert_eq!(
            parse_stream_data(r#"{"choices":[{"delta":{"content":"春"}}]}"#).unwrap(),
            StreamData::Delta {
                text: Some("春".into()),
                total_tokens: None
            }
        );
        assert_eq!(
            parse_stream_data(r#"{"choices":[],"usage":{"total_tokens":42}}"#).unwrap(),
            StreamData::Delta {
                text: None,
                total_tokens: Some(42)
            }
        );
        assert_eq!(
            parse_stream_data(r#"{"error":{"message":"overloaded"}}"#).unwrap(),
            StreamData::Failure("overloaded".into())
        );
        assert!(parse_stream_data("not json").is_err());
    }

    #[test]
    fn request_body_shape() {
        let client =
            OpenAiCompatible::new("deepseek", "https://api.example.com/v1/", Some("k".into()), Duration::from_secs(5))
                .unwrap();
        let request = CompletionRequest {
            model: "deepseek-chat".into(),
            system: Some("be brief".into()),
            prompt: "hello".into(),
            max_tokens: Some(16),
        };
        let body = client.body(&request, true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 16);
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let client = OpenAiCompatible::new("qwen", "http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let request = CompletionRequest {
            model: "qwen-plus".into(),
            system: None,
            prompt: "hi".into(),
            max_tokens: None,
        };
        assert_eq!(
            client.complete(&request).await.unwrap_err(),
            ProviderError::NotConfigured("qwen".into())
        );
    }
}

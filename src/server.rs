use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::engine::{Engine, ProviderUpdate, TitleRequest};
use crate::error::EngineError;
use crate::generation::GenerationRequest;
use crate::models::{
    ContentResult, FeedItem, FeedRefresh, OnboardingRecord, PlatformResult, Provider, ProviderListing,
    ProviderTestResult, RotationState, TitleSuggestion,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub api_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/{name}", patch(update_provider))
        .route("/api/providers/{name}/test", post(test_provider))
        .route("/api/rotation", get(rotation_state).put(set_rotation))
        .route("/api/generate/titles", post(generate_titles))
        .route("/api/generate/content", post(generate_content))
        .route("/api/generate/stream", post(stream_generate))
        .route("/api/generate/{session_id}/cancel", post(cancel_generation))
        .route("/api/feeds/{source}", get(feed_items))
        .route("/api/feeds/{source}/refresh", post(refresh_feed))
        .route("/api/publish", post(publish))
        .route("/api/events", get(events))
        .route("/api/onboarding", get(onboarding).put(set_onboarding))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
        .layer(sentry_tower::SentryHttpLayer::new())
        .layer(sentry_tower::NewSentryLayer::<Request>::new_from_top())
}

/// Engine error rendered as `{traceId, kind, message, hint?}` with a matching status.
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(&self.0), Json(self.0.surface())).into_response()
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::InvalidStrategy(_) | EngineError::InvalidRequest(_) | EngineError::EmptyTargets => {
            StatusCode::BAD_REQUEST
        }
        EngineError::UnknownProvider(_)
        | EngineError::UnknownFeed(_)
        | EngineError::ArticleNotFound(_)
        | EngineError::UnknownSession(_) => StatusCode::NOT_FOUND,
        EngineError::NoProviderAvailable | EngineError::ProviderDisabled(_) | EngineError::ProviderNotConfigured(_) => {
            StatusCode::CONFLICT
        }
        EngineError::Auth { .. } | EngineError::ProviderFailed { .. } | EngineError::ProviderUnreachable { .. } => {
            StatusCode::BAD_GATEWAY
        }
        EngineError::FeedUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Parse an optional JSON body; an empty body means the defaults.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError(EngineError::InvalidRequest(e.to_string())))
}

async fn list_providers(State(state): State<AppState>) -> Json<ProviderListing> {
    Json(state.engine.list_providers())
}

#[derive(Default, Deserialize)]
struct TestProviderBody {
    #[serde(default)]
    apply: bool,
}

async fn test_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<ProviderTestResult> {
    let body: TestProviderBody = optional_json(&body)?;
    Ok(Json(state.engine.test_provider(&name, body.apply).await?))
}

async fn update_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<ProviderUpdate>,
) -> ApiResult<Provider> {
    Ok(Json(state.engine.update_provider(&name, &update)?))
}

async fn rotation_state(State(state): State<AppState>) -> Json<RotationState> {
    Json(state.engine.rotation_state())
}

#[derive(Deserialize)]
struct RotationBody {
    strategy: String,
}

async fn set_rotation(State(state): State<AppState>, Json(body): Json<RotationBody>) -> ApiResult<RotationState> {
    Ok(Json(state.engine.set_rotation_strategy(&body.strategy).await?))
}

async fn generate_titles(
    State(state): State<AppState>,
    Json(request): Json<TitleRequest>,
) -> ApiResult<Vec<TitleSuggestion>> {
    Ok(Json(state.engine.generate_titles(&request).await?))
}

async fn generate_content(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> ApiResult<ContentResult> {
    Ok(Json(state.engine.generate_content(&request).await?))
}

/// Streams the session as SSE. A client that goes away cancels the session.
async fn stream_generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state.engine.stream_generate(request)?;
    debug!(session = %stream.session_id, "streaming generation to client");

    let guard = stream.cancel.clone().drop_guard();
    let events = UnboundedReceiverStream::new(stream.events).map(move |event| {
        let _guard = &guard;
        Ok(sse_event(event.kind(), &event))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn cancel_generation(State(state): State<AppState>, Path(session_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.engine.cancel_generation(&session_id)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Default, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn feed_items(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<FeedItem>> {
    Ok(Json(state.engine.feed_items(&source, query.limit).await?))
}

async fn refresh_feed(State(state): State<AppState>, Path(source): Path<String>, body: Bytes) -> ApiResult<FeedRefresh> {
    let body: LimitQuery = optional_json(&body)?;
    Ok(Json(state.engine.refresh_feed(&source, body.limit).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBody {
    article_id: String,
    targets: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    article_id: String,
    success: bool,
    results: Vec<PlatformResult>,
}

async fn publish(State(state): State<AppState>, Json(body): Json<PublishBody>) -> ApiResult<PublishResponse> {
    let job = state.engine.publish(&body.article_id, &body.targets).await?;
    Ok(Json(PublishResponse {
        article_id: job.article_id.clone(),
        success: job.is_success(),
        results: job.results(),
    }))
}

/// Pushes every notification published after the client connected.
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let notifications = BroadcastStream::new(state.engine.subscribe()).filter_map(|item| match item {
        Ok(notification) => Some(Ok(sse_event(notification.name(), &notification))),
        Err(BroadcastStreamRecvError::Lagged(missed)) => {
            warn!(missed, "event subscriber lagged, dropping oldest notifications");
            None
        }
    });
    Sse::new(notifications).keep_alive(KeepAlive::default())
}

async fn onboarding(State(state): State<AppState>) -> ApiResult<OnboardingRecord> {
    Ok(Json(state.engine.onboarding().await?))
}

async fn set_onboarding(
    State(state): State<AppState>,
    Json(record): Json<OnboardingRecord>,
) -> ApiResult<OnboardingRecord> {
    state.engine.set_onboarding(&record).await?;
    Ok(Json(record))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(event = name, error = %e, "failed to encode SSE payload");
            Event::default().comment("encoding failed")
        }
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn require_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };
    if !authenticate(expected, &query, request.headers()) {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer realm=\"quillcast\"")],
            "Unauthorized",
        )
            .into_response();
    }
    next.run(request).await
}

fn authenticate(api_token: &str, query: &TokenQuery, headers: &HeaderMap) -> bool {
    if let Some(ref token) = query.token
        && constant_time_eq(token, api_token)
    {
        debug!("authenticated via query param");
        return true;
    }

    let Some(auth_str) = headers.get(header::AUTHORIZATION).and_then(|h| h.to_str().ok()) else {
        return false;
    };

    if let Some(token) = auth_str.strip_prefix("Bearer ") {
        return constant_time_eq(token.trim(), api_token);
    }

    if let Some(encoded) = auth_str.strip_prefix("Basic ") {
        use base64::Engine;
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim())
            && let Ok(credentials) = String::from_utf8(decoded)
            && let Some((_user, password)) = credentials.split_once(':')
            && constant_time_eq(password, api_token)
        {
            debug!("authenticated via HTTP Basic Auth");
            return true;
        }
    }

    false
}

/// Constant-time string comparison to prevent timing attacks on token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    use super::*;
    use crate::engine::testing::engine;
    use crate::llm::testing::{ScriptedClient, chunks};

    async fn serve(clients: Vec<(&str, Arc<ScriptedClient>)>, api_token: Option<&str>) -> (TempDir, Arc<Engine>, String) {
        let (dir, engine) = engine(clients).await;
        let state = AppState {
            engine: engine.clone(),
            api_token: api_token.map(str::to_string),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, build_router(state)).await.unwrap() });
        (dir, engine, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn lists_providers_in_camel_case() {
        let (_dir, _engine, base) = serve(vec![("a", ScriptedClient::new(vec![]))], None).await;
        let body: Value = reqwest::get(format!("{base}/api/providers")).await.unwrap().json().await.unwrap();
        assert_eq!(body["currentStrategy"], "sequential");
        assert_eq!(body["enabledProviders"], json!(["a"]));
        assert_eq!(body["providers"][0]["name"], "a");
    }

    #[tokio::test]
    async fn errors_map_to_status_and_carry_trace_id() {
        let (_dir, _engine, base) = serve(vec![], None).await;
        let client = reqwest::Client::new();

        let response = client
            .put(format!("{base}/api/rotation"))
            .json(&json!({"strategy": "weighted"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "invalid_strategy");
        assert!(body["traceId"].as_str().is_some_and(|id| !id.is_empty()));

        let response = client
            .post(format!("{base}/api/generate/content"))
            .json(&json!({"topic": "秋天"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "no_provider_available");
        assert!(body["hint"].is_string());

        let response = client
            .post(format!("{base}/api/publish"))
            .json(&json!({"articleId": "missing", "targets": ["wechat"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client
            .post(format!("{base}/api/generate/nope/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_is_required_when_configured() {
        let (_dir, _engine, base) = serve(vec![], Some("s3cret")).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/api/onboarding");

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = client.get(&url).bearer_auth("wrong").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = client.get(&url).bearer_auth("s3cret").send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = client.get(format!("{url}?token=s3cret")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let basic = base64::engine::general_purpose::STANDARD.encode("anyone:s3cret");
        let response = client
            .get(&url)
            .header(header::AUTHORIZATION, format!("Basic {basic}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn onboarding_is_written_and_read_back() {
        let (_dir, _engine, base) = serve(vec![], None).await;
        let client = reqwest::Client::new();
        let record = json!({"completed": true, "dismissedTips": ["rotation"]});

        let response = client
            .put(format!("{base}/api/onboarding"))
            .json(&record)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = client
            .get(format!("{base}/api/onboarding"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, record);
    }

    #[tokio::test]
    async fn stream_endpoint_emits_progress_first_and_complete_last() {
        let scripted = ScriptedClient::new(vec![chunks(&["标", "题"]), chunks(&["正文"])]);
        let (_dir, _engine, base) = serve(vec![("a", scripted)], None).await;

        let request = reqwest::Client::new()
            .post(format!("{base}/api/generate/stream"))
            .json(&json!({"topic": "秋天"}));
        let mut source = reqwest_eventsource::EventSource::new(request).unwrap();
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let mut messages = Vec::new();
        while let Some(event) = source.next().await {
            match event {
                Ok(reqwest_eventsource::Event::Open) => {}
                Ok(reqwest_eventsource::Event::Message(message)) => messages.push(message),
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(e) => panic!("stream failed: {e}"),
            }
        }
        let names: Vec<_> = messages.iter().map(|m| m.event.as_str()).collect();
        assert_eq!(names.first(), Some(&"progress"));
        assert_eq!(names.last(), Some(&"complete"));
        assert!(names.contains(&"chunk"));

        let complete: Value = serde_json::from_str(&messages.last().unwrap().data).unwrap();
        assert_eq!(complete["type"], "complete");
        assert_eq!(complete["data"]["title"], "标题");
        assert_eq!(complete["data"]["wordCount"], 2);
    }

    #[tokio::test]
    async fn events_endpoint_pushes_notifications() {
        let scripted = ScriptedClient::new(vec![chunks(&["标题"]), chunks(&["正文"])]);
        let (_dir, engine, base) = serve(vec![("a", scripted)], None).await;

        let mut source = reqwest_eventsource::EventSource::get(format!("{base}/api/events"));
        assert!(matches!(source.next().await, Some(Ok(reqwest_eventsource::Event::Open))));

        let mut stream = engine.stream_generate(GenerationRequest::new("秋天")).unwrap();
        while stream.events.recv().await.is_some() {}

        let Some(Ok(reqwest_eventsource::Event::Message(message))) = source.next().await else {
            panic!("expected a notification");
        };
        source.close();
        assert_eq!(message.event, "article_generated");
        let payload: Value = serde_json::from_str(&message.data).unwrap();
        assert_eq!(payload["event"], "article_generated");
        assert_eq!(payload["title"], "标题");
    }
}

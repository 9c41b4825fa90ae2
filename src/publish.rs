use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::{Config, PlatformConfig, parse_duration};
use crate::error::{EngineError, PublishError};
use crate::models::{Article, PlatformResult, PlatformStatus, PublishState};
use crate::notify::{Notification, NotificationBus};

/// A publishing destination.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Upper bound for one publish on this platform, independent of every other platform.
    fn timeout(&self) -> Duration;

    async fn publish(&self, article: &Article) -> Result<Value, PublishError>;

    /// Dedicated draft route, used when the primary platform is the only target.
    async fn create_draft(&self, article: &Article) -> Result<Value, PublishError> {
        self.publish(article).await
    }
}

/// Platform reached through configured HTTP endpoints (usually a small relay service
/// holding the platform credentials).
pub struct HttpPlatform {
    id: String,
    steps: Vec<String>,
    draft_endpoint: Option<String>,
    token: Option<String>,
    timeout: Duration,
    http: reqwest::Client,
}

impl HttpPlatform {
    pub fn from_config(platform: &PlatformConfig) -> Result<Self> {
        let timeout = parse_duration("platform timeout", &platform.timeout)?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("quillcast/", env!("CARGO_PKG_VERSION")))
            .build()
            .with_context(|| format!("building HTTP client for platform '{}'", platform.id))?;
        Ok(Self {
            id: platform.id.clone(),
            steps: platform.steps.clone(),
            draft_endpoint: platform.draft_endpoint.clone(),
            token: platform.token.clone(),
            timeout,
            http,
        })
    }

    /// Call each endpoint in order, handing every step the previous step's response.
    async fn run_steps(&self, endpoints: &[String], article: &Article) -> Result<Value, PublishError> {
        let mut previous = Value::Null;
        for (index, url) in endpoints.iter().enumerate() {
            let mut request = self.http.post(url).json(&json!({
                "platform": self.id,
                "step": index,
                "article": article,
                "previous": previous,
            }));
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await.map_err(|source| PublishError::Http {
                url: url.clone(),
                source,
            })?;
            let status = response.status();
            let body = response.text().await.map_err(|source| PublishError::Http {
                url: url.clone(),
                source,
            })?;
            if !status.is_success() {
                return Err(PublishError::Rejected {
                    step: url.clone(),
                    status: status.as_u16(),
                    body: body.chars().take(500).collect(),
                });
            }

            debug!(platform = %self.id, step = index, url = %url, "publish step done");
            previous = serde_json::from_str(&body).unwrap_or(Value::String(body));
        }
        Ok(previous)
    }
}

#[async_trait]
impl PlatformAdapter for HttpPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn publish(&self, article: &Article) -> Result<Value, PublishError> {
        if self.steps.is_empty() {
            return self.create_draft(article).await;
        }
        self.run_steps(&self.steps, article).await
    }

    async fn create_draft(&self, article: &Article) -> Result<Value, PublishError> {
        match &self.draft_endpoint {
            Some(endpoint) => self.run_steps(std::slice::from_ref(endpoint), article).await,
            None => self.run_steps(&self.steps, article).await,
        }
    }
}

/// One publish request across several platforms.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishJob {
    pub article_id: String,
    pub targets: Vec<String>,
    pub statuses: BTreeMap<String, PlatformStatus>,
    pub started_at: DateTime<Utc>,
}

impl PublishJob {
    fn new(article_id: String, targets: Vec<String>) -> Self {
        let statuses = targets.iter().map(|t| (t.clone(), PlatformStatus::idle())).collect();
        Self {
            article_id,
            targets,
            statuses,
            started_at: Utc::now(),
        }
    }

    fn set(&mut self, platform: &str, status: PlatformStatus) {
        self.statuses.insert(platform.to_string(), status);
    }

    pub fn is_terminal(&self) -> bool {
        self.statuses
            .values()
            .all(|s| matches!(s.state, PublishState::Success | PublishState::Error))
    }

    /// True only if every target succeeded.
    pub fn is_success(&self) -> bool {
        self.statuses.values().all(|s| s.state == PublishState::Success)
    }

    /// Per-platform outcome, in target order.
    pub fn results(&self) -> Vec<PlatformResult> {
        self.targets
            .iter()
            .filter_map(|t| self.statuses.get(t).map(|s| (t, s)))
            .map(|(platform, status)| PlatformResult {
                platform: platform.clone(),
                success: status.state == PublishState::Success,
                error: status.error.clone(),
                detail: status.detail.clone(),
            })
            .collect()
    }
}

pub struct PublishOrchestrator {
    adapters: HashMap<String, Arc<dyn PlatformAdapter>>,
    primary: Option<String>,
    bus: NotificationBus,
}

impl PublishOrchestrator {
    pub fn new(primary: Option<String>, bus: NotificationBus) -> Self {
        Self {
            adapters: HashMap::new(),
            primary,
            bus,
        }
    }

    pub fn from_config(config: &Config, bus: NotificationBus) -> Result<Self> {
        let mut orchestrator = Self::new(config.publish.primary.clone(), bus);
        for platform in &config.platform {
            orchestrator.register(Arc::new(HttpPlatform::from_config(platform)?));
        }
        info!(
            count = orchestrator.adapters.len(),
            primary = ?orchestrator.primary,
            "publish platforms registered"
        );
        Ok(orchestrator)
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Publish to every target concurrently and wait for all of them.
    ///
    /// Each target runs in its own task under its own timeout; one target failing,
    /// timing out or panicking never affects the others.
    pub async fn publish(&self, article: Arc<Article>, targets: &[String]) -> Result<PublishJob, EngineError> {
        let mut unique: Vec<String> = Vec::with_capacity(targets.len());
        for target in targets.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !unique.iter().any(|u| u == target) {
                unique.push(target.to_string());
            }
        }
        if unique.is_empty() {
            return Err(EngineError::EmptyTargets);
        }

        let draft_route = unique.len() == 1 && self.primary.as_deref() == Some(unique[0].as_str());
        info!(article = %article.id, targets = ?unique, draft_route, "publish started");

        let mut job = PublishJob::new(article.id.clone(), unique.clone());
        let mut handles = Vec::with_capacity(unique.len());

        for target in &unique {
            let Some(adapter) = self.adapters.get(target).cloned() else {
                let outcome = Err(PublishError::UnknownPlatform(target.clone()));
                announce(&self.bus, &job.article_id, target, &outcome);
                record(&mut job, target, outcome);
                continue;
            };
            job.set(
                target,
                PlatformStatus {
                    state: PublishState::Loading,
                    error: None,
                    detail: None,
                },
            );

            let article = article.clone();
            let bus = self.bus.clone();
            let platform = target.clone();
            // Detached from the caller: the outcome is announced even if `publish` is dropped.
            let handle = tokio::spawn(async move {
                let article_id = article.id.clone();
                let limit = adapter.timeout();
                let call = tokio::spawn(async move {
                    let call = async {
                        if draft_route {
                            adapter.create_draft(&article).await
                        } else {
                            adapter.publish(&article).await
                        }
                    };
                    match tokio::time::timeout(limit, call).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(PublishError::Timeout(limit)),
                    }
                });
                let outcome = match call.await {
                    Ok(outcome) => outcome,
                    Err(e) => Err(PublishError::Aborted(e.to_string())),
                };
                announce(&bus, &article_id, &platform, &outcome);
                outcome
            });
            handles.push((target.clone(), handle));
        }

        for (target, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(PublishError::Aborted(e.to_string())),
            };
            record(&mut job, &target, outcome);
        }

        info!(
            article = %job.article_id,
            success = job.is_success(),
            failed = job.results().iter().filter(|r| !r.success).count(),
            "publish finished"
        );
        Ok(job)
    }
}

/// Log one platform's outcome and push the matching notification.
fn announce(bus: &NotificationBus, article_id: &str, platform: &str, outcome: &Result<Value, PublishError>) {
    let notification = match outcome {
        Ok(_) => {
            info!(article = %article_id, platform, "published");
            Notification::PublishSuccess {
                article_id: article_id.to_string(),
                platform: platform.to_string(),
            }
        }
        Err(e) => {
            warn!(article = %article_id, platform, error = %e, "publish failed");
            Notification::PublishFailed {
                article_id: article_id.to_string(),
                platform: platform.to_string(),
                error: e.to_string(),
            }
        }
    };
    bus.publish(notification);
}

fn record(job: &mut PublishJob, platform: &str, outcome: Result<Value, PublishError>) {
    let status = match outcome {
        Ok(detail) => PlatformStatus {
            state: PublishState::Success,
            error: None,
            detail: (!detail.is_null()).then_some(detail),
        },
        Err(e) => PlatformStatus {
            state: PublishState::Error,
            error: Some(e.to_string()),
            detail: None,
        },
    };
    job.set(platform, status);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Json;
    use axum::routing::post;

    use super::*;

    struct FakePlatform {
        id: String,
        delay: Duration,
        timeout: Duration,
        fail: Option<String>,
        panics: bool,
        publishes: AtomicUsize,
        drafts: AtomicUsize,
    }

    impl FakePlatform {
        fn ok(id: &str) -> Self {
            Self {
                id: id.into(),
                delay: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
                fail: None,
                panics: false,
                publishes: AtomicUsize::new(0),
                drafts: AtomicUsize::new(0),
            }
        }

        fn failing(id: &str, message: &str) -> Self {
            Self {
                fail: Some(message.into()),
                ..Self::ok(id)
            }
        }

        fn slow(id: &str, delay: Duration) -> Self {
            Self { delay, ..Self::ok(id) }
        }

        async fn respond(&self) -> Result<Value, PublishError> {
            tokio::time::sleep(self.delay).await;
            if self.panics {
                panic!("adapter bug");
            }
            match &self.fail {
                Some(message) => Err(PublishError::Rejected {
                    step: "publish".into(),
                    status: 400,
                    body: message.clone(),
                }),
                None => Ok(json!({ "platform": self.id })),
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for FakePlatform {
        fn id(&self) -> &str {
            &self.id
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        async fn publish(&self, _article: &Article) -> Result<Value, PublishError> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            self.respond().await
        }

        async fn create_draft(&self, _article: &Article) -> Result<Value, PublishError> {
            self.drafts.fetch_add(1, Ordering::SeqCst);
            self.respond().await
        }
    }

    fn article() -> Arc<Article> {
        Arc::new(Article {
            id: "art-1".into(),
            topic: "topic".into(),
            title: "标题".into(),
            content: "正文".into(),
            summary: "正文".into(),
            word_count: 2,
            provider: "a".into(),
            model: "a-model".into(),
            created_at: Utc::now(),
        })
    }

    fn orchestrator(primary: Option<&str>, adapters: Vec<Arc<dyn PlatformAdapter>>) -> PublishOrchestrator {
        let mut orchestrator = PublishOrchestrator::new(primary.map(str::to_string), NotificationBus::new(32));
        for adapter in adapters {
            orchestrator.register(adapter);
        }
        orchestrator
    }

    fn targets(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_is_a_partial_failure() {
        let orchestrator = orchestrator(
            None,
            vec![
                Arc::new(FakePlatform::ok("a")),
                Arc::new(FakePlatform::failing("b", "content rejected")),
                Arc::new(FakePlatform::ok("c")),
            ],
        );
        let mut events = orchestrator.bus.subscribe();

        let job = orchestrator.publish(article(), &targets(&["a", "b", "c"])).await.unwrap();
        assert!(job.is_terminal());
        assert!(!job.is_success());
        let results = job.results();
        assert_eq!(
            results.iter().map(|r| (r.platform.as_str(), r.success)).collect::<Vec<_>>(),
            [("a", true), ("b", false), ("c", true)]
        );
        assert!(results[1].error.as_deref().unwrap().contains("content rejected"));

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names.iter().filter(|n| **n == "publish_success").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "publish_failed").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_timeout_does_not_hold_back_the_others() {
        let b = Arc::new(FakePlatform::slow("b", Duration::from_secs(3600)));
        let orchestrator = orchestrator(
            None,
            vec![Arc::new(FakePlatform::ok("a")), b.clone(), Arc::new(FakePlatform::ok("c"))],
        );

        let started = tokio::time::Instant::now();
        let job = orchestrator.publish(article(), &targets(&["a", "b", "c"])).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= b.timeout && elapsed < b.timeout + Duration::from_secs(1), "{elapsed:?}");

        assert_eq!(job.statuses["a"].state, PublishState::Success);
        assert_eq!(job.statuses["c"].state, PublishState::Success);
        assert_eq!(job.statuses["b"].state, PublishState::Error);
        assert!(job.statuses["b"].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn single_primary_target_uses_the_draft_route() {
        let wechat = Arc::new(FakePlatform::ok("wechat"));
        let orchestrator = orchestrator(Some("wechat"), vec![wechat.clone(), Arc::new(FakePlatform::ok("zhihu"))]);

        let job = orchestrator.publish(article(), &targets(&["wechat"])).await.unwrap();
        assert!(job.is_success());
        assert_eq!(wechat.drafts.load(Ordering::SeqCst), 1);
        assert_eq!(wechat.publishes.load(Ordering::SeqCst), 0);

        orchestrator.publish(article(), &targets(&["wechat", "zhihu"])).await.unwrap();
        assert_eq!(wechat.publishes.load(Ordering::SeqCst), 1);
        assert_eq!(wechat.drafts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_platforms_and_duplicates() {
        let a = Arc::new(FakePlatform::ok("a"));
        let orchestrator = orchestrator(None, vec![a.clone()]);

        let job = orchestrator
            .publish(article(), &targets(&["a", "nowhere", "a"]))
            .await
            .unwrap();
        assert_eq!(job.targets, ["a", "nowhere"]);
        assert_eq!(a.publishes.load(Ordering::SeqCst), 1);
        assert_eq!(job.statuses["nowhere"].state, PublishState::Error);
        assert!(!job.is_success());

        assert!(matches!(
            orchestrator.publish(article(), &targets(&[" ", ""])).await,
            Err(EngineError::EmptyTargets)
        ));
    }

    #[tokio::test]
    async fn a_panicking_adapter_only_fails_its_platform() {
        let broken = FakePlatform {
            panics: true,
            ..FakePlatform::ok("b")
        };
        let orchestrator = orchestrator(None, vec![Arc::new(FakePlatform::ok("a")), Arc::new(broken)]);
        let job = orchestrator.publish(article(), &targets(&["a", "b"])).await.unwrap();
        assert_eq!(job.statuses["a"].state, PublishState::Success);
        assert_eq!(job.statuses["b"].state, PublishState::Error);
    }

    #[tokio::test]
    async fn outcome_is_announced_after_the_caller_gives_up() {
        let slow = Arc::new(FakePlatform::slow("a", Duration::from_millis(200)));
        let orchestrator = orchestrator(None, vec![slow.clone()]);
        let mut notifications = orchestrator.bus.subscribe();

        let dropped = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.publish(article(), &targets(&["a"])),
        )
        .await;
        assert!(dropped.is_err());

        let notification = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            notification,
            Notification::PublishSuccess { ref article_id, ref platform } if article_id == "art-1" && platform == "a"
        ));
        assert_eq!(slow.publishes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_panicking_adapter_is_still_announced() {
        let broken = FakePlatform {
            panics: true,
            ..FakePlatform::ok("b")
        };
        let orchestrator = orchestrator(None, vec![Arc::new(broken)]);
        let mut notifications = orchestrator.bus.subscribe();

        orchestrator.publish(article(), &targets(&["b"])).await.unwrap();
        assert!(matches!(
            notifications.try_recv().unwrap(),
            Notification::PublishFailed { ref platform, .. } if platform == "b"
        ));
    }

    #[tokio::test]
    async fn http_platform_runs_steps_in_order() {
        async fn cover(Json(body): Json<Value>) -> Json<Value> {
            assert!(body["previous"].is_null());
            Json(json!({ "mediaId": "m-1" }))
        }
        async fn publish(Json(body): Json<Value>) -> Json<Value> {
            Json(json!({ "published": true, "cover": body["previous"]["mediaId"], "title": body["article"]["title"] }))
        }

        let app = axum::Router::new()
            .route("/cover", post(cover))
            .route("/publish", post(publish));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let platform = HttpPlatform::from_config(&PlatformConfig {
            id: "wechat".into(),
            display_name: None,
            steps: vec![format!("http://{addr}/cover"), format!("http://{addr}/publish")],
            draft_endpoint: None,
            token: Some("secret".into()),
            timeout: "5s".into(),
        })
        .unwrap();

        let detail = platform.publish(&article()).await.unwrap();
        assert_eq!(detail["published"], true);
        assert_eq!(detail["cover"], "m-1");
        assert_eq!(detail["title"], "标题");

        let missing = HttpPlatform::from_config(&PlatformConfig {
            id: "zhihu".into(),
            display_name: None,
            steps: vec![format!("http://{addr}/missing")],
            draft_endpoint: None,
            token: None,
            timeout: "5s".into(),
        })
        .unwrap();
        assert!(matches!(
            missing.publish(&article()).await,
            Err(PublishError::Rejected { status: 404, .. })
        ));
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::buffer::StreamBuffer;
use crate::compose;
use crate::config::Config;
use crate::db;
use crate::error::EngineError;
use crate::feed::FeedHub;
use crate::generation::{GenerationRequest, GenerationSession, SessionOutcome};
use crate::models::{
    Article, ContentResult, FeedItem, FeedRefresh, GeneratedArticle, OnboardingRecord, Provider, ProviderListing,
    ProviderTestResult, RotationState, Strategy, StreamEvent, TitleSuggestion,
};
use crate::notify::{Notification, NotificationBus};
use crate::publish::{PublishJob, PublishOrchestrator};
use crate::registry::{PoolMember, ProviderRegistry};
use crate::retry::RetryPolicy;
use crate::rotation::RotationScheduler;
use crate::store;

const MAX_TITLE_SUGGESTIONS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleRequest {
    pub topic: String,
    #[serde(default = "default_title_count")]
    pub count: usize,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_title_count() -> usize {
    5
}

/// Admin changes to one provider; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUpdate {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub default_model: Option<String>,
}

/// A running streaming generation, handed to whoever consumes it.
///
/// Dropping `events` cancels the session; the buffer stays readable either way.
pub struct GenerationStream {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
    pub buffer: StreamBuffer,
    pub cancel: CancellationToken,
}

pub struct EngineParts {
    pub registry: Arc<ProviderRegistry>,
    pub strategy: Strategy,
    pub seed: Option<u64>,
    pub retry: RetryPolicy,
    pub publisher: PublishOrchestrator,
    pub feeds: FeedHub,
    pub bus: NotificationBus,
    pub pool: SqlitePool,
}

/// The generation and publish core, shared by the HTTP server, the poller and the CLI.
pub struct Engine {
    registry: Arc<ProviderRegistry>,
    scheduler: RotationScheduler,
    retry: RetryPolicy,
    publisher: PublishOrchestrator,
    feeds: FeedHub,
    bus: NotificationBus,
    pool: SqlitePool,
    sessions: Mutex<HashMap<String, CancellationToken>>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            scheduler: RotationScheduler::new(parts.registry.clone(), parts.strategy, parts.seed),
            registry: parts.registry,
            retry: parts.retry,
            publisher: parts.publisher,
            feeds: parts.feeds,
            bus: parts.bus,
            pool: parts.pool,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_config(config: &Config) -> Result<Arc<Self>> {
        let pool = db::create_pool(config).await.context("opening database")?;
        let bus = NotificationBus::default();
        let registry = Arc::new(ProviderRegistry::from_config(config)?);

        let configured: Strategy = config
            .rotation
            .strategy
            .parse()
            .context("parsing [rotation] strategy")?;
        let strategy = match store::get_setting(&pool, store::ROTATION_STRATEGY_KEY).await? {
            Some(saved) => match saved.parse::<Strategy>() {
                Ok(strategy) => strategy,
                Err(e) => {
                    warn!(error = %e, "ignoring stored rotation strategy");
                    configured
                }
            },
            None => configured,
        };

        let engine = Self::new(EngineParts {
            registry,
            strategy,
            seed: config.rotation.seed,
            retry: RetryPolicy::from_config(&config.retry)?,
            publisher: PublishOrchestrator::from_config(config, bus.clone())?,
            feeds: FeedHub::from_config(config, pool.clone(), bus.clone())?,
            bus,
            pool,
        });
        info!(strategy = %strategy, "engine ready");
        Ok(Arc::new(engine))
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn feeds(&self) -> &FeedHub {
        &self.feeds
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    // --- providers ---

    pub fn list_providers(&self) -> ProviderListing {
        let providers = self.registry.list();
        let enabled_providers = providers.iter().filter(|p| p.enabled).map(|p| p.name.clone()).collect();
        ProviderListing {
            providers,
            current_strategy: self.scheduler.strategy(),
            enabled_providers,
        }
    }

    /// Test connectivity; with `apply`, the outcome becomes the provider's availability.
    pub async fn test_provider(&self, name: &str, apply: bool) -> Result<ProviderTestResult, EngineError> {
        match self.registry.test_provider(name).await {
            Ok(result) => {
                if apply {
                    self.registry.apply_test_result(name, &result)?;
                }
                Ok(result)
            }
            Err(e @ EngineError::ProviderUnreachable { .. }) => {
                if apply {
                    self.registry.set_available(name, false)?;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub fn update_provider(&self, name: &str, update: &ProviderUpdate) -> Result<Provider, EngineError> {
        if let Some(model) = &update.default_model
            && model.trim().is_empty()
        {
            return Err(EngineError::InvalidRequest("defaultModel must not be empty".to_string()));
        }
        // Resolve the name first so an unknown provider fails before any mutation.
        let current = self
            .registry
            .list()
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| EngineError::UnknownProvider(name.to_string()))?;

        if let Some(enabled) = update.enabled {
            self.registry.set_enabled(name, enabled)?;
        }
        if let Some(model) = &update.default_model {
            self.registry.set_default_model(name, model.trim())?;
        }
        Ok(self
            .registry
            .list()
            .into_iter()
            .find(|p| p.name == name)
            .unwrap_or(current))
    }

    pub async fn set_rotation_strategy(&self, value: &str) -> Result<RotationState, EngineError> {
        let strategy = self.scheduler.set_strategy(value)?;
        store::set_setting(&self.pool, store::ROTATION_STRATEGY_KEY, &strategy.to_string()).await?;
        Ok(self.scheduler.state())
    }

    pub fn rotation_state(&self) -> RotationState {
        self.scheduler.state()
    }

    fn select_provider(&self, requested: Option<&str>) -> Result<PoolMember, EngineError> {
        match requested.map(str::trim).filter(|p| !p.is_empty()) {
            Some(name) => self.registry.get(name),
            None => self.scheduler.next(),
        }
    }

    // --- generation ---

    pub async fn generate_titles(&self, request: &TitleRequest) -> Result<Vec<TitleSuggestion>, EngineError> {
        let topic = require_topic(&request.topic)?;
        let count = request.count.clamp(1, MAX_TITLE_SUGGESTIONS);
        let provider = self.select_provider(request.provider.as_deref())?;
        let model = request.model.clone().unwrap_or_else(|| provider.model.clone());

        let completion_request = compose::titles_request(&model, topic, count);
        let completion = self
            .retry
            .run(&provider.name, |_| provider.client.complete(&completion_request))
            .await?;

        let titles = compose::parse_titles(&completion.text, count);
        info!(provider = %provider.name, requested = count, returned = titles.len(), "titles generated");
        Ok(titles.into_iter().map(|title| TitleSuggestion { title }).collect())
    }

    /// Non-streaming content generation for a known title.
    pub async fn generate_content(&self, request: &GenerationRequest) -> Result<ContentResult, EngineError> {
        let topic = require_topic(&request.topic)?;
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(topic);
        let provider = self.select_provider(request.provider.as_deref())?;
        let model = request.model.clone().unwrap_or_else(|| provider.model.clone());
        let length = request.length.unwrap_or(compose::DEFAULT_LENGTH);

        let completion_request = compose::content_request(&model, topic, title, &request.style, length);
        let completion = self
            .retry
            .run(&provider.name, |_| provider.client.complete(&completion_request))
            .await?;

        let content = completion.text.trim().to_string();
        info!(provider = %provider.name, model = %model, chars = content.chars().count(), "content generated");
        Ok(ContentResult {
            summary: compose::summarize(&content),
            word_count: compose::word_count(&content),
            content,
        })
    }

    /// Start a streaming generation session in the background.
    ///
    /// The first event is a `progress` carrying the session id; the last one is
    /// `complete` or `error`, unless the session was cancelled.
    pub fn stream_generate(self: &Arc<Self>, request: GenerationRequest) -> Result<GenerationStream, EngineError> {
        require_topic(&request.topic)?;
        let provider = self.select_provider(request.provider.as_deref())?;

        let session_id = Uuid::new_v4().to_string();
        let (tx, events) = mpsc::unbounded_channel();
        let mut session = GenerationSession::new(session_id.clone(), request.clone(), provider, self.retry, tx.clone());
        let buffer = session.buffer();
        let cancel = session.cancel_token();

        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), cancel.clone());

        let engine = self.clone();
        let id = session_id.clone();
        tokio::spawn(async move {
            let outcome = session.run().await;
            engine.finish_session(&id, &request, outcome, &tx).await;
        });

        Ok(GenerationStream {
            session_id,
            events,
            buffer,
            cancel,
        })
    }

    pub fn cancel_generation(&self, session_id: &str) -> Result<(), EngineError> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let token = sessions
            .get(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.to_string()))?;
        info!(session = %session_id, "cancellation requested");
        token.cancel();
        Ok(())
    }

    /// Cancel every running session, e.g. on shutdown. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        for token in sessions.values() {
            token.cancel();
        }
        sessions.len()
    }

    pub fn running_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn finish_session(
        &self,
        session_id: &str,
        request: &GenerationRequest,
        outcome: SessionOutcome,
        events: &mpsc::UnboundedSender<StreamEvent>,
    ) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        let failure = match outcome {
            SessionOutcome::Cancelled => return,
            SessionOutcome::Failed(e) => e,
            SessionOutcome::Complete(generated) => {
                let article = Article {
                    id: Uuid::new_v4().to_string(),
                    topic: request.topic.trim().to_string(),
                    title: generated.title,
                    content: generated.content,
                    summary: generated.summary,
                    word_count: generated.word_count as i64,
                    provider: generated.provider,
                    model: generated.model,
                    created_at: Utc::now(),
                };
                match store::insert_article(&self.pool, &article).await {
                    Ok(()) => {
                        info!(session = %session_id, article = %article.id, "article stored");
                        let _ = events.send(StreamEvent::Complete(GeneratedArticle {
                            article_id: article.id.clone(),
                            title: article.title.clone(),
                            content: article.content,
                            summary: article.summary,
                            word_count: generated.word_count,
                        }));
                        self.bus.publish(Notification::ArticleGenerated {
                            article_id: article.id,
                            title: article.title,
                        });
                        return;
                    }
                    Err(e) => EngineError::Storage(e),
                }
            }
        };

        let surfaced = failure.surface();
        let _ = events.send(StreamEvent::Error(surfaced.clone()));
        self.bus.publish(Notification::GenerationFailed {
            session_id: session_id.to_string(),
            error: surfaced,
        });
    }

    pub async fn get_article(&self, id: &str) -> Result<Article, EngineError> {
        store::get_article(&self.pool, id)
            .await?
            .ok_or_else(|| EngineError::ArticleNotFound(id.to_string()))
    }

    pub async fn recent_articles(&self, limit: i64) -> Result<Vec<Article>, EngineError> {
        Ok(store::get_recent_articles(&self.pool, limit).await?)
    }

    // --- publishing ---

    pub async fn publish(&self, article_id: &str, targets: &[String]) -> Result<PublishJob, EngineError> {
        let article = self.get_article(article_id).await?;
        self.publisher.publish(Arc::new(article), targets).await
    }

    pub fn platforms(&self) -> Vec<String> {
        self.publisher.platforms()
    }

    // --- feeds ---

    pub async fn refresh_feed(&self, source: &str, limit: Option<usize>) -> Result<FeedRefresh, EngineError> {
        self.feeds.refresh(source, limit).await
    }

    pub async fn feed_items(&self, source: &str, limit: Option<usize>) -> Result<Vec<FeedItem>, EngineError> {
        self.feeds.cached(source, limit).await
    }

    // --- onboarding ---

    pub async fn onboarding(&self) -> Result<OnboardingRecord, EngineError> {
        Ok(store::get_onboarding(&self.pool).await?)
    }

    pub async fn set_onboarding(&self, record: &OnboardingRecord) -> Result<(), EngineError> {
        Ok(store::set_onboarding(&self.pool, record).await?)
    }
}

fn require_topic(topic: &str) -> Result<&str, EngineError> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(EngineError::InvalidRequest("topic must not be empty".to_string()));
    }
    Ok(topic)
}

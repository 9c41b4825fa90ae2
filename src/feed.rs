use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::{Config, parse_duration};
use crate::error::{EngineError, FeedError};
use crate::models::{FeedItem, FeedRefresh};
use crate::notify::{Notification, NotificationBus};
use crate::store;

/// Minimum interval between two polls of the same feed.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(300);

/// A hot-topic list, ranked by position.
#[async_trait]
pub trait FeedProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, limit: usize) -> Result<Vec<FeedItem>, FeedError>;
}

pub struct RssFeed {
    name: String,
    url: String,
    http: reqwest::Client,
}

impl RssFeed {
    pub fn new(name: &str, url: &str) -> Result<Self, FeedError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("quillcast/", env!("CARGO_PKG_VERSION"))),
        );

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()
            .map_err(|e| FeedError::Http {
                url: url.to_string(),
                source: e,
            })?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            http,
        })
    }
}

#[async_trait]
impl FeedProvider for RssFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<FeedItem>, FeedError> {
        debug!(url = %self.url, feed = %self.name, "fetching feed");

        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FeedError::Http {
                url: self.url.clone(),
                source: e,
            })?;

        let body = response.bytes().await.map_err(|e| FeedError::Http {
            url: self.url.clone(),
            source: e,
        })?;

        parse_feed(&self.name, &self.url, &body, limit)
    }
}

pub(crate) fn parse_feed(source: &str, url: &str, body: &[u8], limit: usize) -> Result<Vec<FeedItem>, FeedError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| FeedError::Parse {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let now = Utc::now();
    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let title = entry.title.map(|t| t.content.trim().to_string()).filter(|t| !t.is_empty());
            let Some(title) = title else {
                debug!(entry_id = %entry.id, "skipping entry without title");
                return None;
            };
            let link = entry.links.first().map(|l| l.href.clone());
            let summary = entry
                .summary
                .map(|s| strip_html(&s.content))
                .filter(|s| !s.is_empty());

            // GUID when present, else SHA-256 of link + title.
            let dedup_key = if !entry.id.is_empty() {
                entry.id.clone()
            } else {
                let mut hasher = Sha256::new();
                hasher.update(link.as_deref().unwrap_or(""));
                hasher.update("|");
                hasher.update(&title);
                format!("sha256:{:x}", hasher.finalize())
            };

            Some((title, link, summary, dedup_key, entry.published.or(entry.updated)))
        })
        .take(limit)
        .enumerate()
        .map(|(index, (title, url, summary, dedup_key, published_at))| FeedItem {
            source: source.to_string(),
            dedup_key,
            title,
            url,
            summary,
            rank: index as i64 + 1,
            published_at,
            fetched_at: now,
        })
        .collect();

    Ok(items)
}

fn strip_html(html: &str) -> String {
    if !html.contains('<') {
        return html.trim().to_string();
    }
    match html2text::from_read(html.as_bytes(), 10_000) {
        Ok(text) => text.trim().to_string(),
        Err(e) => {
            warn!(error = %e, "html2text conversion failed, using raw text");
            html.trim().to_string()
        }
    }
}

struct FeedEntry {
    provider: Arc<dyn FeedProvider>,
    limit: usize,
    poll_interval: Duration,
}

/// Live hot-topic feeds backed by the SQLite cache.
pub struct FeedHub {
    feeds: HashMap<String, FeedEntry>,
    pool: SqlitePool,
    bus: NotificationBus,
}

impl FeedHub {
    pub fn new(pool: SqlitePool, bus: NotificationBus) -> Self {
        Self {
            feeds: HashMap::new(),
            pool,
            bus,
        }
    }

    pub fn from_config(config: &Config, pool: SqlitePool, bus: NotificationBus) -> Result<Self> {
        let mut hub = Self::new(pool, bus);
        for feed in config.feed.iter().filter(|f| f.enabled) {
            let interval = parse_duration("feed poll_interval", &feed.poll_interval)?;
            hub.register(Arc::new(RssFeed::new(&feed.name, &feed.url)?), feed.limit as usize, interval);
        }
        info!(count = hub.feeds.len(), "feeds registered");
        Ok(hub)
    }

    pub fn register(&mut self, provider: Arc<dyn FeedProvider>, limit: usize, poll_interval: Duration) {
        if poll_interval < MIN_POLL_INTERVAL {
            warn!(
                feed = %provider.name(),
                requested = ?poll_interval,
                "poll interval below minimum, clamping to 5 minutes"
            );
        }
        self.feeds.insert(
            provider.name().to_string(),
            FeedEntry {
                provider,
                limit,
                poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            },
        );
    }

    /// Registered sources with their poll interval, sorted by name.
    pub fn sources(&self) -> Vec<(String, Duration)> {
        let mut sources: Vec<_> = self
            .feeds
            .iter()
            .map(|(name, entry)| (name.clone(), entry.poll_interval))
            .collect();
        sources.sort();
        sources
    }

    pub fn default_limit(&self, source: &str) -> Result<usize, EngineError> {
        self.feeds
            .get(source)
            .map(|e| e.limit)
            .ok_or_else(|| EngineError::UnknownFeed(source.to_string()))
    }

    /// Fetch the live list and merge it into the cache.
    ///
    /// New items are reported as a live result. With nothing new, or when the live
    /// fetch fails while something is cached, the cached list is returned with
    /// `fallback: "cache"`. A failed fetch with an empty cache is an error.
    pub async fn refresh(&self, source: &str, limit: Option<usize>) -> Result<FeedRefresh, EngineError> {
        let entry = self
            .feeds
            .get(source)
            .ok_or_else(|| EngineError::UnknownFeed(source.to_string()))?;
        let limit = limit.unwrap_or(entry.limit).max(1);

        let fetched = match entry.provider.fetch(limit).await {
            Ok(items) => items,
            Err(e) => {
                warn!(feed = %source, error = %e, "live fetch failed");
                let cached = store::get_feed_items(&self.pool, source, limit as i64).await?;
                if cached.is_empty() {
                    return Err(EngineError::FeedUnavailable {
                        feed: source.to_string(),
                        message: e.to_string(),
                    });
                }
                return Ok(FeedRefresh {
                    success: true,
                    fallback: Some("cache".to_string()),
                    message: format!("live fetch failed ({e}); showing {} cached items", cached.len()),
                    new_items: 0,
                    items: cached,
                });
            }
        };

        let mut new_items = 0;
        let mut known = Vec::new();
        for item in &fetched {
            if store::insert_feed_item(&self.pool, item).await? {
                new_items += 1;
            } else {
                known.push(item);
            }
        }

        if new_items == 0 {
            let cached = store::get_feed_items(&self.pool, source, limit as i64).await?;
            info!(feed = %source, fetched = fetched.len(), "no new items, serving cache");
            return Ok(FeedRefresh {
                success: true,
                fallback: Some("cache".to_string()),
                message: format!("no new items; showing {} cached items", cached.len()),
                new_items: 0,
                items: cached,
            });
        }

        for item in known {
            store::update_feed_rank(&self.pool, &item.source, &item.dedup_key, item.rank).await?;
        }
        let live: Vec<&str> = fetched.iter().map(|i| i.dedup_key.as_str()).collect();
        let demoted = store::demote_feed_items_except(&self.pool, source, &live, fetched.len() as i64 + 1).await?;
        if demoted > 0 {
            debug!(feed = %source, demoted, "items left the live ranking");
        }

        info!(feed = %source, new_items, fetched = fetched.len(), "feed refreshed");
        self.bus.publish(Notification::HotspotUpdated {
            source: source.to_string(),
            new_items,
        });

        Ok(FeedRefresh {
            success: true,
            fallback: None,
            message: format!("{new_items} new items"),
            new_items,
            items: fetched,
        })
    }

    pub async fn cached(&self, source: &str, limit: Option<usize>) -> Result<Vec<FeedItem>, EngineError> {
        let default = self.default_limit(source)?;
        let limit = limit.unwrap_or(default) as i64;
        Ok(store::get_feed_items(&self.pool, source, limit).await?)
    }
}

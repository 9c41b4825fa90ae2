use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Article, FeedItem, OnboardingRecord};

const ONBOARDING_KEY: &str = "onboarding";
pub const ROTATION_STRATEGY_KEY: &str = "rotation_strategy";

fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Get a setting value from the settings table.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("reading setting")?;
    Ok(row.map(|(v,)| v))
}

/// Upsert a setting in the settings table.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("upserting setting")?;
    Ok(())
}

pub async fn get_onboarding(pool: &SqlitePool) -> Result<OnboardingRecord> {
    match get_setting(pool, ONBOARDING_KEY).await? {
        Some(raw) => serde_json::from_str(&raw).context("decoding onboarding record"),
        None => Ok(OnboardingRecord::default()),
    }
}

pub async fn set_onboarding(pool: &SqlitePool, record: &OnboardingRecord) -> Result<()> {
    let raw = serde_json::to_string(record).context("encoding onboarding record")?;
    set_setting(pool, ONBOARDING_KEY, &raw).await
}

/// Insert a feed item unless it is already cached. Returns true when the item is new.
pub async fn insert_feed_item(pool: &SqlitePool, item: &FeedItem) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO feed_items (source, dedup_key, title, url, summary, rank, published_at, fetched_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(source, dedup_key) DO NOTHING",
    )
    .bind(&item.source)
    .bind(&item.dedup_key)
    .bind(&item.title)
    .bind(&item.url)
    .bind(&item.summary)
    .bind(item.rank)
    .bind(item.published_at.map(timestamp))
    .bind(timestamp(item.fetched_at))
    .execute(pool)
    .await
    .context("inserting feed item")?;
    Ok(result.rows_affected() > 0)
}

pub async fn update_feed_rank(pool: &SqlitePool, source: &str, dedup_key: &str, rank: i64) -> Result<()> {
    sqlx::query("UPDATE feed_items SET rank = ? WHERE source = ? AND dedup_key = ?")
        .bind(rank)
        .bind(source)
        .bind(dedup_key)
        .execute(pool)
        .await
        .context("updating feed item rank")?;
    Ok(())
}

/// Move every cached item of `source` whose key is not in `keep` to `rank`.
/// Returns how many items were demoted.
pub async fn demote_feed_items_except(pool: &SqlitePool, source: &str, keep: &[&str], rank: i64) -> Result<u64> {
    let keep = serde_json::to_string(keep).context("encoding kept feed keys")?;
    let result = sqlx::query(
        "UPDATE feed_items SET rank = ?
         WHERE source = ? AND rank < ? AND dedup_key NOT IN (SELECT value FROM json_each(?))",
    )
    .bind(rank)
    .bind(source)
    .bind(rank)
    .bind(keep)
    .execute(pool)
    .await
    .context("demoting stale feed items")?;
    Ok(result.rows_affected())
}

/// Cached items for a source, best rank first.
pub async fn get_feed_items(pool: &SqlitePool, source: &str, limit: i64) -> Result<Vec<FeedItem>> {
    let items = sqlx::query_as::<_, FeedItem>(
        "SELECT source, dedup_key, title, url, summary, rank, published_at, fetched_at
         FROM feed_items
         WHERE source = ?
         ORDER BY rank ASC, fetched_at DESC
         LIMIT ?",
    )
    .bind(source)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetching cached feed items")?;
    Ok(items)
}

pub async fn count_feed_items(pool: &SqlitePool, source: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feed_items WHERE source = ?")
        .bind(source)
        .fetch_one(pool)
        .await
        .context("counting cached feed items")?;
    Ok(count)
}

pub async fn insert_article(pool: &SqlitePool, article: &Article) -> Result<()> {
    sqlx::query(
        "INSERT INTO articles (id, topic, title, content, summary, word_count, provider, model, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&article.id)
    .bind(&article.topic)
    .bind(&article.title)
    .bind(&article.content)
    .bind(&article.summary)
    .bind(article.word_count)
    .bind(&article.provider)
    .bind(&article.model)
    .bind(timestamp(article.created_at))
    .execute(pool)
    .await
    .context("inserting article")?;
    Ok(())
}

pub async fn get_article(pool: &SqlitePool, id: &str) -> Result<Option<Article>> {
    let article = sqlx::query_as::<_, Article>(
        "SELECT id, topic, title, content, summary, word_count, provider, model, created_at
         FROM articles WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("fetching article")?;
    Ok(article)
}

pub async fn get_recent_articles(pool: &SqlitePool, limit: i64) -> Result<Vec<Article>> {
    let articles = sqlx::query_as::<_, Article>(
        "SELECT id, topic, title, content, summary, word_count, provider, model, created_at
         FROM articles ORDER BY created_at DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("fetching recent articles")?;
    Ok(articles)
}

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::StoredArticle;
use crate::publish::{self, PostStatus, WordPressClient};
use crate::store;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub processed: usize,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<SweepEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepEntry {
    pub article_id: String,
    pub user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Publish every scheduled article whose time has come. One entry's failure
/// never blocks the rest of the batch.
pub async fn run_sweep(pool: &SqlitePool, config: &Config, now: DateTime<Utc>) -> Result<SweepSummary> {
    let due = store::get_due_scheduled_articles(pool, now)
        .await
        .context("querying due scheduled articles")?;

    let mut summary = SweepSummary {
        processed: due.len(),
        published: 0,
        skipped: 0,
        failed: 0,
        results: Vec::with_capacity(due.len()),
    };

    if due.is_empty() {
        return Ok(summary);
    }
    info!(due = due.len(), "sweeping scheduled articles");

    for article in &due {
        let entry = sweep_one(pool, config, article, now).await;
        match entry.status.as_str() {
            "published" => summary.published += 1,
            "skipped" => summary.skipped += 1,
            _ => summary.failed += 1,
        }
        summary.results.push(entry);
    }

    info!(
        processed = summary.processed,
        published = summary.published,
        skipped = summary.skipped,
        failed = summary.failed,
        "sweep finished"
    );
    Ok(summary)
}

async fn sweep_one(
    pool: &SqlitePool,
    config: &Config,
    article: &StoredArticle,
    now: DateTime<Utc>,
) -> SweepEntry {
    let entry = |status: &str, post_id: Option<i64>, reason: Option<String>| SweepEntry {
        article_id: article.id.clone(),
        user_id: article.user_id.clone(),
        status: status.to_string(),
        post_id,
        reason,
    };

    let connection = match store::get_wordpress_connection(pool, &article.user_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            warn!(article_id = %article.id, user_id = %article.user_id, "no wordpress connection, skipping");
            return entry("skipped", None, Some("no wordpress connection".to_string()));
        }
        Err(e) => {
            error!(article_id = %article.id, error = %e, "failed to load wordpress connection");
            return entry("failed", None, Some(e.to_string()));
        }
    };

    let client = match WordPressClient::new(
        &connection.site_url,
        &connection.username,
        &connection.app_password,
        config.request_timeout(),
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(article_id = %article.id, error = %e, "failed to build wordpress client");
            return entry("failed", None, Some(e.to_string()));
        }
    };

    let result = publish::publish_article(
        &client,
        article.wordpress_post_id,
        &article.topic,
        &article.content_html,
        &article.seo_metadata(),
        PostStatus::Publish,
        None,
        None,
    )
    .await;

    let post = match result {
        Ok(p) => p,
        Err(e) => {
            warn!(article_id = %article.id, error = %e, "scheduled publish failed");
            return entry("failed", None, Some(e.to_string()));
        }
    };

    if let Err(e) =
        store::update_article_publish_state(pool, &article.id, post.post_id, &post.edit_url, "published", Some(now))
            .await
    {
        error!(article_id = %article.id, error = %e, "publish succeeded but state update failed");
        return entry("failed", Some(post.post_id), Some(e.to_string()));
    }

    info!(article_id = %article.id, post_id = post.post_id, "scheduled article published");
    entry("published", Some(post.post_id), None)
}

/// Background loop: wake on the configured interval and run a sweep.
pub async fn sweep_loop(pool: SqlitePool, config: Arc<Config>, cancel: CancellationToken) {
    let interval = config.sweep_interval();
    info!(interval = ?interval, "scheduled-publish sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("sweeper shutting down");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        if let Err(e) = run_sweep(&pool, &config, Utc::now()).await {
            error!(error = %e, "sweep run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Executor;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        pool.execute("PRAGMA foreign_keys = ON").await.unwrap();
        pool.execute(include_str!("../migrations/20260826_000001_initial_schema.sql"))
            .await
            .unwrap();
        pool
    }

    fn config() -> Config {
        toml::from_str("[plume]\n").unwrap()
    }

    fn scheduled_article(user_id: &str, id: &str, at: DateTime<Utc>) -> StoredArticle {
        StoredArticle {
            id: id.to_string(),
            user_id: user_id.to_string(),
            topic: "Topic".to_string(),
            title: "Title".to_string(),
            content_html: "<p>x</p>".to_string(),
            word_count: 10,
            status: "scheduled".to_string(),
            scheduled_at: Some(at),
            published_at: None,
            wordpress_post_id: None,
            wordpress_edit_url: None,
            meta_title: String::new(),
            meta_description: String::new(),
            slug: String::new(),
            keywords: "[]".to_string(),
            seo_score: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn empty_sweep_reports_zero_processed() {
        let pool = test_pool().await;
        let summary = run_sweep(&pool, &config(), Utc::now()).await.unwrap();
        assert_eq!(summary.processed, 0);
        assert!(summary.results.is_empty());
    }

    #[tokio::test]
    async fn missing_connection_skips_entry_but_continues() {
        let pool = test_pool().await;
        let user = store::create_user(&pool, "alice", "t").await.unwrap();
        let past = Utc::now() - chrono::Duration::minutes(5);
        store::insert_article(&pool, &scheduled_article(&user.id, "a1", past))
            .await
            .unwrap();

        let summary = run_sweep(&pool, &config(), Utc::now()).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.published, 0);
        assert_eq!(summary.results[0].status, "skipped");
        assert_eq!(summary.results[0].reason.as_deref(), Some("no wordpress connection"));

        // Still scheduled; the next sweep will retry once a connection exists.
        let due = store::get_due_scheduled_articles(&pool, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::models::{CtaRow, StoredArticle, User, UserSecret, WordpressConnection};

/// All article columns in SELECT order (must match StoredArticle field order).
const ARTICLE_COLUMNS: &str = "id, user_id, topic, title, content_html, word_count, status,
    scheduled_at, published_at, wordpress_post_id, wordpress_edit_url,
    meta_title, meta_description, slug, keywords, seo_score, created_at, updated_at";

const CTA_COLUMNS: &str = "id, user_id, title, description, button_text, button_url, image_url,
    position, section_number, style, colors, created_at";

fn now_string() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Users ──────────────────────────────────────────────────────────────

pub async fn create_user(pool: &SqlitePool, name: &str, api_token: &str) -> Result<User> {
    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now();

    sqlx::query("INSERT INTO users (id, name, api_token, created_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(name)
        .bind(api_token)
        .bind(created_at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .execute(pool)
        .await
        .context("inserting user")?;

    debug!(name = %name, id = %id, "created user");
    Ok(User {
        id,
        name: name.to_string(),
        api_token: api_token.to_string(),
        created_at,
    })
}

pub async fn get_user_by_token(pool: &SqlitePool, api_token: &str) -> Result<Option<User>> {
    let user = sqlx::query_as::<_, User>(
        "SELECT id, name, api_token, created_at FROM users WHERE api_token = ?",
    )
    .bind(api_token)
    .fetch_optional(pool)
    .await
    .context("querying user by token")?;
    Ok(user)
}

pub async fn get_user_by_name(pool: &SqlitePool, name: &str) -> Result<Option<User>> {
    let user =
        sqlx::query_as::<_, User>("SELECT id, name, api_token, created_at FROM users WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("querying user by name")?;
    Ok(user)
}

pub async fn list_users(pool: &SqlitePool) -> Result<Vec<User>> {
    let users =
        sqlx::query_as::<_, User>("SELECT id, name, api_token, created_at FROM users ORDER BY created_at")
            .fetch_all(pool)
            .await
            .context("listing users")?;
    Ok(users)
}

// ── Provider secrets ───────────────────────────────────────────────────

pub async fn set_user_secret(
    pool: &SqlitePool,
    user_id: &str,
    provider: &str,
    api_key: &str,
    base_url: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO user_secrets (user_id, provider, api_key, base_url, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id, provider) DO UPDATE SET
           api_key = excluded.api_key,
           base_url = excluded.base_url,
           updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(provider)
    .bind(api_key)
    .bind(base_url)
    .bind(now_string())
    .execute(pool)
    .await
    .context("upserting user secret")?;

    debug!(user_id = %user_id, provider = %provider, "stored provider secret");
    Ok(())
}

pub async fn get_user_secrets(pool: &SqlitePool, user_id: &str) -> Result<Vec<UserSecret>> {
    let secrets = sqlx::query_as::<_, UserSecret>(
        "SELECT provider, api_key, base_url FROM user_secrets WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("querying user secrets")?;
    Ok(secrets)
}

// ── WordPress connections ──────────────────────────────────────────────

pub async fn set_wordpress_connection(
    pool: &SqlitePool,
    user_id: &str,
    site_url: &str,
    username: &str,
    app_password: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO wordpress_connections (user_id, site_url, username, app_password, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET
           site_url = excluded.site_url,
           username = excluded.username,
           app_password = excluded.app_password,
           updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(site_url)
    .bind(username)
    .bind(app_password)
    .bind(now_string())
    .execute(pool)
    .await
    .context("upserting wordpress connection")?;

    debug!(user_id = %user_id, site = %site_url, "stored wordpress connection");
    Ok(())
}

pub async fn get_wordpress_connection(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<WordpressConnection>> {
    let connection = sqlx::query_as::<_, WordpressConnection>(
        "SELECT user_id, site_url, username, app_password FROM wordpress_connections WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .context("querying wordpress connection")?;
    Ok(connection)
}

// ── Articles ───────────────────────────────────────────────────────────

pub async fn insert_article(pool: &SqlitePool, article: &StoredArticle) -> Result<()> {
    sqlx::query(
        "INSERT INTO articles (id, user_id, topic, title, content_html, word_count, status,
         scheduled_at, published_at, wordpress_post_id, wordpress_edit_url,
         meta_title, meta_description, slug, keywords, seo_score, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&article.id)
    .bind(&article.user_id)
    .bind(&article.topic)
    .bind(&article.title)
    .bind(&article.content_html)
    .bind(article.word_count)
    .bind(&article.status)
    .bind(article.scheduled_at.map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
    .bind(article.published_at.map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
    .bind(article.wordpress_post_id)
    .bind(&article.wordpress_edit_url)
    .bind(&article.meta_title)
    .bind(&article.meta_description)
    .bind(&article.slug)
    .bind(&article.keywords)
    .bind(article.seo_score)
    .bind(article.created_at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    .bind(article.updated_at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    .execute(pool)
    .await
    .context("inserting article")?;

    debug!(id = %article.id, user_id = %article.user_id, "saved article");
    Ok(())
}

pub async fn get_article(
    pool: &SqlitePool,
    user_id: &str,
    article_id: &str,
) -> Result<Option<StoredArticle>> {
    let query = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE user_id = ? AND id = ?");
    let article = sqlx::query_as::<_, StoredArticle>(&query)
        .bind(user_id)
        .bind(article_id)
        .fetch_optional(pool)
        .await
        .context("querying article")?;
    Ok(article)
}

pub async fn list_articles(pool: &SqlitePool, user_id: &str) -> Result<Vec<StoredArticle>> {
    let query =
        format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE user_id = ? ORDER BY created_at DESC");
    let articles = sqlx::query_as::<_, StoredArticle>(&query)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("listing articles")?;
    Ok(articles)
}

pub async fn delete_article(pool: &SqlitePool, user_id: &str, article_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM articles WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(article_id)
        .execute(pool)
        .await
        .context("deleting article")?;
    Ok(result.rows_affected() > 0)
}

/// Record a successful WordPress publish on an article.
pub async fn update_article_publish_state(
    pool: &SqlitePool,
    article_id: &str,
    post_id: i64,
    edit_url: &str,
    status: &str,
    published_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE articles SET wordpress_post_id = ?, wordpress_edit_url = ?, status = ?,
         published_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(post_id)
    .bind(edit_url)
    .bind(status)
    .bind(published_at.map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string()))
    .bind(now_string())
    .bind(article_id)
    .execute(pool)
    .await
    .context("updating article publish state")?;
    Ok(())
}

/// Mark an article for the scheduled-publish sweep.
pub async fn update_article_schedule(
    pool: &SqlitePool,
    user_id: &str,
    article_id: &str,
    scheduled_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE articles SET status = 'scheduled', scheduled_at = ?, updated_at = ?
         WHERE user_id = ? AND id = ?",
    )
    .bind(scheduled_at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    .bind(now_string())
    .bind(user_id)
    .bind(article_id)
    .execute(pool)
    .await
    .context("updating article schedule")?;
    Ok(())
}

/// Scheduled articles due at or before `now`, across all users.
pub async fn get_due_scheduled_articles(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<StoredArticle>> {
    let query = format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles
         WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
         ORDER BY scheduled_at ASC"
    );
    let articles = sqlx::query_as::<_, StoredArticle>(&query)
        .bind(now.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .fetch_all(pool)
        .await
        .context("querying due scheduled articles")?;
    Ok(articles)
}

// ── CTA templates ──────────────────────────────────────────────────────

pub async fn insert_cta(pool: &SqlitePool, cta: &CtaRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO ctas (id, user_id, title, description, button_text, button_url, image_url,
         position, section_number, style, colors, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&cta.id)
    .bind(&cta.user_id)
    .bind(&cta.title)
    .bind(&cta.description)
    .bind(&cta.button_text)
    .bind(&cta.button_url)
    .bind(&cta.image_url)
    .bind(&cta.position)
    .bind(cta.section_number)
    .bind(&cta.style)
    .bind(&cta.colors)
    .bind(cta.created_at.format("%Y-%m-%dT%H:%M:%SZ").to_string())
    .execute(pool)
    .await
    .context("inserting cta")?;

    debug!(id = %cta.id, user_id = %cta.user_id, "saved cta template");
    Ok(())
}

pub async fn list_ctas(pool: &SqlitePool, user_id: &str) -> Result<Vec<CtaRow>> {
    let query = format!("SELECT {CTA_COLUMNS} FROM ctas WHERE user_id = ? ORDER BY created_at");
    let ctas = sqlx::query_as::<_, CtaRow>(&query)
        .bind(user_id)
        .fetch_all(pool)
        .await
        .context("listing ctas")?;
    Ok(ctas)
}

pub async fn delete_cta(pool: &SqlitePool, user_id: &str, cta_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM ctas WHERE user_id = ? AND id = ?")
        .bind(user_id)
        .bind(cta_id)
        .execute(pool)
        .await
        .context("deleting cta")?;
    Ok(result.rows_affected() > 0)
}

// ── Settings ───────────────────────────────────────────────────────────

/// Read a setting from the settings table.
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

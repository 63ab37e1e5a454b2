use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chat::HttpChatClient;
use crate::config::Config;
use crate::credentials::RunCredentials;
use crate::error::classify;
use crate::images::UnsplashClient;
use crate::models::{CtaRow, CtaSpec, GenerationRequest, SeoMetadata, StoredArticle, User};
use crate::pipeline::{self, PipelineDeps};
use crate::publish::{self, PostStatus, Publisher, WordPressClient};
use crate::research::PerplexityClient;
use crate::store;
use crate::stream::{CompletePayload, FrameStream, ProgressSink};
use crate::sweep;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub sweep_secret: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/articles", get(list_articles_handler).post(save_article_handler))
        .route(
            "/api/articles/{id}",
            get(get_article_handler).delete(delete_article_handler),
        )
        .route("/api/articles/{id}/publish", post(publish_article_handler))
        .route("/api/ctas", get(list_ctas_handler).post(create_cta_handler))
        .route("/api/ctas/{id}", delete(delete_cta_handler))
        .route("/api/sweep", post(sweep_handler))
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction())
        .layer(sentry_tower::NewSentryLayer::<axum::extract::Request>::new_from_top())
        .with_state(state)
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Constant-time string comparison to prevent timing attacks on token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(json_error(StatusCode::UNAUTHORIZED, "authorization required"));
    };
    match store::get_user_by_token(&state.pool, token).await {
        Ok(Some(user)) if constant_time_eq(&user.api_token, token) => Ok(user),
        Ok(_) => Err(json_error(StatusCode::UNAUTHORIZED, "invalid token")),
        Err(e) => {
            warn!(error = %e, "user lookup failed");
            Err(json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
        }
    }
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

// ── Generation ─────────────────────────────────────────────────────────

async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerationRequest>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    if request.topic.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "topic is required");
    }

    let secrets = match store::get_user_secrets(&state.pool, &user.id).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "secret lookup failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let credentials = RunCredentials::resolve(&secrets, &state.config.providers);
    let perplexity_key = credentials.get("perplexity").cloned();
    let unsplash_key = credentials.get("unsplash").cloned();
    let timeout = state.config.request_timeout();

    let chat = match HttpChatClient::new(credentials, timeout) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build chat client");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let research = match PerplexityClient::new(perplexity_key, timeout) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build research client");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let images = match UnsplashClient::new(unsplash_key, timeout) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build image client");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    // A missing WordPress connection only matters if the run asks to publish.
    let publisher = match store::get_wordpress_connection(&state.pool, &user.id).await {
        Ok(Some(conn)) => {
            match WordPressClient::new(&conn.site_url, &conn.username, &conn.app_password, timeout) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "failed to build wordpress client");
                    None
                }
            }
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "wordpress connection lookup failed");
            None
        }
    };

    let (sink, rx) = ProgressSink::new();
    let pool = state.pool.clone();
    let generation = state.config.generation.clone();
    info!(user = %user.name, topic = %request.topic, "generation run accepted");

    tokio::spawn(async move {
        let deps = PipelineDeps {
            chat: &chat,
            research: &research,
            images: &images,
            publisher: publisher.as_ref().map(|p| p as &dyn Publisher),
        };
        match pipeline::run_generation(&deps, &generation, &request, &sink).await {
            Ok(payload) => {
                if let Err(e) = save_generated_article(&pool, &user.id, &request.topic, &payload).await {
                    warn!(error = %e, "failed to save generated article");
                }
                sink.complete(payload);
            }
            Err(err) => {
                error!(error = %err, topic = %request.topic, "generation run failed");
                sink.error(classify(&err));
            }
        }
    });

    Sse::new(FrameStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Persist a finished run so it survives the client going away.
async fn save_generated_article(
    pool: &SqlitePool,
    user_id: &str,
    topic: &str,
    payload: &CompletePayload,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let title = if payload.seo_metadata.meta_title.is_empty() {
        topic.to_string()
    } else {
        payload.seo_metadata.meta_title.clone()
    };
    let article = StoredArticle {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        topic: topic.to_string(),
        title,
        content_html: payload.article_content.clone(),
        word_count: payload.word_count as i64,
        status: "draft".to_string(),
        scheduled_at: None,
        published_at: None,
        wordpress_post_id: payload.post_id,
        wordpress_edit_url: payload.edit_url.clone(),
        meta_title: payload.seo_metadata.meta_title.clone(),
        meta_description: payload.seo_metadata.meta_description.clone(),
        slug: payload.seo_metadata.slug.clone(),
        keywords: serde_json::to_string(&payload.seo_metadata.keywords)?,
        seo_score: payload.seo_score as i64,
        created_at: now,
        updated_at: now,
    };
    store::insert_article(pool, &article).await?;
    info!(article_id = %article.id, "generated article saved");
    Ok(())
}

// ── Articles ───────────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ArticleSummary {
    id: String,
    topic: String,
    title: String,
    status: String,
    word_count: i64,
    seo_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    wordpress_post_id: Option<i64>,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
}

impl From<&StoredArticle> for ArticleSummary {
    fn from(article: &StoredArticle) -> Self {
        Self {
            id: article.id.clone(),
            topic: article.topic.clone(),
            title: article.title.clone(),
            status: article.status.clone(),
            word_count: article.word_count,
            seo_score: article.seo_score,
            wordpress_post_id: article.wordpress_post_id,
            created_at: article.created_at,
            scheduled_at: article.scheduled_at,
            published_at: article.published_at,
        }
    }
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct ArticleDetail {
    id: String,
    topic: String,
    title: String,
    content_html: String,
    word_count: i64,
    status: String,
    seo: SeoMetadata,
    seo_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    wordpress_post_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wordpress_edit_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StoredArticle> for ArticleDetail {
    fn from(article: StoredArticle) -> Self {
        let seo = article.seo_metadata();
        Self {
            id: article.id,
            topic: article.topic,
            title: article.title,
            content_html: article.content_html,
            word_count: article.word_count,
            status: article.status,
            seo,
            seo_score: article.seo_score,
            wordpress_post_id: article.wordpress_post_id,
            wordpress_edit_url: article.wordpress_edit_url,
            scheduled_at: article.scheduled_at,
            published_at: article.published_at,
            created_at: article.created_at,
            updated_at: article.updated_at,
        }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveArticleRequest {
    topic: String,
    #[serde(default)]
    title: Option<String>,
    content_html: String,
    #[serde(default)]
    word_count: u32,
    #[serde(default)]
    seo_metadata: SeoMetadata,
    #[serde(default)]
    seo_score: u8,
}

async fn list_articles_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    match store::list_articles(&state.pool, &user.id).await {
        Ok(articles) => {
            let summaries: Vec<ArticleSummary> = articles.iter().map(ArticleSummary::from).collect();
            Json(summaries).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to list articles");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn save_article_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveArticleRequest>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    if body.topic.trim().is_empty() || body.content_html.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "topic and contentHtml are required");
    }

    let now = Utc::now();
    let title = body
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| body.topic.clone());
    let article = StoredArticle {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        topic: body.topic,
        title,
        content_html: body.content_html,
        word_count: body.word_count as i64,
        status: "draft".to_string(),
        scheduled_at: None,
        published_at: None,
        wordpress_post_id: None,
        wordpress_edit_url: None,
        meta_title: body.seo_metadata.meta_title,
        meta_description: body.seo_metadata.meta_description,
        slug: body.seo_metadata.slug,
        keywords: serde_json::to_string(&body.seo_metadata.keywords).unwrap_or_else(|_| "[]".to_string()),
        seo_score: body.seo_score as i64,
        created_at: now,
        updated_at: now,
    };

    match store::insert_article(&state.pool, &article).await {
        Ok(()) => (StatusCode::CREATED, Json(ArticleSummary::from(&article))).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to save article");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn get_article_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    match store::get_article(&state.pool, &user.id, &id).await {
        Ok(Some(article)) => Json(ArticleDetail::from(article)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "article not found"),
        Err(e) => {
            warn!(error = %e, "failed to load article");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn delete_article_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    match store::delete_article(&state.pool, &user.id, &id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "article not found"),
        Err(e) => {
            warn!(error = %e, "failed to delete article");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Publishing ─────────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    #[serde(default)]
    publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    post_id: i64,
    edit_url: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
}

async fn publish_article_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    let article = match store::get_article(&state.pool, &user.id, &id).await {
        Ok(Some(a)) => a,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "article not found"),
        Err(e) => {
            warn!(error = %e, "failed to load article");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let connection = match store::get_wordpress_connection(&state.pool, &user.id).await {
        Ok(Some(c)) => c,
        Ok(None) => return json_error(StatusCode::BAD_REQUEST, "no wordpress connection configured"),
        Err(e) => {
            warn!(error = %e, "wordpress connection lookup failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let client = match WordPressClient::new(
        &connection.site_url,
        &connection.username,
        &connection.app_password,
        state.config.request_timeout(),
    ) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build wordpress client");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let now = Utc::now();
    let scheduled = body.publish_at.filter(|at| *at > now);
    let (status, wp_date) = match scheduled {
        Some(at) => (PostStatus::Future, Some(at)),
        None => (PostStatus::Publish, None),
    };

    let post = match publish::publish_article(
        &client,
        article.wordpress_post_id,
        &article.topic,
        &article.content_html,
        &article.seo_metadata(),
        status,
        wp_date,
        None,
    )
    .await
    {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, article_id = %id, "wordpress publish failed");
            return json_error(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    let persist = async {
        if let Some(at) = scheduled {
            store::update_article_publish_state(&state.pool, &article.id, post.post_id, &post.edit_url, "scheduled", None)
                .await?;
            store::update_article_schedule(&state.pool, &user.id, &article.id, at).await?;
        } else {
            store::update_article_publish_state(
                &state.pool,
                &article.id,
                post.post_id,
                &post.edit_url,
                "published",
                Some(now),
            )
            .await?;
        }
        anyhow::Ok(())
    };
    if let Err(e) = persist.await {
        error!(error = %e, article_id = %id, "publish succeeded but state update failed");
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    }

    info!(article_id = %id, post_id = post.post_id, scheduled = scheduled.is_some(), "article published");
    Json(PublishResponse {
        post_id: post.post_id,
        edit_url: post.edit_url,
        status: if scheduled.is_some() { "scheduled" } else { "published" }.to_string(),
        scheduled_at: scheduled,
        published_at: scheduled.is_none().then_some(now),
    })
    .into_response()
}

// ── CTA templates ──────────────────────────────────────────────────────

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CtaResponse {
    id: String,
    #[serde(flatten)]
    spec: CtaSpec,
    created_at: DateTime<Utc>,
}

async fn list_ctas_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    match store::list_ctas(&state.pool, &user.id).await {
        Ok(rows) => {
            let ctas: Vec<CtaResponse> = rows
                .iter()
                .map(|row| CtaResponse {
                    id: row.id.clone(),
                    spec: row.to_spec(),
                    created_at: row.created_at,
                })
                .collect();
            Json(ctas).into_response()
        }
        Err(e) => {
            warn!(error = %e, "failed to list ctas");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn create_cta_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<CtaSpec>,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    if spec.title.trim().is_empty() || spec.button_url.trim().is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "title and buttonUrl are required");
    }

    let row = CtaRow {
        id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        title: spec.title.clone(),
        description: spec.description.clone(),
        button_text: spec.button_text.clone(),
        button_url: spec.button_url.clone(),
        image_url: spec.image_url.clone(),
        position: spec.position.as_str().to_string(),
        section_number: spec.section_number.map(i64::from),
        style: spec.style.as_str().to_string(),
        colors: spec.colors.as_ref().and_then(|c| serde_json::to_string(c).ok()),
        created_at: Utc::now(),
    };

    match store::insert_cta(&state.pool, &row).await {
        Ok(()) => (
            StatusCode::CREATED,
            Json(CtaResponse {
                id: row.id,
                spec,
                created_at: row.created_at,
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to save cta");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn delete_cta_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&state, &headers).await {
        Ok(u) => u,
        Err(r) => return r,
    };
    match store::delete_cta(&state.pool, &user.id, &id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "cta not found"),
        Err(e) => {
            warn!(error = %e, "failed to delete cta");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Sweep ──────────────────────────────────────────────────────────────

async fn sweep_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return json_error(StatusCode::UNAUTHORIZED, "authorization required");
    };
    if !constant_time_eq(token, &state.sweep_secret) {
        return json_error(StatusCode::UNAUTHORIZED, "invalid sweep secret");
    }

    match sweep::run_sweep(&state.pool, &state.config, Utc::now()).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            error!(error = %e, "sweep failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

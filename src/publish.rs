use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use futures_core::future::BoxFuture;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::models::SeoMetadata;
use crate::seo::slugify;

const MAX_ERROR_BODY_CHARS: usize = 600;
const MAX_TAGS: usize = 5;

lazy_static! {
    static ref LEAD_WRAPPER_RE: Regex =
        Regex::new(r"(?is)^\s*<article[^>]*>\s*(<header[^>]*>.*?</header>\s*)?(<div[^>]*>)?")
            .unwrap();
    static ref TRAIL_WRAPPER_RE: Regex = Regex::new(r"(?is)(</div>\s*)?</article>\s*$").unwrap();
    static ref LONE_H1_RE: Regex = Regex::new(r"(?is)^\s*<h1[^>]*>.*?</h1>\s*").unwrap();
    static ref IMG_SRC_RE: Regex = Regex::new(r#"(?i)<img[^>]+src="([^"]+)""#).unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Draft,
    Publish,
    Future,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Publish => "publish",
            PostStatus::Future => "future",
        }
    }
}

/// Everything needed to create a post. Categories and tags are derived from
/// the SEO keywords: first keyword becomes the category, the rest become tags.
#[derive(Debug, Clone)]
pub struct PostDraft {
    pub title: String,
    pub content_html: String,
    pub seo: SeoMetadata,
    pub status: PostStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub featured_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPost {
    pub post_id: i64,
    pub edit_url: String,
}

pub trait Publisher: Send + Sync {
    fn create_post<'a>(
        &'a self,
        draft: &'a PostDraft,
    ) -> BoxFuture<'a, Result<PublishedPost, PublishError>>;

    fn update_status<'a>(
        &'a self,
        post_id: i64,
        status: PostStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(), PublishError>>;

    fn edit_url(&self, post_id: i64) -> String;
}

/// Create-or-update entry point. An article that already carries a remote post
/// id only gets its status moved; republishing never creates a duplicate.
pub async fn publish_article(
    publisher: &dyn Publisher,
    existing_post_id: Option<i64>,
    topic: &str,
    content_html: &str,
    seo: &SeoMetadata,
    status: PostStatus,
    scheduled_at: Option<DateTime<Utc>>,
    featured_image_url: Option<String>,
) -> Result<PublishedPost, PublishError> {
    if let Some(post_id) = existing_post_id {
        publisher.update_status(post_id, status, scheduled_at).await?;
        return Ok(PublishedPost {
            post_id,
            edit_url: publisher.edit_url(post_id),
        });
    }

    let title = if seo.meta_title.trim().is_empty() {
        topic.to_string()
    } else {
        seo.meta_title.clone()
    };
    let draft = PostDraft {
        title,
        content_html: content_html.to_string(),
        seo: seo.clone(),
        status,
        scheduled_at,
        featured_image_url,
    };
    publisher.create_post(&draft).await
}

pub struct WordPressClient {
    http: reqwest::Client,
    site_url: String,
    auth: String,
}

impl WordPressClient {
    pub fn new(
        site_url: &str,
        username: &str,
        app_password: &str,
        timeout: Duration,
    ) -> Result<Self, PublishError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plume/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let credentials = BASE64.encode(format!("{username}:{app_password}"));
        Ok(Self {
            http,
            site_url: site_url.trim_end_matches('/').to_string(),
            auth: format!("Basic {credentials}"),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/wp-json{path}", self.site_url)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<(u16, Value), PublishError> {
        let response = self
            .http
            .post(self.api_url(path))
            .header("Authorization", &self.auth)
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<(u16, Value), PublishError> {
        let response = self
            .http
            .get(self.api_url(path))
            .header("Authorization", &self.auth)
            .query(query)
            .send()
            .await?;
        let status = response.status().as_u16();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok((status, value))
    }

    /// Core post creation: only the fields any author role may set. Everything
    /// else (terms, featured image, SEO meta) is attached best-effort after.
    async fn create_minimal_post(&self, draft: &PostDraft) -> Result<i64, PublishError> {
        let content = strip_title_wrapper(&draft.content_html);
        let mut body = json!({
            "title": draft.title,
            "content": content,
            "status": draft.status.as_str(),
            "slug": draft.seo.slug,
            "excerpt": draft.seo.meta_description,
        });
        if draft.status == PostStatus::Future
            && let Some(at) = draft.scheduled_at
        {
            body["date_gmt"] = json!(at.format("%Y-%m-%dT%H:%M:%S").to_string());
        }

        let (status, value) = self.post_json("/wp/v2/posts", &body).await?;
        if !(200..300).contains(&status) {
            return Err(api_error(status, &value));
        }
        value
            .pointer("/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PublishError::Api {
                status,
                body: "create response missing post id".to_string(),
            })
    }

    /// Search-then-create term resolution for one taxonomy.
    async fn ensure_term(&self, taxonomy: &str, name: &str) -> Result<i64, PublishError> {
        let path = format!("/wp/v2/{taxonomy}");
        let (status, value) = self.get_json(&path, &[("search", name)]).await?;
        if (200..300).contains(&status)
            && let Some(id) = value.pointer("/0/id").and_then(Value::as_i64)
        {
            return Ok(id);
        }

        let (status, value) = self
            .post_json(&path, &json!({"name": name, "slug": slugify(name)}))
            .await?;
        if !(200..300).contains(&status) {
            return Err(api_error(status, &value));
        }
        value
            .pointer("/id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PublishError::Api {
                status,
                body: format!("{taxonomy} create response missing id"),
            })
    }

    async fn attach_terms(&self, post_id: i64, seo: &SeoMetadata) -> Result<(), PublishError> {
        let mut keywords = seo.keywords.iter().filter(|k| !k.trim().is_empty());
        let Some(first) = keywords.next() else {
            return Ok(());
        };

        let category = self.ensure_term("categories", first).await?;
        let mut tags = Vec::new();
        for keyword in keywords.take(MAX_TAGS) {
            match self.ensure_term("tags", keyword).await {
                Ok(id) => tags.push(id),
                Err(e) => warn!(tag = %keyword, error = %e, "tag resolution failed"),
            }
        }

        let path = format!("/wp/v2/posts/{post_id}");
        let (status, value) = self
            .post_json(&path, &json!({"categories": [category], "tags": tags}))
            .await?;
        if !(200..300).contains(&status) {
            return Err(api_error(status, &value));
        }
        Ok(())
    }

    async fn attach_featured_image(
        &self,
        post_id: i64,
        draft: &PostDraft,
    ) -> Result<(), PublishError> {
        let image_url = draft
            .featured_image_url
            .clone()
            .or_else(|| first_image_src(&draft.content_html));
        let Some(image_url) = image_url else {
            return Ok(());
        };

        let response = self.http.get(&image_url).send().await?;
        if !response.status().is_success() {
            return Err(PublishError::Api {
                status: response.status().as_u16(),
                body: "image download failed".to_string(),
            });
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let bytes = response.bytes().await?;
        let filename = filename_for(&image_url);

        let response = self
            .http
            .post(self.api_url("/wp/v2/media"))
            .header("Authorization", &self.auth)
            .header(
                "Content-Disposition",
                format!("attachment; filename=\"{filename}\""),
            )
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;
        let status = response.status().as_u16();
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        if !(200..300).contains(&status) {
            return Err(api_error(status, &value));
        }
        let Some(media_id) = value.pointer("/id").and_then(Value::as_i64) else {
            return Err(PublishError::Api {
                status,
                body: "media upload response missing id".to_string(),
            });
        };

        let alt_path = format!("/wp/v2/media/{media_id}");
        if let Err(e) = self
            .post_json(&alt_path, &json!({"alt_text": draft.title}))
            .await
        {
            warn!(media_id, error = %e, "setting media alt text failed");
        }

        let post_path = format!("/wp/v2/posts/{post_id}");
        let (status, value) = self
            .post_json(&post_path, &json!({"featured_media": media_id}))
            .await?;
        if !(200..300).contains(&status) {
            return Err(api_error(status, &value));
        }
        Ok(())
    }

    /// Three ways to hand Yoast its fields; the first 2xx wins.
    async fn attach_seo_meta(&self, post_id: i64, seo: &SeoMetadata) -> Result<(), PublishError> {
        let focus_keyword = seo.keywords.first().cloned().unwrap_or_default();
        let fields = json!({
            "_yoast_wpseo_title": seo.meta_title,
            "_yoast_wpseo_metadesc": seo.meta_description,
            "_yoast_wpseo_focuskw": focus_keyword,
        });

        let post_path = format!("/wp/v2/posts/{post_id}");
        let (status, _) = self.post_json(&post_path, &json!({"meta": fields})).await?;
        if (200..300).contains(&status) {
            return Ok(());
        }

        let plugin_path = format!("/yoast/v1/meta/{post_id}");
        let (status, _) = self.post_json(&plugin_path, &fields).await?;
        if (200..300).contains(&status) {
            return Ok(());
        }

        let meta_path = format!("/wp/v2/posts/{post_id}/meta");
        let mut last_status = status;
        let mut any_ok = false;
        for (key, value) in [
            ("_yoast_wpseo_title", &seo.meta_title),
            ("_yoast_wpseo_metadesc", &seo.meta_description),
            ("_yoast_wpseo_focuskw", &focus_keyword),
        ] {
            let (status, _) = self
                .post_json(&meta_path, &json!({"key": key, "value": value}))
                .await?;
            last_status = status;
            any_ok |= (200..300).contains(&status);
        }
        if any_ok {
            return Ok(());
        }
        Err(PublishError::Api {
            status: last_status,
            body: "no seo meta endpoint accepted the fields".to_string(),
        })
    }
}

impl Publisher for WordPressClient {
    fn create_post<'a>(
        &'a self,
        draft: &'a PostDraft,
    ) -> BoxFuture<'a, Result<PublishedPost, PublishError>> {
        Box::pin(async move {
            let post_id = self.create_minimal_post(draft).await?;
            info!(post_id, status = draft.status.as_str(), "wordpress post created");

            if let Err(e) = self.attach_terms(post_id, &draft.seo).await {
                warn!(post_id, error = %e, "attaching categories/tags failed");
            }
            if let Err(e) = self.attach_featured_image(post_id, draft).await {
                warn!(post_id, error = %e, "attaching featured image failed");
            }
            match self.attach_seo_meta(post_id, &draft.seo).await {
                Ok(()) => debug!(post_id, "seo meta attached"),
                Err(e) => warn!(post_id, error = %e, "attaching seo meta failed"),
            }

            Ok(PublishedPost {
                post_id,
                edit_url: self.edit_url(post_id),
            })
        })
    }

    fn update_status<'a>(
        &'a self,
        post_id: i64,
        status: PostStatus,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            let mut body = json!({"status": status.as_str()});
            if status == PostStatus::Future
                && let Some(at) = scheduled_at
            {
                body["date_gmt"] = json!(at.format("%Y-%m-%dT%H:%M:%S").to_string());
            }

            let path = format!("/wp/v2/posts/{post_id}");
            let (code, value) = self.post_json(&path, &body).await?;
            if !(200..300).contains(&code) {
                return Err(api_error(code, &value));
            }
            info!(post_id, status = status.as_str(), "wordpress post status updated");
            Ok(())
        })
    }

    fn edit_url(&self, post_id: i64) -> String {
        format!("{}/wp-admin/post.php?post={post_id}&action=edit", self.site_url)
    }
}

fn api_error(status: u16, value: &Value) -> PublishError {
    let body = value
        .pointer("/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string());
    PublishError::Api {
        status,
        body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Themes render the post title themselves; a leading h1 in the content would
/// show it twice.
fn strip_title_wrapper(html: &str) -> String {
    let stripped = LEAD_WRAPPER_RE.replace(html, "");
    let stripped = TRAIL_WRAPPER_RE.replace(&stripped, "");
    let stripped = LONE_H1_RE.replace(&stripped, "");
    stripped.trim().to_string()
}

fn first_image_src(html: &str) -> Option<String> {
    IMG_SRC_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn filename_for(url: &str) -> String {
    let candidate = url
        .split('/')
        .next_back()
        .unwrap_or_default()
        .split('?')
        .next()
        .unwrap_or_default();
    let valid = !candidate.is_empty()
        && candidate.len() <= 100
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid && candidate.contains('.') {
        return candidate.to_string();
    }
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("featured-{hex}.jpg")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePublisher {
        created: Mutex<Vec<PostDraft>>,
        updated: Mutex<Vec<(i64, &'static str)>>,
    }

    impl Publisher for FakePublisher {
        fn create_post<'a>(
            &'a self,
            draft: &'a PostDraft,
        ) -> BoxFuture<'a, Result<PublishedPost, PublishError>> {
            self.created.lock().unwrap().push(draft.clone());
            Box::pin(async move {
                Ok(PublishedPost {
                    post_id: 7,
                    edit_url: self.edit_url(7),
                })
            })
        }

        fn update_status<'a>(
            &'a self,
            post_id: i64,
            status: PostStatus,
            _scheduled_at: Option<DateTime<Utc>>,
        ) -> BoxFuture<'a, Result<(), PublishError>> {
            self.updated.lock().unwrap().push((post_id, status.as_str()));
            Box::pin(async move { Ok(()) })
        }

        fn edit_url(&self, post_id: i64) -> String {
            format!("https://wp.example/wp-admin/post.php?post={post_id}&action=edit")
        }
    }

    fn seo() -> SeoMetadata {
        SeoMetadata {
            meta_title: "A Fine Meta Title".to_string(),
            meta_description: "desc".to_string(),
            slug: "a-fine-slug".to_string(),
            keywords: vec!["gardening".to_string(), "soil".to_string()],
        }
    }

    #[tokio::test]
    async fn fresh_article_takes_the_create_path() {
        let publisher = FakePublisher::default();
        let post = publish_article(
            &publisher,
            None,
            "Gardening",
            "<p>content</p>",
            &seo(),
            PostStatus::Draft,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(post.post_id, 7);
        assert_eq!(publisher.created.lock().unwrap().len(), 1);
        assert!(publisher.updated.lock().unwrap().is_empty());
        assert_eq!(
            publisher.created.lock().unwrap()[0].title,
            "A Fine Meta Title"
        );
    }

    #[tokio::test]
    async fn existing_post_id_takes_the_update_path_and_keeps_the_id() {
        let publisher = FakePublisher::default();
        let post = publish_article(
            &publisher,
            Some(42),
            "Gardening",
            "<p>content</p>",
            &seo(),
            PostStatus::Publish,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(post.post_id, 42);
        assert!(publisher.created.lock().unwrap().is_empty());
        assert_eq!(*publisher.updated.lock().unwrap(), vec![(42, "publish")]);
    }

    #[tokio::test]
    async fn republishing_twice_never_creates_a_duplicate() {
        let publisher = FakePublisher::default();
        for _ in 0..2 {
            publish_article(
                &publisher,
                Some(42),
                "Gardening",
                "<p>content</p>",
                &seo(),
                PostStatus::Publish,
                None,
                None,
            )
            .await
            .unwrap();
        }
        assert!(publisher.created.lock().unwrap().is_empty());
        assert_eq!(publisher.updated.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_meta_title_falls_back_to_topic() {
        let publisher = FakePublisher::default();
        let mut bare = seo();
        bare.meta_title = String::new();
        publish_article(
            &publisher,
            None,
            "Gardening for Beginners",
            "<p>x</p>",
            &bare,
            PostStatus::Draft,
            None,
            None,
        )
        .await
        .unwrap();

        assert_eq!(
            publisher.created.lock().unwrap()[0].title,
            "Gardening for Beginners"
        );
    }

    #[test]
    fn wrapper_and_leading_h1_are_stripped() {
        let wrapped = "<article>\n  <header>\n    <h1>Title</h1>\n  </header>\n  <div class=\"article-content\">\n<p>intro</p>\n<h2>Section</h2>\n  </div>\n</article>";
        let stripped = strip_title_wrapper(wrapped);
        assert!(stripped.starts_with("<p>intro</p>"));
        assert!(stripped.ends_with("<h2>Section</h2>"));
        assert!(!stripped.contains("<h1"));
        assert!(!stripped.contains("<article"));

        let bare_h1 = "<h1>Loud Title</h1><p>body</p>";
        assert_eq!(strip_title_wrapper(bare_h1), "<p>body</p>");

        let plain = "<p>already plain</p>";
        assert_eq!(strip_title_wrapper(plain), plain);
    }

    #[test]
    fn first_image_src_finds_the_first_img() {
        let html = r#"<p>a</p><img src="https://img.example/1.jpg" /><img src="https://img.example/2.jpg" />"#;
        assert_eq!(
            first_image_src(html),
            Some("https://img.example/1.jpg".to_string())
        );
        assert_eq!(first_image_src("<p>none</p>"), None);
    }

    #[test]
    fn filenames_come_from_the_url_or_a_digest() {
        assert_eq!(
            filename_for("https://img.example/photos/sunset.jpg?w=1080"),
            "sunset.jpg"
        );
        let hashed = filename_for("https://img.example/weird path/%20");
        assert!(hashed.starts_with("featured-"));
        assert!(hashed.ends_with(".jpg"));
    }

    #[test]
    fn edit_urls_point_at_the_admin_editor() {
        let publisher = FakePublisher::default();
        assert_eq!(
            publisher.edit_url(9),
            "https://wp.example/wp-admin/post.php?post=9&action=edit"
        );
    }
}

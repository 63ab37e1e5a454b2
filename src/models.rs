use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Per-call generation knobs, resolved from the request and config defaults.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub reasoning_effort: Option<String>,
    pub verbosity: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.total += other.total;
    }
}

/// Normalized output of a single chat completion, regardless of backend.
#[derive(Debug, Clone)]
pub struct ChatOutput {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Shallow,
    Moderate,
    Deep,
}

impl Default for ResearchDepth {
    fn default() -> Self {
        ResearchDepth::Moderate
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub content: String,
    pub url: String,
    pub relevance_score: f64,
}

/// Everything the research stage hands downstream. An empty bundle (no results,
/// zero usage) means research was skipped or degraded — never an error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchBundle {
    pub topic: String,
    pub model: String,
    pub queries: Vec<String>,
    pub results: Vec<SearchResult>,
    pub usage: TokenUsage,
}

impl ResearchBundle {
    pub fn empty(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            model: String::new(),
            queries: Vec::new(),
            results: Vec::new(),
            usage: TokenUsage::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outline {
    pub title: String,
    pub introduction: OutlineIntro,
    pub sections: Vec<OutlineSection>,
    pub conclusion: OutlineConclusion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineIntro {
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub tone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineSection {
    pub title: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default = "default_section_words")]
    pub estimated_word_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsections: Option<Vec<String>>,
}

fn default_section_words() -> u32 {
    300
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineConclusion {
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub call_to_action: Option<String>,
}

/// Assembled article: full HTML fragment plus derived metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleContent {
    pub html: String,
    pub word_count: u32,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeoMetadata {
    #[serde(default)]
    pub meta_title: String,
    #[serde(default)]
    pub meta_description: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeoReport {
    pub score: u8,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub id: String,
    pub url: String,
    pub alt: String,
    pub author: Option<String>,
    pub author_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedImage {
    pub section_index: usize,
    pub section_title: String,
    pub search_term: String,
    pub image: ImageAsset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CtaPosition {
    AfterIntro,
    AfterSection,
    Middle,
    BeforeConclusion,
    End,
}

impl CtaPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtaPosition::AfterIntro => "after-intro",
            CtaPosition::AfterSection => "after-section",
            CtaPosition::Middle => "middle",
            CtaPosition::BeforeConclusion => "before-conclusion",
            CtaPosition::End => "end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "after-intro" => Some(CtaPosition::AfterIntro),
            "after-section" => Some(CtaPosition::AfterSection),
            "middle" => Some(CtaPosition::Middle),
            "before-conclusion" => Some(CtaPosition::BeforeConclusion),
            "end" => Some(CtaPosition::End),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtaStyle {
    Default,
    Bordered,
    Gradient,
    Minimal,
    Custom,
}

impl Default for CtaStyle {
    fn default() -> Self {
        CtaStyle::Default
    }
}

impl CtaStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            CtaStyle::Default => "default",
            CtaStyle::Bordered => "bordered",
            CtaStyle::Gradient => "gradient",
            CtaStyle::Minimal => "minimal",
            CtaStyle::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(CtaStyle::Default),
            "bordered" => Some(CtaStyle::Bordered),
            "gradient" => Some(CtaStyle::Gradient),
            "minimal" => Some(CtaStyle::Minimal),
            "custom" => Some(CtaStyle::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtaColors {
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub button: Option<String>,
    #[serde(default)]
    pub button_text: Option<String>,
}

/// A CTA block to inject into the article, either sent inline with the
/// generation request or loaded from the user's saved CTAs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtaSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub button_text: String,
    pub button_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub position: CtaPosition,
    #[serde(default)]
    pub section_number: Option<u32>,
    #[serde(default)]
    pub style: CtaStyle,
    #[serde(default)]
    pub colors: Option<CtaColors>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub topic: String,
    #[serde(default = "default_use_research")]
    pub use_research: bool,
    #[serde(default)]
    pub research_depth: ResearchDepth,
    #[serde(default)]
    pub number_of_images: u32,
    #[serde(default)]
    pub publish_to_wordpress: bool,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub verbosity: Option<String>,
    #[serde(default)]
    pub extra_context: Option<String>,
    #[serde(default)]
    pub ctas: Vec<CtaSpec>,
}

fn default_use_research() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArticleStatus {
    Draft,
    Scheduled,
    Published,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "draft",
            ArticleStatus::Scheduled => "scheduled",
            ArticleStatus::Published => "published",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(ArticleStatus::Draft),
            "scheduled" => Some(ArticleStatus::Scheduled),
            "published" => Some(ArticleStatus::Published),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserSecret {
    pub provider: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WordpressConnection {
    pub user_id: String,
    pub site_url: String,
    pub username: String,
    pub app_password: String,
}

/// Read model for articles. `keywords` is a JSON array stored as TEXT.
#[derive(Debug, Clone, FromRow)]
pub struct StoredArticle {
    pub id: String,
    pub user_id: String,
    pub topic: String,
    pub title: String,
    pub content_html: String,
    pub word_count: i64,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub wordpress_post_id: Option<i64>,
    pub wordpress_edit_url: Option<String>,
    pub meta_title: String,
    pub meta_description: String,
    pub slug: String,
    pub keywords: String,
    pub seo_score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredArticle {
    pub fn seo_metadata(&self) -> SeoMetadata {
        SeoMetadata {
            meta_title: self.meta_title.clone(),
            meta_description: self.meta_description.clone(),
            slug: self.slug.clone(),
            keywords: serde_json::from_str(&self.keywords).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CtaRow {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub button_text: String,
    pub button_url: String,
    pub image_url: Option<String>,
    pub position: String,
    pub section_number: Option<i64>,
    pub style: String,
    pub colors: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CtaRow {
    /// Unknown stored positions or styles fall back to end/default rather
    /// than failing the whole request.
    pub fn to_spec(&self) -> CtaSpec {
        CtaSpec {
            title: self.title.clone(),
            description: self.description.clone(),
            button_text: self.button_text.clone(),
            button_url: self.button_url.clone(),
            image_url: self.image_url.clone(),
            position: CtaPosition::parse(&self.position).unwrap_or(CtaPosition::End),
            section_number: self.section_number.map(|n| n.max(0) as u32),
            style: CtaStyle::parse(&self.style).unwrap_or_default(),
            colors: self
                .colors
                .as_deref()
                .and_then(|c| serde_json::from_str(c).ok()),
        }
    }
}

use std::collections::HashMap;
use std::time::Duration;

use futures_core::future::BoxFuture;
use lazy_static::lazy_static;
use rand::seq::SliceRandom;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::chat::{self, ChatApi};
use crate::credentials::ProviderKey;
use crate::error::ProviderError;
use crate::models::{ChatMessage, GenerateOptions, ImageAsset, Outline, PlacedImage};

const UNSPLASH_BASE: &str = "https://api.unsplash.com";

/// Hard cap on images per article.
const MAX_IMAGES: u32 = 5;
/// Last-resort search term when both the model and the heuristic come up empty.
const GENERIC_SEARCH_TERM: &str = "business";

lazy_static! {
    static ref H2_RE: Regex = Regex::new(r"(?is)<h2[^>]*>.*?</h2>").unwrap();
}

const STOPWORDS: [&str; 49] = [
    "the", "a", "an", "and", "or", "but", "of", "for", "to", "in", "on", "at", "with", "by",
    "from", "about", "as", "is", "are", "was", "were", "be", "been", "it", "its", "this", "that",
    "these", "those", "your", "you", "our", "how", "what", "why", "when", "where", "which", "who",
    "will", "can", "should", "into", "over", "more", "most", "other", "some", "such",
];

const TERM_SYSTEM: &str = "You pick short, concrete stock-photo search terms. Reply with the \
     term only: no punctuation, no quotes, no explanations.";

pub trait ImageApi: Send + Sync {
    /// Returns the top result for `term` on the given 1-based result page,
    /// or None when the provider has nothing for that term.
    fn search<'a>(
        &'a self,
        term: &'a str,
        page: u32,
    ) -> BoxFuture<'a, Result<Option<ImageAsset>, ProviderError>>;
}

pub struct UnsplashClient {
    http: reqwest::Client,
    key: Option<ProviderKey>,
}

impl UnsplashClient {
    pub fn new(key: Option<ProviderKey>, timeout: Duration) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plume/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Http {
                provider: "unsplash".to_string(),
                source: e,
            })?;
        Ok(Self { http, key })
    }

    fn base_url(&self) -> &str {
        self.key
            .as_ref()
            .and_then(|k| k.base_url.as_deref())
            .unwrap_or(UNSPLASH_BASE)
    }
}

impl ImageApi for UnsplashClient {
    fn search<'a>(
        &'a self,
        term: &'a str,
        page: u32,
    ) -> BoxFuture<'a, Result<Option<ImageAsset>, ProviderError>> {
        Box::pin(async move {
            // No key configured means the image stage is a no-op, not an error.
            let Some(key) = &self.key else {
                return Ok(None);
            };

            let url = format!("{}/search/photos", self.base_url());
            let response = self
                .http
                .get(&url)
                .header("Authorization", format!("Client-ID {}", key.api_key))
                .query(&[
                    ("query", term),
                    ("page", &page.to_string()),
                    ("per_page", "1"),
                    ("orientation", "landscape"),
                ])
                .send()
                .await
                .map_err(|e| chat::http_error("unsplash", e))?;

            let body: Value = chat::read_json("unsplash", response).await?;
            let Some(hit) = body.pointer("/results/0") else {
                return Ok(None);
            };

            let id = hit
                .pointer("/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let Some(image_url) = hit.pointer("/urls/regular").and_then(Value::as_str) else {
                return Ok(None);
            };
            let alt = hit
                .pointer("/alt_description")
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(term)
                .to_string();
            let author = hit
                .pointer("/user/name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let author_url = hit
                .pointer("/user/links/html")
                .and_then(Value::as_str)
                .map(str::to_string);

            Ok(Some(ImageAsset {
                id,
                url: image_url.to_string(),
                alt,
                author,
                author_url,
            }))
        })
    }
}

/// Picks a random subset of sections, finds one image per pick and splices it
/// in right after that section's heading. Everything in here is best-effort:
/// a failed term lookup falls back to a heuristic, a failed or empty image
/// search skips the section.
pub async fn place_images(
    chat: &dyn ChatApi,
    images: &dyn ImageApi,
    options: &GenerateOptions,
    outline: &Outline,
    html: &str,
    seo_description: &str,
    requested: u32,
) -> (String, Vec<PlacedImage>) {
    let count = requested.min(MAX_IMAGES) as usize;
    let section_count = outline.sections.len();
    let take = count.min(section_count);
    if take == 0 {
        return (html.to_string(), Vec::new());
    }

    let mut indices: Vec<usize> = (0..section_count).collect();
    indices.shuffle(&mut rand::rng());
    indices.truncate(take);
    indices.sort_unstable();

    let mut term_uses: HashMap<String, u32> = HashMap::new();
    let mut placed: Vec<PlacedImage> = Vec::new();

    for index in indices {
        let section = &outline.sections[index];
        let term = derive_term(chat, options, outline, index, seo_description).await;

        let uses = term_uses.entry(term.clone()).or_insert(0);
        *uses += 1;
        let page = *uses;

        match images.search(&term, page).await {
            Ok(Some(image)) => {
                debug!(section = %section.title, term = %term, page, "image found");
                placed.push(PlacedImage {
                    section_index: index,
                    section_title: section.title.clone(),
                    search_term: term,
                    image,
                });
            }
            Ok(None) => {
                debug!(section = %section.title, term = %term, "no image result, skipping");
            }
            Err(e) => {
                warn!(section = %section.title, term = %term, error = %e, "image search failed, skipping");
            }
        }
    }

    let html = splice_figures(html, &placed);
    (html, placed)
}

/// AI first, stopword heuristic second, fixed generic term last.
async fn derive_term(
    chat: &dyn ChatApi,
    options: &GenerateOptions,
    outline: &Outline,
    section_index: usize,
    seo_description: &str,
) -> String {
    let section = &outline.sections[section_index];

    let messages = term_messages(outline, section_index, seo_description);
    match chat.generate(&messages, options).await {
        Ok(output) => {
            let term = clean_term(&output.text);
            if !term.is_empty() {
                return term;
            }
        }
        Err(e) => {
            warn!(section = %section.title, error = %e, "term generation failed, using heuristic");
        }
    }

    let fallback = fallback_term(outline, section_index, seo_description);
    if fallback.is_empty() {
        GENERIC_SEARCH_TERM.to_string()
    } else {
        fallback
    }
}

fn term_messages(outline: &Outline, section_index: usize, seo_description: &str) -> Vec<ChatMessage> {
    let section = &outline.sections[section_index];
    let mut user = format!(
        "Suggest an image search term for a section of a blog article.\n\n\
         Article: {}\n\
         Section: {}\n",
        outline.title, section.title
    );
    if !section.key_points.is_empty() {
        user.push_str(&format!("Key points: {}\n", section.key_points.join("; ")));
    }
    if !seo_description.is_empty() {
        user.push_str(&format!("Article summary: {seo_description}\n"));
    }
    user.push_str(
        "\nRules:\n\
         - Reply with the term only, 1 to 3 words.\n\
         - Concrete nouns photograph well; avoid abstract words.\n\
         - English only; translate if the section is in another language.\n",
    );
    vec![ChatMessage::system(TERM_SYSTEM), ChatMessage::user(user)]
}

fn clean_term(raw: &str) -> String {
    raw.trim()
        .trim_matches(['"', '\'', '.', '`'])
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stopword-filtered words from section title, key points, article title and
/// SEO description, in that order, capped at three.
fn fallback_term(outline: &Outline, section_index: usize, seo_description: &str) -> String {
    let section = &outline.sections[section_index];
    let mut pool = section.title.clone();
    pool.push(' ');
    pool.push_str(&section.key_points.join(" "));
    pool.push(' ');
    pool.push_str(&outline.title);
    pool.push(' ');
    pool.push_str(seo_description);

    let mut words: Vec<String> = Vec::new();
    for word in pool.to_lowercase().split_whitespace() {
        let word: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if word.len() < 3 || STOPWORDS.contains(&word.as_str()) {
            continue;
        }
        if !words.contains(&word) {
            words.push(word);
        }
        if words.len() == 3 {
            break;
        }
    }
    words.join(" ")
}

/// Inserts each figure right after its section's closing `</h2>`. Offsets are
/// applied from the end so earlier insertions don't shift later ones.
fn splice_figures(html: &str, placed: &[PlacedImage]) -> String {
    let heading_ends: Vec<usize> = H2_RE.find_iter(html).map(|m| m.end()).collect();

    let mut insertions: Vec<(usize, String)> = placed
        .iter()
        .filter_map(|p| {
            heading_ends
                .get(p.section_index)
                .map(|&end| (end, render_figure(&p.image)))
        })
        .collect();
    insertions.sort_by(|a, b| b.0.cmp(&a.0));

    let mut out = html.to_string();
    for (offset, figure) in insertions {
        out.insert_str(offset, &figure);
    }
    out
}

fn render_figure(image: &ImageAsset) -> String {
    let mut figure = format!(
        "\n<figure class=\"article-image\">\n  <img src=\"{}\" alt=\"{}\" loading=\"lazy\" />\n",
        image.url,
        crate::writer::escape_html(&image.alt)
    );
    if let Some(author) = &image.author {
        let credit = match &image.author_url {
            Some(url) => format!(
                "  <figcaption>Photo by <a href=\"{}\" rel=\"nofollow\">{}</a> on Unsplash</figcaption>\n",
                url,
                crate::writer::escape_html(author)
            ),
            None => format!(
                "  <figcaption>Photo by {} on Unsplash</figcaption>\n",
                crate::writer::escape_html(author)
            ),
        };
        figure.push_str(&credit);
    }
    figure.push_str("</figure>");
    figure
}

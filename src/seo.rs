use tracing::{info, warn};

use crate::chat::ChatApi;
use crate::error::PipelineError;
use crate::json_repair;
use crate::models::{
    ArticleContent, ChatMessage, GenerateOptions, Outline, SeoMetadata, SeoReport, TokenUsage,
};

const MAX_TITLE_CHARS: usize = 60;
const TITLE_CUT: usize = 57;
const MAX_DESCRIPTION_CHARS: usize = 160;
const DESCRIPTION_CUT: usize = 157;
const MAX_SLUG_CHARS: usize = 60;
const MAX_KEYWORDS: usize = 8;

const PROMPT_EXCERPT_CHARS: usize = 1200;

const SEO_SYSTEM: &str = "You are an SEO specialist. Respond with ONLY a JSON object. \
     No markdown fences, no commentary.";

/// One metadata call, then deterministic normalization. A malformed response
/// degrades to defaults instead of killing a run that already paid for the
/// full article.
pub async fn generate_seo(
    chat: &dyn ChatApi,
    options: &GenerateOptions,
    outline: &Outline,
    content: &ArticleContent,
    topic: &str,
) -> Result<(SeoMetadata, TokenUsage), PipelineError> {
    let messages = seo_messages(outline, content, topic);
    let output = chat.generate(&messages, options).await?;

    let mut seo: SeoMetadata = match json_repair::parse_with_repair(&output.text) {
        Ok(seo) => seo,
        Err(e) => {
            warn!(error = %e, "seo metadata not parseable, falling back to defaults");
            SeoMetadata::default()
        }
    };
    normalize_seo(&mut seo, topic);
    info!(slug = %seo.slug, keywords = seo.keywords.len(), "seo metadata ready");
    Ok((seo, output.usage))
}

fn seo_messages(outline: &Outline, content: &ArticleContent, topic: &str) -> Vec<ChatMessage> {
    let excerpt: String = crate::writer::strip_tags(&content.html)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(PROMPT_EXCERPT_CHARS)
        .collect();

    let user = format!(
        "Derive SEO metadata for an article about: {topic}\n\n\
         Article title: {}\n\
         Word count: {}\n\n\
         Article text (excerpt):\n{excerpt}\n\n\
         Return JSON with this exact shape:\n\
         {{\n  \"metaTitle\": \"30-60 characters\",\n  \"metaDescription\": \"120-160 characters\",\n  \
         \"slug\": \"kebab-case-url-slug\",\n  \"keywords\": [\"5 to 8 terms\"]\n}}",
        outline.title, content.word_count
    );
    vec![ChatMessage::system(SEO_SYSTEM), ChatMessage::user(user)]
}

/// Enforces the length invariants and fills absent fields. Truncation cuts at
/// a fixed point and appends an ellipsis so the result lands exactly on the
/// limit, never over it.
pub fn normalize_seo(seo: &mut SeoMetadata, topic: &str) {
    seo.meta_title = truncate_with_ellipsis(seo.meta_title.trim(), MAX_TITLE_CHARS, TITLE_CUT);
    seo.meta_description = truncate_with_ellipsis(
        seo.meta_description.trim(),
        MAX_DESCRIPTION_CHARS,
        DESCRIPTION_CUT,
    );

    seo.slug = if seo.slug.trim().is_empty() {
        slugify(topic)
    } else {
        slugify(&seo.slug)
    };

    seo.keywords.retain(|k| !k.trim().is_empty());
    if seo.keywords.is_empty() {
        seo.keywords = default_keywords(topic);
    }
    seo.keywords.truncate(MAX_KEYWORDS);
}

fn truncate_with_ellipsis(text: &str, max: usize, cut: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(cut).collect();
    format!("{head}...")
}

fn default_keywords(topic: &str) -> Vec<String> {
    let lowered = topic.trim().to_lowercase();
    if lowered.is_empty() {
        return Vec::new();
    }
    let mut keywords = vec![lowered.clone()];
    for word in lowered.split_whitespace().filter(|w| w.len() >= 3) {
        if !keywords.iter().any(|k| k == word) {
            keywords.push(word.to_string());
        }
    }
    keywords.push(format!("{lowered} guide"));
    keywords.push(format!("{lowered} tips"));
    keywords.truncate(MAX_KEYWORDS);
    keywords
}

/// Lowercase, transliterate common diacritics to ASCII, collapse everything
/// else to single hyphens, cap at 60 chars without a trailing hyphen.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;

    for c in text.to_lowercase().chars() {
        if let Some(mapped) = transliterate(c) {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push_str(mapped);
        } else if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }

    let mut slug: String = slug.chars().take(MAX_SLUG_CHARS).collect();
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

fn transliterate(c: char) -> Option<&'static str> {
    Some(match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' | 'å' | 'ā' | 'ą' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => "i",
        'ò' | 'ó' | 'ô' | 'ö' | 'õ' | 'ø' | 'ō' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' => "u",
        'ñ' | 'ń' => "n",
        'ç' | 'č' | 'ć' => "c",
        'ß' => "ss",
        'æ' => "ae",
        'œ' => "oe",
        'ý' | 'ÿ' => "y",
        'š' | 'ś' | 'ş' => "s",
        'ž' | 'ż' | 'ź' => "z",
        'đ' | 'ď' => "d",
        'ł' => "l",
        'ř' => "r",
        'ť' => "t",
        'ğ' => "g",
        _ => return None,
    })
}

/// Pure scoring against fixed heuristics. Five criteria worth 20 points each;
/// every miss contributes one recommendation.
pub fn analyze_seo_score(seo: &SeoMetadata, word_count: u32) -> SeoReport {
    let mut score = 0u8;
    let mut recommendations = Vec::new();

    let title_len = seo.meta_title.chars().count();
    if (30..=60).contains(&title_len) {
        score += 20;
    } else {
        recommendations.push("Meta title should be 30-60 characters long.".to_string());
    }

    let description_len = seo.meta_description.chars().count();
    if (120..=160).contains(&description_len) {
        score += 20;
    } else {
        recommendations.push("Meta description should be 120-160 characters long.".to_string());
    }

    let title_lower = seo.meta_title.to_lowercase();
    let keyword_in_title = seo
        .keywords
        .iter()
        .any(|k| !k.trim().is_empty() && title_lower.contains(&k.to_lowercase()));
    if keyword_in_title {
        score += 20;
    } else {
        recommendations.push("Include at least one focus keyword in the meta title.".to_string());
    }

    if word_count >= 800 {
        score += 20;
    } else {
        recommendations.push("Articles of 800+ words tend to rank better.".to_string());
    }

    if seo.slug.chars().count() <= 60 && seo.slug.contains('-') {
        score += 20;
    } else {
        recommendations.push("Use a short hyphenated slug (max 60 characters).".to_string());
    }

    SeoReport {
        score,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{ChatOutput, OutlineConclusion, OutlineIntro};
    use futures_core::future::BoxFuture;

    struct OneShotChat(String);

    impl ChatApi for OneShotChat {
        fn generate<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _options: &'a GenerateOptions,
        ) -> BoxFuture<'a, Result<ChatOutput, ProviderError>> {
            let text = self.0.clone();
            Box::pin(async move {
                Ok(ChatOutput {
                    text,
                    usage: TokenUsage {
                        input: 50,
                        output: 30,
                        total: 80,
                    },
                })
            })
        }

        fn totals(&self) -> TokenUsage {
            TokenUsage::default()
        }
    }

    fn options() -> GenerateOptions {
        GenerateOptions {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 2000,
            reasoning_effort: None,
            verbosity: None,
        }
    }

    fn outline() -> Outline {
        Outline {
            title: "Gardening for Beginners".to_string(),
            introduction: OutlineIntro::default(),
            sections: Vec::new(),
            conclusion: OutlineConclusion::default(),
        }
    }

    fn content() -> ArticleContent {
        ArticleContent {
            html: "<p>dig plant water repeat</p>".to_string(),
            word_count: 900,
            sources: Vec::new(),
        }
    }

    #[test]
    fn slugify_produces_url_safe_kebab_case() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("Äpfel & Öl: größer"), "apfel-ol-grosser");
        assert_eq!(slugify("--Hi there--"), "hi-there");
        assert_eq!(slugify("çà és ñoño"), "ca-es-nono");

        let re = regex::Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
        for input in ["Hello, World!", "Äpfel & Öl", "a  b   c", "99 red balloons"] {
            assert!(re.is_match(&slugify(input)), "bad slug for {input:?}");
        }
    }

    #[test]
    fn slugify_caps_length_without_trailing_hyphen() {
        let long = "word ".repeat(30);
        let slug = slugify(&long);
        assert!(slug.chars().count() <= 60);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn overlong_title_lands_exactly_on_the_limit() {
        let mut seo = SeoMetadata {
            meta_title: "t".repeat(100),
            ..Default::default()
        };
        normalize_seo(&mut seo, "topic");
        assert_eq!(seo.meta_title.chars().count(), 60);
        assert!(seo.meta_title.ends_with("..."));
    }

    #[test]
    fn title_at_the_limit_is_untouched() {
        let exact = "t".repeat(60);
        let mut seo = SeoMetadata {
            meta_title: exact.clone(),
            ..Default::default()
        };
        normalize_seo(&mut seo, "topic");
        assert_eq!(seo.meta_title, exact);
    }

    #[test]
    fn overlong_description_lands_exactly_on_the_limit() {
        let mut seo = SeoMetadata {
            meta_description: "d".repeat(300),
            ..Default::default()
        };
        normalize_seo(&mut seo, "topic");
        assert_eq!(seo.meta_description.chars().count(), 160);
        assert!(seo.meta_description.ends_with("..."));
    }

    #[test]
    fn absent_slug_is_regenerated_from_topic() {
        let mut seo = SeoMetadata::default();
        normalize_seo(&mut seo, "Gardening for Beginners");
        assert_eq!(seo.slug, "gardening-for-beginners");
    }

    #[test]
    fn model_slug_is_still_sanitized() {
        let mut seo = SeoMetadata {
            slug: "My Fancy Slug!".to_string(),
            ..Default::default()
        };
        normalize_seo(&mut seo, "topic");
        assert_eq!(seo.slug, "my-fancy-slug");
    }

    #[test]
    fn empty_keywords_get_topic_defaults() {
        let mut seo = SeoMetadata::default();
        normalize_seo(&mut seo, "Urban Beekeeping");
        assert!(seo.keywords.contains(&"urban beekeeping".to_string()));
        assert!(seo.keywords.contains(&"urban beekeeping guide".to_string()));
        assert!(seo.keywords.len() <= 8);

        let mut kept = SeoMetadata {
            keywords: vec!["bees".to_string()],
            ..Default::default()
        };
        normalize_seo(&mut kept, "Urban Beekeeping");
        assert_eq!(kept.keywords, vec!["bees"]);
    }

    #[test]
    fn perfect_metadata_scores_one_hundred() {
        let seo = SeoMetadata {
            meta_title: "Urban Beekeeping: A Complete Beginner Guide".to_string(),
            meta_description: "d".repeat(140),
            slug: "urban-beekeeping-guide".to_string(),
            keywords: vec!["beekeeping".to_string()],
        };
        let report = analyze_seo_score(&seo, 1200);
        assert_eq!(report.score, 100);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn each_miss_costs_twenty_and_adds_a_recommendation() {
        let seo = SeoMetadata {
            meta_title: "Short".to_string(),
            meta_description: "too short".to_string(),
            slug: "noslug".to_string(),
            keywords: vec!["absent".to_string()],
        };
        let report = analyze_seo_score(&seo, 200);
        assert_eq!(report.score, 0);
        assert_eq!(report.recommendations.len(), 5);

        let seo = SeoMetadata {
            meta_title: "Urban Beekeeping: A Complete Beginner Guide".to_string(),
            meta_description: "d".repeat(140),
            slug: "urban-beekeeping-guide".to_string(),
            keywords: vec!["beekeeping".to_string()],
        };
        let report = analyze_seo_score(&seo, 200);
        assert_eq!(report.score, 80);
        assert_eq!(report.recommendations.len(), 1);
    }

    #[test]
    fn scoring_is_pure() {
        let seo = SeoMetadata {
            meta_title: "Some Title That Is Long Enough Here".to_string(),
            meta_description: "d".repeat(140),
            slug: "some-title".to_string(),
            keywords: vec!["title".to_string()],
        };
        let a = analyze_seo_score(&seo, 900);
        let b = analyze_seo_score(&seo, 900);
        assert_eq!(a.score, b.score);
        assert_eq!(a.recommendations, b.recommendations);
    }

    #[tokio::test]
    async fn fenced_response_parses_and_normalizes() {
        let reply = "```json\n{\"metaTitle\": \"A Practical Guide to Garden Soil\", \
                     \"metaDescription\": \"desc\", \"slug\": \"\", \"keywords\": [\"soil\"]}\n```";
        let chat = OneShotChat(reply.to_string());
        let (seo, usage) = generate_seo(&chat, &options(), &outline(), &content(), "Garden Soil")
            .await
            .unwrap();
        assert_eq!(seo.meta_title, "A Practical Guide to Garden Soil");
        assert_eq!(seo.slug, "garden-soil");
        assert_eq!(usage.total, 80);
    }

    #[tokio::test]
    async fn garbage_response_degrades_to_defaults() {
        let chat = OneShotChat("sorry, I cannot help with that".to_string());
        let (seo, _) = generate_seo(&chat, &options(), &outline(), &content(), "Garden Soil")
            .await
            .unwrap();
        assert_eq!(seo.slug, "garden-soil");
        assert!(!seo.keywords.is_empty());
        assert!(seo.meta_title.is_empty());
    }
}

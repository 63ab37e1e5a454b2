use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use crate::chat::ChatApi;
use crate::error::PipelineError;
use crate::models::{
    ArticleContent, ChatMessage, GenerateOptions, Outline, OutlineSection, ResearchBundle,
    TokenUsage,
};

lazy_static! {
    static ref TAG_RE: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref URL_RE: Regex = Regex::new(r#"https?://[^\s"'<>)]+"#).unwrap();
}

/// Trailing slice of prior prose handed to each section prompt for continuity.
const SECTION_TAIL_CHARS: usize = 500;
/// The conclusion gets a longer view of the article arc.
const CONCLUSION_TAIL_CHARS: usize = 800;

const WRITER_SYSTEM: &str = "You are a senior content writer producing clean HTML fragments. \
     Respond with the HTML fragment only: no markdown, no code fences, no <html> or <body> wrapper.";

/// One finished unit of prose, surfaced to the caller as soon as it lands.
pub struct WrittenUnit {
    pub name: String,
    pub html: String,
    pub index: usize,
    pub total: usize,
}

/// Writes the article strictly in order: introduction, each section, conclusion.
/// Each unit's prompt carries the full research text plus a tail of what has
/// already been written, so units cannot be generated out of order or in
/// parallel. Unit failures abort the run; there is no mid-article resume.
pub async fn write_article(
    chat: &dyn ChatApi,
    options: &GenerateOptions,
    outline: &Outline,
    research: &ResearchBundle,
    extra_context: Option<&str>,
    on_unit: &mut (dyn FnMut(WrittenUnit) + Send),
) -> Result<(ArticleContent, TokenUsage), PipelineError> {
    let research_text = research.full_text();
    let total = outline.sections.len() + 2;
    let mut usage = TokenUsage::default();
    let mut body = String::new();
    let mut sources: Vec<String> = Vec::new();
    let mut seen = HashSet::new();

    let messages = intro_messages(outline, &research_text, extra_context);
    let html = write_unit(chat, options, &messages, "introduction", &mut usage).await?;
    collect_urls(&html, &mut sources, &mut seen);
    push_unit(&mut body, &html);
    on_unit(WrittenUnit {
        name: "introduction".to_string(),
        html,
        index: 0,
        total,
    });

    for (i, section) in outline.sections.iter().enumerate() {
        let tail = tail_of(&body, SECTION_TAIL_CHARS);
        let messages = section_messages(outline, section, &research_text, extra_context, &tail);
        let html = write_unit(chat, options, &messages, &section.title, &mut usage).await?;
        collect_urls(&html, &mut sources, &mut seen);
        push_unit(&mut body, &html);
        on_unit(WrittenUnit {
            name: section.title.clone(),
            html,
            index: i + 1,
            total,
        });
    }

    let tail = tail_of(&body, CONCLUSION_TAIL_CHARS);
    let messages = conclusion_messages(outline, &research_text, extra_context, &tail);
    let html = write_unit(chat, options, &messages, "conclusion", &mut usage).await?;
    collect_urls(&html, &mut sources, &mut seen);
    push_unit(&mut body, &html);
    on_unit(WrittenUnit {
        name: "conclusion".to_string(),
        html,
        index: total - 1,
        total,
    });

    let html = assemble(&outline.title, &body);
    let word_count = count_words(&html);
    info!(word_count, sections = outline.sections.len(), "article written");

    Ok((
        ArticleContent {
            html,
            word_count,
            sources,
        },
        usage,
    ))
}

async fn write_unit(
    chat: &dyn ChatApi,
    options: &GenerateOptions,
    messages: &[ChatMessage],
    unit: &str,
    usage: &mut TokenUsage,
) -> Result<String, PipelineError> {
    let output = chat.generate(messages, options).await?;
    usage.add(&output.usage);
    let html = strip_fences(&output.text);
    if html.is_empty() {
        return Err(PipelineError::EmptyUnit {
            unit: unit.to_string(),
        });
    }
    debug!(unit = %unit, chars = html.len(), "unit written");
    Ok(html)
}

fn intro_messages(
    outline: &Outline,
    research_text: &str,
    extra_context: Option<&str>,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "Write the introduction for an article titled \"{}\".\n",
        outline.title
    );
    if !outline.introduction.key_points.is_empty() {
        user.push_str("\nKey points to open with:\n");
        for point in &outline.introduction.key_points {
            user.push_str(&format!("- {point}\n"));
        }
    }
    if let Some(tone) = &outline.introduction.tone {
        user.push_str(&format!("\nTone: {tone}\n"));
    }
    user.push_str(
        "\nRules:\n\
         - 150 to 200 words.\n\
         - Use only <p>, <strong> and <em> tags.\n\
         - No headings of any kind.\n\
         - Hook the reader and preview what the article covers.\n",
    );
    append_research(&mut user, research_text);
    append_extra(&mut user, extra_context);
    vec![ChatMessage::system(WRITER_SYSTEM), ChatMessage::user(user)]
}

fn section_messages(
    outline: &Outline,
    section: &OutlineSection,
    research_text: &str,
    extra_context: Option<&str>,
    tail: &str,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "Write the section \"{}\" for an article titled \"{}\".\n",
        section.title, outline.title
    );
    if !section.key_points.is_empty() {
        user.push_str("\nCover these key points:\n");
        for point in &section.key_points {
            user.push_str(&format!("- {point}\n"));
        }
    }
    if let Some(subsections) = &section.subsections
        && !subsections.is_empty()
    {
        user.push_str("\nPlanned subsections (use <h3> for these):\n");
        for sub in subsections {
            user.push_str(&format!("- {sub}\n"));
        }
    }
    user.push_str(&format!(
        "\nTarget length: about {} words.\n",
        section.estimated_word_count
    ));
    if !tail.is_empty() {
        user.push_str(&format!("\nThe article so far ends with:\n...{tail}\n"));
    }
    user.push_str(&format!(
        "\nRules:\n\
         - Start with exactly <h2>{}</h2>.\n\
         - Use only <h2>, <h3>, <p>, <ul>, <li>, <strong> and <em> tags.\n\
         - Never use <h1>.\n\
         - Continue naturally from the text above without repeating it.\n",
        section.title
    ));
    append_research(&mut user, research_text);
    append_extra(&mut user, extra_context);
    vec![ChatMessage::system(WRITER_SYSTEM), ChatMessage::user(user)]
}

fn conclusion_messages(
    outline: &Outline,
    research_text: &str,
    extra_context: Option<&str>,
    tail: &str,
) -> Vec<ChatMessage> {
    let mut user = format!(
        "Write the conclusion for an article titled \"{}\".\n",
        outline.title
    );
    if !outline.conclusion.key_points.is_empty() {
        user.push_str("\nWrap up these points:\n");
        for point in &outline.conclusion.key_points {
            user.push_str(&format!("- {point}\n"));
        }
    }
    if let Some(cta) = &outline.conclusion.call_to_action {
        user.push_str(&format!("\nEnd with this call to action: {cta}\n"));
    }
    if !tail.is_empty() {
        user.push_str(&format!("\nThe article so far ends with:\n...{tail}\n"));
    }
    user.push_str(
        "\nRules:\n\
         - 100 to 150 words.\n\
         - Use only <p>, <strong> and <em> tags.\n\
         - No headings of any kind.\n\
         - Do not introduce new topics.\n",
    );
    append_research(&mut user, research_text);
    append_extra(&mut user, extra_context);
    vec![ChatMessage::system(WRITER_SYSTEM), ChatMessage::user(user)]
}

fn append_research(user: &mut String, research_text: &str) {
    if !research_text.is_empty() {
        user.push_str("\nResearch material (cite URLs inline where useful):\n");
        user.push_str(research_text);
        user.push('\n');
    }
}

fn append_extra(user: &mut String, extra_context: Option<&str>) {
    if let Some(extra) = extra_context
        && !extra.trim().is_empty()
    {
        user.push_str("\nAdditional context from the author:\n");
        user.push_str(extra.trim());
        user.push('\n');
    }
}

/// Models wrap fragments in code fences despite instructions often enough
/// that stripping them unconditionally is cheaper than re-prompting.
fn strip_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("html").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

fn tail_of(body: &str, max_chars: usize) -> String {
    let count = body.chars().count();
    body.chars().skip(count.saturating_sub(max_chars)).collect()
}

fn push_unit(body: &mut String, html: &str) {
    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str(html);
}

fn collect_urls(html: &str, sources: &mut Vec<String>, seen: &mut HashSet<String>) {
    for m in URL_RE.find_iter(html) {
        let url = m.as_str().trim_end_matches(['.', ',']).to_string();
        if seen.insert(url.clone()) {
            sources.push(url);
        }
    }
}

/// Single h1 lives here and only here; units are forbidden from emitting one.
fn assemble(title: &str, body: &str) -> String {
    format!(
        "<article>\n  <header>\n    <h1>{}</h1>\n  </header>\n  <div class=\"article-content\">\n{}\n  </div>\n</article>",
        escape_html(title),
        body
    )
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn count_words(html: &str) -> u32 {
    TAG_RE
        .replace_all(html, " ")
        .split_whitespace()
        .count() as u32
}

pub(crate) fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::models::{ChatOutput, OutlineConclusion, OutlineIntro};
    use futures_core::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedChat {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedChat {
        fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            }
        }
    }

    impl ChatApi for ScriptedChat {
        fn generate<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _options: &'a GenerateOptions,
        ) -> BoxFuture<'a, Result<ChatOutput, ProviderError>> {
            let text = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            Box::pin(async move {
                Ok(ChatOutput {
                    text,
                    usage: TokenUsage {
                        input: 10,
                        output: 5,
                        total: 15,
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

    fn two_section_outline() -> Outline {
        Outline {
            title: "Coffee & Code".to_string(),
            introduction: OutlineIntro {
                key_points: vec!["why coffee".to_string()],
                tone: Some("warm".to_string()),
            },
            sections: vec![
                OutlineSection {
                    title: "Brewing".to_string(),
                    key_points: vec!["grind".to_string(), "water".to_string()],
                    estimated_word_count: 250,
                    subsections: None,
                },
                OutlineSection {
                    title: "Drinking".to_string(),
                    key_points: vec!["timing".to_string(), "amount".to_string()],
                    estimated_word_count: 250,
                    subsections: None,
                },
            ],
            conclusion: OutlineConclusion {
                key_points: vec!["recap".to_string()],
                call_to_action: Some("try it".to_string()),
            },
        }
    }

    #[tokio::test]
    async fn units_are_written_in_order_with_progress() {
        let chat = ScriptedChat::new([
            "<p>intro</p>",
            "<h2>Brewing</h2><p>s1</p>",
            "<h2>Drinking</h2><p>s2</p>",
            "<p>outro</p>",
        ]);
        let research = ResearchBundle::empty("coffee");
        let mut names = Vec::new();
        let mut on_unit = |u: WrittenUnit| names.push((u.index, u.total, u.name));

        let (content, usage) = write_article(
            &chat,
            &options(),
            &two_section_outline(),
            &research,
            None,
            &mut on_unit,
        )
        .await
        .unwrap();

        assert_eq!(
            names,
            vec![
                (0, 4, "introduction".to_string()),
                (1, 4, "Brewing".to_string()),
                (2, 4, "Drinking".to_string()),
                (3, 4, "conclusion".to_string()),
            ]
        );
        let intro_at = content.html.find("<p>intro</p>").unwrap();
        let s1_at = content.html.find("<p>s1</p>").unwrap();
        let s2_at = content.html.find("<p>s2</p>").unwrap();
        let outro_at = content.html.find("<p>outro</p>").unwrap();
        assert!(intro_at < s1_at && s1_at < s2_at && s2_at < outro_at);
        assert_eq!(usage.total, 60);
    }

    #[tokio::test]
    async fn assembly_has_exactly_one_h1_with_escaped_title() {
        let chat = ScriptedChat::new(["<p>a</p>", "<p>b</p>", "<p>c</p>", "<p>d</p>"]);
        let research = ResearchBundle::empty("coffee");
        let mut on_unit = |_u: WrittenUnit| {};

        let (content, _) = write_article(
            &chat,
            &options(),
            &two_section_outline(),
            &research,
            None,
            &mut on_unit,
        )
        .await
        .unwrap();

        assert!(content.html.starts_with("<article>"));
        assert!(content.html.ends_with("</article>"));
        assert!(content.html.contains("<h1>Coffee &amp; Code</h1>"));
        assert_eq!(content.html.matches("<h1").count(), 1);
        assert!(content.html.contains("<div class=\"article-content\">"));
    }

    #[tokio::test]
    async fn empty_unit_aborts_the_run() {
        let chat = ScriptedChat::new(["<p>intro</p>", "   "]);
        let research = ResearchBundle::empty("coffee");
        let mut on_unit = |_u: WrittenUnit| {};

        let err = write_article(
            &chat,
            &options(),
            &two_section_outline(),
            &research,
            None,
            &mut on_unit,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("Brewing"));
    }

    #[tokio::test]
    async fn fenced_output_is_unwrapped() {
        let chat = ScriptedChat::new([
            "```html\n<p>intro</p>\n```",
            "<p>b</p>",
            "<p>c</p>",
            "<p>d</p>",
        ]);
        let research = ResearchBundle::empty("coffee");
        let mut on_unit = |_u: WrittenUnit| {};

        let (content, _) = write_article(
            &chat,
            &options(),
            &two_section_outline(),
            &research,
            None,
            &mut on_unit,
        )
        .await
        .unwrap();

        assert!(content.html.contains("<p>intro</p>"));
        assert!(!content.html.contains("```"));
    }

    #[tokio::test]
    async fn urls_are_collected_once_in_first_seen_order() {
        let chat = ScriptedChat::new([
            "<p>see https://a.example/x and https://b.example/y.</p>",
            "<p>again https://a.example/x</p>",
            "<p>plus https://c.example/z</p>",
            "<p>done</p>",
        ]);
        let research = ResearchBundle::empty("coffee");
        let mut on_unit = |_u: WrittenUnit| {};

        let (content, _) = write_article(
            &chat,
            &options(),
            &two_section_outline(),
            &research,
            None,
            &mut on_unit,
        )
        .await
        .unwrap();

        assert_eq!(
            content.sources,
            vec![
                "https://a.example/x",
                "https://b.example/y",
                "https://c.example/z",
            ]
        );
    }

    #[test]
    fn word_count_strips_tags_first() {
        assert_eq!(count_words("<p>one two</p><ul><li>three</li></ul>"), 3);
        assert_eq!(count_words("<h2>a</h2>b"), 2);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn tail_respects_char_budget() {
        let long = "x".repeat(1000);
        assert_eq!(tail_of(&long, 500).chars().count(), 500);
        assert_eq!(tail_of("short", 500), "short");
    }

    #[test]
    fn section_prompt_carries_continuity_and_research() {
        let outline = two_section_outline();
        let mut research = ResearchBundle::empty("coffee");
        research.results.push(crate::models::SearchResult {
            title: "q".to_string(),
            content: "espresso extraction facts".to_string(),
            url: "https://r.example".to_string(),
            relevance_score: 1.0,
        });
        let research_text = research.full_text();

        let messages = section_messages(
            &outline,
            &outline.sections[1],
            &research_text,
            Some("our brand voice"),
            "previous prose tail",
        );
        let user = &messages[1].content;
        assert!(user.contains("previous prose tail"));
        assert!(user.contains("espresso extraction facts"));
        assert!(user.contains("about 250 words"));
        assert!(user.contains("<h2>Drinking</h2>"));
        assert!(user.contains("our brand voice"));
        assert!(user.contains("Never use <h1>"));
    }

    #[test]
    fn fence_stripping_handles_plain_and_tagged() {
        assert_eq!(strip_fences("```html\n<p>x</p>\n```"), "<p>x</p>");
        assert_eq!(strip_fences("```\n<p>x</p>\n```"), "<p>x</p>");
        assert_eq!(strip_fences("<p>x</p>"), "<p>x</p>");
    }
}

use serde::Deserialize;
use tracing::info;

use crate::chat::ChatApi;
use crate::error::PipelineError;
use crate::json_repair;
use crate::models::{
    ChatMessage, GenerateOptions, Outline, OutlineConclusion, OutlineIntro, OutlineSection,
    ResearchBundle, TokenUsage,
};

/// Hard floor on section count; anything below gets placeholder padding.
const MIN_SECTIONS: usize = 4;
const MIN_KEY_POINTS: usize = 2;

const PLACEHOLDER_TITLES: [&str; 4] = [
    "Understanding {topic}",
    "Key Aspects of {topic}",
    "Practical Tips for {topic}",
    "Common Questions About {topic}",
];

const GENERIC_KEY_POINTS: [&str; 2] = ["Core ideas and context", "Practical takeaways"];

/// Tolerant mirror of the outline JSON. Structural validation happens after
/// parsing so a missing field produces a named error, not a serde one.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutline {
    title: Option<String>,
    introduction: Option<OutlineIntro>,
    sections: Option<Vec<OutlineSection>>,
    conclusion: Option<OutlineConclusion>,
}

pub async fn generate_outline(
    chat: &dyn ChatApi,
    options: &GenerateOptions,
    topic: &str,
    research: &ResearchBundle,
    extra_context: Option<&str>,
) -> Result<(Outline, TokenUsage), PipelineError> {
    let messages = outline_messages(topic, research, extra_context);
    let output = chat.generate(&messages, options).await?;
    let outline = parse_outline(&output.text, topic)?;
    info!(
        title = %outline.title,
        sections = outline.sections.len(),
        "outline generated"
    );
    Ok((outline, output.usage))
}

fn outline_messages(topic: &str, research: &ResearchBundle, extra_context: Option<&str>) -> Vec<ChatMessage> {
    let system = "You are an expert content strategist. Respond with ONLY a JSON object \
                  matching the requested shape. No markdown fences, no commentary.";

    let mut user = format!(
        "Create a blog article outline for the topic: {topic}\n\n\
         Return JSON with this exact shape:\n\
         {{\n  \"title\": \"...\",\n  \"introduction\": {{\"keyPoints\": [\"...\"], \"tone\": \"...\"}},\n  \
         \"sections\": [{{\"title\": \"...\", \"keyPoints\": [\"...\", \"...\"], \"estimatedWordCount\": 300}}],\n  \
         \"conclusion\": {{\"keyPoints\": [\"...\"], \"callToAction\": \"...\"}}\n}}\n\n\
         Aim for 4-6 sections that together tell a complete story."
    );

    if !research.results.is_empty() {
        user.push_str("\n\nResearch findings to ground the outline:\n");
        for r in &research.results {
            let snippet: String = r.content.chars().take(500).collect();
            user.push_str(&format!("- {} — {}\n", r.title, snippet));
        }
    }

    if let Some(extra) = extra_context
        && !extra.trim().is_empty()
    {
        user.push_str("\n\nAdditional context from the author:\n");
        user.push_str(extra.trim());
    }

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

fn parse_outline(raw: &str, topic: &str) -> Result<Outline, PipelineError> {
    let parsed: RawOutline = json_repair::parse_with_repair(raw)
        .map_err(|e| PipelineError::InvalidOutline(format!("not parseable as JSON: {e}")))?;

    let mut missing = Vec::new();
    if parsed.title.as_deref().is_none_or(|t| t.trim().is_empty()) {
        missing.push("title");
    }
    if parsed.introduction.is_none() {
        missing.push("introduction");
    }
    if parsed.sections.is_none() {
        missing.push("sections");
    }
    if parsed.conclusion.is_none() {
        missing.push("conclusion");
    }
    if !missing.is_empty() {
        return Err(PipelineError::InvalidOutline(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }

    let mut outline = Outline {
        title: parsed.title.unwrap_or_default(),
        introduction: parsed.introduction.unwrap_or_default(),
        sections: parsed.sections.unwrap_or_default(),
        conclusion: parsed.conclusion.unwrap_or_default(),
    };
    pad_outline(&mut outline, topic);
    Ok(outline)
}

/// Deterministic invariant enforcement: at least 4 sections, at least 2 key
/// points per section. No upper bound beyond what the model returned.
pub fn pad_outline(outline: &mut Outline, topic: &str) {
    let mut index = 0;
    while outline.sections.len() < MIN_SECTIONS {
        outline.sections.push(placeholder_section(topic, index));
        index += 1;
    }

    for section in &mut outline.sections {
        if section.key_points.len() < MIN_KEY_POINTS {
            section
                .key_points
                .extend(GENERIC_KEY_POINTS.iter().map(|p| p.to_string()));
        }
    }
}

fn placeholder_section(topic: &str, index: usize) -> OutlineSection {
    let template = PLACEHOLDER_TITLES[index % PLACEHOLDER_TITLES.len()];
    OutlineSection {
        title: template.replace("{topic}", topic),
        key_points: vec![
            "Core concepts and definitions".to_string(),
            "Concrete examples".to_string(),
            "Key takeaways".to_string(),
        ],
        estimated_word_count: 300,
        subsections: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatOutput, Role};
    use futures_core::future::BoxFuture;

    struct OneShotChat(String);

    impl ChatApi for OneShotChat {
        fn generate<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _options: &'a GenerateOptions,
        ) -> BoxFuture<'a, Result<ChatOutput, crate::error::ProviderError>> {
            let text = self.0.clone();
            Box::pin(async move {
                Ok(ChatOutput {
                    text,
                    usage: TokenUsage {
                        input: 120,
                        output: 80,
                        total: 200,
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

    fn full_outline_json() -> String {
        serde_json::json!({
            "title": "A Complete Guide",
            "introduction": {"keyPoints": ["hook"], "tone": "friendly"},
            "sections": [
                {"title": "One", "keyPoints": ["a", "b"], "estimatedWordCount": 250},
                {"title": "Two", "keyPoints": ["c", "d"], "estimatedWordCount": 300},
                {"title": "Three", "keyPoints": ["e", "f"], "estimatedWordCount": 300},
                {"title": "Four", "keyPoints": ["g", "h"], "estimatedWordCount": 350},
            ],
            "conclusion": {"keyPoints": ["wrap"], "callToAction": "subscribe"},
        })
        .to_string()
    }

    #[test]
    fn complete_outline_passes_through_unchanged() {
        let outline = parse_outline(&full_outline_json(), "topic").unwrap();
        assert_eq!(outline.title, "A Complete Guide");
        assert_eq!(outline.sections.len(), 4);
        assert_eq!(outline.sections[0].key_points, vec!["a", "b"]);
        assert_eq!(outline.conclusion.call_to_action.as_deref(), Some("subscribe"));
    }

    #[test]
    fn short_outline_is_padded_to_four_sections() {
        let raw = serde_json::json!({
            "title": "T",
            "introduction": {"keyPoints": []},
            "sections": [
                {"title": "Only One", "keyPoints": ["a", "b"]},
            ],
            "conclusion": {"keyPoints": []},
        })
        .to_string();

        let outline = parse_outline(&raw, "urban beekeeping").unwrap();
        assert_eq!(outline.sections.len(), 4);
        assert_eq!(outline.sections[1].title, "Understanding urban beekeeping");
        assert_eq!(outline.sections[2].title, "Key Aspects of urban beekeeping");
        assert_eq!(outline.sections[1].key_points.len(), 3);
        assert_eq!(outline.sections[1].estimated_word_count, 300);
    }

    #[test]
    fn padding_is_deterministic() {
        let raw = serde_json::json!({
            "title": "T",
            "introduction": {"keyPoints": []},
            "sections": [],
            "conclusion": {"keyPoints": []},
        })
        .to_string();

        let a = parse_outline(&raw, "x").unwrap();
        let b = parse_outline(&raw, "x").unwrap();
        let titles_a: Vec<_> = a.sections.iter().map(|s| s.title.clone()).collect();
        let titles_b: Vec<_> = b.sections.iter().map(|s| s.title.clone()).collect();
        assert_eq!(titles_a, titles_b);
        assert_eq!(a.sections.len(), 4);
    }

    #[test]
    fn sparse_key_points_get_generic_padding() {
        let raw = serde_json::json!({
            "title": "T",
            "introduction": {"keyPoints": []},
            "sections": [
                {"title": "One", "keyPoints": ["solo"]},
                {"title": "Two", "keyPoints": ["a", "b"]},
                {"title": "Three", "keyPoints": ["c", "d"]},
                {"title": "Four", "keyPoints": ["e", "f"]},
            ],
            "conclusion": {"keyPoints": []},
        })
        .to_string();

        let outline = parse_outline(&raw, "t").unwrap();
        assert_eq!(outline.sections[0].key_points.len(), 3);
        assert_eq!(outline.sections[0].key_points[0], "solo");
        assert_eq!(outline.sections[1].key_points.len(), 2);
    }

    #[test]
    fn missing_fields_are_a_hard_error() {
        let raw = serde_json::json!({
            "title": "T",
            "sections": [],
        })
        .to_string();

        let err = parse_outline(&raw, "t").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("invalid outline structure"));
        assert!(msg.contains("introduction"));
        assert!(msg.contains("conclusion"));
        assert!(!msg.contains("title,"));
    }

    #[test]
    fn fenced_and_slightly_broken_json_still_parses() {
        let raw = format!(
            "Here is your outline:\n```json\n{}\n```",
            r#"{
                "title": "The "Ultimate" Guide",
                "introduction": {"keyPoints": ["a"],},
                "sections": [{"title": "S1", "keyPoints": ["x", "y"]},],
                "conclusion": {"keyPoints": ["z"]}
            }"#
        );
        let outline = parse_outline(&raw, "t").unwrap();
        assert_eq!(outline.title, "The \"Ultimate\" Guide");
        assert_eq!(outline.sections.len(), 4);
    }

    #[test]
    fn garbage_is_invalid_outline() {
        let err = parse_outline("no json here", "t").unwrap_err();
        assert!(err.to_string().contains("invalid outline structure"));
    }

    #[tokio::test]
    async fn stage_returns_outline_and_usage() {
        let chat = OneShotChat(full_outline_json());
        let research = ResearchBundle::empty("topic");
        let (outline, usage) = generate_outline(&chat, &options(), "topic", &research, None)
            .await
            .unwrap();
        assert_eq!(outline.sections.len(), 4);
        assert_eq!(usage.total, 200);
    }

    #[test]
    fn prompt_includes_research_and_extra_context() {
        let mut research = ResearchBundle::empty("espresso");
        research.results.push(crate::models::SearchResult {
            title: "espresso basics".to_string(),
            content: "pressure and grind size dominate extraction".to_string(),
            url: "https://example.com".to_string(),
            relevance_score: 1.0,
        });

        let messages = outline_messages("espresso", &research, Some("mention our café"));
        assert_eq!(messages[0].role, Role::System);
        let user = &messages[1].content;
        assert!(user.contains("espresso basics"));
        assert!(user.contains("mention our café"));
        assert!(user.contains("estimatedWordCount"));
    }
}

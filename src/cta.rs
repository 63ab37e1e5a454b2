use std::collections::BTreeMap;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::models::{CtaColors, CtaPosition, CtaSpec, CtaStyle};
use crate::writer::escape_html;

lazy_static! {
    static ref H2_START_RE: Regex = Regex::new(r"(?i)<h2[^>]*>").unwrap();
}

/// Splices promo blocks into article HTML at rule-based positions. Positions
/// are resolved against the h2 headings found in the HTML itself;
/// out-of-range section numbers clamp to the last section instead of failing.
pub fn inject_ctas(html: &str, ctas: &[CtaSpec]) -> String {
    if ctas.is_empty() {
        return html.to_string();
    }

    let h2_starts: Vec<usize> = H2_START_RE.find_iter(html).map(|m| m.start()).collect();
    let end = end_offset(html);

    let mut groups: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    for cta in ctas {
        match resolve_offset(cta, &h2_starts, end) {
            Some(offset) => groups.entry(offset).or_default().push(render_cta(cta)),
            None => {
                warn!(
                    title = %cta.title,
                    position = cta.position.as_str(),
                    "cta position unresolvable in this article, skipping"
                );
            }
        }
    }

    // Insert back-to-front so earlier offsets stay valid.
    let mut out = html.to_string();
    for (&offset, blocks) in groups.iter().rev() {
        out.insert_str(offset, &blocks.concat());
    }
    out
}

/// Offset where a CTA at this position should be inserted, in the coordinate
/// space of the original HTML. "After section N" means before the (N+1)th h2,
/// or at the content end when N is the last section.
fn resolve_offset(cta: &CtaSpec, h2_starts: &[usize], end: usize) -> Option<usize> {
    let h2_count = h2_starts.len();

    let after_section = |n: usize| -> Option<usize> {
        if n == 0 || h2_count == 0 {
            return None;
        }
        let n = n.min(h2_count);
        Some(h2_starts.get(n).copied().unwrap_or(end))
    };

    match cta.position {
        CtaPosition::AfterIntro => Some(h2_starts.first().copied().unwrap_or(end)),
        CtaPosition::AfterSection => after_section(cta.section_number.unwrap_or(0) as usize),
        CtaPosition::Middle => after_section(h2_count / 2),
        CtaPosition::BeforeConclusion => after_section(h2_count.saturating_sub(1)),
        CtaPosition::End => Some(end),
    }
}

/// Walks back over the trailing wrapper closers so "end" CTAs land inside the
/// content container, after the last real fragment.
fn end_offset(html: &str) -> usize {
    let mut cursor = html.trim_end().len();
    loop {
        let upto = html[..cursor].trim_end();
        if let Some(stripped) = upto.strip_suffix("</article>") {
            cursor = stripped.len();
        } else if let Some(stripped) = upto.strip_suffix("</div>") {
            cursor = stripped.len();
        } else {
            return upto.len();
        }
    }
}

pub fn render_cta(cta: &CtaSpec) -> String {
    let (container, button) = styles_for(cta);

    let mut block = format!("\n<div class=\"article-cta\" style=\"{container}\">\n");
    if let Some(image_url) = &cta.image_url
        && !image_url.trim().is_empty()
    {
        block.push_str(&format!(
            "  <img src=\"{}\" alt=\"\" style=\"max-width: 100%; border-radius: 6px; margin-bottom: 16px;\" />\n",
            escape_html(image_url)
        ));
    }
    block.push_str(&format!("  <h3>{}</h3>\n", escape_html(&cta.title)));
    if !cta.description.trim().is_empty() {
        block.push_str(&format!("  <p>{}</p>\n", escape_html(&cta.description)));
    }
    block.push_str(&format!(
        "  <a href=\"{}\" style=\"{button}\">{}</a>\n</div>\n",
        escape_html(&cta.button_url),
        escape_html(&cta.button_text)
    ));
    block
}

fn styles_for(cta: &CtaSpec) -> (String, String) {
    const BUTTON_BASE: &str = "display: inline-block; padding: 10px 20px; border-radius: 6px; \
                               text-decoration: none; font-weight: 600;";

    match cta.style {
        CtaStyle::Default => (
            "background: #f8f9fa; border-radius: 8px; padding: 24px; margin: 32px 0; text-align: center;"
                .to_string(),
            format!("{BUTTON_BASE} background: #2563eb; color: #ffffff;"),
        ),
        CtaStyle::Bordered => (
            "background: #ffffff; border: 2px solid #2563eb; border-radius: 8px; padding: 24px; margin: 32px 0; text-align: center;"
                .to_string(),
            format!("{BUTTON_BASE} background: #2563eb; color: #ffffff;"),
        ),
        CtaStyle::Gradient => (
            "background: linear-gradient(135deg, #2563eb, #7c3aed); color: #ffffff; border-radius: 8px; padding: 24px; margin: 32px 0; text-align: center;"
                .to_string(),
            format!("{BUTTON_BASE} background: #ffffff; color: #2563eb;"),
        ),
        CtaStyle::Minimal => (
            "border-top: 1px solid #e5e7eb; border-bottom: 1px solid #e5e7eb; padding: 16px 0; margin: 32px 0;"
                .to_string(),
            "color: #2563eb; text-decoration: underline; font-weight: 600;".to_string(),
        ),
        CtaStyle::Custom => {
            let defaults = CtaColors::default();
            let colors = cta.colors.as_ref().unwrap_or(&defaults);
            let background = colors.background.as_deref().unwrap_or("#f8f9fa");
            let text = colors.text.as_deref().unwrap_or("#111827");
            let button = colors.button.as_deref().unwrap_or("#2563eb");
            let button_text = colors.button_text.as_deref().unwrap_or("#ffffff");
            (
                format!(
                    "background: {background}; color: {text}; border-radius: 8px; padding: 24px; margin: 32px 0; text-align: center;"
                ),
                format!("{BUTTON_BASE} background: {button}; color: {button_text};"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cta(position: CtaPosition, section_number: Option<u32>) -> CtaSpec {
        CtaSpec {
            title: "Try Plume".to_string(),
            description: "Write faster.".to_string(),
            button_text: "Start now".to_string(),
            button_url: "https://plume.example/start".to_string(),
            image_url: None,
            position,
            section_number,
            style: CtaStyle::Default,
            colors: None,
        }
    }

    fn article(section_count: usize) -> String {
        let mut html = String::from(
            "<article>\n  <header>\n    <h1>Title</h1>\n  </header>\n  <div class=\"article-content\">\n<p>intro</p>\n",
        );
        for i in 1..=section_count {
            html.push_str(&format!("<h2>Section {i}</h2>\n<p>body {i}</p>\n"));
        }
        html.push_str("<p>conclusion</p>\n  </div>\n</article>");
        html
    }

    fn offset_of(html: &str, needle: &str) -> usize {
        html.find(needle).unwrap()
    }

    #[test]
    fn after_intro_lands_before_first_section() {
        let out = inject_ctas(&article(3), &[cta(CtaPosition::AfterIntro, None)]);
        let cta_at = offset_of(&out, "article-cta");
        assert!(offset_of(&out, "<p>intro</p>") < cta_at);
        assert!(cta_at < offset_of(&out, "<h2>Section 1</h2>"));
    }

    #[test]
    fn after_section_lands_between_sections() {
        let out = inject_ctas(&article(3), &[cta(CtaPosition::AfterSection, Some(2))]);
        let cta_at = offset_of(&out, "article-cta");
        assert!(offset_of(&out, "<p>body 2</p>") < cta_at);
        assert!(cta_at < offset_of(&out, "<h2>Section 3</h2>"));
    }

    #[test]
    fn out_of_range_section_clamps_to_last() {
        let clamped = inject_ctas(&article(5), &[cta(CtaPosition::AfterSection, Some(99))]);
        let last = inject_ctas(&article(5), &[cta(CtaPosition::AfterSection, Some(5))]);
        assert_eq!(clamped, last);

        let cta_at = offset_of(&clamped, "article-cta");
        assert!(offset_of(&clamped, "<p>conclusion</p>") < cta_at);
        assert!(cta_at < offset_of(&clamped, "</div>"));
    }

    #[test]
    fn middle_is_floor_of_half_the_sections() {
        let out = inject_ctas(&article(5), &[cta(CtaPosition::Middle, None)]);
        let cta_at = offset_of(&out, "article-cta");
        assert!(offset_of(&out, "<p>body 2</p>") < cta_at);
        assert!(cta_at < offset_of(&out, "<h2>Section 3</h2>"));
    }

    #[test]
    fn before_conclusion_precedes_the_last_section() {
        let out = inject_ctas(&article(5), &[cta(CtaPosition::BeforeConclusion, None)]);
        let cta_at = offset_of(&out, "article-cta");
        assert!(offset_of(&out, "<p>body 4</p>") < cta_at);
        assert!(cta_at < offset_of(&out, "<h2>Section 5</h2>"));
    }

    #[test]
    fn end_lands_after_the_conclusion_inside_the_wrapper() {
        let out = inject_ctas(&article(3), &[cta(CtaPosition::End, None)]);
        let cta_at = offset_of(&out, "article-cta");
        assert!(offset_of(&out, "<p>conclusion</p>") < cta_at);
        assert!(out.trim_end().ends_with("</article>"));
        assert!(cta_at < offset_of(&out, "  </div>\n</article>"));
    }

    #[test]
    fn same_position_keeps_list_order() {
        let mut first = cta(CtaPosition::Middle, None);
        first.title = "First".to_string();
        let mut second = cta(CtaPosition::Middle, None);
        second.title = "Second".to_string();

        let out = inject_ctas(&article(4), &[first, second]);
        assert!(offset_of(&out, "First") < offset_of(&out, "Second"));
    }

    #[test]
    fn headingless_article_still_takes_intro_and_end() {
        let html = "<p>just a fragment</p>";
        let out = inject_ctas(html, &[cta(CtaPosition::AfterIntro, None)]);
        assert!(out.contains("article-cta"));

        let skipped = inject_ctas(html, &[cta(CtaPosition::AfterSection, Some(1))]);
        assert_eq!(skipped, html);
    }

    #[test]
    fn empty_cta_list_is_identity() {
        let html = article(2);
        assert_eq!(inject_ctas(&html, &[]), html);
    }

    #[test]
    fn gradient_and_minimal_styles_render_differently() {
        let mut gradient = cta(CtaPosition::End, None);
        gradient.style = CtaStyle::Gradient;
        let block = render_cta(&gradient);
        assert!(block.contains("linear-gradient(135deg"));
        assert!(block.contains("background: #ffffff; color: #2563eb;"));

        let mut minimal = cta(CtaPosition::End, None);
        minimal.style = CtaStyle::Minimal;
        let block = render_cta(&minimal);
        assert!(!block.contains("background:"));
        assert!(block.contains("border-top: 1px solid #e5e7eb"));
    }

    #[test]
    fn custom_style_fills_unset_colors_with_defaults() {
        let mut custom = cta(CtaPosition::End, None);
        custom.style = CtaStyle::Custom;
        custom.colors = Some(CtaColors {
            background: Some("#000000".to_string()),
            text: None,
            button: None,
            button_text: Some("#ff00ff".to_string()),
        });
        let block = render_cta(&custom);
        assert!(block.contains("background: #000000; color: #111827;"));
        assert!(block.contains("background: #2563eb; color: #ff00ff;"));
    }

    #[test]
    fn text_content_is_escaped() {
        let mut sneaky = cta(CtaPosition::End, None);
        sneaky.title = "<script>alert(1)</script>".to_string();
        sneaky.button_url = "https://x.example/?a=1&b=2".to_string();
        let block = render_cta(&sneaky);
        assert!(block.contains("&lt;script&gt;"));
        assert!(block.contains("a=1&amp;b=2"));
        assert!(!block.contains("<script>"));
    }

    #[test]
    fn image_url_renders_an_img_block() {
        let mut with_image = cta(CtaPosition::End, None);
        with_image.image_url = Some("https://img.example/promo.png".to_string());
        let block = render_cta(&with_image);
        assert!(block.contains("<img src=\"https://img.example/promo.png\""));
    }
}

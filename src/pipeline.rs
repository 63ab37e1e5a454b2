use tracing::{debug, info, warn};

use crate::chat::ChatApi;
use crate::config::GenerationConfig;
use crate::cta;
use crate::error::PipelineError;
use crate::images::{self, ImageApi};
use crate::models::{GenerateOptions, GenerationRequest, ResearchBundle, SearchResult};
use crate::outline;
use crate::publish::{self, PostStatus, Publisher};
use crate::research::{self, ResearchApi};
use crate::seo;
use crate::stream::{CompletePayload, PipelineStep, ProgressSink, ResearchSummary};
use crate::writer::{self, WrittenUnit};

const PERCENT_RESEARCH: u8 = 10;
const PERCENT_OUTLINE: u8 = 25;
const PERCENT_WRITING_START: u8 = 40;
const PERCENT_WRITING_END: u8 = 80;
const PERCENT_SEO: u8 = 80;
const PERCENT_IMAGES: u8 = 85;
const PERCENT_WORDPRESS: u8 = 90;
const PERCENT_COMPLETED: u8 = 100;

/// Result sample size carried in the complete payload.
const RESEARCH_SAMPLE: usize = 5;

/// Everything a run talks to. Built per request from the invoking user's
/// credentials, never shared between runs.
pub struct PipelineDeps<'a> {
    pub chat: &'a dyn ChatApi,
    pub research: &'a dyn ResearchApi,
    pub images: &'a dyn ImageApi,
    pub publisher: Option<&'a dyn Publisher>,
}

/// Runs the full generation pipeline for one request, emitting progress
/// frames along the way. The caller owns the terminal frame: on Ok it sends
/// `complete`, on Err it classifies and sends `error`. The run itself never
/// aborts on client disconnect; writes to a dead stream are silently dropped
/// so a finished article can still be saved.
pub async fn run_generation(
    deps: &PipelineDeps<'_>,
    generation: &GenerationConfig,
    request: &GenerationRequest,
    sink: &ProgressSink,
) -> Result<CompletePayload, PipelineError> {
    let options = resolve_options(generation, request);
    info!(
        topic = %request.topic,
        provider = %options.provider,
        model = %options.model,
        "generation run starting"
    );

    let research = if request.use_research {
        sink.progress(PipelineStep::Research, "Researching topic...", PERCENT_RESEARCH, None);
        research::run_research(deps.research, &request.topic, request.research_depth).await
    } else {
        debug!("research disabled for this run");
        ResearchBundle::empty(&request.topic)
    };

    sink.progress(
        PipelineStep::Outline,
        "Creating article outline...",
        PERCENT_OUTLINE,
        None,
    );
    let (outline, outline_usage) = outline::generate_outline(
        deps.chat,
        &options,
        &request.topic,
        &research,
        request.extra_context.as_deref(),
    )
    .await?;
    debug!(tokens = outline_usage.total, "outline stage done");

    sink.progress(
        PipelineStep::Writing,
        "Writing article...",
        PERCENT_WRITING_START,
        None,
    );
    let mut report_unit = |unit: WrittenUnit| {
        let done = unit.index + 1;
        let span = (PERCENT_WRITING_END - PERCENT_WRITING_START) as usize;
        let percent = PERCENT_WRITING_START + ((done * span) / unit.total) as u8;
        sink.progress(
            PipelineStep::Writing,
            format!("Writing article... ({done}/{})", unit.total),
            percent,
            Some(unit.name),
        );
    };
    let (content, writer_usage) = writer::write_article(
        deps.chat,
        &options,
        &outline,
        &research,
        request.extra_context.as_deref(),
        &mut report_unit,
    )
    .await?;
    debug!(tokens = writer_usage.total, words = content.word_count, "writing stage done");

    sink.progress(
        PipelineStep::Seo,
        "Optimizing for search engines...",
        PERCENT_SEO,
        None,
    );
    let (seo, seo_usage) =
        seo::generate_seo(deps.chat, &options, &outline, &content, &request.topic).await?;
    let report = seo::analyze_seo_score(&seo, content.word_count);
    debug!(tokens = seo_usage.total, score = report.score, "seo stage done");

    sink.progress(PipelineStep::Images, "Adding images...", PERCENT_IMAGES, None);
    let (html, placed) = images::place_images(
        deps.chat,
        deps.images,
        &options,
        &outline,
        &content.html,
        &seo.meta_description,
        request.number_of_images,
    )
    .await;

    let html = cta::inject_ctas(&html, &request.ctas);

    let mut post_id = None;
    let mut edit_url = None;
    if request.publish_to_wordpress {
        let Some(publisher) = deps.publisher else {
            return Err(PipelineError::Publish(
                crate::error::PublishError::NotConfigured,
            ));
        };
        sink.progress(
            PipelineStep::Wordpress,
            "Publishing to WordPress...",
            PERCENT_WORDPRESS,
            None,
        );
        let featured = placed.first().map(|p| p.image.url.clone());
        let post = publish::publish_article(
            publisher,
            None,
            &request.topic,
            &html,
            &seo,
            PostStatus::Draft,
            None,
            featured,
        )
        .await?;
        post_id = Some(post.post_id);
        edit_url = Some(post.edit_url);
    }

    sink.progress(
        PipelineStep::Completed,
        "Article generation complete!",
        PERCENT_COMPLETED,
        None,
    );
    if sink.is_disconnected() {
        warn!(topic = %request.topic, "client went away mid-run, finishing anyway");
    }

    let mut token_usage = deps.chat.totals();
    token_usage.add(&research.usage);
    let sample: Vec<SearchResult> = research.results.iter().take(RESEARCH_SAMPLE).cloned().collect();

    info!(
        topic = %request.topic,
        words = content.word_count,
        seo_score = report.score,
        tokens = token_usage.total,
        "generation run finished"
    );

    Ok(CompletePayload {
        post_id,
        edit_url,
        seo_score: report.score,
        word_count: content.word_count,
        article_content: html,
        outline,
        seo_metadata: seo,
        images: placed,
        research: ResearchSummary {
            model: research.model.clone(),
            queries: research.queries.clone(),
            usage: research.usage,
            sample,
        },
        recommendations: report.recommendations,
        total_tokens: token_usage.total,
        token_usage,
    })
}

fn resolve_options(generation: &GenerationConfig, request: &GenerationRequest) -> GenerateOptions {
    GenerateOptions {
        provider: request
            .provider
            .clone()
            .unwrap_or_else(|| generation.default_provider.clone()),
        model: request
            .model
            .clone()
            .unwrap_or_else(|| generation.default_model.clone()),
        temperature: generation.temperature,
        max_tokens: generation.max_tokens,
        reasoning_effort: request.reasoning_effort.clone(),
        verbosity: request.verbosity.clone(),
    }
}

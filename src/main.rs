mod chat;
mod cli;
mod config;
mod credentials;
mod cta;
mod daemon;
mod db;
mod error;
mod images;
mod json_repair;
mod models;
mod outline;
mod pipeline;
mod publish;
mod research;
mod seo;
mod server;
mod store;
mod stream;
mod sweep;
mod writer;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::chat::HttpChatClient;
use crate::cli::{Cli, Commands, UserCommands};
use crate::config::{load_config, validate_config};
use crate::credentials::RunCredentials;
use crate::error::classify;
use crate::images::UnsplashClient;
use crate::models::{GenerationRequest, ResearchDepth};
use crate::pipeline::PipelineDeps;
use crate::research::PerplexityClient;
use crate::stream::{ProgressSink, StreamFrame};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Error reporting before anything else so startup panics are captured
    let _sentry_guard = config.plume.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    // Initialize tracing. The sentry layer is a no-op without a DSN.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.plume.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();

    info!(config_path = %cli.config.display(), "config loaded");

    validate_config(&config).context("config validation failed")?;
    info!("config validated successfully");

    match cli.command {
        Some(Commands::Validate) => {
            println!("Configuration is valid.");
        }
        Some(Commands::Generate {
            topic,
            no_research,
            depth,
            images,
            provider,
            model,
            output,
        }) => {
            let research_depth = match depth.as_str() {
                "shallow" => ResearchDepth::Shallow,
                "moderate" => ResearchDepth::Moderate,
                "deep" => ResearchDepth::Deep,
                other => anyhow::bail!("invalid --depth '{other}' (expected shallow, moderate, or deep)"),
            };

            let request = GenerationRequest {
                topic,
                use_research: !no_research,
                research_depth,
                number_of_images: images,
                publish_to_wordpress: false,
                provider,
                model,
                reasoning_effort: None,
                verbosity: None,
                extra_context: None,
                ctas: Vec::new(),
            };

            // One-shot runs resolve credentials from [providers] config and
            // environment variables; there is no user row involved.
            let credentials = RunCredentials::resolve(&[], &config.providers);
            let perplexity_key = credentials.get("perplexity").cloned();
            let unsplash_key = credentials.get("unsplash").cloned();
            let timeout = config.request_timeout();

            let chat = HttpChatClient::new(credentials, timeout)?;
            let research = PerplexityClient::new(perplexity_key, timeout)?;
            let image_api = UnsplashClient::new(unsplash_key, timeout)?;

            let (sink, mut rx) = ProgressSink::new();
            let printer = tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if let StreamFrame::Progress(p) = frame {
                        info!(progress = p.progress, "{}", p.message);
                    }
                }
            });

            let deps = PipelineDeps {
                chat: &chat,
                research: &research,
                images: &image_api,
                publisher: None,
            };
            let result = pipeline::run_generation(&deps, &config.generation, &request, &sink).await;
            drop(sink);
            let _ = printer.await;

            let payload = match result {
                Ok(p) => p,
                Err(err) => {
                    let classified = classify(&err);
                    anyhow::bail!("{} {}", classified.message, classified.hint);
                }
            };

            let title = if payload.seo_metadata.meta_title.is_empty() {
                request.topic.clone()
            } else {
                payload.seo_metadata.meta_title.clone()
            };

            if let Some(output_path) = output {
                std::fs::write(&output_path, &payload.article_content)
                    .with_context(|| format!("writing article to {}", output_path.display()))?;
                println!("Article written to: {}", output_path.display());
            }
            println!(
                "Generated \"{title}\" — {} words, SEO score {}/100, {} tokens",
                payload.word_count, payload.seo_score, payload.total_tokens
            );
        }
        Some(Commands::Sweep) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            let summary = sweep::run_sweep(&pool, &config, chrono::Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            pool.close().await;
        }
        Some(Commands::User { command }) => {
            let pool = db::create_pool(&config).await.context("creating database")?;
            match command {
                UserCommands::Add { name } => {
                    let token = daemon::generate_token();
                    let user = store::create_user(&pool, &name, &token).await?;
                    println!("User '{}' created.", user.name);
                    println!("API token: {token}");
                    println!("Save this token — it won't be shown again.");
                }
                UserCommands::List => {
                    let users = store::list_users(&pool).await?;
                    if users.is_empty() {
                        println!("No users.");
                    }
                    for user in users {
                        println!("{}  {}  created {}", user.id, user.name, user.created_at.format("%Y-%m-%d"));
                    }
                }
                UserCommands::SetSecret {
                    name,
                    provider,
                    api_key,
                    base_url,
                } => {
                    let known = credentials::CHAT_PROVIDERS.contains(&provider.as_str())
                        || provider == "perplexity"
                        || provider == "unsplash";
                    if !known {
                        anyhow::bail!("unknown provider '{provider}'");
                    }
                    let user = store::get_user_by_name(&pool, &name)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("no user named '{name}'"))?;
                    store::set_user_secret(&pool, &user.id, &provider, &api_key, base_url.as_deref()).await?;
                    println!("Stored {provider} key for '{name}'.");
                }
                UserCommands::SetWordpress {
                    name,
                    site_url,
                    username,
                    app_password,
                } => {
                    let user = store::get_user_by_name(&pool, &name)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("no user named '{name}'"))?;
                    store::set_wordpress_connection(&pool, &user.id, &site_url, &username, &app_password).await?;
                    println!("Stored WordPress connection for '{name}'.");
                }
            }
            pool.close().await;
        }
        Some(Commands::Serve) | None => {
            daemon::run(config).await?;
        }
    }

    Ok(())
}

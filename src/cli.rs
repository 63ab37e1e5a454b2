use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "plume", about = "AI article generation and WordPress publishing service")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the configuration file
    Validate,

    /// Run the daemon (HTTP server + scheduled-publish sweeper)
    Serve,

    /// Generate one article from the command line
    Generate {
        /// Article topic
        topic: String,

        /// Skip the research stage
        #[arg(long)]
        no_research: bool,

        /// Research depth: shallow, moderate, or deep
        #[arg(long, default_value = "moderate")]
        depth: String,

        /// Number of images to place (max 5)
        #[arg(long, default_value_t = 0)]
        images: u32,

        /// Override the configured provider
        #[arg(long)]
        provider: Option<String>,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        /// Write the article HTML to this file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the scheduled-publish sweep once and print the summary
    Sweep,

    /// User management
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user and print their API token
    Add {
        /// Unique display name
        name: String,
    },

    /// List users
    List,

    /// Store a provider API key for a user
    SetSecret {
        /// User name
        name: String,

        /// Provider id (openai, anthropic, gemini, deepseek, qwen, grok, perplexity, unsplash)
        provider: String,

        /// API key
        api_key: String,

        /// Base URL override for OpenAI-compatible proxies
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Store a user's WordPress connection
    SetWordpress {
        /// User name
        name: String,

        /// Site URL, e.g. https://blog.example.com
        site_url: String,

        /// WordPress username
        username: String,

        /// Application password
        app_password: String,
    },
}

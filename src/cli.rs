use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "quillcast", about = "AI content generation and multi-platform publishing")]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server and feed poller (the default)
    Serve,

    /// Validate the configuration file
    Validate,

    /// List providers and the current rotation strategy
    Providers,

    /// Send a minimal request to a provider
    TestProvider {
        name: String,

        /// Mark the provider unavailable if it cannot be reached
        #[arg(long)]
        apply: bool,
    },

    /// Stream an article for a topic to the terminal
    Generate {
        topic: String,

        /// Use this title instead of generating one
        #[arg(long)]
        title: Option<String>,

        #[arg(long, default_value = quillcast::compose::DEFAULT_STYLE)]
        style: String,

        /// Bypass rotation and use this provider
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Target length in characters
        #[arg(long)]
        length: Option<u32>,

        /// Print the article once it is finished instead of revealing it progressively
        #[arg(long)]
        no_typewriter: bool,
    },

    /// Publish a stored article to one or more platforms
    Publish {
        article_id: String,

        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Fetch a trending feed now
    RefreshFeed {
        source: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Follow notifications from a running server
    Watch {
        /// Server root (defaults to the configured listen address)
        #[arg(long)]
        url: Option<String>,

        /// API token (defaults to [server].api_token)
        #[arg(long)]
        token: Option<String>,
    },
}

//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "skema",
    version,
    about = "Chat with your database schema using local models",
    long_about = "Skema turns a crawled relational-database schema into a locally-searchable, \
                  semantically-indexed knowledge base, and answers natural-language questions \
                  about it with retrieval-augmented generation against a local model service."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/skema/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl a schema snapshot and build the source's index
    Index {
        /// Source identifier (one logical database connection)
        source: String,

        /// Path to a JSON schema snapshot to crawl
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Ask a natural-language question about an indexed schema
    Ask {
        /// Source identifier to query
        source: String,

        /// Question to ask
        question: String,
    },

    /// Search an indexed schema with hybrid semantic + keyword search
    Search {
        /// Source identifier to query
        source: String,

        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Restrict to one object type
        #[arg(short = 't', long, value_parser = ["table", "view", "stored_procedure", "function"])]
        object_type: Option<String>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show index statistics for a source, or list all indexed sources
    Stats {
        /// Source identifier (omit to list all sources)
        source: Option<String>,

        /// Show output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Drop a source's index
    Clear {
        /// Source identifier to clear
        source: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

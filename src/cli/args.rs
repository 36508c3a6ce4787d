use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::privacy::NetworkMode;
use crate::runtime::ModelSize;

#[derive(Parser, Debug)]
#[command(name = "jarvis")]
#[command(version)]
#[command(about = "Private, on-device assistant backed by a local model runtime", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a single question and stream the answer
    Ask {
        /// The prompt to send
        prompt: String,

        /// Model size to use (lite or max)
        #[arg(short, long)]
        model: Option<ModelSize>,

        /// Network mode (offline, quick, deep, voice)
        #[arg(long)]
        mode: Option<NetworkMode>,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output_format: OutputFormat,
    },
    /// List model variants and whether the engine serves them
    Models,
    /// Check engine, configuration and network policy
    Status,
    /// Initialize configuration
    Init,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output, streamed as it is generated
    Text,
    /// JSON structured output
    Json,
}

use clap::{Parser, Subcommand, ValueEnum};

use crate::task::model::{ImageQuality, ImageSize, TaskKind};
use crate::user::model::{ProviderModel, UserId};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindCli {
    Generate,
    Edit,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QualityCli {
    Low,
    Medium,
    High,
}

#[derive(Debug, Parser)]
#[clap(name = "genqueue", version)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the executor pool and the reconciliation loop until Ctrl-C
    Work {
        /// Queue to consume (defaults to QUEUE_NAME)
        #[clap(long)]
        queue: Option<String>,

        /// Exit once nothing is runnable
        #[clap(long)]
        burst: bool,

        /// Number of concurrent workers (defaults to WORKER_COUNT)
        #[clap(long)]
        workers: Option<usize>,
    },

    /// Admit one task, creating the user on first contact
    Submit {
        #[clap(long)]
        user: UserId,

        #[clap(long)]
        prompt: String,

        #[clap(long, value_enum, default_value_t = KindCli::Generate)]
        kind: KindCli,

        /// Defaults to the user's stored quality
        #[clap(long, value_enum)]
        quality: Option<QualityCli>,

        /// 1024x1024, 1024x1536 or 1536x1024; defaults to the user's stored size
        #[clap(long, value_parser = parse_size)]
        size: Option<ImageSize>,

        /// Required for --kind edit
        #[clap(long)]
        source_image: Option<String>,

        /// Prompt template cost multiplier
        #[clap(long, default_value_t = 1)]
        multiplier: u32,
    },

    /// Update a user's stored model and image defaults
    Settings {
        #[clap(long)]
        user: UserId,

        /// gpt-image-1, dall-e-3 or dall-e-2
        #[clap(long, value_parser = parse_model)]
        model: Option<ProviderModel>,

        #[clap(long, value_enum)]
        quality: Option<QualityCli>,

        #[clap(long, value_parser = parse_size)]
        size: Option<ImageSize>,
    },

    /// Run a single reconciliation sweep
    Reconcile,

    /// Show balance, outstanding spend and recent tasks for a user
    History {
        #[clap(long)]
        user: UserId,

        #[clap(long, default_value_t = 10)]
        limit: usize,
    },
}

/// Convert CLI kind selection → task kind
pub fn cli_to_kind(k: KindCli) -> TaskKind {
    match k {
        KindCli::Generate => TaskKind::Generate,
        KindCli::Edit => TaskKind::Edit,
    }
}

pub fn cli_to_quality(q: QualityCli) -> ImageQuality {
    match q {
        QualityCli::Low => ImageQuality::Low,
        QualityCli::Medium => ImageQuality::Medium,
        QualityCli::High => ImageQuality::High,
    }
}

fn parse_size(s: &str) -> Result<ImageSize, String> {
    s.parse::<ImageSize>().map_err(|e| e.to_string())
}

fn parse_model(s: &str) -> Result<ProviderModel, String> {
    s.parse::<ProviderModel>().map_err(|e| e.to_string())
}

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "spica",
    about = "Spica — self-tuning optimizer operator CLI",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Output raw JSON (for scripting/piping)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show optimizer status: generation, baselines, instances
    Status,

    /// Inspect candidate packs
    #[command(subcommand)]
    Packs(PacksCommand),

    /// Inspect instance lineage chains
    #[command(subcommand)]
    Lineage(LineageCommand),

    /// Inspect and acknowledge promotion bundles
    #[command(subcommand)]
    Promotion(PromotionCommand),
}

#[derive(Subcommand)]
pub enum PacksCommand {
    /// List stored candidate packs
    List,
    /// Show one pack in full
    Show {
        /// Genome ID of the pack
        genome: String,
    },
    /// Re-verify a pack's content hash
    Verify {
        /// Genome ID of the pack
        genome: String,
    },
}

#[derive(Subcommand)]
pub enum LineageCommand {
    /// List known instances
    List,
    /// Verify an instance's HMAC lineage chain
    Verify {
        /// Instance ID
        instance: String,
    },
    /// Apply a new configuration to an instance, extending its lineage
    Update {
        /// Instance ID
        instance: String,
        /// Path to the new configuration JSON
        config: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
pub enum PromotionCommand {
    /// List promotion bundles
    List,
    /// Show one promotion bundle
    Show {
        /// Tournament ID of the bundle
        tournament: String,
    },
    /// Acknowledge a pending promotion bundle
    Ack {
        /// Tournament ID of the bundle
        tournament: String,
    },
    /// Validate a deployed promotion against its baseline (keep / rollback)
    Validate {
        /// Tournament ID of the bundle
        tournament: String,
        /// Domain of the baseline to compare against
        #[arg(long)]
        domain: String,
        /// Regime of the baseline to compare against
        #[arg(long)]
        regime: String,
        /// Observed live primary-metric mean
        #[arg(long)]
        observed: f64,
    },
    /// Show the rollback history
    Rollbacks,
}

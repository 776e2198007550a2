mod lineage;
mod packs;
mod promotion;
mod status;

use crate::cli::{Cli, Commands};
use crate::context::CliContext;

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let ctx = CliContext::open().await?;
    match cli.command {
        Commands::Status => status::run(&ctx, cli.json).await,
        Commands::Packs(cmd) => packs::run(&ctx, cmd, cli.json).await,
        Commands::Lineage(cmd) => lineage::run(&ctx, cmd, cli.json).await,
        Commands::Promotion(cmd) => promotion::run(&ctx, cmd, cli.json).await,
    }
}

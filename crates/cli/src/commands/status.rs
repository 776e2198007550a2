use anyhow::Result;
use colored::Colorize;

use crate::context::CliContext;
use crate::output;

pub async fn run(ctx: &CliContext, json_mode: bool) -> Result<()> {
    let population = spica_core::evolution::load_population(ctx.store.as_ref()).await?;
    let baselines = ctx.baselines.list_current().await?;
    let instances = ctx.instances.list().await?;
    let packs = ctx.artifacts.list_packs().await.unwrap_or_default();
    let promotions = ctx.artifacts.list_promotions().await.unwrap_or_default();

    if json_mode {
        let data = serde_json::json!({
            "database_url": ctx.cfg.database_url,
            "data_dir": ctx.cfg.data_dir,
            "generation": population.as_ref().map(|p| p.generation),
            "population_size": population.as_ref().map(spica_shared::model::Population::len),
            "baselines": baselines.len(),
            "instances": instances.len(),
            "packs": packs.len(),
            "promotions": promotions.len(),
            "signing_key_configured": ctx.cfg.signing_key.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    output::print_header("Spica Optimizer Status");

    println!(
        "  {}   v{} ({})",
        "Version:".dimmed(),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
    );
    println!("  {}  {}", "Database:".dimmed(), ctx.cfg.database_url);
    match &population {
        Some(pop) => println!(
            "  {} generation {} ({} genomes)",
            "Evolution:".dimmed(),
            format!("{}", pop.generation).green(),
            pop.len(),
        ),
        None => println!(
            "  {} {}",
            "Evolution:".dimmed(),
            "no persisted population".dimmed()
        ),
    }
    println!(
        "  {}     {} stored",
        "Packs:".dimmed(),
        format!("{}", packs.len()).green(),
    );
    if ctx.cfg.signing_key.is_none() {
        println!(
            "  {}   {}",
            "Signing:".dimmed(),
            "no key configured (spawn/promotion refused)".yellow()
        );
    }

    output::print_header("Baselines");
    output::print_baselines_table(&baselines);

    output::print_header("Instances");
    output::print_instances_table(&instances);

    output::print_header("Promotions");
    output::print_promotions_table(&promotions);
    println!();

    Ok(())
}

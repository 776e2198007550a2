use anyhow::Result;
use colored::Colorize;
use spica_shared::SpicaId;

use crate::cli::PacksCommand;
use crate::context::CliContext;
use crate::output;

pub async fn run(ctx: &CliContext, cmd: PacksCommand, json_mode: bool) -> Result<()> {
    match cmd {
        PacksCommand::List => list(ctx, json_mode).await,
        PacksCommand::Show { genome } => show(ctx, &genome, json_mode).await,
        PacksCommand::Verify { genome } => verify(ctx, &genome, json_mode).await,
    }
}

async fn list(ctx: &CliContext, json_mode: bool) -> Result<()> {
    let ids = ctx.artifacts.list_packs().await?;
    let mut packs = Vec::with_capacity(ids.len());
    for id in ids {
        // A tampered pack still shows up in the listing via verify below;
        // here it is just skipped.
        if let Ok(pack) = ctx.artifacts.read_pack(id).await {
            packs.push(pack);
        }
    }
    packs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&packs)?);
        return Ok(());
    }
    output::print_header("Candidate Packs");
    output::print_packs_table(&packs);
    println!();
    Ok(())
}

async fn show(ctx: &CliContext, genome: &str, json_mode: bool) -> Result<()> {
    let id: SpicaId = genome.parse()?;
    let pack = ctx.artifacts.read_pack(id).await?;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&pack)?);
        return Ok(());
    }

    output::print_header(&format!("Pack {}", pack.genome.id));
    println!(
        "  {}     {}",
        "Feasible:".dimmed(),
        if pack.feasible {
            "yes".green().to_string()
        } else {
            "no".red().to_string()
        }
    );
    let score = if pack.aggregate_score.is_finite() {
        format!("{:.4}", pack.aggregate_score)
    } else {
        "-∞ (infeasible)".to_string()
    };
    println!("  {}        {}", "Score:".dimmed(), score);
    println!(
        "  {}   {} (parents: {})",
        "Generation:".dimmed(),
        pack.genome.generation,
        pack.genome.parent_ids.len()
    );
    println!(
        "  {}   performance {:.3}  stability {:.3}  drawdown {:.3}  risk {:.3}",
        "Dimensions:".dimmed(),
        pack.dimensions.performance,
        pack.dimensions.stability,
        pack.dimensions.drawdown,
        pack.dimensions.risk,
    );
    for regime in &pack.per_regime {
        let marker = if regime.infeasible {
            "○".red().to_string()
        } else {
            "●".green().to_string()
        };
        println!(
            "    {} {}  trials {}  error rate {:.2}  oom {}",
            marker, regime.regime, regime.trial_count, regime.error_rate, regime.oom_count
        );
    }
    println!();
    Ok(())
}

async fn verify(ctx: &CliContext, genome: &str, json_mode: bool) -> Result<()> {
    let id: SpicaId = genome.parse()?;
    let result = ctx.artifacts.read_pack(id).await;

    if json_mode {
        let data = serde_json::json!({
            "genome_id": genome,
            "valid": result.is_ok(),
            "error": result.as_ref().err().map(ToString::to_string),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    match result {
        Ok(_) => println!("  {} Pack {} verifies", "OK".green().bold(), genome),
        Err(e) => {
            println!("  {} Pack {} is corrupt", "FAIL".red().bold(), genome);
            println!("        {e}");
        }
    }
    Ok(())
}

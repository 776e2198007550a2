use anyhow::Result;
use colored::Colorize;
use spica_shared::SpicaId;

use crate::cli::LineageCommand;
use crate::context::CliContext;
use crate::output;

pub async fn run(ctx: &CliContext, cmd: LineageCommand, json_mode: bool) -> Result<()> {
    match cmd {
        LineageCommand::List => list(ctx, json_mode).await,
        LineageCommand::Verify { instance } => verify(ctx, &instance, json_mode).await,
        LineageCommand::Update { instance, config } => {
            update(ctx, &instance, &config, json_mode).await
        }
    }
}

async fn list(ctx: &CliContext, json_mode: bool) -> Result<()> {
    let instances = ctx.instances.list().await?;
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }
    output::print_header("Instances");
    output::print_instances_table(&instances);
    println!();
    Ok(())
}

async fn verify(ctx: &CliContext, instance: &str, json_mode: bool) -> Result<()> {
    let id: SpicaId = instance.parse()?;
    let (valid, total) = ctx.instances.verify_lineage(id).await?;

    if json_mode {
        let data = serde_json::json!({
            "instance_id": instance,
            "valid_entries": valid,
            "total_entries": total,
            "intact": valid == total,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if valid == total {
        println!(
            "  {} Lineage chain intact ({} entries)",
            "OK".green().bold(),
            total
        );
    } else {
        println!(
            "  {} Lineage chain valid only through entry {} of {}",
            "FAIL".red().bold(),
            valid,
            total
        );
        println!(
            "        Entries {}..{} are tampered or resigned with a different key.",
            valid, total
        );
    }
    Ok(())
}

async fn update(
    ctx: &CliContext,
    instance: &str,
    config: &std::path::Path,
    json_mode: bool,
) -> Result<()> {
    let id: SpicaId = instance.parse()?;
    let raw = tokio::fs::read_to_string(config).await?;
    let snapshot: serde_json::Value = serde_json::from_str(&raw)?;
    let updated = ctx.instances.update_config(id, snapshot).await?;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&updated)?);
        return Ok(());
    }
    println!(
        "  {} Instance {} updated; lineage chain now {} entries",
        "OK".green().bold(),
        id,
        updated.lineage_chain.len()
    );
    Ok(())
}

use anyhow::Result;
use colored::Colorize;
use spica_core::tournament::DeploymentVerdict;
use spica_shared::model::AckStatus;
use spica_shared::{sign, SpicaId};

use crate::cli::PromotionCommand;
use crate::context::CliContext;
use crate::output;

pub async fn run(ctx: &CliContext, cmd: PromotionCommand, json_mode: bool) -> Result<()> {
    match cmd {
        PromotionCommand::List => list(ctx, json_mode).await,
        PromotionCommand::Show { tournament } => show(ctx, &tournament, json_mode).await,
        PromotionCommand::Ack { tournament } => ack(ctx, &tournament, json_mode).await,
        PromotionCommand::Validate {
            tournament,
            domain,
            regime,
            observed,
        } => validate(ctx, &tournament, &domain, &regime, observed, json_mode).await,
        PromotionCommand::Rollbacks => rollbacks(ctx, json_mode).await,
    }
}

async fn list(ctx: &CliContext, json_mode: bool) -> Result<()> {
    let bundles = ctx.artifacts.list_promotions().await?;
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&bundles)?);
        return Ok(());
    }
    output::print_header("Promotion Bundles");
    output::print_promotions_table(&bundles);
    println!();
    Ok(())
}

async fn show(ctx: &CliContext, tournament: &str, json_mode: bool) -> Result<()> {
    let id: SpicaId = tournament.parse()?;
    let bundle = ctx.artifacts.read_promotion(id).await?;
    let signature_ok = ctx
        .cfg
        .signing_key
        .as_deref()
        .map(|key| sign::verify_promotion(key, &bundle).is_ok());

    if json_mode {
        let data = serde_json::json!({
            "bundle": bundle,
            "signature_verified": signature_ok,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    output::print_header(&format!("Promotion {}", bundle.tournament_id));
    println!("  {}   {}", "Winner:".dimmed(), bundle.winner_id);
    println!("  {}      {:?}", "Ack:".dimmed(), bundle.ack_status);
    match signature_ok {
        Some(true) => println!("  {} {}", "Signature:".dimmed(), "verified".green()),
        Some(false) => println!("  {} {}", "Signature:".dimmed(), "INVALID".red().bold()),
        None => println!(
            "  {} {}",
            "Signature:".dimmed(),
            "unverified (no signing key)".yellow()
        ),
    }
    println!(
        "  {}   {}",
        "Config:".dimmed(),
        serde_json::to_string(&bundle.winner_config)?
    );
    println!();
    Ok(())
}

async fn ack(ctx: &CliContext, tournament: &str, json_mode: bool) -> Result<()> {
    let id: SpicaId = tournament.parse()?;
    let bundle = ctx.artifacts.read_promotion(id).await?;

    // Verify before acknowledging; an unsigned environment cannot ack.
    let key = ctx
        .cfg
        .signing_key
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("signing key unavailable: SPICA_SIGNING_KEY is not set"))?;
    sign::verify_promotion(key, &bundle)?;

    if bundle.ack_status != AckStatus::Pending {
        anyhow::bail!(
            "promotion {} is {:?}, only pending bundles can be acked",
            id,
            bundle.ack_status
        );
    }
    let updated = ctx.artifacts.update_ack_status(id, AckStatus::Acked).await?;

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&updated)?);
        return Ok(());
    }
    println!("  {} Promotion {} acknowledged", "OK".green().bold(), id);
    Ok(())
}

async fn validate(
    ctx: &CliContext,
    tournament: &str,
    domain: &str,
    regime: &str,
    observed: f64,
    json_mode: bool,
) -> Result<()> {
    let id: SpicaId = tournament.parse()?;
    let (verdict, _) = ctx
        .promoter
        .validate_deployment(id, domain, regime, observed)
        .await?;

    if json_mode {
        let data = serde_json::json!({
            "tournament_id": tournament,
            "domain": domain,
            "regime": regime,
            "observed_primary": observed,
            "verdict": format!("{verdict:?}"),
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    match verdict {
        DeploymentVerdict::Keep => println!(
            "  {} Deployment confirmed; baseline updated to {:.4}",
            "KEEP".green().bold(),
            observed
        ),
        DeploymentVerdict::Neutral => println!(
            "  {} Inside the neutral band; baseline unchanged",
            "NEUTRAL".yellow().bold()
        ),
        DeploymentVerdict::RolledBack => println!(
            "  {} Regression detected; promotion rolled back and previous baseline restored",
            "ROLLBACK".red().bold()
        ),
    }
    Ok(())
}

async fn rollbacks(ctx: &CliContext, json_mode: bool) -> Result<()> {
    let history = ctx
        .store
        .get_json(
            spica_core::tournament::TOURNAMENT_STORE_NS,
            spica_core::tournament::KEY_ROLLBACK_HISTORY,
        )
        .await?
        .unwrap_or_else(|| serde_json::json!([]));

    if json_mode {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    output::print_header("Rollback History");
    let entries = history.as_array().cloned().unwrap_or_default();
    if entries.is_empty() {
        println!("  {}", "No rollbacks recorded.".dimmed());
    }
    for entry in entries {
        println!(
            "  {}  {}",
            entry["timestamp"].as_str().unwrap_or("-").dimmed(),
            entry["reason"].as_str().unwrap_or("-"),
        );
    }
    println!();
    Ok(())
}

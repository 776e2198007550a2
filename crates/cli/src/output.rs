use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};

use spica_shared::model::{Baseline, CandidatePack, PromotionBundle, SpicaInstance};
use spica_shared::model::{AckStatus, InstanceState};

/// Print a decorated section header.
pub fn print_header(title: &str) {
    let line = "─".repeat(36);
    println!();
    println!("  {}", title.bold());
    println!("  {}", line.dimmed());
}

fn bare_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Feasibility dot: ● feasible (green), ○ infeasible (dim).
pub fn feasible_dot(feasible: bool) -> String {
    if feasible {
        "●".green().to_string()
    } else {
        "○".dimmed().to_string()
    }
}

pub fn print_packs_table(packs: &[CandidatePack]) {
    if packs.is_empty() {
        println!("  {}", "No candidate packs stored.".dimmed());
        return;
    }
    let mut table = bare_table();
    for pack in packs {
        let score = if pack.aggregate_score.is_finite() {
            format!("{:.4}", pack.aggregate_score)
        } else {
            "-∞".dimmed().to_string()
        };
        table.add_row(vec![
            format!("  {}", feasible_dot(pack.feasible)),
            pack.genome.id.to_string().bold().to_string(),
            format!("gen {}", pack.genome.generation),
            score,
            pack.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_baselines_table(baselines: &[Baseline]) {
    if baselines.is_empty() {
        println!("  {}", "No baselines established.".dimmed());
        return;
    }
    let mut table = bare_table();
    for b in baselines {
        let primary = b
            .metric_means
            .get(spica_shared::model::PRIMARY_METRIC)
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            format!("  {}", b.domain.clone().bold()),
            b.regime.clone(),
            primary,
            b.established_at.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_instances_table(instances: &[SpicaInstance]) {
    if instances.is_empty() {
        println!("  {}", "No instances registered.".dimmed());
        return;
    }
    let mut table = bare_table();
    for inst in instances {
        let state = match inst.state {
            InstanceState::Spawned => "spawned".cyan().to_string(),
            InstanceState::Retained => "retained".green().to_string(),
            InstanceState::Pruned => "pruned".dimmed().to_string(),
        };
        table.add_row(vec![
            format!("  {}", inst.instance_id.to_string().bold()),
            state,
            format!("{} links", inst.lineage_chain.len()),
            inst.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_promotions_table(bundles: &[PromotionBundle]) {
    if bundles.is_empty() {
        println!("  {}", "No promotion bundles.".dimmed());
        return;
    }
    let mut table = bare_table();
    for bundle in bundles {
        let ack = match bundle.ack_status {
            AckStatus::Pending => "pending".yellow().to_string(),
            AckStatus::Acked => "acked".green().to_string(),
            AckStatus::RolledBack => "rolled back".red().to_string(),
        };
        table.add_row(vec![
            format!("  {}", bundle.tournament_id.to_string().bold()),
            bundle.winner_id.to_string(),
            ack,
            bundle.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

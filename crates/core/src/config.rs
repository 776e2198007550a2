use anyhow::Context;
use chrono::NaiveTime;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use spica_shared::model::FitnessWeights;

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Root for artifacts: packs/, manifests/, telemetry/, promotions/, signals/.
    pub data_dir: PathBuf,
    pub search_space_path: PathBuf,

    // Evolution
    pub population_size: usize,
    pub elite_k: usize,
    pub tournament_size: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    /// Mutation noise amplitude as a fraction of a numeric parameter's range.
    pub mutation_sigma: f64,
    pub quarantine_generations: u64,

    // Novelty
    pub novelty_k: usize,
    pub archive_capacity: usize,

    // Evaluation
    pub fitness_weights: FitnessWeights,
    pub bootstrap_iterations: usize,
    pub max_parallel_experiments: usize,
    pub trial_timeout: Duration,
    pub cycle_budget: Duration,
    pub drain_timeout: Duration,

    // PHASE window
    pub phase_window_start: NaiveTime,
    pub phase_window_end: NaiveTime,
    pub phase_grace: Duration,
    pub signal_poll_interval: Duration,

    // Instances
    pub prune_after_days: i64,
    pub min_instances: usize,

    // Promotion validation
    pub promote_keep_threshold: f64,
    pub promote_rollback_threshold: f64,

    /// HMAC key for lineage chains and promotion bundles. Spawn and promote
    /// fail closed when absent.
    pub signing_key: Option<Vec<u8>>,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| anyhow::anyhow!("Failed to parse {}='{}': {}", name, raw, e))
}

impl AppConfig {
    #[allow(clippy::too_many_lines)]
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("spica_optimizer.db");
            format!("sqlite:{}", db_path.display())
        });

        let data_dir = env::var("SPICA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| exe_dir().join("data"));

        let search_space_path = env::var("SPICA_SEARCH_SPACE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| exe_dir().join("search_space.json"));

        let population_size: usize = env_parse("SPICA_POPULATION_SIZE", "24")?;
        if population_size < 2 {
            anyhow::bail!(
                "SPICA_POPULATION_SIZE must be >= 2 (got {})",
                population_size
            );
        }

        let elite_k: usize = env_parse("SPICA_ELITE_K", "2")?;
        if elite_k >= population_size {
            anyhow::bail!(
                "SPICA_ELITE_K must be < population size (got {} >= {})",
                elite_k,
                population_size
            );
        }

        let tournament_size: usize = env_parse("SPICA_TOURNAMENT_SIZE", "3")?;
        if tournament_size == 0 || tournament_size > population_size {
            anyhow::bail!(
                "SPICA_TOURNAMENT_SIZE must be between 1 and population size (got {})",
                tournament_size
            );
        }

        let crossover_rate: f64 = env_parse("SPICA_CROSSOVER_RATE", "0.7")?;
        let mutation_rate: f64 = env_parse("SPICA_MUTATION_RATE", "0.15")?;
        let mutation_sigma: f64 = env_parse("SPICA_MUTATION_SIGMA", "0.1")?;
        for (name, val) in [
            ("SPICA_CROSSOVER_RATE", crossover_rate),
            ("SPICA_MUTATION_RATE", mutation_rate),
            ("SPICA_MUTATION_SIGMA", mutation_sigma),
        ] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                anyhow::bail!("{} must be in [0.0, 1.0] (got {})", name, val);
            }
        }

        let quarantine_generations: u64 = env_parse("SPICA_QUARANTINE_GENERATIONS", "3")?;

        let novelty_k: usize = env_parse("SPICA_NOVELTY_K", "15")?;
        let archive_capacity: usize = env_parse("SPICA_ARCHIVE_CAPACITY", "256")?;
        if novelty_k == 0 || archive_capacity == 0 {
            anyhow::bail!("SPICA_NOVELTY_K and SPICA_ARCHIVE_CAPACITY must be > 0");
        }

        let fitness_weights = match env::var("SPICA_FITNESS_WEIGHTS") {
            Ok(raw) => parse_weights(&raw)
                .with_context(|| format!("Failed to parse SPICA_FITNESS_WEIGHTS='{raw}'"))?,
            Err(_) => FitnessWeights::default(),
        };
        fitness_weights.validate()?;

        let bootstrap_iterations: usize = env_parse("SPICA_BOOTSTRAP_ITERATIONS", "2000")?;
        if bootstrap_iterations == 0 || bootstrap_iterations > 1_000_000 {
            anyhow::bail!(
                "SPICA_BOOTSTRAP_ITERATIONS must be between 1 and 1000000 (got {})",
                bootstrap_iterations
            );
        }

        let max_parallel_experiments: usize = env_parse("SPICA_MAX_PARALLEL_EXPERIMENTS", "4")?;
        if max_parallel_experiments == 0 || max_parallel_experiments > 64 {
            anyhow::bail!(
                "SPICA_MAX_PARALLEL_EXPERIMENTS must be between 1 and 64 (got {})",
                max_parallel_experiments
            );
        }

        let trial_timeout_secs: u64 = env_parse("SPICA_TRIAL_TIMEOUT_SECS", "120")?;
        if trial_timeout_secs == 0 || trial_timeout_secs > 3600 {
            anyhow::bail!(
                "SPICA_TRIAL_TIMEOUT_SECS must be between 1 and 3600 (got {})",
                trial_timeout_secs
            );
        }

        let cycle_budget_secs: u64 = env_parse("SPICA_CYCLE_BUDGET_SECS", "600")?;
        let drain_timeout_secs: u64 = env_parse("SPICA_DRAIN_TIMEOUT_SECS", "60")?;

        let phase_window_start = parse_window_time("SPICA_PHASE_WINDOW_START", "03:00")?;
        let phase_window_end = parse_window_time("SPICA_PHASE_WINDOW_END", "07:00")?;
        if phase_window_start == phase_window_end {
            anyhow::bail!("PHASE window start and end must differ");
        }

        let phase_grace_secs: u64 = env_parse("SPICA_PHASE_GRACE_SECS", "900")?;
        let signal_poll_secs: u64 = env_parse("SPICA_SIGNAL_POLL_SECS", "30")?;
        if signal_poll_secs == 0 {
            anyhow::bail!("SPICA_SIGNAL_POLL_SECS must be > 0");
        }

        let prune_after_days: i64 = env_parse("SPICA_PRUNE_AFTER_DAYS", "14")?;
        if prune_after_days <= 0 {
            anyhow::bail!("SPICA_PRUNE_AFTER_DAYS must be > 0 (got {})", prune_after_days);
        }
        let min_instances: usize = env_parse("SPICA_MIN_INSTANCES", "3")?;

        let promote_keep_threshold: f64 = env_parse("SPICA_PROMOTE_KEEP_THRESHOLD", "0.02")?;
        let promote_rollback_threshold: f64 =
            env_parse("SPICA_PROMOTE_ROLLBACK_THRESHOLD", "0.05")?;
        for (name, val) in [
            ("SPICA_PROMOTE_KEEP_THRESHOLD", promote_keep_threshold),
            ("SPICA_PROMOTE_ROLLBACK_THRESHOLD", promote_rollback_threshold),
        ] {
            if !val.is_finite() || val <= 0.0 || val >= 1.0 {
                anyhow::bail!("{} must be in (0.0, 1.0) (got {})", name, val);
            }
        }

        let signing_key = env::var("SPICA_SIGNING_KEY").ok().map(|k| {
            if k.len() < 32 {
                tracing::warn!("SPICA_SIGNING_KEY is shorter than recommended minimum (32 chars)");
            }
            k.into_bytes()
        });

        Ok(Self {
            database_url,
            data_dir,
            search_space_path,
            population_size,
            elite_k,
            tournament_size,
            crossover_rate,
            mutation_rate,
            mutation_sigma,
            quarantine_generations,
            novelty_k,
            archive_capacity,
            fitness_weights,
            bootstrap_iterations,
            max_parallel_experiments,
            trial_timeout: Duration::from_secs(trial_timeout_secs),
            cycle_budget: Duration::from_secs(cycle_budget_secs),
            drain_timeout: Duration::from_secs(drain_timeout_secs),
            phase_window_start,
            phase_window_end,
            phase_grace: Duration::from_secs(phase_grace_secs),
            signal_poll_interval: Duration::from_secs(signal_poll_secs),
            prune_after_days,
            min_instances,
            promote_keep_threshold,
            promote_rollback_threshold,
            signing_key,
        })
    }
}

fn parse_window_time(name: &str, default: &str) -> anyhow::Result<NaiveTime> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
        .map_err(|e| anyhow::anyhow!("Failed to parse {}='{}' as HH:MM: {}", name, raw, e))
}

/// "0.40,0.20,0.15,0.10,0.10,0.05" in dimension order
/// (performance, stability, drawdown, turnover, correlation, risk).
fn parse_weights(raw: &str) -> anyhow::Result<FitnessWeights> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()?;
    if parts.len() != 6 {
        anyhow::bail!("expected 6 comma-separated weights, got {}", parts.len());
    }
    Ok(FitnessWeights {
        performance: parts[0],
        stability: parts[1],
        drawdown: parts[2],
        turnover: parts[3],
        correlation: parts[4],
        risk: parts[5],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weights_six_values() {
        let w = parse_weights("0.40,0.20,0.15,0.10,0.10,0.05").unwrap();
        assert!((w.performance - 0.40).abs() < f64::EPSILON);
        assert!((w.risk - 0.05).abs() < f64::EPSILON);
        assert!(w.validate().is_ok());
    }

    #[test]
    fn test_parse_weights_wrong_arity() {
        assert!(parse_weights("0.5,0.5").is_err());
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod events;
pub mod model;
pub mod sign;

pub use events::{SpicaEvent, SpicaEventData};

/// Unique identifier inside the Spica optimizer (genomes, instances, runs, baselines).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpicaId(Uuid);

impl std::fmt::Display for SpicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default generates a random UUID v4. Each default SpicaId is unique,
/// suitable for run ids and trace ids. For deterministic ids use `from_name`.
impl Default for SpicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl SpicaId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id derived from a name (UUID v5, DNS namespace).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()))
    }
}

impl std::str::FromStr for SpicaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Error taxonomy for the optimizer core. Integrity and signature failures
/// never auto-recover; everything else prefers local recovery.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum SpicaError {
    #[error("constraint violation: {0}")]
    Infeasible(String),
    #[error("integrity failure: {0}")]
    Integrity(String),
    #[error("signature verification failed: {0}")]
    Signature(String),
    #[error("signing key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("workload error: {0}")]
    Workload(String),
    #[error("workload timed out after {0}ms")]
    WorkloadTimeout(u64),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type SpicaResult<T> = std::result::Result<T, SpicaError>;

/// Abstract key/value storage for optimizer state (population, baselines,
/// instances, quarantine ledger). Namespaced so subsystems cannot trample
/// each other's keys.
#[async_trait]
pub trait OptimizerStore: Send + Sync {
    /// Store a JSON value under (namespace, key).
    async fn set_json(
        &self,
        namespace: &str,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()>;
    /// Fetch the JSON value stored under (namespace, key).
    async fn get_json(
        &self,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Option<serde_json::Value>>;
    /// Fetch all (key, value) pairs whose key starts with the given prefix.
    async fn get_prefix(
        &self,
        namespace: &str,
        key_prefix: &str,
    ) -> anyhow::Result<Vec<(String, serde_json::Value)>>;
    /// Delete the value stored under (namespace, key).
    async fn delete(&self, namespace: &str, key: &str) -> anyhow::Result<()>;
    /// Atomically increment a counter and return the new value.
    async fn increment_counter(&self, namespace: &str, key: &str) -> anyhow::Result<i64>;
}

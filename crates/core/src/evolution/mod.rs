pub mod calc;
pub mod evolver;

pub use evolver::{load_population, EvolverConfig, GenomeEvolver};

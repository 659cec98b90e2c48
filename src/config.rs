use crate::error::{ConfigError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

/// Number of random weight vectors drawn per run.
pub const DEFAULT_TRIALS: usize = 5000;

/// Upper bound on trials per run; every sample keeps its own weight vector.
pub const MAX_TRIALS: usize = 1_000_000;

/// Annual trading days for annualization.
pub const TRADING_DAYS: u32 = 252;

/// Trials per batch in the parallel sampler. Each batch owns one seeded generator.
pub const SAMPLER_BATCH_SIZE: usize = 1000;

/// Above this trial count the pipeline switches to the parallel sampler.
pub const PARALLEL_TRIAL_THRESHOLD: usize = 10_000;

/// Redraws allowed when a uniform draw sums to zero.
pub const MAX_DRAW_RETRIES: usize = 10;

/// Freshness window for cached market-data responses.
pub const CACHE_TTL_SECS: u64 = 86_400;

/// Directory for cached market-data responses.
pub const CACHE_DIR: &str = ".cache";

/// Attempts per market-data request before giving up.
pub const FETCH_MAX_ATTEMPTS: usize = 3;

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// How the pipeline picks between the sequential and the batched sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Parallel only above [`PARALLEL_TRIAL_THRESHOLD`] trials.
    #[default]
    Auto,
    Always,
    Never,
}

impl ParallelMode {
    pub fn use_parallel(self, trials: usize) -> bool {
        match self {
            Self::Auto => trials > PARALLEL_TRIAL_THRESHOLD,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub trials: usize,
    pub trading_days_per_year: u32,
    /// Fixed seed for reproducible runs; `None` seeds from OS entropy.
    pub seed: Option<u64>,
    pub parallel: ParallelMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            trials: DEFAULT_TRIALS,
            trading_days_per_year: TRADING_DAYS,
            seed: None,
            parallel: ParallelMode::Auto,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.trials < 1 {
            return Err(ConfigError::ZeroTrials.into());
        }
        if self.trials > MAX_TRIALS {
            return Err(ConfigError::TooManyTrials {
                trials: self.trials,
                max: MAX_TRIALS,
            }
            .into());
        }
        if self.trading_days_per_year == 0 {
            return Err(ConfigError::ZeroTradingDays.into());
        }
        Ok(())
    }

    /// Applies `FRONTIER_TRIALS`, `FRONTIER_TRADING_DAYS` and `FRONTIER_SEED`.
    /// Unparseable values are logged and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(trials) = env_parse::<usize>("FRONTIER_TRIALS") {
            self.trials = trials;
        }
        if let Some(days) = env_parse::<u32>("FRONTIER_TRADING_DAYS") {
            self.trading_days_per_year = days;
        }
        if let Some(seed) = env_parse::<u64>("FRONTIER_SEED") {
            self.seed = Some(seed);
        }
        self
    }

    pub fn make_rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={} ; expected a non-negative integer", key, trimmed);
            None
        }
    }
}

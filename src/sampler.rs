//! Monte Carlo search over random long-only portfolios.
//!
//! Every trial draws `k` uniforms in `[0, 1)`, normalizes them into weights,
//! and scores the portfolio against the mean vector and covariance matrix of
//! the log-return table. The best sample is the one with the highest Sharpe
//! ratio; ties keep the earliest trial.

use crate::config::{MAX_DRAW_RETRIES, SAMPLER_BATCH_SIZE};
use crate::error::{ConfigError, DataError, EngineError, Result};
use crate::returns::{LogReturnTable, ReturnStatistics};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

/// Non-negative weights summing to 1, in instrument column order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WeightVector(Vec<f64>);

impl WeightVector {
    /// Normalizes raw draws by their sum. `None` when the sum is not a
    /// positive finite number or a draw is negative.
    pub fn from_raw(raw: Vec<f64>) -> Option<Self> {
        if raw.iter().any(|&v| v < 0.0) {
            return None;
        }
        let sum: f64 = raw.iter().sum();
        if !(sum > 0.0 && sum.is_finite()) {
            return None;
        }
        Some(Self(raw.into_iter().map(|v| v / sum).collect()))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn sum(&self) -> f64 {
        self.0.iter().sum()
    }
}

/// One scored trial. `sharpe_ratio` is `None` when volatility is zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortfolioSample {
    pub weights: WeightVector,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
}

impl PortfolioSample {
    pub fn is_comparable(&self) -> bool {
        self.sharpe_ratio.is_some()
    }
}

/// All samples of one run, in trial order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SampleCloud(Vec<PortfolioSample>);

impl SampleCloud {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn samples(&self) -> &[PortfolioSample] {
        &self.0
    }

    pub fn comparable_count(&self) -> usize {
        self.0.iter().filter(|s| s.is_comparable()).count()
    }

    /// (min, max) of volatility and of expected return across the cloud.
    pub fn extent(&self) -> Option<((f64, f64), (f64, f64))> {
        let first = self.0.first()?;
        let init = (
            (first.volatility, first.volatility),
            (first.expected_return, first.expected_return),
        );
        Some(self.0.iter().fold(init, |((vmin, vmax), (rmin, rmax)), s| {
            (
                (vmin.min(s.volatility), vmax.max(s.volatility)),
                (rmin.min(s.expected_return), rmax.max(s.expected_return)),
            )
        }))
    }
}

impl From<Vec<PortfolioSample>> for SampleCloud {
    fn from(samples: Vec<PortfolioSample>) -> Self {
        Self(samples)
    }
}

/// The max-Sharpe sample of a cloud, with its trial index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BestPortfolio {
    pub index: usize,
    pub weights: WeightVector,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

fn validate(returns: &LogReturnTable, trials: usize, trading_days_per_year: u32) -> Result<()> {
    if trials < 1 {
        return Err(ConfigError::ZeroTrials.into());
    }
    if trading_days_per_year == 0 {
        return Err(ConfigError::ZeroTradingDays.into());
    }
    if returns.cols() == 0 {
        return Err(DataError::NoColumns.into());
    }
    Ok(())
}

fn draw_weights<R: Rng>(k: usize, rng: &mut R) -> Result<WeightVector> {
    for _ in 0..MAX_DRAW_RETRIES {
        let raw: Vec<f64> = (0..k).map(|_| rng.r#gen::<f64>()).collect();
        if let Some(weights) = WeightVector::from_raw(raw) {
            return Ok(weights);
        }
    }
    Err(EngineError::internal(format!(
        "random draw summed to zero {} times in a row",
        MAX_DRAW_RETRIES
    )))
}

/// Annualized return, volatility and Sharpe ratio of one weight vector.
pub fn evaluate(
    stats: &ReturnStatistics,
    weights: WeightVector,
    trading_days_per_year: u32,
) -> PortfolioSample {
    let days = trading_days_per_year as f64;
    let expected_return = stats.portfolio_return(weights.as_slice()) * days;
    // Degenerate covariance can round slightly below zero.
    let variance = (stats.portfolio_variance(weights.as_slice()) * days).max(0.0);
    let volatility = variance.sqrt();
    let sharpe_ratio = if volatility > 0.0 {
        Some(expected_return / volatility)
    } else {
        None
    };

    PortfolioSample {
        weights,
        expected_return,
        volatility,
        sharpe_ratio,
    }
}

fn run_trials<R: Rng>(
    stats: &ReturnStatistics,
    count: usize,
    trading_days_per_year: u32,
    rng: &mut R,
) -> Result<Vec<PortfolioSample>> {
    let k = stats.len();
    (0..count)
        .map(|_| -> Result<PortfolioSample> {
            Ok(evaluate(stats, draw_weights(k, rng)?, trading_days_per_year))
        })
        .collect()
}

/// Picks the highest Sharpe ratio, skipping zero-volatility samples.
/// A later sample must be strictly better to replace an earlier one.
pub fn select_best(cloud: &SampleCloud) -> Result<BestPortfolio> {
    let mut best: Option<(usize, f64)> = None;
    for (index, sample) in cloud.samples().iter().enumerate() {
        let Some(sharpe) = sample.sharpe_ratio else {
            continue;
        };
        match best {
            Some((_, best_sharpe)) if sharpe <= best_sharpe => {}
            _ => best = Some((index, sharpe)),
        }
    }

    let (index, sharpe_ratio) = best.ok_or(EngineError::DegenerateSample {
        trials: cloud.len(),
    })?;
    let sample = &cloud.samples()[index];
    Ok(BestPortfolio {
        index,
        weights: sample.weights.clone(),
        expected_return: sample.expected_return,
        volatility: sample.volatility,
        sharpe_ratio,
    })
}

/// Runs `trials` draws sequentially from `rng`.
pub fn simulate<R: Rng>(
    returns: &LogReturnTable,
    trials: usize,
    trading_days_per_year: u32,
    rng: &mut R,
) -> Result<(SampleCloud, BestPortfolio)> {
    validate(returns, trials, trading_days_per_year)?;
    let stats = ReturnStatistics::from_returns(returns)?;

    let cloud = SampleCloud(run_trials(&stats, trials, trading_days_per_year, rng)?);
    let best = select_best(&cloud)?;

    info!(
        "Sampled {} portfolios over {} instruments: best Sharpe {:.3} at trial {}",
        trials,
        stats.len(),
        best.sharpe_ratio,
        best.index
    );
    Ok((cloud, best))
}

/// Runs `trials` draws in fixed-size batches on the rayon pool.
///
/// One seed per batch is drawn from `rng` up front and batches are merged in
/// batch order, so the result depends only on `rng`, never on scheduling.
pub fn simulate_parallel<R: Rng>(
    returns: &LogReturnTable,
    trials: usize,
    trading_days_per_year: u32,
    rng: &mut R,
) -> Result<(SampleCloud, BestPortfolio)> {
    validate(returns, trials, trading_days_per_year)?;
    let stats = ReturnStatistics::from_returns(returns)?;

    let num_batches = trials.div_ceil(SAMPLER_BATCH_SIZE);
    let seeds: Vec<u64> = (0..num_batches).map(|_| rng.next_u64()).collect();

    let batches: Vec<Vec<PortfolioSample>> = seeds
        .into_par_iter()
        .enumerate()
        .map(|(i, seed)| -> Result<Vec<PortfolioSample>> {
            let mut batch_rng = StdRng::seed_from_u64(seed);
            let batch_size = if i == num_batches - 1 {
                trials - i * SAMPLER_BATCH_SIZE
            } else {
                SAMPLER_BATCH_SIZE
            };
            let samples = run_trials(&stats, batch_size, trading_days_per_year, &mut batch_rng)?;
            debug!("Batch {}/{} produced {} samples", i + 1, num_batches, samples.len());
            Ok(samples)
        })
        .collect::<Result<_>>()?;

    let cloud = SampleCloud(batches.into_iter().flatten().collect());
    let best = select_best(&cloud)?;

    info!(
        "Sampled {} portfolios over {} instruments in {} batches: best Sharpe {:.3} at trial {}",
        trials,
        stats.len(),
        num_batches,
        best.sharpe_ratio,
        best.index
    );
    Ok((cloud, best))
}

use crate::config::SimulationConfig;
use crate::data::PriceTable;
use crate::error::{DataError, Result};
use crate::returns::compute_log_returns;
use crate::sampler::{self, BestPortfolio, SampleCloud};
use chrono::NaiveDate;
use rand::Rng;
use serde::Serialize;
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// Weight of one instrument in the best portfolio, as a percentage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightShare {
    pub instrument: String,
    pub percent: f64,
}

/// Best-portfolio weights × 100, in instrument column order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PercentageBreakdown(Vec<WeightShare>);

impl PercentageBreakdown {
    #[cfg(test)]
    pub fn shares(&self) -> &[WeightShare] {
        &self.0
    }

    #[cfg(test)]
    pub fn get(&self, instrument: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|s| s.instrument == instrument)
            .map(|s| s.percent)
    }

    /// Shares ordered by descending weight.
    pub fn sorted_by_weight(&self) -> Vec<WeightShare> {
        let mut sorted = self.0.clone();
        sorted.sort_by(|a, b| b.percent.total_cmp(&a.percent));
        sorted
    }
}

/// The triple shown next to the charts.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Summary {
    #[serde(rename = "return")]
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// Adjusted-close series of one instrument over the aligned dates.
/// Missing cells are left out of `points`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PriceHistory {
    pub instrument: String,
    pub first_price: f64,
    pub last_price: f64,
    pub points: Vec<PricePoint>,
}

/// Everything one optimization run produces.
#[derive(Clone, Debug, Serialize)]
pub struct SimulationReport {
    pub instruments: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub trials: usize,
    pub trading_days_per_year: u32,
    pub seed: Option<u64>,
    pub history: Vec<PriceHistory>,
    pub cloud: SampleCloud,
    pub best: BestPortfolio,
    pub breakdown: PercentageBreakdown,
    pub summary: Summary,
}

// ──────────────────────────────────────────────────────────────────────────────
// Projections
// ──────────────────────────────────────────────────────────────────────────────

pub fn to_percentage_breakdown(
    best: &BestPortfolio,
    instrument_order: &[String],
) -> Result<PercentageBreakdown> {
    let weights = best.weights.as_slice();
    if weights.len() != instrument_order.len() {
        return Err(DataError::BreakdownLengthMismatch {
            weights: weights.len(),
            instruments: instrument_order.len(),
        }
        .into());
    }

    Ok(PercentageBreakdown(
        instrument_order
            .iter()
            .zip(weights)
            .map(|(instrument, w)| WeightShare {
                instrument: instrument.clone(),
                percent: w * 100.0,
            })
            .collect(),
    ))
}

pub fn summary_of(best: &BestPortfolio) -> Summary {
    Summary {
        expected_return: best.expected_return,
        volatility: best.volatility,
        sharpe_ratio: best.sharpe_ratio,
    }
}

fn price_history(prices: &PriceTable) -> Vec<PriceHistory> {
    prices
        .instruments()
        .iter()
        .enumerate()
        .filter_map(|(j, instrument)| {
            let points: Vec<PricePoint> = prices
                .dates()
                .iter()
                .zip(prices.column(j))
                .filter_map(|(&date, price)| price.map(|price| PricePoint { date, price }))
                .collect();
            let first_price = points.first()?.price;
            let last_price = points.last()?.price;
            Some(PriceHistory {
                instrument: instrument.clone(),
                first_price,
                last_price,
                points,
            })
        })
        .collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Top-Level Command: Run Portfolio Optimization
// ──────────────────────────────────────────────────────────────────────────────

/// Full pipeline: prices → log returns → sampler → breakdown and summary.
pub fn run_optimization<R: Rng>(
    prices: &PriceTable,
    config: &SimulationConfig,
    rng: &mut R,
) -> Result<SimulationReport> {
    config.validate()?;

    info!(
        "Optimizing {} instruments over {} dates ({}..{}), {} trials",
        prices.cols(),
        prices.rows(),
        prices.dates()[0],
        prices.dates()[prices.rows() - 1],
        config.trials
    );

    let returns = compute_log_returns(prices)?;
    let (cloud, best) = if config.parallel.use_parallel(config.trials) {
        sampler::simulate_parallel(&returns, config.trials, config.trading_days_per_year, rng)?
    } else {
        sampler::simulate(&returns, config.trials, config.trading_days_per_year, rng)?
    };

    let breakdown = to_percentage_breakdown(&best, prices.instruments())?;
    let summary = summary_of(&best);

    Ok(SimulationReport {
        instruments: prices.instruments().to_vec(),
        start_date: prices.dates()[0],
        end_date: prices.dates()[prices.rows() - 1],
        trials: config.trials,
        trading_days_per_year: config.trading_days_per_year,
        seed: config.seed,
        history: price_history(prices),
        cloud,
        best,
        breakdown,
        summary,
    })
}

/// Seeds from `config.seed` (or OS entropy) and runs the pipeline.
pub fn run_with_config(prices: &PriceTable, config: &SimulationConfig) -> Result<SimulationReport> {
    let mut rng = config.make_rng();
    run_optimization(prices, config, &mut rng)
}

/// Pretty-prints the report to stdout.
pub fn print_report(report: &SimulationReport) {
    let s = &report.summary;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║              Max-Sharpe Portfolio (Monte Carlo)            ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!(
        "║  Period                 : {} .. {}               ║",
        report.start_date, report.end_date
    );
    println!(
        "║  Trials                 : {:>9}                        ║",
        report.trials
    );
    println!(
        "║  Expected Annual Return : {:>+7.2}%                        ║",
        s.expected_return * 100.0
    );
    println!(
        "║  Expected Annual Vol    : {:>7.2}%                        ║",
        s.volatility * 100.0
    );
    println!(
        "║  Sharpe Ratio           : {:>7.2}                         ║",
        s.sharpe_ratio
    );
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol      Weight     First Price   Last Price           ║");
    println!("╠════════════════════════════════════════════════════════════╣");

    for share in report.breakdown.sorted_by_weight() {
        let history = report
            .history
            .iter()
            .find(|h| h.instrument == share.instrument);
        match history {
            Some(h) => println!(
                "║  {:<8} {:>7.2}%   ${:>10.2}  ${:>10.2}          ║",
                share.instrument, share.percent, h.first_price, h.last_price
            ),
            None => println!(
                "║  {:<8} {:>7.2}%                                       ║",
                share.instrument, share.percent
            ),
        }
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    if let Some(((vmin, vmax), (rmin, rmax))) = report.cloud.extent() {
        println!(
            "║  Cloud volatility       : {:>6.2}% .. {:>6.2}%              ║",
            vmin * 100.0,
            vmax * 100.0
        );
        println!(
            "║  Cloud return           : {:>+6.2}% .. {:>+6.2}%              ║",
            rmin * 100.0,
            rmax * 100.0
        );
    }
    println!(
        "║  Comparable samples     : {:>9} / {:<9}              ║",
        report.cloud.comparable_count(),
        report.cloud.len()
    );
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParallelMode;
    use crate::error::{ConfigError, EngineError};
    use crate::returns::tests::table;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn prices() -> PriceTable {
        table(&[
            ("AAPL", [100.0, 102.0, 101.0, 105.0, 104.0, 107.0]),
            ("MSFT", [20.0, 19.5, 20.5, 21.0, 20.0, 20.2]),
            ("GOOGL", [7.0, 7.1, 7.3, 7.2, 7.6, 7.5]),
        ])
    }

    fn config(trials: usize) -> SimulationConfig {
        SimulationConfig {
            trials,
            seed: Some(17),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_breakdown_pairs_weights_with_instruments() {
        let report = run_with_config(&prices(), &config(400)).unwrap();
        let shares = report.breakdown.shares();

        assert_eq!(shares.len(), 3);
        assert_eq!(shares[0].instrument, "AAPL");
        assert_eq!(shares[2].instrument, "GOOGL");
        for (share, w) in shares.iter().zip(report.best.weights.as_slice()) {
            assert!((share.percent - w * 100.0).abs() < 1e-12);
        }
        let total: f64 = shares.iter().map(|s| s.percent).sum();
        assert!((total - 100.0).abs() < 1e-7);
        assert_eq!(report.breakdown.get("MSFT"), Some(shares[1].percent));
        assert_eq!(report.breakdown.get("TSLA"), None);
    }

    #[test]
    fn test_breakdown_rejects_length_mismatch() {
        let report = run_with_config(&prices(), &config(10)).unwrap();
        let err = to_percentage_breakdown(&report.best, &["AAPL".to_string()]).unwrap_err();
        assert_eq!(
            err,
            EngineError::Data(DataError::BreakdownLengthMismatch {
                weights: 3,
                instruments: 1
            })
        );
    }

    #[test]
    fn test_summary_is_a_pure_projection() {
        let report = run_with_config(&prices(), &config(200)).unwrap();
        let a = summary_of(&report.best);
        let b = summary_of(&report.best);

        assert_eq!(a, b);
        assert_eq!(a, report.summary);
        assert_eq!(a.sharpe_ratio, report.best.sharpe_ratio);
        assert_eq!(a.expected_return, report.best.expected_return);
        assert_eq!(a.volatility, report.best.volatility);
    }

    #[test]
    fn test_report_is_reproducible_with_seed() {
        let a = run_with_config(&prices(), &config(300)).unwrap();
        let b = run_with_config(&prices(), &config(300)).unwrap();
        assert_eq!(a.cloud, b.cloud);
        assert_eq!(a.best, b.best);
        assert_eq!(a.seed, Some(17));
    }

    #[test]
    fn test_parallel_mode_runs_through_pipeline() {
        let cfg = SimulationConfig {
            parallel: ParallelMode::Always,
            ..config(2500)
        };
        let report = run_with_config(&prices(), &cfg).unwrap();
        assert_eq!(report.cloud.len(), 2500);
        assert_eq!(report.trials, 2500);
    }

    #[test]
    fn test_invalid_config_fails_before_sampling() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = run_optimization(&prices(), &config(0), &mut rng).unwrap_err();
        assert_eq!(err, EngineError::Config(ConfigError::ZeroTrials));
    }

    #[test]
    fn test_report_carries_history_and_dates() {
        let p = prices();
        let report = run_with_config(&p, &config(50)).unwrap();

        assert_eq!(report.start_date, p.dates()[0]);
        assert_eq!(report.end_date, p.dates()[5]);
        assert_eq!(report.history.len(), 3);
        for (h, instrument) in report.history.iter().zip(p.instruments()) {
            assert_eq!(&h.instrument, instrument);
            assert_eq!(h.points.len(), p.rows());
        }

        let aapl = &report.history[0];
        assert_eq!(aapl.first_price, 100.0);
        assert_eq!(aapl.last_price, 107.0);
        assert_eq!(aapl.points[3], PricePoint { date: p.dates()[3], price: 105.0 });
    }

    #[test]
    fn test_history_skips_missing_prices() {
        let p = PriceTable::new(
            table(&[("A", [1.0, 1.0, 1.0])]).dates().to_vec(),
            vec!["A".to_string(), "B".to_string()],
            vec![vec![Some(10.0), None, Some(12.0)], vec![None, None, None]],
        )
        .unwrap();
        let history = price_history(&p);

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].instrument, "A");
        assert_eq!(history[0].points.len(), 2);
        assert_eq!(history[0].last_price, 12.0);
    }

    #[test]
    fn test_report_serializes_summary_keys() {
        let report = run_with_config(&prices(), &config(20)).unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert!(json["summary"]["return"].is_number());
        assert!(json["summary"]["sharpe_ratio"].is_number());
        assert_eq!(json["cloud"].as_array().unwrap().len(), 20);
        assert_eq!(json["breakdown"][0]["instrument"], "AAPL");
        assert_eq!(json["best"]["weights"].as_array().unwrap().len(), 3);
        assert_eq!(json["history"][1]["points"].as_array().unwrap().len(), 6);
        assert_eq!(json["history"][1]["points"][0]["price"], 20.0);
    }
}

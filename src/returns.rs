//! Log-return transform and the per-instrument statistics the sampler reuses.

use crate::data::PriceTable;
use crate::error::{DataError, Result};
use chrono::NaiveDate;

/// Daily log-returns, one row fewer than the price table it came from.
///
/// Cells are `NaN` where either price was missing or non-positive.
#[derive(Clone, Debug)]
pub struct LogReturnTable {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl LogReturnTable {
    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn column(&self, index: usize) -> &[f64] {
        &self.columns[index]
    }

    pub fn rows(&self) -> usize {
        self.dates.len()
    }

    pub fn cols(&self) -> usize {
        self.instruments.len()
    }
}

fn log_return(prev: Option<f64>, curr: Option<f64>) -> f64 {
    match (prev, curr) {
        (Some(p), Some(c)) if p > 0.0 && c > 0.0 && p.is_finite() && c.is_finite() => (c / p).ln(),
        _ => f64::NAN,
    }
}

/// `ln(price[i] / price[i-1])` per column; row 0 is dropped.
pub fn compute_log_returns(prices: &PriceTable) -> Result<LogReturnTable> {
    if prices.rows() < 2 {
        return Err(DataError::TooFewRows {
            required: 2,
            available: prices.rows(),
        }
        .into());
    }
    if prices.cols() == 0 {
        return Err(DataError::NoColumns.into());
    }

    let columns = (0..prices.cols())
        .map(|j| {
            prices
                .column(j)
                .windows(2)
                .map(|w| log_return(w[0], w[1]))
                .collect()
        })
        .collect();

    Ok(LogReturnTable {
        dates: prices.dates()[1..].to_vec(),
        instruments: prices.instruments().to_vec(),
        columns,
    })
}

/// Mean vector and sample covariance matrix of daily log-returns.
#[derive(Clone, Debug)]
pub struct ReturnStatistics {
    pub means: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
}

impl ReturnStatistics {
    /// Fails on the first undefined cell, scanning column by column.
    pub fn from_returns(returns: &LogReturnTable) -> Result<Self> {
        let n = returns.cols();
        if n == 0 {
            return Err(DataError::NoColumns.into());
        }
        let rows = returns.rows();
        if rows < 2 {
            return Err(DataError::InsufficientReturns {
                required: 2,
                available: rows,
            }
            .into());
        }

        for j in 0..n {
            if let Some(i) = returns.column(j).iter().position(|r| !r.is_finite()) {
                return Err(DataError::UndefinedReturn {
                    instrument: returns.instruments()[j].clone(),
                    date: returns.dates()[i].to_string(),
                }
                .into());
            }
        }

        let means: Vec<f64> = (0..n)
            .map(|j| returns.column(j).iter().sum::<f64>() / rows as f64)
            .collect();

        let mut covariance = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let ci = returns.column(i);
                let cj = returns.column(j);
                let sum: f64 = ci
                    .iter()
                    .zip(cj)
                    .map(|(a, b)| (a - means[i]) * (b - means[j]))
                    .sum();
                let c = sum / (rows as f64 - 1.0);
                covariance[i][j] = c;
                covariance[j][i] = c;
            }
        }

        Ok(Self { means, covariance })
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn portfolio_return(&self, weights: &[f64]) -> f64 {
        weights.iter().zip(self.means.iter()).map(|(w, r)| w * r).sum()
    }

    pub fn portfolio_variance(&self, weights: &[f64]) -> f64 {
        let n = weights.len();
        let mut var = 0.0;
        for i in 0..n {
            for j in 0..n {
                var += weights[i] * weights[j] * self.covariance[i][j];
            }
        }
        var
    }
}

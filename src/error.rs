//! Error types for the simulation engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Malformed or insufficient price/return input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Insufficient rows: need at least {required} dates, got {available}")]
    TooFewRows { required: usize, available: usize },

    #[error("Price table has no instrument columns")]
    NoColumns,

    #[error("Instrument {instrument} appears more than once")]
    DuplicateInstrument { instrument: String },

    #[error("Expected {expected} price columns, got {actual}")]
    ColumnCountMismatch { expected: usize, actual: usize },

    #[error("Column {instrument} has {actual} cells, expected {expected}")]
    ColumnLengthMismatch {
        instrument: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dates must be strictly increasing: {date} follows {previous}")]
    UnorderedDates { previous: String, date: String },

    #[error("Undefined log-return for {instrument} on {date} (missing or non-positive price)")]
    UndefinedReturn { instrument: String, date: String },

    #[error("Insufficient returns: need at least {required} rows for covariance, got {available}")]
    InsufficientReturns { required: usize, available: usize },

    #[error("Cell for {instrument} at row {row} is not numeric: {value:?}")]
    UncoercibleCell {
        instrument: String,
        row: usize,
        value: String,
    },

    #[error("No price data for instrument {instrument}")]
    NoData { instrument: String },

    #[error("Invalid instrument symbol {symbol:?}: allowed characters are A-Z 0-9 . ^ = -")]
    InvalidSymbol { symbol: String },

    #[error("Weight vector has {weights} entries but {instruments} instruments were given")]
    BreakdownLengthMismatch { weights: usize, instruments: usize },
}

/// Invalid simulation parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Trial count must be at least 1")]
    ZeroTrials,

    #[error("Trading days per year must be greater than 0")]
    ZeroTradingDays,

    #[error("Trial count {trials} exceeds the limit of {max}")]
    TooManyTrials { trials: usize, max: usize },
}

/// Error types for the simulation engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every trial produced a zero-volatility sample, so nothing is selectable.
    #[error("All {trials} trials produced zero volatility; no portfolio can be selected")]
    DegenerateSample { trials: usize },

    #[error("Internal invariant violated: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error stems from caller input rather than the engine.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::Internal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_error_wraps_into_engine_error() {
        let err: EngineError = DataError::NoColumns.into();
        assert_eq!(err, EngineError::Data(DataError::NoColumns));
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("no instrument columns"));
    }

    #[test]
    fn test_internal_error_is_not_caller_error() {
        let err = EngineError::internal("zero-sum draw");
        assert!(!err.is_caller_error());
        assert_eq!(err.to_string(), "Internal invariant violated: zero-sum draw");
    }

    #[test]
    fn test_undefined_return_names_instrument_and_date() {
        let err = DataError::UndefinedReturn {
            instrument: "AAPL".to_string(),
            date: "2024-01-03".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("AAPL"));
        assert!(msg.contains("2024-01-03"));
    }
}

use crate::config::{CACHE_DIR, CACHE_TTL_SECS, FETCH_MAX_ATTEMPTS};
use crate::error::{DataError, EngineError, Result as EngineResult};
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// Adjusted closing prices, one row per date and one column per instrument.
///
/// Rows are positional-aligned: `columns[j][i]` is the price of
/// `instruments[j]` on `dates[i]`. Missing cells are `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PriceTableParts")]
pub struct PriceTable {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
}

#[derive(Deserialize)]
struct PriceTableParts {
    dates: Vec<NaiveDate>,
    instruments: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
}

impl TryFrom<PriceTableParts> for PriceTable {
    type Error = EngineError;

    fn try_from(parts: PriceTableParts) -> EngineResult<Self> {
        Self::new(parts.dates, parts.instruments, parts.columns)
    }
}

impl PriceTable {
    pub fn new(
        dates: Vec<NaiveDate>,
        instruments: Vec<String>,
        columns: Vec<Vec<Option<f64>>>,
    ) -> EngineResult<Self> {
        if instruments.is_empty() {
            return Err(DataError::NoColumns.into());
        }
        if dates.len() < 2 {
            return Err(DataError::TooFewRows {
                required: 2,
                available: dates.len(),
            }
            .into());
        }

        let mut seen = HashSet::new();
        for instrument in &instruments {
            if !seen.insert(instrument.as_str()) {
                return Err(DataError::DuplicateInstrument {
                    instrument: instrument.clone(),
                }
                .into());
            }
        }

        if columns.len() != instruments.len() {
            return Err(DataError::ColumnCountMismatch {
                expected: instruments.len(),
                actual: columns.len(),
            }
            .into());
        }
        for (instrument, column) in instruments.iter().zip(&columns) {
            if column.len() != dates.len() {
                return Err(DataError::ColumnLengthMismatch {
                    instrument: instrument.clone(),
                    expected: dates.len(),
                    actual: column.len(),
                }
                .into());
            }
        }

        if let Some(w) = dates.windows(2).find(|w| w[1] <= w[0]) {
            return Err(DataError::UnorderedDates {
                previous: w[0].to_string(),
                date: w[1].to_string(),
            }
            .into());
        }

        Ok(Self {
            dates,
            instruments,
            columns,
        })
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[String] {
        &self.instruments
    }

    pub fn column(&self, index: usize) -> &[Option<f64>] {
        &self.columns[index]
    }

    pub fn rows(&self) -> usize {
        self.dates.len()
    }

    pub fn cols(&self) -> usize {
        self.instruments.len()
    }

    /// Reads a table with header `Date,<id>,<id>,...` and ISO dates.
    ///
    /// Empty cells and `NaN` are missing prices; any other non-numeric text is
    /// rejected with [`DataError::UncoercibleCell`].
    pub fn from_csv_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let headers = rdr.headers()?.clone();
        let instruments: Vec<String> = headers.iter().skip(1).map(|h| h.to_string()).collect();

        let mut dates = Vec::new();
        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); instruments.len()];

        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let raw_date = record.get(0).unwrap_or_default();
            dates.push(parse_date(raw_date).ok_or_else(|| {
                anyhow::anyhow!("row {}: cannot parse date {:?}", row, raw_date)
            })?);

            for (j, instrument) in instruments.iter().enumerate() {
                let raw = record.get(j + 1).unwrap_or_default();
                columns[j].push(parse_cell(instrument, row, raw)?);
            }
        }

        Ok(Self::new(dates, instruments, columns)?)
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("cannot open {}: {}", path.display(), e))?;
        let table = Self::from_csv_reader(std::io::BufReader::new(file))?;
        info!(
            "Loaded {} rows x {} instruments from {}",
            table.rows(),
            table.cols(),
            path.display()
        );
        Ok(table)
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| raw.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()))
}

fn parse_cell(instrument: &str, row: usize, raw: &str) -> std::result::Result<Option<f64>, DataError> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    raw.parse::<f64>()
        .map(Some)
        .map_err(|_| DataError::UncoercibleCell {
            instrument: instrument.to_string(),
            row,
            value: raw.to_string(),
        })
}

/// Splits a user-entered instrument list on whitespace and commas.
/// Upper-cases and de-duplicates, keeping the first occurrence.
pub fn parse_symbols(text: &str) -> EngineResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut symbols = Vec::new();
    for raw in text.split(|c: char| c.is_whitespace() || c == ',') {
        let symbol = raw.trim().to_uppercase();
        if symbol.is_empty() {
            continue;
        }
        check_symbol(&symbol)?;
        if seen.insert(symbol.clone()) {
            symbols.push(symbol);
        }
    }
    Ok(symbols)
}

/// Ticker characters only (`A-Z 0-9 . ^ = -`), never a leading dot.
/// Symbols become cache file names and URL path segments.
fn check_symbol(symbol: &str) -> EngineResult<()> {
    let valid = !symbol.is_empty()
        && !symbol.starts_with('.')
        && symbol
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '.' | '^' | '=' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DataError::InvalidSymbol {
            symbol: symbol.to_string(),
        }
        .into())
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance daily history
// ──────────────────────────────────────────────────────────────────────────────

/// Daily adjusted closes for one instrument.
#[derive(Clone, Debug)]
pub struct PriceSeries {
    pub symbol: String,
    pub points: Vec<(NaiveDate, f64)>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Option<Vec<YahooAdjClose>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    close: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

fn series_from_response(symbol: &str, response: &YahooChartResponse) -> Result<PriceSeries> {
    if let Some(err) = &response.chart.error {
        if !err.is_null() {
            return Err(anyhow::anyhow!("Yahoo returned an error for {}: {}", symbol, err));
        }
    }
    let result = response
        .chart
        .result
        .as_ref()
        .and_then(|r| r.first())
        .ok_or(anyhow::anyhow!("No data found for {}", symbol))?;

    let adjusted = result
        .indicators
        .adjclose
        .as_ref()
        .and_then(|a| a.first())
        .map(|a| &a.adjclose)
        .filter(|a| !a.is_empty());
    let prices = match adjusted {
        Some(prices) => prices,
        None => {
            warn!("{}: no adjusted close series, falling back to raw close", symbol);
            &result
                .indicators
                .quote
                .first()
                .ok_or(anyhow::anyhow!("No quote series for {}", symbol))?
                .close
        }
    };

    let points = result
        .timestamp
        .iter()
        .zip(prices.iter())
        .filter_map(|(&ts, price)| {
            let date = Utc.timestamp_opt(ts, 0).single()?.date_naive();
            price.map(|p| (date, p))
        })
        .collect();

    Ok(PriceSeries {
        symbol: symbol.to_string(),
        points,
    })
}

/// Fetches daily adjusted closes for `[start, end)` from Yahoo Finance,
/// going through the on-disk cache.
pub async fn fetch_series(symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<PriceSeries> {
    check_symbol(symbol)?;
    let cache_dir = Path::new(CACHE_DIR);
    std::fs::create_dir_all(cache_dir)?;
    let cache_file = cache_dir.join(format!("{}_{}_{}.json", symbol, start, end));

    let response = match read_cache(&cache_file) {
        Some(cached) => {
            info!("{}: using cached history {}", symbol, cache_file.display());
            cached
        }
        None => {
            let fresh = request_chart(symbol, start, end).await?;
            if let Err(e) = write_cache(&cache_file, &fresh) {
                warn!("{}: could not cache history: {}", symbol, e);
            }
            fresh
        }
    };

    series_from_response(symbol, &response)
}

/// Cached response if the file exists, is younger than the TTL and parses.
fn read_cache(path: &Path) -> Option<YahooChartResponse> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let age = std::time::SystemTime::now().duration_since(modified).ok()?;
    if age.as_secs() >= CACHE_TTL_SECS {
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    match serde_json::from_reader(std::io::BufReader::new(file)) {
        Ok(response) => Some(response),
        Err(e) => {
            warn!("Ignoring unreadable cache file {}: {}", path.display(), e);
            None
        }
    }
}

fn write_cache(path: &Path, response: &YahooChartResponse) -> Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), response)?;
    Ok(())
}

async fn request_chart(symbol: &str, start: NaiveDate, end: NaiveDate) -> Result<YahooChartResponse> {
    let period1 = start.and_time(NaiveTime::MIN).and_utc().timestamp();
    let period2 = end.and_time(NaiveTime::MIN).and_utc().timestamp();
    let url = format!(
        "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplits",
        symbol, period1, period2
    );
    let client = reqwest::Client::new();

    let mut attempt = 1;
    loop {
        let outcome = async {
            let resp = client
                .get(&url)
                .header("User-Agent", "Mozilla/5.0")
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, anyhow::Error>(resp.json::<YahooChartResponse>().await?)
        }
        .await;

        match outcome {
            Ok(response) => return Ok(response),
            Err(e) if attempt >= FETCH_MAX_ATTEMPTS => return Err(e),
            Err(e) => warn!(
                "{}: chart request {}/{} failed, retrying: {}",
                symbol, attempt, FETCH_MAX_ATTEMPTS, e
            ),
        }
        attempt += 1;
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

/// Builds a table from independently fetched series, keeping only the dates
/// every series has a price for.
pub fn align_series(series: &[PriceSeries]) -> EngineResult<PriceTable> {
    if series.is_empty() {
        return Err(DataError::NoColumns.into());
    }

    let mut common: Option<BTreeSet<NaiveDate>> = None;
    let mut total = BTreeSet::new();
    for s in series {
        if s.points.is_empty() {
            return Err(DataError::NoData {
                instrument: s.symbol.clone(),
            }
            .into());
        }
        let dates: BTreeSet<NaiveDate> = s.points.iter().map(|(d, _)| *d).collect();
        total.extend(dates.iter().copied());
        common = Some(match common {
            Some(acc) => acc.intersection(&dates).copied().collect(),
            None => dates,
        });
    }
    let dates: Vec<NaiveDate> = common.unwrap_or_default().into_iter().collect();

    let dropped = total.len() - dates.len();
    if dropped > 0 {
        warn!(
            "Dropped {} dates not covered by every instrument ({} remain)",
            dropped,
            dates.len()
        );
    }

    let columns = series
        .iter()
        .map(|s| {
            let by_date: HashMap<NaiveDate, f64> = s.points.iter().copied().collect();
            dates.iter().map(|d| by_date.get(d).copied()).collect()
        })
        .collect();
    let instruments = series.iter().map(|s| s.symbol.clone()).collect();

    PriceTable::new(dates, instruments, columns)
}

/// Fetches every instrument and aligns them into one table.
pub async fn fetch_price_table(
    symbols: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<PriceTable> {
    if start >= end {
        return Err(anyhow::anyhow!(
            "start date {} must be before end date {}",
            start,
            end
        ));
    }

    for symbol in symbols {
        check_symbol(symbol)?;
    }

    let mut series = Vec::with_capacity(symbols.len());
    for symbol in symbols {
        let s = fetch_series(symbol, start, end).await.map_err(|e| {
            anyhow::anyhow!(
                "historical fetch failed: symbol={}, range={}..{}, reason={}",
                symbol,
                start,
                end,
                e
            )
        })?;
        info!("{}: {} daily prices", symbol, s.points.len());
        series.push(s);
    }

    Ok(align_series(&series)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_new_rejects_single_row() {
        let err = PriceTable::new(vec![d("2024-01-02")], vec!["A".into()], vec![vec![Some(1.0)]])
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Data(DataError::TooFewRows {
                required: 2,
                available: 1
            })
        );
    }

    #[test]
    fn test_new_rejects_duplicate_instrument() {
        let err = PriceTable::new(
            vec![d("2024-01-02"), d("2024-01-03")],
            vec!["A".into(), "A".into()],
            vec![vec![Some(1.0), Some(2.0)], vec![Some(1.0), Some(2.0)]],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Data(DataError::DuplicateInstrument { .. })
        ));
    }

    #[test]
    fn test_new_rejects_unordered_dates() {
        let err = PriceTable::new(
            vec![d("2024-01-03"), d("2024-01-02")],
            vec!["A".into()],
            vec![vec![Some(1.0), Some(2.0)]],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Data(DataError::UnorderedDates { .. })));
    }

    #[test]
    fn test_new_rejects_ragged_column() {
        let err = PriceTable::new(
            vec![d("2024-01-02"), d("2024-01-03")],
            vec!["A".into()],
            vec![vec![Some(1.0)]],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Data(DataError::ColumnLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_csv_loader_reads_missing_cells() {
        let csv = "Date,AAPL,MSFT\n2024-01-02,100.0,200\n2024-01-03,,NaN\n2024-01-04 00:00:00,102.5,201\n";
        let table = PriceTable::from_csv_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.rows(), 3);
        assert_eq!(table.instruments(), &["AAPL".to_string(), "MSFT".to_string()]);
        assert_eq!(table.column(0), &[Some(100.0), None, Some(102.5)]);
        assert_eq!(table.column(1), &[Some(200.0), None, Some(201.0)]);
        assert_eq!(table.dates()[2], d("2024-01-04"));
    }

    #[test]
    fn test_csv_loader_rejects_text_cell() {
        let csv = "Date,AAPL\n2024-01-02,100.0\n2024-01-03,abc\n";
        let err = PriceTable::from_csv_reader(csv.as_bytes()).unwrap_err();
        let data_err = err.downcast_ref::<DataError>().unwrap();
        assert_eq!(
            data_err,
            &DataError::UncoercibleCell {
                instrument: "AAPL".to_string(),
                row: 1,
                value: "abc".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_symbols_dedups_in_order() {
        assert_eq!(
            parse_symbols("aapl msft,  googl\nAAPL ,").unwrap(),
            vec!["AAPL".to_string(), "MSFT".to_string(), "GOOGL".to_string()]
        );
        assert!(parse_symbols("  , ").unwrap().is_empty());
        assert_eq!(
            parse_symbols("brk-b ^gspc eurusd=x 0700.hk").unwrap(),
            vec!["BRK-B", "^GSPC", "EURUSD=X", "0700.HK"]
        );
    }

    #[test]
    fn test_parse_symbols_rejects_path_characters() {
        for bad in ["../../tmp/pwned", "AAPL/..", "..", "A\\B", "A%2F"] {
            let err = parse_symbols(&format!("MSFT {}", bad)).unwrap_err();
            assert!(
                matches!(err, EngineError::Data(DataError::InvalidSymbol { .. })),
                "{} accepted",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_price_table_rejects_bad_symbol_before_fetching() {
        let err = fetch_price_table(&["../X".to_string()], d("2024-01-01"), d("2024-02-01"))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Data(DataError::InvalidSymbol { .. }))
        ));
    }

    #[test]
    fn test_series_prefers_adjusted_close() {
        let json = r#"{"chart":{"result":[{"timestamp":[1704205800,1704292200,1704378600],
            "indicators":{"quote":[{"close":[10.0,11.0,12.0]}],
            "adjclose":[{"adjclose":[9.5,null,11.5]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let series = series_from_response("TEST", &response).unwrap();

        assert_eq!(series.points.len(), 2);
        assert_eq!(series.points[0], (d("2024-01-02"), 9.5));
        assert_eq!(series.points[1], (d("2024-01-04"), 11.5));
    }

    #[test]
    fn test_series_falls_back_to_close() {
        let json = r#"{"chart":{"result":[{"timestamp":[1704205800,1704292200],
            "indicators":{"quote":[{"close":[10.0,11.0]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        let series = series_from_response("TEST", &response).unwrap();
        assert_eq!(series.points, vec![(d("2024-01-02"), 10.0), (d("2024-01-03"), 11.0)]);
    }

    #[test]
    fn test_series_reports_provider_error() {
        let json = r#"{"chart":{"result":null,"error":{"code":"Not Found"}}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();
        assert!(series_from_response("NOPE", &response).is_err());
    }

    #[test]
    fn test_cache_roundtrip_ignores_unreadable_file() {
        let path = std::env::temp_dir().join(format!("frontier_sim_cache_{}.json", std::process::id()));
        let json = r#"{"chart":{"result":[{"timestamp":[1704205800],
            "indicators":{"quote":[{"close":[10.0]}]}}],"error":null}}"#;
        let response: YahooChartResponse = serde_json::from_str(json).unwrap();

        assert!(read_cache(&path).is_none());
        write_cache(&path, &response).unwrap();
        let cached = read_cache(&path).unwrap();
        let series = series_from_response("TEST", &cached).unwrap();
        assert_eq!(series.points, vec![(d("2024-01-02"), 10.0)]);

        std::fs::write(&path, "not json").unwrap();
        assert!(read_cache(&path).is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_align_series_keeps_common_dates() {
        let a = PriceSeries {
            symbol: "A".into(),
            points: vec![(d("2024-01-02"), 1.0), (d("2024-01-03"), 2.0), (d("2024-01-04"), 3.0)],
        };
        let b = PriceSeries {
            symbol: "B".into(),
            points: vec![(d("2024-01-03"), 20.0), (d("2024-01-04"), 30.0), (d("2024-01-05"), 40.0)],
        };
        let table = align_series(&[a, b]).unwrap();

        assert_eq!(table.dates(), &[d("2024-01-03"), d("2024-01-04")]);
        assert_eq!(table.column(0), &[Some(2.0), Some(3.0)]);
        assert_eq!(table.column(1), &[Some(20.0), Some(30.0)]);
    }

    #[test]
    fn test_align_series_rejects_empty_instrument() {
        let a = PriceSeries {
            symbol: "A".into(),
            points: vec![(d("2024-01-02"), 1.0), (d("2024-01-03"), 2.0)],
        };
        let b = PriceSeries {
            symbol: "B".into(),
            points: vec![],
        };
        let err = align_series(&[a, b]).unwrap_err();
        assert_eq!(
            err,
            EngineError::Data(DataError::NoData {
                instrument: "B".to_string()
            })
        );
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"dates":["2024-01-02"],"instruments":["A"],"columns":[[1.0]]}"#;
        assert!(serde_json::from_str::<PriceTable>(json).is_err());

        let json = r#"{"dates":["2024-01-02","2024-01-03"],"instruments":["A"],"columns":[[1.0,null]]}"#;
        let table: PriceTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.column(0), &[Some(1.0), None]);
    }
}

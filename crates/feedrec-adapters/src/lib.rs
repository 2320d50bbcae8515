//! Feed adapters: per-feed column layout, URL construction and CSV row parsing.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord, Trim};
use feedrec_core::{AttrValue, Attributes, CandidateEntity, ColumnKind, ColumnSpec, FeedSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "feedrec-adapters";

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Earnings,
    MarketCap,
}

impl FeedKind {
    pub const ALL: [FeedKind; 2] = [FeedKind::Earnings, FeedKind::MarketCap];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::Earnings => "earnings",
            FeedKind::MarketCap => "marketcap",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earnings" | "earnings-calendar" => Ok(FeedKind::Earnings),
            "marketcap" | "market-cap" | "companiesmarketcap" => Ok(FeedKind::MarketCap),
            other => Err(AdapterError::UnknownFeed(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unknown feed {0:?} (expected one of: earnings, marketcap)")]
    UnknownFeed(String),
    #[error("feed {feed} requires setting {setting}")]
    MissingSetting { feed: FeedKind, setting: &'static str },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("feed header is missing column {column:?}")]
    MissingColumn { column: &'static str },
    #[error("line {line}: column {column:?} is empty")]
    MissingValue { line: u64, column: &'static str },
    #[error("line {line}: column {column:?} has invalid value {value:?}: {reason}")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings an adapter needs to build its download URL.
#[derive(Debug, Clone, Default)]
pub struct FeedSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

pub trait FeedAdapter: Send + Sync {
    fn kind(&self) -> FeedKind;
    fn schema(&self) -> FeedSchema;
    fn default_table(&self) -> &'static str;
    fn default_prefix(&self) -> &'static str;
    fn feed_url(&self, settings: &FeedSettings) -> Result<String, AdapterError>;

    /// Site the rows come from, stored in a constant `{prefix}origin` column.
    fn origin(&self) -> Option<&'static str> {
        None
    }

    fn parse(&self, body: &[u8]) -> Result<Vec<CandidateEntity>, ParseError> {
        parse_csv(&self.schema(), body)
    }
}

const EARNINGS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("name", "name", ColumnKind::Text),
    ColumnSpec::new("report_date", "reportDate", ColumnKind::Date),
    ColumnSpec::new("fiscal_date_ending", "fiscalDateEnding", ColumnKind::Date),
    ColumnSpec::new("estimate", "estimate", ColumnKind::Number),
    ColumnSpec::new("currency", "currency", ColumnKind::Text),
];

pub const EARNINGS_SCHEMA: FeedSchema = FeedSchema {
    identity: ColumnSpec::new("symbol", "symbol", ColumnKind::Text),
    columns: EARNINGS_COLUMNS,
};

const MARKET_CAP_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::new("rank", "Rank", ColumnKind::Integer),
    ColumnSpec::new("name", "Name", ColumnKind::Text),
    ColumnSpec::new("marketcap", "marketcap", ColumnKind::Number),
    ColumnSpec::new("latest_price", "price (USD)", ColumnKind::Number),
    ColumnSpec::new("country", "country", ColumnKind::Text),
];

pub const MARKET_CAP_SCHEMA: FeedSchema = FeedSchema {
    identity: ColumnSpec::new("symbol", "Symbol", ColumnKind::Text),
    columns: MARKET_CAP_COLUMNS,
};

/// Alpha Vantage earnings calendar (next three months of expected reports).
#[derive(Debug, Clone, Copy, Default)]
pub struct EarningsCalendarAdapter;

impl EarningsCalendarAdapter {
    pub const DEFAULT_BASE_URL: &'static str = "https://www.alphavantage.co/query";
}

impl FeedAdapter for EarningsCalendarAdapter {
    fn kind(&self) -> FeedKind {
        FeedKind::Earnings
    }

    fn schema(&self) -> FeedSchema {
        EARNINGS_SCHEMA
    }

    fn default_table(&self) -> &'static str {
        "earningscalendar"
    }

    fn default_prefix(&self) -> &'static str {
        "ec_"
    }

    fn feed_url(&self, settings: &FeedSettings) -> Result<String, AdapterError> {
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(AdapterError::MissingSetting {
                feed: self.kind(),
                setting: "ALPHAVANTAGE_API_KEY",
            })?;
        let base = settings.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL);
        Ok(format!(
            "{base}?function=EARNINGS_CALENDAR&apikey={}&datatype=csv",
            api_key.trim()
        ))
    }
}

/// companiesmarketcap.com ranking of the largest US companies.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketCapAdapter;

impl MarketCapAdapter {
    pub const DEFAULT_BASE_URL: &'static str =
        "https://companiesmarketcap.com/usa/largest-companies-in-the-usa-by-market-cap/";
    pub const ORIGIN: &'static str = "https://companiesmarketcap.com";
}

impl FeedAdapter for MarketCapAdapter {
    fn kind(&self) -> FeedKind {
        FeedKind::MarketCap
    }

    fn schema(&self) -> FeedSchema {
        MARKET_CAP_SCHEMA
    }

    fn default_table(&self) -> &'static str {
        "companiesmarketcap"
    }

    fn default_prefix(&self) -> &'static str {
        "cmc_"
    }

    fn feed_url(&self, settings: &FeedSettings) -> Result<String, AdapterError> {
        let base = settings.base_url.as_deref().unwrap_or(Self::DEFAULT_BASE_URL);
        Ok(format!("{base}?download=csv"))
    }

    fn origin(&self) -> Option<&'static str> {
        Some(Self::ORIGIN)
    }
}

pub fn adapter_for_feed(kind: FeedKind) -> Box<dyn FeedAdapter> {
    match kind {
        FeedKind::Earnings => Box::new(EarningsCalendarAdapter),
        FeedKind::MarketCap => Box::new(MarketCapAdapter),
    }
}

/// Parses a full CSV snapshot into candidates, failing on the first bad row.
pub fn parse_csv(schema: &FeedSchema, body: &[u8]) -> Result<Vec<CandidateEntity>, ParseError> {
    let body = body.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(body);
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(body);

    let headers = reader.headers()?.clone();
    let identity_idx = header_index(&headers, &schema.identity)?;
    let column_idx = schema
        .columns
        .iter()
        .map(|column| header_index(&headers, column).map(|idx| (column, idx)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut candidates = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line());

        let identity = record.get(identity_idx).unwrap_or_default();
        if identity.is_empty() {
            return Err(ParseError::MissingValue {
                line,
                column: schema.identity.header,
            });
        }

        let mut attributes = Attributes::new();
        for (column, idx) in &column_idx {
            let raw = record.get(*idx).unwrap_or_default();
            attributes.set(column.name, coerce(column, raw, line)?);
        }

        candidates.push(CandidateEntity {
            identity: identity.to_string(),
            attributes,
            source_line: Some(line),
        });
    }
    Ok(candidates)
}

fn header_index(headers: &StringRecord, column: &ColumnSpec) -> Result<usize, ParseError> {
    headers
        .iter()
        .position(|h| h == column.header)
        .ok_or(ParseError::MissingColumn { column: column.header })
}

/// Converts one trimmed cell. Empty cells become `Null`.
pub fn coerce(column: &ColumnSpec, raw: &str, line: u64) -> Result<AttrValue, ParseError> {
    if raw.is_empty() {
        return Ok(AttrValue::Null);
    }
    let invalid = |reason: String| ParseError::InvalidValue {
        line,
        column: column.header,
        value: raw.to_string(),
        reason,
    };

    match column.kind {
        ColumnKind::Text => Ok(AttrValue::Text(raw.to_string())),
        ColumnKind::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map(AttrValue::Date)
            .map_err(|err| invalid(err.to_string())),
        ColumnKind::Number => {
            let value = raw.parse::<f64>().map_err(|err| invalid(err.to_string()))?;
            if value.is_finite() {
                Ok(AttrValue::Number(value))
            } else {
                Err(invalid("not a finite number".to_string()))
            }
        }
        ColumnKind::Integer => raw
            .parse::<i64>()
            .map(AttrValue::Integer)
            .map_err(|err| invalid(err.to_string())),
    }
}

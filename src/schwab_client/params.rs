use std::fmt;

use chrono::{DateTime, Utc};

/// Query string under construction. Empty values are never sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, key: &str, value: impl ToString) -> Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.pairs.push((key.to_string(), value));
        }
        self
    }

    pub fn push_opt<V: ToString>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.push(key, value),
            None => self,
        }
    }

    pub fn push_list<S: AsRef<str>>(self, key: &str, values: &[S]) -> Self {
        let joined = format_list(values);
        self.push(key, joined)
    }

    pub fn push_time(self, key: &str, value: Option<DateTime<Utc>>, format: TimeFormat) -> Self {
        let value = value.map(|dt| convert_time(dt, format));
        self.push_opt(key, value)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }
}

/// Comma-join a list of symbols, fields or statuses.
pub fn format_list<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(AsRef::as_ref)
        .filter(|value| !value.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Timestamp encodings accepted by the REST endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeFormat {
    /// `2024-03-29T14:30:00.000Z`
    Iso8601,
    /// Milliseconds since the epoch.
    EpochMillis,
    /// `2024-03-29`
    Date,
}

pub fn convert_time(dt: DateTime<Utc>, format: TimeFormat) -> String {
    match format {
        TimeFormat::Iso8601 => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        TimeFormat::EpochMillis => dt.timestamp_millis().to_string(),
        TimeFormat::Date => dt.format("%Y-%m-%d").to_string(),
    }
}

/// Period unit for price history requests.
#[derive(Clone, Copy, Debug)]
pub enum PeriodType {
    Day,
    Month,
    Year,
    Ytd,
}

impl PeriodType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PeriodType::Day => "day",
            PeriodType::Month => "month",
            PeriodType::Year => "year",
            PeriodType::Ytd => "ytd",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candle width unit for price history requests.
#[derive(Clone, Copy, Debug)]
pub enum FrequencyType {
    Minute,
    Daily,
    Weekly,
    Monthly,
}

impl FrequencyType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            FrequencyType::Minute => "minute",
            FrequencyType::Daily => "daily",
            FrequencyType::Weekly => "weekly",
            FrequencyType::Monthly => "monthly",
        }
    }
}

impl fmt::Display for FrequencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Option chain side filter.
#[derive(Clone, Copy, Debug)]
pub enum ContractType {
    Call,
    Put,
    All,
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractType::Call => f.write_str("CALL"),
            ContractType::Put => f.write_str("PUT"),
            ContractType::All => f.write_str("ALL"),
        }
    }
}

/// Instrument search mode.
#[derive(Clone, Copy, Debug)]
pub enum Projection {
    SymbolSearch,
    SymbolRegex,
    DescSearch,
    DescRegex,
    Search,
    Fundamental,
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Projection::SymbolSearch => "symbol-search",
            Projection::SymbolRegex => "symbol-regex",
            Projection::DescSearch => "desc-search",
            Projection::DescRegex => "desc-regex",
            Projection::Search => "search",
            Projection::Fundamental => "fundamental",
        };
        f.write_str(value)
    }
}

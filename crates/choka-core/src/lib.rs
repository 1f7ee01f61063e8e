//! Core domain model for the choka collector: per-day marine conditions and catch reports.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "choka-core";

/// Upstream sources polled by one ingestion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Weather,
    Tide,
    Reports,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Weather, SourceKind::Tide, SourceKind::Reports];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Weather => "weather",
            SourceKind::Tide => "tide",
            SourceKind::Reports => "reports",
        }
    }

    /// File extension of the raw payload this source serves.
    pub fn payload_extension(self) -> &'static str {
        match self {
            SourceKind::Weather | SourceKind::Tide => "json",
            SourceKind::Reports => "html",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted aggregates that carry a per-date natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    DailyConditions,
    CatchReports,
}

impl TableKind {
    pub fn table_name(self) -> &'static str {
        match self {
            TableKind::DailyConditions => "daily_conditions",
            TableKind::CatchReports => "catch_reports",
        }
    }

    pub fn date_column(self) -> &'static str {
        match self {
            TableKind::DailyConditions => "date",
            TableKind::CatchReports => "report_date",
        }
    }
}

/// Result of looking for a day's data in a well-formed payload.
///
/// Upstream services only publish some dates, so a missing entry is an
/// ordinary outcome and not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Availability<T> {
    Present(T),
    Absent { reason: String },
}

impl<T> Availability<T> {
    pub fn absent(reason: impl Into<String>) -> Self {
        Availability::Absent {
            reason: reason.into(),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Availability::Present(_))
    }

    pub fn present(self) -> Option<T> {
        match self {
            Availability::Present(value) => Some(value),
            Availability::Absent { .. } => None,
        }
    }

    pub fn as_ref(&self) -> Availability<&T> {
        match self {
            Availability::Present(value) => Availability::Present(value),
            Availability::Absent { reason } => Availability::Absent {
                reason: reason.clone(),
            },
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Availability<U> {
        match self {
            Availability::Present(value) => Availability::Present(f(value)),
            Availability::Absent { reason } => Availability::Absent { reason },
        }
    }
}

/// Weather forecast values for one calendar day. Missing source values are `0.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub date: NaiveDate,
    pub min_temp: f64,
    pub max_temp: f64,
    /// Max precipitation probability (0-100) across the day's forecast slots.
    pub precipitation_probability: f64,
    /// Meters, parsed from the forecast's free-text wave description.
    pub wave_height: f64,
}

impl WeatherObservation {
    pub fn defaults(date: NaiveDate) -> Self {
        Self {
            date,
            min_temp: 0.0,
            max_temp: 0.0,
            precipitation_probability: 0.0,
            wave_height: 0.0,
        }
    }
}

/// One high or low water event. `time` is kept as the upstream `H:MM`/`HH:MM` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TideEvent {
    pub time: String,
    pub height_cm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TideReading {
    pub date: NaiveDate,
    pub tide_name: Option<String>,
    pub high_tide_1: Option<TideEvent>,
    pub high_tide_2: Option<TideEvent>,
    pub low_tide_1: Option<TideEvent>,
    pub low_tide_2: Option<TideEvent>,
    pub sunrise: Option<String>,
    pub sunset: Option<String>,
    pub moonrise: Option<String>,
    pub moonset: Option<String>,
    pub moon_age: Option<f64>,
}

impl TideReading {
    /// Reading with every event and astronomical field explicitly absent.
    pub fn absent(date: NaiveDate) -> Self {
        Self {
            date,
            tide_name: None,
            high_tide_1: None,
            high_tide_2: None,
            low_tide_1: None,
            low_tide_2: None,
            sunrise: None,
            sunset: None,
            moonrise: None,
            moonset: None,
            moon_age: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::absent(self.date)
    }
}

/// Per-date aggregate of weather and tide data. At most one row per date is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyConditions {
    pub date: NaiveDate,
    pub weather: WeatherObservation,
    pub tide: TideReading,
    /// Sources whose values were replaced by defaults for this date.
    pub degraded_sources: Vec<SourceKind>,
}

impl DailyConditions {
    pub fn is_degraded(&self) -> bool {
        !self.degraded_sources.is_empty()
    }
}

/// One species line of a shop's daily fishing report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchReport {
    pub report_date: NaiveDate,
    pub prefecture: String,
    pub shop_name: String,
    pub fish_name: String,
    pub details: String,
}

impl CatchReport {
    /// Natural key: (report_date, shop_name, fish_name).
    pub fn natural_key(&self) -> (NaiveDate, &str, &str) {
        (self.report_date, &self.shop_name, &self.fish_name)
    }
}

/// A catch report joined to the conditions persisted for the same date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRow {
    pub prefecture: String,
    pub fish_name: String,
    pub conditions: DailyConditions,
}

//! JMA area forecast (`/bosai/forecast/data/forecast/<office>.json`) adapter.

use chrono::NaiveDate;
use choka_core::{Availability, SourceKind, WeatherObservation};
use serde::Deserialize;

use crate::text::{max_precipitation, normalize_fullwidth, parse_wave_height, NO_DATA};
use crate::{AdapterContext, AdapterError, FetchedPage, SourceAdapter};

/// Index of the day's max / min temperature in the station's `temps` series.
const TEMP_MAX_INDEX: usize = 1;
const TEMP_MIN_INDEX: usize = 2;

#[derive(Debug, Clone, Deserialize)]
struct JmaForecast {
    #[serde(rename = "timeSeries", default)]
    time_series: Vec<JmaTimeSeries>,
}

#[derive(Debug, Clone, Deserialize)]
struct JmaTimeSeries {
    #[serde(rename = "timeDefines", default)]
    time_defines: Vec<String>,
    #[serde(default)]
    areas: Vec<JmaArea>,
}

#[derive(Debug, Clone, Deserialize)]
struct JmaArea {
    #[serde(default)]
    area: Option<JmaAreaId>,
    #[serde(default)]
    waves: Option<Vec<String>>,
    #[serde(default)]
    pops: Option<Vec<String>>,
    #[serde(default)]
    temps: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct JmaAreaId {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Clone)]
pub struct WeatherAdapter {
    url: String,
    area_code: String,
    station_code: String,
}

impl WeatherAdapter {
    /// `area_code` selects the marine sub-area (waves, precipitation);
    /// `station_code` selects the temperature station.
    pub fn new(
        url: impl Into<String>,
        area_code: impl Into<String>,
        station_code: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            area_code: area_code.into(),
            station_code: station_code.into(),
        }
    }
}

impl SourceAdapter for WeatherAdapter {
    type Output = WeatherObservation;

    fn source(&self) -> SourceKind {
        SourceKind::Weather
    }

    fn request_url(&self, _ctx: &AdapterContext) -> String {
        self.url.clone()
    }

    fn parse(
        &self,
        ctx: &AdapterContext,
        page: &FetchedPage,
    ) -> Result<Availability<WeatherObservation>, AdapterError> {
        parse_forecast(
            &page.body,
            ctx.reference_date,
            &self.area_code,
            &self.station_code,
        )
    }
}

/// Read the day's weather for one area/station from a JMA forecast document.
///
/// Areas or series missing from the document leave their fields at 0.0.
pub fn parse_forecast(
    body: &[u8],
    date: NaiveDate,
    area_code: &str,
    station_code: &str,
) -> Result<Availability<WeatherObservation>, AdapterError> {
    let forecasts: Vec<JmaForecast> = serde_json::from_slice(body).map_err(|e| {
        AdapterError::format(SourceKind::Weather, "JMA forecast JSON array", e, body)
    })?;

    let Some(short_term) = forecasts.first().filter(|f| !f.time_series.is_empty()) else {
        return Ok(Availability::absent("forecast document has no time series"));
    };

    let mut observation = WeatherObservation::defaults(date);

    if let Some(waves) = find_series(short_term, area_code, |a| a.waves.as_ref()) {
        if let Some(text) = waves.1.first() {
            observation.wave_height = parse_wave_height(text);
        }
    }

    if let Some((series, pops)) = find_series(short_term, area_code, |a| a.pops.as_ref()) {
        let todays = values_for_date(&series.time_defines, pops, date);
        observation.precipitation_probability = max_precipitation(&todays);
    }

    if let Some((_, temps)) = find_series(short_term, station_code, |a| a.temps.as_ref()) {
        observation.max_temp = temperature_at(temps, TEMP_MAX_INDEX);
        observation.min_temp = temperature_at(temps, TEMP_MIN_INDEX);
    }

    Ok(Availability::Present(observation))
}

fn find_series<'a>(
    forecast: &'a JmaForecast,
    code: &str,
    values: impl Fn(&'a JmaArea) -> Option<&'a Vec<String>>,
) -> Option<(&'a JmaTimeSeries, &'a Vec<String>)> {
    forecast.time_series.iter().find_map(|series| {
        series
            .areas
            .iter()
            .filter(|area| area.area.as_ref().is_some_and(|id| id.code == code))
            .find_map(|area| values(area).map(|v| (series, v)))
    })
}

/// Values whose time define falls on `date`; all values when none do.
fn values_for_date<'a>(time_defines: &[String], values: &'a [String], date: NaiveDate) -> Vec<&'a str> {
    let prefix = date.format("%Y-%m-%d").to_string();
    let todays: Vec<&str> = time_defines
        .iter()
        .zip(values)
        .filter(|(define, _)| define.starts_with(&prefix))
        .map(|(_, value)| value.as_str())
        .collect();
    if todays.is_empty() {
        values.iter().map(String::as_str).collect()
    } else {
        todays
    }
}

fn temperature_at(temps: &[String], index: usize) -> f64 {
    temps
        .get(index)
        .map(|t| normalize_fullwidth(t.trim()))
        .filter(|t| t != NO_DATA)
        .and_then(|t| t.parse().ok())
        .unwrap_or(0.0)
}

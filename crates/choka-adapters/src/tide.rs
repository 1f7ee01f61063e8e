//! tide736 (`get_tide.php`) adapter.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use choka_core::{Availability, SourceKind, TideEvent, TideReading};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::text::{first_clock_time, normalize_fullwidth, text_or_none};
use crate::{AdapterContext, AdapterError, FetchedPage, SourceAdapter};

const EVENTS_PER_DIRECTION: usize = 2;

#[derive(Debug, Clone, Deserialize)]
struct TidePayload {
    #[serde(default)]
    status: Option<JsonValue>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    chart: Option<BTreeMap<String, JsonValue>>,
    #[serde(default)]
    tide: Option<TideEnvelope>,
}

#[derive(Debug, Clone, Deserialize)]
struct TideEnvelope {
    #[serde(default)]
    chart: Option<BTreeMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Deserialize)]
struct TideDay {
    #[serde(default)]
    flood: Option<Vec<RawEvent>>,
    #[serde(default)]
    edd: Option<Vec<RawEvent>>,
    #[serde(default)]
    sun: Option<RawSun>,
    #[serde(default)]
    moon: Option<RawMoon>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    cm: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSun {
    #[serde(default)]
    rise: Option<String>,
    #[serde(default)]
    set: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMoon {
    #[serde(default)]
    age: Option<JsonValue>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    rise: Option<String>,
    #[serde(default)]
    set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TideAdapter {
    url_template: String,
}

impl TideAdapter {
    /// `url_template` may contain `{year}`, `{month}` and `{day}` placeholders.
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }
}

impl SourceAdapter for TideAdapter {
    type Output = TideReading;

    fn source(&self) -> SourceKind {
        SourceKind::Tide
    }

    fn request_url(&self, ctx: &AdapterContext) -> String {
        let date = ctx.reference_date;
        self.url_template
            .replace("{year}", &date.year().to_string())
            .replace("{month}", &date.month().to_string())
            .replace("{day}", &date.day().to_string())
    }

    fn parse(
        &self,
        ctx: &AdapterContext,
        page: &FetchedPage,
    ) -> Result<Availability<TideReading>, AdapterError> {
        parse_tide(&page.body, ctx.reference_date)
    }
}

pub fn parse_tide(body: &[u8], date: NaiveDate) -> Result<Availability<TideReading>, AdapterError> {
    let payload: TidePayload = serde_json::from_slice(body)
        .map_err(|e| AdapterError::format(SourceKind::Tide, "tide JSON object", e, body))?;

    if status_is_failure(payload.status.as_ref()) {
        let message = payload
            .message
            .unwrap_or_else(|| "no message".to_string());
        return Err(AdapterError::format(
            SourceKind::Tide,
            "successful tide response",
            format!("upstream reported failure: {message}"),
            body,
        ));
    }

    let Some(chart) = payload.chart.or_else(|| payload.tide.and_then(|t| t.chart)) else {
        return Ok(Availability::absent("response has no chart"));
    };

    // Only the reference day is decoded; other days of the week are never inspected.
    let key = date.format("%Y-%m-%d").to_string();
    let Some(entry) = chart.get(&key) else {
        let available = chart.keys().cloned().collect::<Vec<_>>().join(", ");
        return Ok(Availability::absent(format!(
            "no chart entry for {key}; available: {available}"
        )));
    };
    let day = TideDay::deserialize(entry).map_err(|e| {
        AdapterError::format(SourceKind::Tide, "tide chart entry object", e, body)
    })?;

    let highs = events(day.flood.as_deref().unwrap_or_default());
    let lows = events(day.edd.as_deref().unwrap_or_default());
    let sun = day.sun.as_ref();
    let moon = day.moon.as_ref();

    Ok(Availability::Present(TideReading {
        date,
        tide_name: moon
            .and_then(|m| m.title.as_deref())
            .and_then(text_or_none),
        high_tide_1: highs.first().cloned(),
        high_tide_2: highs.get(1).cloned(),
        low_tide_1: lows.first().cloned(),
        low_tide_2: lows.get(1).cloned(),
        sunrise: sun.and_then(|s| s.rise.as_deref()).and_then(first_clock_time),
        sunset: sun.and_then(|s| s.set.as_deref()).and_then(first_clock_time),
        moonrise: moon.and_then(|m| m.rise.as_deref()).and_then(first_clock_time),
        moonset: moon.and_then(|m| m.set.as_deref()).and_then(first_clock_time),
        moon_age: moon.and_then(|m| m.age.as_ref()).and_then(json_number),
    }))
}

fn status_is_failure(status: Option<&JsonValue>) -> bool {
    match status {
        Some(JsonValue::Bool(ok)) => !ok,
        Some(JsonValue::Number(n)) => n.as_i64() == Some(0),
        _ => false,
    }
}

/// First events with both a clock time and a height; incomplete entries are dropped.
fn events(raw: &[RawEvent]) -> Vec<TideEvent> {
    raw.iter()
        .filter_map(|e| {
            let time = e.time.as_deref().and_then(first_clock_time)?;
            let height_cm = e.cm.as_ref().and_then(json_number)?;
            Some(TideEvent { time, height_cm })
        })
        .take(EVENTS_PER_DIRECTION)
        .collect()
}

fn json_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => normalize_fullwidth(s.trim()).parse().ok(),
        _ => None,
    }
}

use chrono::NaiveDate;
use choka_core::{DailyConditions, SourceKind, TideReading, WeatherObservation};

/// Combine the cycle's weather and tide results into the day's aggregate.
///
/// A missing side is filled with its defaults (`0.0` weather values, absent
/// tide events) and listed in `degraded_sources`. Both sides are pinned to
/// `date`, the cycle's reference date.
pub fn merge_daily_conditions(
    date: NaiveDate,
    weather: Option<WeatherObservation>,
    tide: Option<TideReading>,
) -> DailyConditions {
    let mut degraded_sources = Vec::new();

    let weather = match weather {
        Some(observation) => WeatherObservation {
            date,
            ..observation
        },
        None => {
            degraded_sources.push(SourceKind::Weather);
            WeatherObservation::defaults(date)
        }
    };

    let tide = match tide {
        Some(reading) => TideReading { date, ..reading },
        None => {
            degraded_sources.push(SourceKind::Tide);
            TideReading::absent(date)
        }
    };

    DailyConditions {
        date,
        weather,
        tide,
        degraded_sources,
    }
}

//! Process configuration: built-in defaults, then an optional YAML file, then `CHOKA_*` env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use choka_adapters::{ReportAdapter, ReportSelectors, TideAdapter, WeatherAdapter};
use choka_storage::{HttpClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::schedule::WeeklySchedule;

pub const DEFAULT_CONFIG_FILE: &str = "choka.yaml";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

const SLOT_TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSourceConfig {
    pub url: String,
    /// Marine forecast sub-area carrying waves and precipitation.
    pub area_code: String,
    /// Observation station carrying min/max temperature.
    pub station_code: String,
}

impl Default for WeatherSourceConfig {
    fn default() -> Self {
        Self {
            url: "https://www.jma.go.jp/bosai/forecast/data/forecast/140000.json".to_string(),
            area_code: "140010".to_string(),
            station_code: "46106".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TideSourceConfig {
    pub url_template: String,
}

impl Default for TideSourceConfig {
    fn default() -> Self {
        Self {
            url_template: "https://api.tide736.net/get_tide.php?pc=14&hc=16&rg=week&yr={year}&mn={month}&dy={day}"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSourceConfig {
    pub url: String,
    /// Used for cards that carry no prefecture label of their own.
    pub default_prefecture: String,
    pub selectors: ReportSelectors,
}

impl Default for ReportSourceConfig {
    fn default() -> Self {
        Self {
            url: "https://choka.example.jp/kanagawa/".to_string(),
            default_prefecture: "神奈川県".to_string(),
            selectors: ReportSelectors::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `HH:MM` local times, applied to every day of the week.
    pub slot_times: Vec<String>,
    pub poll_interval_secs: u64,
    pub warm_up: bool,
    pub failure_retry_secs: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slot_times: vec!["06:00".to_string(), "18:00".to_string()],
            poll_interval_secs: 600,
            warm_up: true,
            failure_retry_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: String,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub weather: WeatherSourceConfig,
    pub tide: TideSourceConfig,
    pub reports: ReportSourceConfig,
    pub schedule: ScheduleConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://choka.db".to_string(),
            archive_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            http_max_retries: 2,
            weather: WeatherSourceConfig::default(),
            tide: TideSourceConfig::default(),
            reports: ReportSourceConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Resolve the process configuration once at startup.
    ///
    /// `CHOKA_CONFIG` names a YAML file that must exist; without it `choka.yaml`
    /// in the working directory is read when present.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("CHOKA_CONFIG") {
            Ok(path) => Self::from_yaml_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing choka config yaml")
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Apply `CHOKA_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("CHOKA_DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(dir) = lookup("CHOKA_ARCHIVE_DIR") {
            self.archive_dir = (!dir.trim().is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(agent) = lookup("CHOKA_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(secs) = lookup("CHOKA_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_number("CHOKA_HTTP_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("CHOKA_POLL_INTERVAL_SECS") {
            self.schedule.poll_interval_secs = parse_number("CHOKA_POLL_INTERVAL_SECS", &secs)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let schedule = self.weekly_schedule()?;
        if schedule.is_empty() {
            bail!("schedule.slot_times must name at least one time");
        }
        if self.schedule.poll_interval_secs == 0 {
            bail!("schedule.poll_interval_secs must be greater than zero");
        }
        if self.http_timeout_secs == 0 {
            bail!("http_timeout_secs must be greater than zero");
        }
        self.report_adapter()?;
        Ok(())
    }

    pub fn weekly_schedule(&self) -> Result<WeeklySchedule> {
        let times = self
            .schedule
            .slot_times
            .iter()
            .map(|raw| {
                NaiveTime::parse_from_str(raw.trim(), SLOT_TIME_FORMAT)
                    .with_context(|| format!("invalid schedule slot time {raw:?} (expected HH:MM)"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(WeeklySchedule::daily(&times))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }

    pub fn failure_retry(&self) -> Option<Duration> {
        self.schedule.failure_retry_secs.map(Duration::from_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            retry: RetryPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Upper bound for one source's fetch + parse leg, covering every retry.
    pub fn source_deadline(&self) -> Duration {
        let http = self.http_client_config();
        let attempts = self.http_max_retries as u32 + 1;
        http.timeout.saturating_mul(attempts) + http.retry.total_wait()
    }

    pub fn weather_adapter(&self) -> WeatherAdapter {
        WeatherAdapter::new(
            self.weather.url.clone(),
            self.weather.area_code.clone(),
            self.weather.station_code.clone(),
        )
    }

    pub fn tide_adapter(&self) -> TideAdapter {
        TideAdapter::new(self.tide.url_template.clone())
    }

    pub fn report_adapter(&self) -> Result<ReportAdapter> {
        ReportAdapter::new(
            self.reports.url.clone(),
            self.reports.default_prefecture.clone(),
            &self.reports.selectors,
        )
        .context("compiling report selectors")
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}={value:?} is not a valid number"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_describe_kanagawa_twice_daily() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.database_url, "sqlite://choka.db");
        assert_eq!(config.weekly_schedule().unwrap().len(), 14);
        assert_eq!(config.poll_interval(), Duration::from_secs(600));
        assert!(config.schedule.warm_up);
        assert_eq!(config.failure_retry(), None);
        assert!(config.tide.url_template.contains("pc=14&hc=16"));
    }

    #[test]
    fn yaml_keys_are_optional_and_layered_over_defaults() {
        let config = SyncConfig::from_yaml_str(
            r#"
database_url: "sqlite://data/choka.db"
schedule:
  slot_times: ["05:30"]
  failure_retry_secs: 900
reports:
  selectors:
    card: "article.report"
"#,
        )
        .unwrap();
        assert_eq!(config.database_url, "sqlite://data/choka.db");
        assert_eq!(config.schedule.poll_interval_secs, 600);
        assert_eq!(config.weekly_schedule().unwrap().len(), 7);
        assert_eq!(config.failure_retry(), Some(Duration::from_secs(900)));
        assert_eq!(config.reports.selectors.card, "article.report");
        assert_eq!(config.reports.selectors.shop, ".shop-name");
        assert_eq!(config.weather.area_code, "140010");
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = SyncConfig::default();
        config
            .apply_env(env(&[
                ("CHOKA_DATABASE_URL", "sqlite::memory:"),
                ("CHOKA_ARCHIVE_DIR", "/var/lib/choka/raw"),
                ("CHOKA_POLL_INTERVAL_SECS", "30"),
            ]))
            .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.archive_dir, Some(PathBuf::from("/var/lib/choka/raw")));
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
    }

    #[test]
    fn non_numeric_env_value_is_rejected() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env(env(&[("CHOKA_HTTP_TIMEOUT_SECS", "fifteen")]))
            .unwrap_err();
        assert!(err.to_string().contains("CHOKA_HTTP_TIMEOUT_SECS"));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let mut config = SyncConfig::default();
        config.schedule.slot_times = vec!["25:99".to_string()];
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.schedule.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.reports.selectors.row = "tr[".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn example_config_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../choka.example.yaml");
        let config = SyncConfig::from_yaml_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.archive_dir, Some(PathBuf::from("raw")));
        assert_eq!(config.reports, ReportSourceConfig::default());
    }

    #[test]
    fn source_deadline_covers_every_attempt() {
        let config = SyncConfig::default();
        // 3 attempts x 15s + 0.5s + 1s between them
        assert_eq!(config.source_deadline(), Duration::from_millis(46_500));
    }
}

//! Deduplicating SQLite store for `DailyConditions` and `CatchReport` rows.
//!
//! Inserts are keyed on natural keys and never overwrite: a second insert for
//! the same key is reported as [`InsertOutcome::AlreadyExists`] and leaves the
//! first row untouched.

use std::str::FromStr;

use chrono::NaiveDate;
use choka_core::{
    CatchReport, DailyConditions, SourceKind, TableKind, TideEvent, TideReading, TrainingRow,
    WeatherObservation,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Per-row tally of a catch report batch. Failed rows do not roll back their siblings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub already_existed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ConditionsStore {
    pool: SqlitePool,
}

impl ConditionsStore {
    /// Open (creating if missing) the database at `database_url`, e.g. `sqlite://choka.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(4);
        if database_url.contains(":memory:") {
            // Every connection to :memory: is its own database.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_daily_conditions(
        &self,
        conditions: &DailyConditions,
    ) -> Result<InsertOutcome, StoreError> {
        let w = &conditions.weather;
        let t = &conditions.tide;
        let (ht1_time, ht1_height) = split_event(t.high_tide_1.as_ref());
        let (ht2_time, ht2_height) = split_event(t.high_tide_2.as_ref());
        let (lt1_time, lt1_height) = split_event(t.low_tide_1.as_ref());
        let (lt2_time, lt2_height) = split_event(t.low_tide_2.as_ref());

        let result = sqlx::query(
            r#"
            INSERT INTO daily_conditions (
                date, min_temp, max_temp, precipitation, wave_height, tide_name,
                high_tide_1_time, high_tide_1_height, high_tide_2_time, high_tide_2_height,
                low_tide_1_time, low_tide_1_height, low_tide_2_time, low_tide_2_height,
                sun_rise, sun_set, moon_age, moon_rise, moon_set, degraded_sources
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(date) DO NOTHING
            "#,
        )
        .bind(format_date(conditions.date))
        .bind(w.min_temp)
        .bind(w.max_temp)
        .bind(w.precipitation_probability)
        .bind(w.wave_height)
        .bind(t.tide_name.as_deref())
        .bind(ht1_time)
        .bind(ht1_height)
        .bind(ht2_time)
        .bind(ht2_height)
        .bind(lt1_time)
        .bind(lt1_height)
        .bind(lt2_time)
        .bind(lt2_height)
        .bind(t.sunrise.as_deref())
        .bind(t.sunset.as_deref())
        .bind(t.moon_age)
        .bind(t.moonrise.as_deref())
        .bind(t.moonset.as_deref())
        .bind(join_sources(&conditions.degraded_sources))
        .execute(&self.pool)
        .await?;

        Ok(outcome(result.rows_affected()))
    }

    pub async fn insert_catch_report(&self, report: &CatchReport) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO catch_reports (report_date, prefecture, shop_name, fish_name, details)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(report_date, shop_name, fish_name) DO NOTHING
            "#,
        )
        .bind(format_date(report.report_date))
        .bind(&report.prefecture)
        .bind(&report.shop_name)
        .bind(&report.fish_name)
        .bind(&report.details)
        .execute(&self.pool)
        .await?;

        Ok(outcome(result.rows_affected()))
    }

    /// Insert rows one at a time, outside any transaction.
    pub async fn insert_catch_reports(&self, reports: &[CatchReport]) -> BatchOutcome {
        let mut tally = BatchOutcome::default();
        for report in reports {
            match self.insert_catch_report(report).await {
                Ok(InsertOutcome::Inserted) => {
                    tally.inserted += 1;
                    debug!(
                        date = %report.report_date,
                        shop = %report.shop_name,
                        fish = %report.fish_name,
                        "catch report stored"
                    );
                }
                Ok(InsertOutcome::AlreadyExists) => tally.already_existed += 1,
                Err(err) => {
                    tally.failed += 1;
                    warn!(
                        date = %report.report_date,
                        shop = %report.shop_name,
                        fish = %report.fish_name,
                        error = %err,
                        "catch report insert failed"
                    );
                }
            }
        }
        tally
    }

    pub async fn exists(&self, date: NaiveDate, table: TableKind) -> Result<bool, StoreError> {
        Ok(self.count(table, date).await? > 0)
    }

    pub async fn count(&self, table: TableKind, date: NaiveDate) -> Result<i64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {} WHERE {} = ?",
            table.table_name(),
            table.date_column()
        );
        let row = sqlx::query(&sql)
            .bind(format_date(date))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn daily_conditions(&self, date: NaiveDate) -> Result<Option<DailyConditions>, StoreError> {
        let row = sqlx::query("SELECT * FROM daily_conditions WHERE date = ?")
            .bind(format_date(date))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conditions_from_row).transpose()
    }

    pub async fn all_daily_conditions(&self) -> Result<Vec<DailyConditions>, StoreError> {
        let rows = sqlx::query("SELECT * FROM daily_conditions ORDER BY date")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conditions_from_row).collect()
    }

    pub async fn shops_for_species(
        &self,
        fish_name: &str,
        prefecture: &str,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT shop_name, MAX(report_date) AS latest
              FROM catch_reports
             WHERE fish_name = ? AND prefecture = ?
             GROUP BY shop_name
             ORDER BY latest DESC, shop_name
             LIMIT ?
            "#,
        )
        .bind(fish_name)
        .bind(prefecture)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("shop_name").map_err(StoreError::from))
            .collect()
    }

    /// Catch reports joined to same-date conditions; reports without a conditions row are left out.
    pub async fn training_rows(&self) -> Result<Vec<TrainingRow>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.prefecture AS report_prefecture, r.fish_name AS report_fish_name, c.*
              FROM catch_reports r
              JOIN daily_conditions c ON r.report_date = c.date
             ORDER BY c.date, r.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TrainingRow {
                    prefecture: row.try_get("report_prefecture")?,
                    fish_name: row.try_get("report_fish_name")?,
                    conditions: conditions_from_row(row)?,
                })
            })
            .collect()
    }
}

fn outcome(rows_affected: u64) -> InsertOutcome {
    if rows_affected > 0 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::AlreadyExists
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(column: &'static str, value: String) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(&value, DATE_FORMAT).map_err(|_| StoreError::Corrupt { column, value })
}

fn split_event(event: Option<&TideEvent>) -> (Option<&str>, Option<f64>) {
    match event {
        Some(e) => (Some(e.time.as_str()), Some(e.height_cm)),
        None => (None, None),
    }
}

fn join_sources(sources: &[SourceKind]) -> String {
    sources
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_sources(value: &str) -> Result<Vec<SourceKind>, StoreError> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "weather" => Ok(SourceKind::Weather),
            "tide" => Ok(SourceKind::Tide),
            "reports" => Ok(SourceKind::Reports),
            other => Err(StoreError::Corrupt {
                column: "degraded_sources",
                value: other.to_string(),
            }),
        })
        .collect()
}

fn event_from_row(
    row: &SqliteRow,
    time_column: &str,
    height_column: &str,
) -> Result<Option<TideEvent>, StoreError> {
    let time: Option<String> = row.try_get(time_column)?;
    let height: Option<f64> = row.try_get(height_column)?;
    Ok(time.map(|time| TideEvent {
        time,
        height_cm: height.unwrap_or(0.0),
    }))
}

fn conditions_from_row(row: &SqliteRow) -> Result<DailyConditions, StoreError> {
    let date = parse_date("date", row.try_get("date")?)?;
    let degraded: String = row.try_get("degraded_sources")?;

    Ok(DailyConditions {
        date,
        weather: WeatherObservation {
            date,
            min_temp: row.try_get("min_temp")?,
            max_temp: row.try_get("max_temp")?,
            precipitation_probability: row.try_get("precipitation")?,
            wave_height: row.try_get("wave_height")?,
        },
        tide: TideReading {
            date,
            tide_name: row.try_get("tide_name")?,
            high_tide_1: event_from_row(row, "high_tide_1_time", "high_tide_1_height")?,
            high_tide_2: event_from_row(row, "high_tide_2_time", "high_tide_2_height")?,
            low_tide_1: event_from_row(row, "low_tide_1_time", "low_tide_1_height")?,
            low_tide_2: event_from_row(row, "low_tide_2_time", "low_tide_2_height")?,
            sunrise: row.try_get("sun_rise")?,
            sunset: row.try_get("sun_set")?,
            moonrise: row.try_get("moon_rise")?,
            moonset: row.try_get("moon_set")?,
            moon_age: row.try_get("moon_age")?,
        },
        degraded_sources: parse_sources(&degraded)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    async fn store() -> ConditionsStore {
        let store = ConditionsStore::in_memory().await.expect("open");
        store.migrate().await.expect("migrate");
        store
    }

    fn conditions(date: NaiveDate) -> DailyConditions {
        DailyConditions {
            date,
            weather: WeatherObservation {
                date,
                min_temp: 14.0,
                max_temp: 22.0,
                precipitation_probability: 40.0,
                wave_height: 1.5,
            },
            tide: TideReading {
                date,
                tide_name: Some("大潮".into()),
                high_tide_1: Some(TideEvent {
                    time: "5:12".into(),
                    height_cm: 148.0,
                }),
                high_tide_2: Some(TideEvent {
                    time: "17:40".into(),
                    height_cm: 161.5,
                }),
                low_tide_1: Some(TideEvent {
                    time: "11:28".into(),
                    height_cm: 31.0,
                }),
                low_tide_2: None,
                sunrise: Some("4:51".into()),
                sunset: Some("18:29".into()),
                moonrise: Some("0:33".into()),
                moonset: Some("11:21".into()),
                moon_age: Some(22.5),
            },
            degraded_sources: vec![],
        }
    }

    fn report(date: NaiveDate, shop: &str, fish: &str, details: &str) -> CatchReport {
        CatchReport {
            report_date: date,
            prefecture: "神奈川県".into(),
            shop_name: shop.into(),
            fish_name: fish.into(),
            details: details.into(),
        }
    }

    #[tokio::test]
    async fn migrations_can_run_twice() {
        let store = store().await;
        store.migrate().await.expect("second migrate");
    }

    #[tokio::test]
    async fn daily_conditions_insert_is_idempotent_and_first_write_wins() {
        let store = store().await;
        let first = conditions(day(1));
        let mut second = first.clone();
        second.weather.max_temp = 30.0;

        assert_eq!(
            store.insert_daily_conditions(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_daily_conditions(&second).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.count(TableKind::DailyConditions, day(1)).await.unwrap(), 1);

        let stored = store.daily_conditions(day(1)).await.unwrap().unwrap();
        assert_eq!(stored, first);
    }

    #[tokio::test]
    async fn absent_tide_events_round_trip_as_none() {
        let store = store().await;
        let mut degraded = conditions(day(2));
        degraded.tide = TideReading::absent(day(2));
        degraded.degraded_sources = vec![SourceKind::Tide];

        store.insert_daily_conditions(&degraded).await.unwrap();
        let stored = store.daily_conditions(day(2)).await.unwrap().unwrap();
        assert!(stored.tide.is_empty());
        assert_eq!(stored.degraded_sources, vec![SourceKind::Tide]);
        assert_eq!(stored.weather.wave_height, 1.5);
    }

    #[tokio::test]
    async fn catch_report_natural_key_rejects_duplicates_silently() {
        let store = store().await;
        let first = report(day(1), "一之瀬丸", "マダイ", "0-3枚");
        let second = report(day(1), "一之瀬丸", "マダイ", "1-5枚 良型混じり");

        assert_eq!(
            store.insert_catch_report(&first).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_catch_report(&second).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.count(TableKind::CatchReports, day(1)).await.unwrap(), 1);

        let details: String = sqlx::query("SELECT details FROM catch_reports")
            .fetch_one(store.pool())
            .await
            .unwrap()
            .try_get("details")
            .unwrap();
        assert_eq!(details, "0-3枚");
    }

    #[tokio::test]
    async fn batch_insert_tallies_each_row() {
        let store = store().await;
        store
            .insert_catch_report(&report(day(1), "一之瀬丸", "アジ", "10-40匹"))
            .await
            .unwrap();

        let batch = vec![
            report(day(1), "一之瀬丸", "アジ", "10-40匹"),
            report(day(1), "一之瀬丸", "マダイ", "0-3枚"),
            report(day(1), "広漁丸", "アジ", "5-20匹"),
        ];
        let tally = store.insert_catch_reports(&batch).await;
        assert_eq!(
            tally,
            BatchOutcome {
                inserted: 2,
                already_existed: 1,
                failed: 0
            }
        );
        assert_eq!(store.count(TableKind::CatchReports, day(1)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_row_does_not_roll_back_siblings() {
        let store = store().await;
        sqlx::query(
            r#"
            CREATE TRIGGER reject_fugu BEFORE INSERT ON catch_reports
            WHEN NEW.fish_name = 'フグ'
            BEGIN SELECT RAISE(ABORT, 'rejected'); END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch = vec![
            report(day(1), "一之瀬丸", "アジ", ""),
            report(day(1), "一之瀬丸", "フグ", ""),
            report(day(1), "一之瀬丸", "カワハギ", ""),
        ];
        let tally = store.insert_catch_reports(&batch).await;
        assert_eq!(tally.inserted, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(store.count(TableKind::CatchReports, day(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn exists_checks_each_table_by_date() {
        let store = store().await;
        assert!(!store.exists(day(1), TableKind::DailyConditions).await.unwrap());
        store.insert_daily_conditions(&conditions(day(1))).await.unwrap();
        store
            .insert_catch_report(&report(day(3), "広漁丸", "タチウオ", ""))
            .await
            .unwrap();

        assert!(store.exists(day(1), TableKind::DailyConditions).await.unwrap());
        assert!(!store.exists(day(1), TableKind::CatchReports).await.unwrap());
        assert!(store.exists(day(3), TableKind::CatchReports).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_inserts_for_different_dates_both_land() {
        let store = store().await;
        let a = conditions(day(4));
        let b = conditions(day(5));
        let (ra, rb) = tokio::join!(
            store.insert_daily_conditions(&a),
            store.insert_daily_conditions(&b)
        );
        assert_eq!(ra.unwrap(), InsertOutcome::Inserted);
        assert_eq!(rb.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.all_daily_conditions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn training_rows_join_reports_to_same_date_conditions() {
        let store = store().await;
        store.insert_daily_conditions(&conditions(day(1))).await.unwrap();
        store
            .insert_catch_reports(&[
                report(day(1), "一之瀬丸", "マダイ", ""),
                report(day(1), "広漁丸", "アジ", ""),
                report(day(2), "広漁丸", "アジ", ""),
            ])
            .await;

        let rows = store.training_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.conditions.date == day(1)));
        assert_eq!(rows[0].fish_name, "マダイ");
        assert_eq!(rows[0].prefecture, "神奈川県");
    }

    #[tokio::test]
    async fn shops_for_species_are_distinct_and_filtered_by_prefecture() {
        let store = store().await;
        let mut other_pref = report(day(2), "勝山丸", "アジ", "");
        other_pref.prefecture = "千葉県".into();
        store
            .insert_catch_reports(&[
                report(day(1), "一之瀬丸", "アジ", ""),
                report(day(2), "一之瀬丸", "アジ", ""),
                report(day(2), "広漁丸", "アジ", ""),
                report(day(2), "広漁丸", "マダイ", ""),
                other_pref,
            ])
            .await;

        let shops = store.shops_for_species("アジ", "神奈川県", 5).await.unwrap();
        assert_eq!(shops, vec!["一之瀬丸".to_string(), "広漁丸".to_string()]);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("choka.db").display());

        let store = ConditionsStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        store.insert_daily_conditions(&conditions(day(6))).await.unwrap();
        store.pool().close().await;

        let reopened = ConditionsStore::connect(&url).await.unwrap();
        reopened.migrate().await.unwrap();
        assert!(reopened.exists(day(6), TableKind::DailyConditions).await.unwrap());
        assert_eq!(
            reopened.insert_daily_conditions(&conditions(day(6))).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
    }
}

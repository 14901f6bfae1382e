use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::storage::database::decimal_helpers;

/// Per-user spending ceilings, held in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostThreshold {
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub alert_email: Option<String>,
}

/// In-memory map of cost thresholds keyed by user id.
///
/// The store is constructed independently and handed to whichever
/// components need it, so tests can run any number of isolated instances.
#[derive(Default)]
pub struct ThresholdStore {
    thresholds: RwLock<HashMap<String, CostThreshold>>,
}

impl ThresholdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or overwrite the threshold for a user; last write wins
    pub async fn set(&self, user_id: impl Into<String>, threshold: CostThreshold) {
        let user_id = user_id.into();
        debug!("Setting cost threshold for user {}", user_id);
        self.thresholds.write().await.insert(user_id, threshold);
    }

    /// Get the threshold configured for a user, if any
    pub async fn get(&self, user_id: &str) -> Option<CostThreshold> {
        self.thresholds.read().await.get(user_id).cloned()
    }
}

/// Checks per-user spend against configured thresholds
pub struct ThresholdMonitor {
    pool: SqlitePool,
    store: Arc<ThresholdStore>,
}

impl ThresholdMonitor {
    /// Create a monitor over the usage record store and an injected
    /// threshold store
    pub fn new(pool: SqlitePool, store: Arc<ThresholdStore>) -> Self {
        Self { pool, store }
    }

    /// Set or overwrite the threshold for a user
    pub async fn set_cost_threshold(&self, user_id: impl Into<String>, threshold: CostThreshold) {
        self.store.set(user_id, threshold).await;
    }

    /// Get the threshold configured for a user, if any
    pub async fn get_cost_threshold(&self, user_id: &str) -> Option<CostThreshold> {
        self.store.get(user_id).await
    }

    /// True iff the user has a daily limit configured and today's
    /// successful spend strictly exceeds it.
    ///
    /// Today is the current local calendar day. A configured monthly limit
    /// is not evaluated by this check.
    pub async fn check_cost_threshold(&self, user_id: &str) -> Result<bool> {
        let Some(threshold) = self.store.get(user_id).await else {
            return Ok(false);
        };
        let Some(daily_limit) = threshold.daily_limit else {
            return Ok(false);
        };

        let daily_cost = self.daily_cost(user_id).await?;
        let exceeded = daily_cost > daily_limit;

        if exceeded {
            warn!(
                "User {} exceeded daily cost limit: spent {} against limit {}",
                user_id, daily_cost, daily_limit
            );
        }

        Ok(exceeded)
    }

    /// Sum of the user's successful spend over the current local calendar day
    pub async fn daily_cost(&self, user_id: &str) -> Result<Decimal> {
        let (start_ms, end_ms) = local_day_bounds();

        let rows = sqlx::query(
            "SELECT cost FROM usage_records \
             WHERE user_id = ? AND success = TRUE AND timestamp >= ? AND timestamp < ?",
        )
        .bind(user_id)
        .bind(start_ms)
        .bind(end_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load today's usage for user {}: {}", user_id, e);
            Error::Database(e)
        })?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let cost_str: String = row.get("cost");
            total += decimal_helpers::string_to_decimal(&cost_str)?;
        }

        Ok(total)
    }
}

/// Millisecond bounds of the current local calendar day, half-open
fn local_day_bounds() -> (i64, i64) {
    day_bounds_for(Local::now().date_naive())
}

/// Half-open millisecond bounds of one local calendar day, from its
/// midnight to the next day's midnight. On DST-transition days the two
/// midnights are not 24 hours apart.
fn day_bounds_for(date: NaiveDate) -> (i64, i64) {
    let start = local_midnight(date);
    let end = local_midnight(date + Duration::days(1));
    (start.timestamp_millis(), end.timestamp_millis())
}

/// Local midnight of `date`, or the first later hour that exists on the
/// clock when a DST transition skips midnight
fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap();
    for offset_hours in 0..24 {
        match (midnight + Duration::hours(offset_hours)).and_local_timezone(Local) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => return dt,
            LocalResult::None => continue,
        }
    }
    // The date is entirely absent from the local timezone
    Local::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    use crate::platform::AppPaths;
    use crate::storage::{Database, NewUsageRecord, UsageRepository};

    async fn create_test_monitor() -> (ThresholdMonitor, UsageRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let store = Arc::new(ThresholdStore::new());
        let monitor = ThresholdMonitor::new(db.pool().clone(), store);
        let repo = UsageRepository::new(db.pool().clone());
        (monitor, repo, temp_dir)
    }

    #[tokio::test]
    async fn test_threshold_trips_on_strict_excess() {
        let (monitor, repo, _temp_dir) = create_test_monitor().await;

        monitor
            .set_cost_threshold(
                "user-1",
                CostThreshold {
                    daily_limit: Some(Decimal::new(2, 3)), // 0.002
                    ..Default::default()
                },
            )
            .await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(3, 3)),
        )
        .await
        .unwrap();

        assert!(monitor.check_cost_threshold("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_threshold_not_tripped_at_exact_limit() {
        let (monitor, repo, _temp_dir) = create_test_monitor().await;

        monitor
            .set_cost_threshold(
                "user-1",
                CostThreshold {
                    daily_limit: Some(Decimal::new(2, 3)),
                    ..Default::default()
                },
            )
            .await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(2, 3)),
        )
        .await
        .unwrap();

        // Spend equal to the limit does not trip the strictly-exceeds check
        assert!(!monitor.check_cost_threshold("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_threshold_returns_false_regardless_of_spend() {
        let (monitor, repo, _temp_dir) = create_test_monitor().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(500, 2)),
        )
        .await
        .unwrap();

        assert!(!monitor.check_cost_threshold("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_monthly_limit_is_stored_but_not_evaluated() {
        let (monitor, repo, _temp_dir) = create_test_monitor().await;

        monitor
            .set_cost_threshold(
                "user-1",
                CostThreshold {
                    monthly_limit: Some(Decimal::new(1, 4)), // 0.0001
                    alert_email: Some("billing@example.com".into()),
                    ..Default::default()
                },
            )
            .await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(500, 2)),
        )
        .await
        .unwrap();

        // Way over the monthly limit, but only daily limits are checked
        assert!(!monitor.check_cost_threshold("user-1").await.unwrap());

        let threshold = monitor.get_cost_threshold("user-1").await.unwrap();
        assert_eq!(threshold.monthly_limit, Some(Decimal::new(1, 4)));
        assert_eq!(threshold.alert_email.as_deref(), Some("billing@example.com"));
    }

    #[tokio::test]
    async fn test_set_threshold_last_write_wins() {
        let (monitor, _repo, _temp_dir) = create_test_monitor().await;

        monitor
            .set_cost_threshold(
                "user-1",
                CostThreshold {
                    daily_limit: Some(Decimal::new(10, 2)),
                    ..Default::default()
                },
            )
            .await;
        monitor
            .set_cost_threshold(
                "user-1",
                CostThreshold {
                    daily_limit: Some(Decimal::new(25, 2)),
                    ..Default::default()
                },
            )
            .await;

        let threshold = monitor.get_cost_threshold("user-1").await.unwrap();
        assert_eq!(threshold.daily_limit, Some(Decimal::new(25, 2)));

        assert!(monitor.get_cost_threshold("user-2").await.is_none());
    }

    #[tokio::test]
    async fn test_daily_cost_scopes_to_user_day_and_successes() {
        let (monitor, repo, _temp_dir) = create_test_monitor().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        // Another user's spend does not count
        repo.record_usage(
            NewUsageRecord::new("user-2", "gpt-4", "openai").with_cost(Decimal::new(70, 3)),
        )
        .await
        .unwrap();
        // Failed call does not count
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_cost(Decimal::new(50, 3))
                .failed(Some("timeout")),
        )
        .await
        .unwrap();
        // Yesterday's spend does not count
        repo.record_usage_at(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(90, 3)),
            Utc::now() - chrono::Duration::hours(25),
        )
        .await
        .unwrap();

        let daily = monitor.daily_cost("user-1").await.unwrap();
        assert_eq!(daily, Decimal::new(10, 3));
    }

    #[test]
    fn test_local_day_bounds_bracket_now() {
        let (start_ms, end_ms) = local_day_bounds();
        let now_ms = Local::now().timestamp_millis();

        assert!(start_ms <= now_ms);
        assert!(now_ms < end_ms);
    }

    #[test]
    fn test_day_bounds_contiguous_across_dst_transitions() {
        // Two years of consecutive days covers any DST transition of the
        // local timezone; every day must end exactly where the next begins.
        let today = Local::now().date_naive();
        let mut previous_end: Option<i64> = None;

        for offset in -365..=365 {
            let (start_ms, end_ms) = day_bounds_for(today + Duration::days(offset));

            assert!(start_ms < end_ms);
            let span_hours = (end_ms - start_ms) / 3_600_000;
            assert!((23..=25).contains(&span_hours));

            if let Some(previous) = previous_end {
                assert_eq!(previous, start_ms);
            }
            previous_end = Some(end_ms);
        }
    }
}

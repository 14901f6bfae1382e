use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::aggregation::{average_latency, round_cost};
use crate::storage::database::decimal_helpers;

/// Usage counters for one model over a date range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub model: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_cost: Decimal,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub average_latency_ms: f64,
}

/// Usage counters for one user over a date range, with a per-model cost
/// breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserUsageStats {
    pub user_id: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_cost: Decimal,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub average_latency_ms: f64,
    pub cost_by_model: HashMap<String, Decimal>,
}

/// Model- and user-scoped usage statistics.
///
/// Unlike cost aggregation, statistics scan failed calls too, so call
/// counters reflect everything the platform attempted.
pub struct UsageStatistics {
    pool: SqlitePool,
}

impl UsageStatistics {
    /// Create a new statistics service over the usage record store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Usage statistics for one model over the date range
    pub async fn get_model_usage_stats(
        &self,
        model: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ModelUsageStats> {
        debug!("Computing usage stats for model {} between {} and {}", model, start, end);

        let rows = sqlx::query(
            r#"
            SELECT input_tokens, output_tokens, cost, latency_ms, success
            FROM usage_records
            WHERE model = ? AND timestamp >= ? AND timestamp <= ?
            "#,
        )
        .bind(model)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load usage stats for model {}: {}", model, e);
            Error::Database(e)
        })?;

        let mut stats = ModelUsageStats {
            model: model.to_string(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            total_cost: Decimal::ZERO,
            total_input_tokens: 0,
            total_output_tokens: 0,
            average_latency_ms: 0.0,
        };

        let mut latency_sum = 0i64;
        for row in rows {
            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            stats.total_calls += 1;
            if row.get::<bool, _>("success") {
                stats.successful_calls += 1;
            } else {
                stats.failed_calls += 1;
            }
            stats.total_cost += cost;
            stats.total_input_tokens += row.get::<i64, _>("input_tokens");
            stats.total_output_tokens += row.get::<i64, _>("output_tokens");
            latency_sum += row.get::<i64, _>("latency_ms");
        }

        stats.total_cost = round_cost(stats.total_cost);
        stats.average_latency_ms = average_latency(latency_sum, stats.total_calls);

        Ok(stats)
    }

    /// Usage statistics for one user over the date range
    pub async fn get_user_usage_stats(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<UserUsageStats> {
        debug!("Computing usage stats for user {} between {} and {}", user_id, start, end);

        let rows = sqlx::query(
            r#"
            SELECT model, input_tokens, output_tokens, cost, latency_ms, success
            FROM usage_records
            WHERE user_id = ? AND timestamp >= ? AND timestamp <= ?
            "#,
        )
        .bind(user_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load usage stats for user {}: {}", user_id, e);
            Error::Database(e)
        })?;

        let mut stats = UserUsageStats {
            user_id: user_id.to_string(),
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            total_cost: Decimal::ZERO,
            total_input_tokens: 0,
            total_output_tokens: 0,
            average_latency_ms: 0.0,
            cost_by_model: HashMap::new(),
        };

        let mut latency_sum = 0i64;
        for row in rows {
            let model: String = row.get("model");

            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            stats.total_calls += 1;
            if row.get::<bool, _>("success") {
                stats.successful_calls += 1;
            } else {
                stats.failed_calls += 1;
            }
            stats.total_cost += cost;
            stats.total_input_tokens += row.get::<i64, _>("input_tokens");
            stats.total_output_tokens += row.get::<i64, _>("output_tokens");
            latency_sum += row.get::<i64, _>("latency_ms");

            *stats.cost_by_model.entry(model).or_insert(Decimal::ZERO) += cost;
        }

        stats.total_cost = round_cost(stats.total_cost);
        stats.average_latency_ms = average_latency(latency_sum, stats.total_calls);

        Ok(stats)
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::database::decimal_helpers;

/// Group key used for records that carry no value for the selected
/// dimension.
pub const UNKNOWN_KEY: &str = "unknown";

/// Cost aggregation over usage records.
///
/// Queries load the full matching result set into memory before grouping;
/// callers are expected to bound their date ranges accordingly.
pub struct CostAggregator {
    pool: SqlitePool,
}

/// Token and cost totals for one workflow step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStats {
    pub step: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost: Decimal,
    pub call_count: u64,
    pub average_latency_ms: f64,
}

/// Workflow step breakdown over a date range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBreakdown {
    pub total_tokens: i64,
    pub total_cost: Decimal,
    pub steps: Vec<StepStats>,
}

/// Round a cost the way report output expects it, to 4 decimal places
pub(crate) fn round_cost(cost: Decimal) -> Decimal {
    cost.round_dp_with_strategy(4, RoundingStrategy::MidpointAwayFromZero)
}

/// Average latency over a call count, rounded to 2 decimal places
pub(crate) fn average_latency(total_latency_ms: i64, calls: u64) -> f64 {
    if calls == 0 {
        return 0.0;
    }
    let avg = total_latency_ms as f64 / calls as f64;
    (avg * 100.0).round() / 100.0
}

#[derive(Default)]
struct StepAccumulator {
    input_tokens: i64,
    output_tokens: i64,
    cost: Decimal,
    latency_ms: i64,
    calls: u64,
}

impl CostAggregator {
    /// Create a new aggregator over the usage record store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Cost per model over the date range, successful records only
    pub async fn get_cost_by_model(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        model: Option<&str>,
    ) -> Result<HashMap<String, Decimal>> {
        self.sum_costs_by("model", start, end, model, false).await
    }

    /// Cost per scenario over the date range; untagged records land in the
    /// "unknown" bucket
    pub async fn get_cost_by_scenario(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        scenario: Option<&str>,
    ) -> Result<HashMap<String, Decimal>> {
        self.sum_costs_by("scenario", start, end, scenario, false).await
    }

    /// Cost per user over the date range, successful records only
    pub async fn get_cost_by_user(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<&str>,
    ) -> Result<HashMap<String, Decimal>> {
        self.sum_costs_by("user_id", start, end, user_id, false).await
    }

    /// Cost per agent type over the date range. Without a filter, records
    /// with no agent type tag are excluded from this query entirely.
    pub async fn get_cost_by_agent_type(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        agent_type: Option<&str>,
    ) -> Result<HashMap<String, Decimal>> {
        self.sum_costs_by("agent_type", start, end, agent_type, true).await
    }

    /// Cost per workflow step over the date range. Without a filter, records
    /// with no workflow step tag are excluded from this query entirely.
    pub async fn get_cost_by_workflow_step(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        workflow_step: Option<&str>,
    ) -> Result<HashMap<String, Decimal>> {
        self.sum_costs_by("workflow_step", start, end, workflow_step, true).await
    }

    /// Sum costs per key of one dimension. The filter value is pushed into
    /// the query; `skip_untagged` drops NULL-tagged rows instead of folding
    /// them into the "unknown" bucket.
    async fn sum_costs_by(
        &self,
        dimension: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: Option<&str>,
        skip_untagged: bool,
    ) -> Result<HashMap<String, Decimal>> {
        debug!(
            "Aggregating cost by {} between {} and {} (filter: {:?})",
            dimension, start, end, filter
        );

        let mut query = format!(
            "SELECT {} AS group_key, cost FROM usage_records \
             WHERE success = TRUE AND timestamp >= ? AND timestamp <= ?",
            dimension
        );

        if filter.is_some() {
            query.push_str(&format!(" AND {} = ?", dimension));
        } else if skip_untagged {
            query.push_str(&format!(" AND {} IS NOT NULL", dimension));
        }

        let mut query_builder = sqlx::query(&query)
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis());

        if let Some(value) = filter {
            query_builder = query_builder.bind(value);
        }

        let rows = query_builder.fetch_all(&self.pool).await.map_err(|e| {
            error!("Failed to aggregate cost by {}: {}", dimension, e);
            Error::Database(e)
        })?;

        let mut totals: HashMap<String, Decimal> = HashMap::new();
        for row in rows {
            let key: Option<String> = row.get("group_key");
            let key = key.unwrap_or_else(|| UNKNOWN_KEY.to_string());

            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            *totals.entry(key).or_insert(Decimal::ZERO) += cost;
        }

        debug!("Aggregated {} {} groups", totals.len(), dimension);
        Ok(totals)
    }

    /// Token and cost breakdown per workflow step over the date range.
    ///
    /// Only successful records carrying a workflow step tag contribute. The
    /// session id is accepted for interface compatibility but does not
    /// narrow the query; all sessions in range are aggregated together.
    pub async fn generate_step_breakdown(
        &self,
        _session_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StepBreakdown> {
        debug!("Generating step breakdown between {} and {}", start, end);

        let rows = sqlx::query(
            r#"
            SELECT workflow_step, input_tokens, output_tokens, cost, latency_ms
            FROM usage_records
            WHERE success = TRUE AND workflow_step IS NOT NULL
              AND timestamp >= ? AND timestamp <= ?
            "#,
        )
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load records for step breakdown: {}", e);
            Error::Database(e)
        })?;

        let mut total_tokens = 0i64;
        let mut total_cost = Decimal::ZERO;
        let mut by_step: HashMap<String, StepAccumulator> = HashMap::new();

        for row in rows {
            let step: String = row.get("workflow_step");
            let input_tokens: i64 = row.get("input_tokens");
            let output_tokens: i64 = row.get("output_tokens");
            let latency_ms: i64 = row.get("latency_ms");

            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            total_tokens += input_tokens + output_tokens;
            total_cost += cost;

            let entry = by_step.entry(step).or_default();
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.cost += cost;
            entry.latency_ms += latency_ms;
            entry.calls += 1;
        }

        let mut steps = by_step
            .into_iter()
            .map(|(step, acc)| StepStats {
                step,
                input_tokens: acc.input_tokens,
                output_tokens: acc.output_tokens,
                total_tokens: acc.input_tokens + acc.output_tokens,
                cost: round_cost(acc.cost),
                call_count: acc.calls,
                average_latency_ms: average_latency(acc.latency_ms, acc.calls),
            })
            .collect::<Vec<_>>();

        steps.sort_by(|a, b| b.cost.cmp(&a.cost));

        debug!("Step breakdown covers {} steps", steps.len());
        Ok(StepBreakdown {
            total_tokens,
            total_cost: round_cost(total_cost),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    use crate::platform::AppPaths;
    use crate::storage::{Database, NewUsageRecord, UsageRepository};

    async fn create_test_aggregator() -> (CostAggregator, UsageRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let aggregator = CostAggregator::new(db.pool().clone());
        let repo = UsageRepository::new(db.pool().clone());
        (aggregator, repo, temp_dir)
    }

    fn wide_range() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now - Duration::days(1), now + Duration::days(1))
    }

    #[tokio::test]
    async fn test_cost_by_model_sums_and_excludes_failures() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-2", "gpt-4", "openai").with_cost(Decimal::new(20, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "claude-3", "anthropic").with_cost(Decimal::new(30, 3)),
        )
        .await
        .unwrap();
        // Failed call must not contribute to any bucket
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_cost(Decimal::new(40, 3))
                .failed(Some("timeout")),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator.get_cost_by_model(start, end, None).await.unwrap();

        assert_eq!(costs.len(), 2);
        assert_eq!(costs["gpt-4"], Decimal::new(30, 3));
        assert_eq!(costs["claude-3"], Decimal::new(30, 3));
    }

    #[tokio::test]
    async fn test_cost_by_model_applies_filter() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "claude-3", "anthropic").with_cost(Decimal::new(30, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator
            .get_cost_by_model(start, end, Some("gpt-4"))
            .await
            .unwrap();

        assert_eq!(costs.len(), 1);
        assert_eq!(costs["gpt-4"], Decimal::new(10, 3));
    }

    #[tokio::test]
    async fn test_range_boundaries_are_inclusive() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();

        let record = |cost| NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(cost);

        repo.record_usage_at(record(Decimal::new(1, 2)), start).await.unwrap();
        repo.record_usage_at(record(Decimal::new(2, 2)), end).await.unwrap();
        repo.record_usage_at(record(Decimal::new(4, 2)), start - Duration::milliseconds(1))
            .await
            .unwrap();
        repo.record_usage_at(record(Decimal::new(8, 2)), end + Duration::milliseconds(1))
            .await
            .unwrap();

        let costs = aggregator.get_cost_by_model(start, end, None).await.unwrap();

        // Only the two boundary records are inside the inclusive range
        assert_eq!(costs["gpt-4"], Decimal::new(3, 2));
    }

    #[tokio::test]
    async fn test_cost_by_scenario_buckets_untagged_as_unknown() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_scenario("consultation")
                .with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(5, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator.get_cost_by_scenario(start, end, None).await.unwrap();

        assert_eq!(costs.len(), 2);
        assert_eq!(costs["consultation"], Decimal::new(10, 3));
        assert_eq!(costs[UNKNOWN_KEY], Decimal::new(5, 3));
    }

    #[tokio::test]
    async fn test_agent_type_accessor_excludes_untagged() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_agent_type("triage")
                .with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(5, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator.get_cost_by_agent_type(start, end, None).await.unwrap();

        // The untagged record is excluded, not folded into "unknown"
        assert_eq!(costs.len(), 1);
        assert_eq!(costs["triage"], Decimal::new(10, 3));
        assert!(!costs.contains_key(UNKNOWN_KEY));
    }

    #[tokio::test]
    async fn test_workflow_step_accessor_excludes_untagged() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_workflow_step("extract-symptoms")
                .with_cost(Decimal::new(12, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai").with_cost(Decimal::new(7, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator
            .get_cost_by_workflow_step(start, end, None)
            .await
            .unwrap();

        assert_eq!(costs.len(), 1);
        assert_eq!(costs["extract-symptoms"], Decimal::new(12, 3));
    }

    #[tokio::test]
    async fn test_agent_type_filter_restricts_to_value() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_agent_type("triage")
                .with_cost(Decimal::new(10, 3)),
        )
        .await
        .unwrap();
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_agent_type("summarizer")
                .with_cost(Decimal::new(20, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let costs = aggregator
            .get_cost_by_agent_type(start, end, Some("summarizer"))
            .await
            .unwrap();

        assert_eq!(costs.len(), 1);
        assert_eq!(costs["summarizer"], Decimal::new(20, 3));
    }

    #[tokio::test]
    async fn test_step_breakdown_totals_and_ordering() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        for _ in 0..2 {
            repo.record_usage(
                NewUsageRecord::new("user-1", "gpt-4", "openai")
                    .with_workflow_step("extract-achievements")
                    .with_tokens(150, 75)
                    .with_cost(Decimal::new(5, 3))
                    .with_latency(100),
            )
            .await
            .unwrap();
        }
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_workflow_step("generate-introduction")
                .with_tokens(200, 100)
                .with_cost(Decimal::new(8, 3))
                .with_latency(100),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let breakdown = aggregator
            .generate_step_breakdown(None, start, end)
            .await
            .unwrap();

        // 2 x (150 + 75) + (200 + 100) tokens across the tagged records
        assert_eq!(breakdown.total_tokens, 750);
        assert_eq!(
            breakdown.total_tokens,
            breakdown.steps.iter().map(|s| s.total_tokens).sum::<i64>()
        );
        assert_eq!(breakdown.total_cost, Decimal::new(18, 3));
        assert_eq!(breakdown.steps.len(), 2);

        let first = &breakdown.steps[0];
        assert_eq!(first.step, "extract-achievements");
        assert_eq!(first.input_tokens, 300);
        assert_eq!(first.output_tokens, 150);
        assert_eq!(first.total_tokens, 450);
        assert_eq!(first.cost, Decimal::new(1, 2));
        assert_eq!(first.call_count, 2);
        assert_eq!(first.average_latency_ms, 100.0);

        let second = &breakdown.steps[1];
        assert_eq!(second.step, "generate-introduction");
        assert_eq!(second.total_tokens, 300);
        assert_eq!(second.cost, Decimal::new(8, 3));
        assert_eq!(second.call_count, 1);
    }

    #[tokio::test]
    async fn test_step_breakdown_ignores_session_filter_and_untagged() {
        let (aggregator, repo, _temp_dir) = create_test_aggregator().await;

        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_workflow_step("extract-achievements")
                .with_tokens(100, 50)
                .with_cost(Decimal::new(5, 3)),
        )
        .await
        .unwrap();
        // No workflow step tag, stays out of the breakdown
        repo.record_usage(
            NewUsageRecord::new("user-1", "gpt-4", "openai")
                .with_tokens(500, 500)
                .with_cost(Decimal::new(99, 3)),
        )
        .await
        .unwrap();

        let (start, end) = wide_range();
        let breakdown = aggregator
            .generate_step_breakdown(Some("session-that-matches-nothing"), start, end)
            .await
            .unwrap();

        // Session id does not narrow the aggregation
        assert_eq!(breakdown.steps.len(), 1);
        assert_eq!(breakdown.total_tokens, 150);
        assert_eq!(breakdown.total_cost, Decimal::new(5, 3));
    }

    #[tokio::test]
    async fn test_step_breakdown_empty_range() {
        let (aggregator, _repo, _temp_dir) = create_test_aggregator().await;

        let (start, end) = wide_range();
        let breakdown = aggregator
            .generate_step_breakdown(None, start, end)
            .await
            .unwrap();

        assert_eq!(breakdown.total_tokens, 0);
        assert_eq!(breakdown.total_cost, Decimal::ZERO);
        assert!(breakdown.steps.is_empty());
    }

    #[test]
    fn test_average_latency_rounding() {
        assert_eq!(average_latency(0, 0), 0.0);
        assert_eq!(average_latency(301, 2), 150.5);
        assert_eq!(average_latency(1000, 3), 333.33);
    }
}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::storage::database::decimal_helpers;

/// Default retention window for the cleanup sweep, in days.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Repository for recording and querying usage records
pub struct UsageRepository {
    pool: SqlitePool,
}

/// A persisted usage record, one per billable model call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub model: String,
    pub provider: String,
    pub scenario: Option<String>,
    pub agent_type: Option<String>,
    pub workflow_step: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: Decimal,
    pub latency_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
}

/// Input for a new usage record, before the store assigns id and timestamp
#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub user_id: String,
    pub model: String,
    pub provider: String,
    pub scenario: Option<String>,
    pub agent_type: Option<String>,
    pub workflow_step: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: Decimal,
    pub latency_ms: i64,
    pub success: bool,
    pub error_code: Option<String>,
}

impl NewUsageRecord {
    pub fn new(
        user_id: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            model: model.into(),
            provider: provider.into(),
            scenario: None,
            agent_type: None,
            workflow_step: None,
            input_tokens: 0,
            output_tokens: 0,
            cost: Decimal::ZERO,
            latency_ms: 0,
            success: true,
            error_code: None,
        }
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = Some(scenario.into());
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_workflow_step(mut self, workflow_step: impl Into<String>) -> Self {
        self.workflow_step = Some(workflow_step.into());
        self
    }

    pub fn with_tokens(mut self, input_tokens: i64, output_tokens: i64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_latency(mut self, latency_ms: i64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Mark the call as failed, with an optional provider error code
    pub fn failed(mut self, error_code: Option<&str>) -> Self {
        self.success = false;
        self.error_code = error_code.map(|code| code.to_string());
        self
    }

    /// Check the record invariants before it is written
    fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            return Err(Error::validation("user_id must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation("model must not be empty"));
        }
        if self.provider.trim().is_empty() {
            return Err(Error::validation("provider must not be empty"));
        }
        if self.input_tokens < 0 {
            return Err(Error::validation("input_tokens must not be negative"));
        }
        if self.output_tokens < 0 {
            return Err(Error::validation("output_tokens must not be negative"));
        }
        if self.cost < Decimal::ZERO {
            return Err(Error::validation("cost must not be negative"));
        }
        if self.latency_ms < 0 {
            return Err(Error::validation("latency_ms must not be negative"));
        }
        Ok(())
    }
}

impl UsageRepository {
    /// Create a new usage repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a usage event with the current time as its timestamp
    pub async fn record_usage(&self, record: NewUsageRecord) -> Result<UsageRecord> {
        self.insert_record(record, Utc::now()).await
    }

    /// Record a usage event with an explicit timestamp, for backfilling
    /// imported usage data
    pub async fn record_usage_at(
        &self,
        record: NewUsageRecord,
        timestamp: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        self.insert_record(record, timestamp).await
    }

    async fn insert_record(
        &self,
        record: NewUsageRecord,
        timestamp: DateTime<Utc>,
    ) -> Result<UsageRecord> {
        record.validate()?;

        debug!(
            "Recording usage: user={}, model={}, provider={}, input_tokens={}, output_tokens={}, cost={}",
            record.user_id, record.model, record.provider,
            record.input_tokens, record.output_tokens, record.cost
        );

        let result = sqlx::query(
            r#"
            INSERT INTO usage_records (
                timestamp, user_id, model, provider, scenario, agent_type, workflow_step,
                input_tokens, output_tokens, cost, latency_ms, success, error_code
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(timestamp.timestamp_millis())
        .bind(&record.user_id)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(&record.scenario)
        .bind(&record.agent_type)
        .bind(&record.workflow_step)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(decimal_helpers::decimal_to_string(record.cost))
        .bind(record.latency_ms)
        .bind(record.success)
        .bind(&record.error_code)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record usage for user {}: {}", record.user_id, e);
            Error::Database(e)
        })?;

        let id = result.last_insert_rowid();
        info!("Recorded usage record {} for user {}", id, record.user_id);

        Ok(UsageRecord {
            id,
            timestamp,
            user_id: record.user_id,
            model: record.model,
            provider: record.provider,
            scenario: record.scenario,
            agent_type: record.agent_type,
            workflow_step: record.workflow_step,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            cost: record.cost,
            latency_ms: record.latency_ms,
            success: record.success,
            error_code: record.error_code,
        })
    }

    /// Get usage records for a specific time period, newest first
    pub async fn get_usage_records(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        user_id: Option<&str>,
        model: Option<&str>,
        limit: Option<i32>,
        offset: Option<i32>,
    ) -> Result<Vec<UsageRecord>> {
        debug!("Getting usage records with filters");

        let mut query = String::from(
            r#"
            SELECT id, timestamp, user_id, model, provider, scenario, agent_type, workflow_step,
                   input_tokens, output_tokens, cost, latency_ms, success, error_code
            FROM usage_records WHERE 1=1
            "#,
        );

        if start_time.is_some() {
            query.push_str(" AND timestamp >= ?");
        }
        if end_time.is_some() {
            query.push_str(" AND timestamp <= ?");
        }
        if user_id.is_some() {
            query.push_str(" AND user_id = ?");
        }
        if model.is_some() {
            query.push_str(" AND model = ?");
        }

        query.push_str(" ORDER BY timestamp DESC");

        if let Some(limit) = limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = offset {
            query.push_str(&format!(" OFFSET {}", offset));
        }

        let mut query_builder = sqlx::query(&query);

        if let Some(start) = start_time {
            query_builder = query_builder.bind(start.timestamp_millis());
        }
        if let Some(end) = end_time {
            query_builder = query_builder.bind(end.timestamp_millis());
        }
        if let Some(user) = user_id {
            query_builder = query_builder.bind(user);
        }
        if let Some(model) = model {
            query_builder = query_builder.bind(model);
        }

        let rows = query_builder.fetch_all(&self.pool).await.map_err(|e| {
            error!("Failed to get usage records: {}", e);
            Error::Database(e)
        })?;

        let mut records = Vec::new();
        for row in rows {
            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            let timestamp_ms: i64 = row.get("timestamp");
            let timestamp =
                DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);

            records.push(UsageRecord {
                id: row.get("id"),
                timestamp,
                user_id: row.get("user_id"),
                model: row.get("model"),
                provider: row.get("provider"),
                scenario: row.get("scenario"),
                agent_type: row.get("agent_type"),
                workflow_step: row.get("workflow_step"),
                input_tokens: row.get("input_tokens"),
                output_tokens: row.get("output_tokens"),
                cost,
                latency_ms: row.get("latency_ms"),
                success: row.get("success"),
                error_code: row.get("error_code"),
            });
        }

        debug!("Retrieved {} usage records", records.len());
        Ok(records)
    }

    /// Delete usage records older than the retention window
    pub async fn cleanup_old_records(&self, days_to_keep: u32) -> Result<u64> {
        info!("Cleaning up usage records older than {} days", days_to_keep);

        let cutoff_time = Utc::now() - chrono::Duration::days(days_to_keep as i64);

        let result = sqlx::query("DELETE FROM usage_records WHERE timestamp < ?")
            .bind(cutoff_time.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to clean up old usage records: {}", e);
                Error::Database(e)
            })?;

        let deleted_rows = result.rows_affected();
        info!("Cleaned up {} old usage records", deleted_rows);

        Ok(deleted_rows)
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::storage::aggregation::{average_latency, round_cost, UNKNOWN_KEY};
use crate::storage::database::decimal_helpers;

/// Dimension a cost report is grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupBy {
    Model,
    Scenario,
    User,
    AgentType,
    WorkflowStep,
}

impl GroupBy {
    /// Column holding the group key for this dimension
    fn column(&self) -> &'static str {
        match self {
            GroupBy::Model => "model",
            GroupBy::Scenario => "scenario",
            GroupBy::User => "user_id",
            GroupBy::AgentType => "agent_type",
            GroupBy::WorkflowStep => "workflow_step",
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupBy::Model => "model",
            GroupBy::Scenario => "scenario",
            GroupBy::User => "user",
            GroupBy::AgentType => "agent-type",
            GroupBy::WorkflowStep => "workflow-step",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for GroupBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "model" => Ok(GroupBy::Model),
            "scenario" => Ok(GroupBy::Scenario),
            "user" => Ok(GroupBy::User),
            "agent-type" => Ok(GroupBy::AgentType),
            "workflow-step" => Ok(GroupBy::WorkflowStep),
            other => Err(Error::validation(format!(
                "unknown group-by dimension: {}",
                other
            ))),
        }
    }
}

/// Time window a report covers, inclusive on both ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One row of a cost report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReportItem {
    pub key: String,
    pub cost: Decimal,
    pub call_count: u64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub average_latency_ms: f64,
}

/// A computed cost summary over one grouping dimension
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostReport {
    pub period: ReportPeriod,
    pub group_by: GroupBy,
    pub total_cost: Decimal,
    pub items: Vec<CostReportItem>,
}

/// Builds cost reports and serializes them for export
pub struct ReportBuilder {
    pool: SqlitePool,
}

#[derive(Default)]
struct ItemAccumulator {
    input_tokens: i64,
    output_tokens: i64,
    cost: Decimal,
    latency_ms: i64,
    calls: u64,
}

impl ReportBuilder {
    /// Create a new report builder over the usage record store
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Build a cost report over the date range, grouped by one dimension.
    ///
    /// Records without a value for the dimension are reported under the
    /// "unknown" key. This applies to every dimension here, unlike the
    /// per-dimension aggregator accessors which exclude untagged records
    /// for agent type and workflow step.
    pub async fn generate_cost_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        group_by: GroupBy,
    ) -> Result<CostReport> {
        debug!(
            "Generating cost report grouped by {} between {} and {}",
            group_by, start, end
        );

        let query = format!(
            "SELECT {} AS group_key, input_tokens, output_tokens, cost, latency_ms \
             FROM usage_records WHERE success = TRUE AND timestamp >= ? AND timestamp <= ?",
            group_by.column()
        );

        let rows = sqlx::query(&query)
            .bind(start.timestamp_millis())
            .bind(end.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load records for cost report: {}", e);
                Error::Database(e)
            })?;

        let mut by_key: HashMap<String, ItemAccumulator> = HashMap::new();
        for row in rows {
            let key: Option<String> = row.get("group_key");
            let key = key.unwrap_or_else(|| UNKNOWN_KEY.to_string());

            let cost_str: String = row.get("cost");
            let cost = decimal_helpers::string_to_decimal(&cost_str)?;

            let entry = by_key.entry(key).or_default();
            entry.input_tokens += row.get::<i64, _>("input_tokens");
            entry.output_tokens += row.get::<i64, _>("output_tokens");
            entry.latency_ms += row.get::<i64, _>("latency_ms");
            entry.cost += cost;
            entry.calls += 1;
        }

        let mut items = by_key
            .into_iter()
            .map(|(key, acc)| CostReportItem {
                key,
                cost: round_cost(acc.cost),
                call_count: acc.calls,
                input_tokens: acc.input_tokens,
                output_tokens: acc.output_tokens,
                average_latency_ms: average_latency(acc.latency_ms, acc.calls),
            })
            .collect::<Vec<_>>();

        items.sort_by(|a, b| b.cost.cmp(&a.cost));

        // Total over the rounded item costs, not re-derived from raw rows
        let total_cost = round_cost(items.iter().map(|item| item.cost).sum::<Decimal>());

        debug!(
            "Cost report has {} items, total cost {}",
            items.len(),
            total_cost
        );

        Ok(CostReport {
            period: ReportPeriod { start, end },
            group_by,
            total_cost,
            items,
        })
    }

    /// Serialize a report to CSV: a period/grouping/total header block, a
    /// blank line, then one row per item. Keys are internal tags, so no
    /// quoting is applied.
    pub fn export_cost_report_to_csv(&self, report: &CostReport) -> String {
        let mut csv = String::new();

        csv.push_str(&format!(
            "Period: {} - {}\n",
            report.period.start.to_rfc3339(),
            report.period.end.to_rfc3339()
        ));
        csv.push_str(&format!("Group By: {}\n", report.group_by));
        csv.push_str(&format!("Total Cost: {}\n", report.total_cost));
        csv.push('\n');
        csv.push_str("Key,Cost,Call Count,Input Tokens,Output Tokens,Average Latency (ms)\n");

        for item in &report.items {
            csv.push_str(&format!(
                "{},{},{},{},{},{}\n",
                item.key,
                item.cost,
                item.call_count,
                item.input_tokens,
                item.output_tokens,
                item.average_latency_ms
            ));
        }

        csv
    }

    /// Serialize a report to pretty-printed JSON
    pub fn export_cost_report_to_json(&self, report: &CostReport) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }
}

/// One row of a filtered per-key cost listing
#[derive(Debug, Serialize)]
struct CostListingRow<'a> {
    key: &'a str,
    cost: Decimal,
}

/// Serialize per-key cost sums as CSV, keeping the given order
pub fn export_cost_listing_to_csv(entries: &[(String, Decimal)]) -> String {
    let mut csv = String::from("Key,Cost\n");
    for (key, cost) in entries {
        csv.push_str(&format!("{},{}\n", key, cost));
    }
    csv
}

/// Serialize per-key cost sums as pretty-printed JSON, keeping the given
/// order
pub fn export_cost_listing_to_json(entries: &[(String, Decimal)]) -> Result<String> {
    let rows = entries
        .iter()
        .map(|(key, cost)| CostListingRow {
            key: key.as_str(),
            cost: *cost,
        })
        .collect::<Vec<_>>();
    Ok(serde_json::to_string_pretty(&rows)?)
}

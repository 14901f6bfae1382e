// Storage layer for persistent data

pub mod aggregation;
pub mod database;
pub mod reports;
pub mod statistics;
pub mod thresholds;
pub mod usage;

pub use aggregation::{CostAggregator, StepBreakdown, StepStats, UNKNOWN_KEY};
pub use database::{decimal_helpers, Database, DatabaseStatistics};
pub use reports::{
    CostReport, CostReportItem, GroupBy, ReportBuilder, ReportPeriod, export_cost_listing_to_csv,
    export_cost_listing_to_json,
};
pub use statistics::{ModelUsageStats, UsageStatistics, UserUsageStats};
pub use thresholds::{CostThreshold, ThresholdMonitor, ThresholdStore};
pub use usage::{NewUsageRecord, UsageRecord, UsageRepository, DEFAULT_RETENTION_DAYS};

use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;

use crate::error::{Error, Result};

#[derive(Parser)]
#[command(name = "costmeter")]
#[command(about = "Usage metering, cost reporting, and spend thresholds for AI model calls")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Override the data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record a usage event
    Record {
        /// Acting user id
        #[arg(short, long)]
        user: String,

        /// Model that served the call
        #[arg(short, long)]
        model: String,

        /// Provider hosting the model
        #[arg(short, long)]
        provider: String,

        /// Business scenario tag
        #[arg(long)]
        scenario: Option<String>,

        /// Agent type tag
        #[arg(long)]
        agent_type: Option<String>,

        /// Workflow step tag
        #[arg(long)]
        workflow_step: Option<String>,

        /// Input tokens consumed
        #[arg(long, default_value_t = 0)]
        input_tokens: i64,

        /// Output tokens produced
        #[arg(long, default_value_t = 0)]
        output_tokens: i64,

        /// Cost in USD
        #[arg(long, default_value = "0")]
        cost: String,

        /// Call latency in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: i64,

        /// Record the call as failed
        #[arg(long)]
        failed: bool,

        /// Error code for failed calls
        #[arg(long)]
        error_code: Option<String>,
    },

    /// Summarize costs over a date range
    Report {
        /// Range start (YYYY-MM-DD, defaults to 30 days ago)
        #[arg(short, long)]
        start: Option<String>,

        /// Range end (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        end: Option<String>,

        /// Dimension to group by (model, scenario, user, agent-type, workflow-step)
        #[arg(short, long, default_value = "model")]
        group_by: String,

        /// Only sum records matching this dimension value
        #[arg(long)]
        filter: Option<String>,

        /// Output format (table, csv, json)
        #[arg(short, long, default_value = "table")]
        format: String,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Break down cost and tokens by workflow step
    Steps {
        /// Range start (YYYY-MM-DD, defaults to 30 days ago)
        #[arg(short, long)]
        start: Option<String>,

        /// Range end (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        end: Option<String>,

        /// Session id, accepted for compatibility
        #[arg(long)]
        session: Option<String>,
    },

    /// Show usage statistics for a model or a user
    Stats {
        /// Model to summarize
        #[arg(short, long)]
        model: Option<String>,

        /// User to summarize
        #[arg(short, long)]
        user: Option<String>,

        /// Range start (YYYY-MM-DD, defaults to 30 days ago)
        #[arg(short, long)]
        start: Option<String>,

        /// Range end (YYYY-MM-DD, defaults to today)
        #[arg(short, long)]
        end: Option<String>,
    },

    /// Manage per-user cost thresholds
    Threshold {
        /// User the threshold applies to
        user: String,

        /// Set the daily limit in USD
        #[arg(long)]
        daily: Option<String>,

        /// Set the monthly limit in USD
        #[arg(long)]
        monthly: Option<String>,

        /// Set the alert email
        #[arg(long)]
        email: Option<String>,

        /// Check today's spend against the daily limit
        #[arg(long)]
        check: bool,

        /// Show the stored threshold
        #[arg(long)]
        status: bool,
    },

    /// Delete usage records older than the retention window
    Cleanup {
        /// Retention window in days (defaults to the configured value)
        #[arg(short, long)]
        days: Option<u32>,
    },

    /// Database maintenance
    Db {
        /// Show database statistics
        #[arg(long)]
        stats: bool,

        /// Reclaim unused space
        #[arg(long)]
        vacuum: bool,

        /// Run an integrity check
        #[arg(long)]
        verify: bool,

        /// Refresh query planner statistics
        #[arg(long)]
        analyze: bool,

        /// Write a backup to this path
        #[arg(long)]
        backup: Option<String>,
    },
}

/// Parse a USD amount from the command line
pub fn parse_amount(value: &str) -> Result<Decimal> {
    value
        .parse::<Decimal>()
        .map_err(|e| Error::validation(format!("Invalid amount '{}': {}", value, e)))
}

/// Resolve an optional YYYY-MM-DD date pair into an inclusive UTC range.
/// Missing bounds default to the trailing 30 days.
pub fn parse_date_range(
    start: Option<&str>,
    end: Option<&str>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let end = match end {
        Some(text) => parse_date(text)?
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap()
            .and_utc(),
        None => Utc::now(),
    };
    let start = match start {
        Some(text) => parse_date(text)?.and_hms_opt(0, 0, 0).unwrap().and_utc(),
        None => end - Duration::days(30),
    };

    if start > end {
        return Err(Error::validation("Start date is after end date"));
    }

    Ok((start, end))
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| Error::validation(format!("Invalid date '{}', expected YYYY-MM-DD", text)))
}

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use costmeter::app::{AppConfig, AppState};
use costmeter::cli::{parse_amount, parse_date_range, Cli, Commands};
use costmeter::error::{Error, Result};
use costmeter::platform::AppPaths;
use costmeter::storage::{
    CostReport, GroupBy, NewUsageRecord, StepBreakdown, export_cost_listing_to_csv,
    export_cost_listing_to_json,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.debug {
        "costmeter=debug"
    } else {
        "costmeter=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().unwrap()),
        )
        .init();

    let state = init_app_state(cli.data_dir).await?;
    run_command(&state, cli.command).await
}

async fn init_app_state(data_dir: Option<PathBuf>) -> Result<AppState> {
    info!("Starting costmeter");

    // Initialize paths and create directories
    let paths = match data_dir {
        Some(dir) => AppPaths::with_data_dir(dir)?,
        None => AppPaths::new()?,
    };
    paths.ensure_dirs_exist()?;

    // Load configuration
    let config = AppConfig::load(&paths).await?;

    // Initialize application state
    let state = AppState::new(config, paths).await?;
    info!("Application state initialized");

    Ok(state)
}

async fn run_command(state: &AppState, command: Commands) -> Result<()> {
    match command {
        Commands::Record {
            user,
            model,
            provider,
            scenario,
            agent_type,
            workflow_step,
            input_tokens,
            output_tokens,
            cost,
            latency_ms,
            failed,
            error_code,
        } => {
            let cost = parse_amount(&cost)?;

            let mut record = NewUsageRecord::new(user, model, provider)
                .with_tokens(input_tokens, output_tokens)
                .with_cost(cost)
                .with_latency(latency_ms);
            if let Some(scenario) = scenario {
                record = record.with_scenario(scenario);
            }
            if let Some(agent_type) = agent_type {
                record = record.with_agent_type(agent_type);
            }
            if let Some(workflow_step) = workflow_step {
                record = record.with_workflow_step(workflow_step);
            }
            if failed {
                record = record.failed(error_code.as_deref());
            }

            let stored = state.get_usage_repo().record_usage(record).await?;
            println!(
                "Recorded usage record {} for {} at {}",
                stored.id,
                stored.user_id,
                stored.timestamp.to_rfc3339()
            );
            Ok(())
        }

        Commands::Report {
            start,
            end,
            group_by,
            filter,
            format,
            output,
        } => cmd_report(state, start, end, group_by, filter, format, output).await,

        Commands::Steps { start, end, session } => {
            let (start, end) = parse_date_range(start.as_deref(), end.as_deref())?;
            let breakdown = state
                .get_aggregator()
                .generate_step_breakdown(session.as_deref(), start, end)
                .await?;
            print_step_breakdown(&breakdown);
            Ok(())
        }

        Commands::Stats {
            model,
            user,
            start,
            end,
        } => cmd_stats(state, model, user, start, end).await,

        Commands::Threshold {
            user,
            daily,
            monthly,
            email,
            check,
            status,
        } => cmd_threshold(state, user, daily, monthly, email, check, status).await,

        Commands::Cleanup { days } => {
            let days = days.unwrap_or_else(|| state.get_config().storage.retention_days);
            let deleted = state.get_usage_repo().cleanup_old_records(days).await?;
            println!("Deleted {} records older than {} days", deleted, days);
            Ok(())
        }

        Commands::Db {
            stats,
            vacuum,
            verify,
            analyze,
            backup,
        } => cmd_db(state, stats, vacuum, verify, analyze, backup).await,
    }
}

async fn cmd_report(
    state: &AppState,
    start: Option<String>,
    end: Option<String>,
    group_by: String,
    filter: Option<String>,
    format: String,
    output: Option<String>,
) -> Result<()> {
    let (start, end) = parse_date_range(start.as_deref(), end.as_deref())?;
    let group_by: GroupBy = group_by.parse()?;

    // A filter turns the report into a direct dimension query
    if let Some(filter) = filter {
        let aggregator = state.get_aggregator();
        let costs = match group_by {
            GroupBy::Model => aggregator.get_cost_by_model(start, end, Some(&filter)).await?,
            GroupBy::Scenario => {
                aggregator.get_cost_by_scenario(start, end, Some(&filter)).await?
            }
            GroupBy::User => aggregator.get_cost_by_user(start, end, Some(&filter)).await?,
            GroupBy::AgentType => {
                aggregator.get_cost_by_agent_type(start, end, Some(&filter)).await?
            }
            GroupBy::WorkflowStep => {
                aggregator
                    .get_cost_by_workflow_step(start, end, Some(&filter))
                    .await?
            }
        };

        let mut entries = costs.into_iter().collect::<Vec<_>>();
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        return match format.as_str() {
            "table" => {
                println!(
                    "Cost by {} ({} - {})",
                    group_by,
                    start.to_rfc3339(),
                    end.to_rfc3339()
                );
                for (key, cost) in entries {
                    println!("{:<30} {}", key, cost);
                }
                Ok(())
            }
            "csv" => write_output(output.as_deref(), &export_cost_listing_to_csv(&entries)).await,
            "json" => {
                write_output(output.as_deref(), &export_cost_listing_to_json(&entries)?).await
            }
            other => Err(Error::validation(format!("Unknown report format: {}", other))),
        };
    }

    let builder = state.get_report_builder();
    let report = builder.generate_cost_report(start, end, group_by).await?;

    match format.as_str() {
        "table" => {
            print_cost_report(&report);
            Ok(())
        }
        "csv" => write_output(output.as_deref(), &builder.export_cost_report_to_csv(&report)).await,
        "json" => {
            write_output(output.as_deref(), &builder.export_cost_report_to_json(&report)?).await
        }
        other => Err(Error::validation(format!("Unknown report format: {}", other))),
    }
}

async fn cmd_stats(
    state: &AppState,
    model: Option<String>,
    user: Option<String>,
    start: Option<String>,
    end: Option<String>,
) -> Result<()> {
    let (start, end) = parse_date_range(start.as_deref(), end.as_deref())?;

    match (model, user) {
        (Some(model), None) => {
            let stats = state
                .get_statistics()
                .get_model_usage_stats(&model, start, end)
                .await?;
            println!("Model: {}", stats.model);
            println!("  Calls: {} ({} ok, {} failed)",
                stats.total_calls, stats.successful_calls, stats.failed_calls);
            println!("  Total cost: {}", stats.total_cost);
            println!("  Tokens: {} in / {} out",
                stats.total_input_tokens, stats.total_output_tokens);
            println!("  Average latency: {} ms", stats.average_latency_ms);
            Ok(())
        }
        (None, Some(user)) => {
            let stats = state
                .get_statistics()
                .get_user_usage_stats(&user, start, end)
                .await?;
            println!("User: {}", stats.user_id);
            println!("  Calls: {} ({} ok, {} failed)",
                stats.total_calls, stats.successful_calls, stats.failed_calls);
            println!("  Total cost: {}", stats.total_cost);
            println!("  Tokens: {} in / {} out",
                stats.total_input_tokens, stats.total_output_tokens);
            println!("  Average latency: {} ms", stats.average_latency_ms);

            let mut by_model = stats.cost_by_model.into_iter().collect::<Vec<_>>();
            by_model.sort_by(|a, b| b.1.cmp(&a.1));
            if !by_model.is_empty() {
                println!("  Cost by model:");
                for (model, cost) in by_model {
                    println!("    {:<26} {}", model, cost);
                }
            }
            Ok(())
        }
        _ => Err(Error::validation("Provide exactly one of --model or --user")),
    }
}

async fn cmd_threshold(
    state: &AppState,
    user: String,
    daily: Option<String>,
    monthly: Option<String>,
    email: Option<String>,
    check: bool,
    status: bool,
) -> Result<()> {
    let monitor = state.get_threshold_monitor();

    if daily.is_some() || monthly.is_some() || email.is_some() {
        let mut threshold = monitor.get_cost_threshold(&user).await.unwrap_or_default();
        if let Some(daily) = daily {
            threshold.daily_limit = Some(parse_amount(&daily)?);
        }
        if let Some(monthly) = monthly {
            threshold.monthly_limit = Some(parse_amount(&monthly)?);
        }
        if let Some(email) = email {
            threshold.alert_email = Some(email);
        }
        monitor.set_cost_threshold(user.as_str(), threshold).await;
        println!("Threshold updated for {}", user);
    } else if (check || status) && monitor.get_cost_threshold(&user).await.is_none() {
        // Fall back to the configured billing defaults
        if let Some(default_threshold) = state.get_config().default_threshold() {
            monitor.set_cost_threshold(user.as_str(), default_threshold).await;
        }
    }

    if status {
        match monitor.get_cost_threshold(&user).await {
            Some(threshold) => {
                let format_limit = |limit: Option<rust_decimal::Decimal>| {
                    limit.map_or_else(|| "none".to_string(), |value| value.to_string())
                };
                println!("User: {}", user);
                println!("  Daily limit: {}", format_limit(threshold.daily_limit));
                println!("  Monthly limit: {}", format_limit(threshold.monthly_limit));
                println!(
                    "  Alert email: {}",
                    threshold.alert_email.as_deref().unwrap_or("none")
                );
            }
            None => println!("No threshold configured for {}", user),
        }
    }

    if check {
        let spent = monitor.daily_cost(&user).await?;
        if monitor.check_cost_threshold(&user).await? {
            println!("{} is OVER the daily limit (spent {} today)", user, spent);
        } else {
            println!("{} is within the daily limit (spent {} today)", user, spent);
        }
    }

    Ok(())
}

async fn cmd_db(
    state: &AppState,
    stats: bool,
    vacuum: bool,
    verify: bool,
    analyze: bool,
    backup: Option<String>,
) -> Result<()> {
    let database = state.get_database();
    let no_action = !stats && !vacuum && !verify && !analyze && backup.is_none();

    if stats || no_action {
        let statistics = database.get_statistics().await?;
        println!("Usage records: {}", statistics.usage_records_count);
        println!("Database size: {}", statistics.size_human_readable());
    }
    if vacuum {
        database.vacuum().await?;
        println!("Vacuum complete");
    }
    if verify {
        if database.verify_integrity().await? {
            println!("Integrity check passed");
        } else {
            println!("Integrity check FAILED");
        }
    }
    if analyze {
        database.analyze().await?;
        println!("Analyze complete");
    }
    if let Some(path) = backup {
        database.backup(&path).await?;
        println!("Backup written to {}", path);
    }

    Ok(())
}

fn print_cost_report(report: &CostReport) {
    println!(
        "Cost report ({} - {})",
        report.period.start.to_rfc3339(),
        report.period.end.to_rfc3339()
    );
    println!("Grouped by {}, total cost {}", report.group_by, report.total_cost);
    println!();
    println!(
        "{:<28} {:>12} {:>8} {:>12} {:>13} {:>10}",
        "Key", "Cost", "Calls", "Input Tok", "Output Tok", "Avg ms"
    );
    for item in &report.items {
        println!(
            "{:<28} {:>12} {:>8} {:>12} {:>13} {:>10.2}",
            item.key,
            item.cost.to_string(),
            item.call_count,
            item.input_tokens,
            item.output_tokens,
            item.average_latency_ms
        );
    }
}

fn print_step_breakdown(breakdown: &StepBreakdown) {
    println!("Total tokens: {}", breakdown.total_tokens);
    println!("Total cost: {}", breakdown.total_cost);
    println!();
    println!(
        "{:<28} {:>8} {:>12} {:>13} {:>12} {:>10}",
        "Step", "Calls", "Input Tok", "Output Tok", "Cost", "Avg ms"
    );
    for step in &breakdown.steps {
        println!(
            "{:<28} {:>8} {:>12} {:>13} {:>12} {:>10.2}",
            step.step,
            step.call_count,
            step.input_tokens,
            step.output_tokens,
            step.cost.to_string(),
            step.average_latency_ms
        );
    }
}

async fn write_output(path: Option<&str>, content: &str) -> Result<()> {
    match path {
        Some(path) => {
            tokio::fs::write(path, content).await?;
            println!("Wrote report to {}", path);
        }
        None => print!("{}", content),
    }
    Ok(())
}

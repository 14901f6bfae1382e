use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::app::config::AppConfig;
use crate::error::Result;
use crate::platform::AppPaths;
use crate::storage::{
    CostAggregator, Database, ReportBuilder, ThresholdMonitor, ThresholdStore, UsageRepository,
    UsageStatistics,
};

pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    database: Database,
    usage_repo: UsageRepository,
    aggregator: CostAggregator,
    report_builder: ReportBuilder,
    threshold_monitor: ThresholdMonitor,
    statistics: UsageStatistics,
}

impl AppState {
    pub async fn new(config: AppConfig, paths: AppPaths) -> Result<Self> {
        info!("Initializing application state");

        // Initialize database
        let database = Database::new(&paths).await?;
        let pool = database.pool();

        // Initialize services over the shared pool
        let usage_repo = UsageRepository::new(pool.clone());
        let aggregator = CostAggregator::new(pool.clone());
        let report_builder = ReportBuilder::new(pool.clone());
        let statistics = UsageStatistics::new(pool.clone());
        let threshold_store = Arc::new(ThresholdStore::new());
        let threshold_monitor = ThresholdMonitor::new(pool.clone(), threshold_store);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            database,
            usage_repo,
            aggregator,
            report_builder,
            threshold_monitor,
            statistics,
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        {
            let mut config = self.config.write();
            updater(&mut config);
            config.validate()?;
        }

        let config = self.config.read().clone();
        config.save(&self.paths).await?;

        info!("Configuration updated and saved");
        Ok(())
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn get_database(&self) -> &Database {
        &self.database
    }

    pub fn get_usage_repo(&self) -> &UsageRepository {
        &self.usage_repo
    }

    pub fn get_aggregator(&self) -> &CostAggregator {
        &self.aggregator
    }

    pub fn get_report_builder(&self) -> &ReportBuilder {
        &self.report_builder
    }

    pub fn get_threshold_monitor(&self) -> &ThresholdMonitor {
        &self.threshold_monitor
    }

    pub fn get_statistics(&self) -> &UsageStatistics {
        &self.statistics
    }
}

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::{Error, Result};
use crate::platform::AppPaths;
use crate::storage::{CostThreshold, DEFAULT_RETENTION_DAYS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub storage: StorageConfig,
    pub billing: BillingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Records older than this many days are eligible for cleanup
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub default_daily_limit_usd: Option<f64>,
    pub default_monthly_limit_usd: Option<f64>,
    pub alert_email: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                log_level: "info".to_string(),
            },
            storage: StorageConfig {
                retention_days: DEFAULT_RETENTION_DAYS,
            },
            billing: BillingConfig {
                default_daily_limit_usd: None,
                default_monthly_limit_usd: None,
                alert_email: None,
            },
        }
    }
}

impl AppConfig {
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(paths).await?;
            return Ok(default_config);
        }

        info!("Loading configuration from: {:?}", config_file);

        let config_content = fs::read_to_string(&config_file).await?;
        let config: AppConfig = toml::from_str(&config_content)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        let config_file = paths.config_file();

        info!("Saving configuration to: {:?}", config_file);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(config::ConfigError::Message(e.to_string())))?;

        fs::write(&config_file, config_content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.general.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::validation(format!("Unknown log level: {}", other)));
            }
        }

        if self.storage.retention_days == 0 {
            return Err(Error::validation("retention_days must be at least 1"));
        }

        for (name, limit) in [
            ("default_daily_limit_usd", self.billing.default_daily_limit_usd),
            ("default_monthly_limit_usd", self.billing.default_monthly_limit_usd),
        ] {
            if let Some(value) = limit {
                if !value.is_finite() || value < 0.0 {
                    return Err(Error::validation(format!(
                        "{} must be a non-negative number",
                        name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Threshold built from the configured billing defaults, if any limit
    /// is set
    pub fn default_threshold(&self) -> Option<CostThreshold> {
        let daily_limit = self
            .billing
            .default_daily_limit_usd
            .and_then(|v| Decimal::try_from(v).ok());
        let monthly_limit = self
            .billing
            .default_monthly_limit_usd
            .and_then(|v| Decimal::try_from(v).ok());

        if daily_limit.is_none() && monthly_limit.is_none() {
            return None;
        }

        Some(CostThreshold {
            daily_limit,
            monthly_limit,
            alert_email: self.billing.alert_email.clone(),
        })
    }
}

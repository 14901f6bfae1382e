pub mod config;
pub mod state;

pub use config::{AppConfig, BillingConfig, GeneralConfig, StorageConfig};
pub use state::AppState;

pub mod app;
pub mod cli;
pub mod error;
pub mod platform;
pub mod storage;

pub use error::{Error, Result};

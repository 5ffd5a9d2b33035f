pub mod config;
pub mod errors;
pub mod logging;
pub mod models;
pub mod paths;
pub mod traits;

pub use config::SchedulerConfig;
pub use errors::*;
pub use logging::{init_logging, LogConfig, LogLevel, OutputFormat};
pub use models::*;
pub use paths::StorePaths;
pub use traits::*;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

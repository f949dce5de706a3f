pub mod config;
pub mod logging;
pub mod paths;

pub use config::{
    Config, ConfigError, EngineSettings, LogLevel, LoggingConfig, ValidationError,
    ValidatorSettings,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};

pub const APP_NAME: &str = "plugbench";
pub const APP_AUTHOR: &str = "Plugbench";
pub const APP_QUALIFIER: &str = "io";

pub mod config;
pub mod logging;

pub use config::{ConfigLoader, ConfigSource, MessagingConfig};
pub use logging::{setup_logging, LogFormat, LogOutput, LoggingConfig};

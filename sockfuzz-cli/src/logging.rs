use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration for the sockfuzz CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Whether to include thread names in logs
    pub include_thread_names: bool,

    /// Whether to enable colored output
    pub enable_colors: bool,

    /// Module-specific log levels
    pub module_levels: std::collections::HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut module_levels = std::collections::HashMap::new();

        // Set default levels for common modules
        module_levels.insert("sockfuzz_cli".to_string(), "info".to_string());
        module_levels.insert("fuzz_engine".to_string(), "info".to_string());
        module_levels.insert("tokio".to_string(), "warn".to_string());

        Self {
            level: "info".to_string(),
            include_thread_names: false,
            enable_colors: true,
            module_levels,
        }
    }
}

impl LoggingConfig {
    /// Default configuration at the given base level
    pub fn from_level(level: &str) -> Self {
        Self {
            level: level.to_string(),
            ..Self::default()
        }
    }
}

/// Initialize logging based on the provided configuration
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    // Build the environment filter
    let mut filter = EnvFilter::new(&config.level);

    // Add module-specific filters
    for (module, level) in &config.module_levels {
        let directive = format!("{}={}", module, level);
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid log directive: {}", directive))?,
        );
    }

    // Try to initialize logging, ignore if already initialized
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(config.include_thread_names)
                .with_ansi(config.enable_colors),
        )
        .try_init();

    match result {
        Ok(_) => {
            tracing::debug!("logging initialized at level: {}", config.level);
        }
        Err(_) => {
            // Logging already initialized, that's fine
            tracing::debug!("logging already initialized, skipping");
        }
    }

    Ok(())
}

/// Log level utilities
pub mod levels {
    /// Check if a log level string is valid
    pub fn is_valid_level(level: &str) -> bool {
        matches!(
            level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        )
    }

    /// Get all valid log levels
    pub fn valid_levels() -> Vec<&'static str> {
        vec!["trace", "debug", "info", "warn", "error"]
    }
}

use crate::config::LoggingSettings;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Configuration for logging.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_file: bool,
    pub include_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_file: false,
            include_line: false,
        }
    }
}

impl From<&LoggingSettings> for LogConfig {
    fn from(settings: &LoggingSettings) -> Self {
        Self {
            level: settings.level.clone(),
            format: LogFormat::from(settings.format.as_str()),
            ..Self::default()
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. A second call is a no-op.
pub fn init_logging(config: &LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let base = fmt::layer()
        .with_target(config.include_target)
        .with_file(config.include_file)
        .with_line_number(config.include_line);

    let fmt_layer = match config.format {
        LogFormat::Json => base.json().with_span_events(FmtSpan::CLOSE).boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global subscriber already installed");
        return;
    }

    tracing::info!(level = %config.level, format = ?config.format, "Logging initialized");
}

/// Keeps `visible_chars` at each end and stars out the rest.
/// Values too short to keep both ends are starred out entirely.
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        return "*".repeat(chars.len());
    }

    let prefix: String = chars[..visible_chars].iter().collect();
    let suffix: String = chars[chars.len() - visible_chars..].iter().collect();
    let masked_len = chars.len() - (visible_chars * 2);

    format!("{}{}{}", prefix, "*".repeat(masked_len), suffix)
}

use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub redis: RedisSettings,
    pub idempotency: IdempotencySettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Which cache store backs the replay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub main_header: String,
    pub repeated_header: String,
    /// Record lifetime, in minutes.
    pub expiration_minutes: u64,
    /// How long a first request may hold its key before the reservation lapses.
    pub lock_ttl_seconds: u64,
    pub http_methods: Vec<String>,
    pub key_prefix: String,
    pub store: StoreBackend,
    pub max_body_bytes: usize,
    pub cleanup_interval_seconds: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            main_header: "Idempotency-Key".to_string(),
            repeated_header: "Idempotent-Replayed".to_string(),
            expiration_minutes: 360, // 6 hours
            lock_ttl_seconds: 30,
            http_methods: vec!["POST".to_string()],
            key_prefix: "idem".to_string(),
            store: StoreBackend::Redis,
            max_body_bytes: 2 * 1024 * 1024,
            cleanup_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("idempotency.http_methods")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

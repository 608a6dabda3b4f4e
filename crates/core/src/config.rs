use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub locking: LockingConfig,
    pub mail: MailConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Tunables of the request lifecycle engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Business days before an unattended request expires.
    pub expired_day_limit: i64,
    /// Minutes after which an incomplete submission is re-submitted.
    pub resubmit_timeout_mins: i64,
    /// Sweep interval per master table.
    pub sweep_interval_secs: u64,
    /// Cooperative per-sweep time budget.
    pub sweep_budget_ms: u64,
    /// Assignee of last resort.
    pub default_agent: String,
    /// Offset of the business timezone from UTC, whole hours.
    pub utc_offset_hours: i32,
    /// Bounded attempts per outbound notification.
    pub notification_attempts: u32,
    /// Static holiday feed, ISO dates.
    pub holidays: Vec<NaiveDate>,
}

#[derive(Clone, Debug)]
pub struct LockingConfig {
    pub lease_ms: i64,
    pub acquire_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

#[derive(Clone, Debug)]
pub struct MailConfig {
    pub from_address: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_password: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub default_agent: Option<String>,
    pub expired_day_limit: Option<i64>,
    pub sweep_interval_secs: Option<u64>,
    pub mail_from_address: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://caseflow.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            engine: EngineConfig {
                expired_day_limit: 5,
                resubmit_timeout_mins: 10,
                sweep_interval_secs: 60,
                sweep_budget_ms: 45_000,
                default_agent: "mdm-default".to_string(),
                utc_offset_hours: 7,
                notification_attempts: 3,
                holidays: Vec::new(),
            },
            locking: LockingConfig {
                lease_ms: 300_000,
                acquire_wait_ms: 10_000,
                backoff_base_ms: 25,
                backoff_cap_ms: 800,
            },
            mail: MailConfig {
                from_address: "mdm-noreply@example.com".to_string(),
                smtp_host: "localhost".to_string(),
                smtp_port: 25,
                smtp_password: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch)?;
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("caseflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) -> Result<(), ConfigError> {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(expired_day_limit) = engine.expired_day_limit {
                self.engine.expired_day_limit = expired_day_limit;
            }
            if let Some(resubmit_timeout_mins) = engine.resubmit_timeout_mins {
                self.engine.resubmit_timeout_mins = resubmit_timeout_mins;
            }
            if let Some(sweep_interval_secs) = engine.sweep_interval_secs {
                self.engine.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(sweep_budget_ms) = engine.sweep_budget_ms {
                self.engine.sweep_budget_ms = sweep_budget_ms;
            }
            if let Some(default_agent) = engine.default_agent {
                self.engine.default_agent = default_agent;
            }
            if let Some(utc_offset_hours) = engine.utc_offset_hours {
                self.engine.utc_offset_hours = utc_offset_hours;
            }
            if let Some(notification_attempts) = engine.notification_attempts {
                self.engine.notification_attempts = notification_attempts;
            }
            if let Some(holidays) = engine.holidays {
                self.engine.holidays = parse_holidays(&holidays)?;
            }
        }

        if let Some(locking) = patch.locking {
            if let Some(lease_ms) = locking.lease_ms {
                self.locking.lease_ms = lease_ms;
            }
            if let Some(acquire_wait_ms) = locking.acquire_wait_ms {
                self.locking.acquire_wait_ms = acquire_wait_ms;
            }
            if let Some(backoff_base_ms) = locking.backoff_base_ms {
                self.locking.backoff_base_ms = backoff_base_ms;
            }
            if let Some(backoff_cap_ms) = locking.backoff_cap_ms {
                self.locking.backoff_cap_ms = backoff_cap_ms;
            }
        }

        if let Some(mail) = patch.mail {
            if let Some(from_address) = mail.from_address {
                self.mail.from_address = from_address;
            }
            if let Some(smtp_host) = mail.smtp_host {
                self.mail.smtp_host = smtp_host;
            }
            if let Some(smtp_port) = mail.smtp_port {
                self.mail.smtp_port = smtp_port;
            }
            if let Some(smtp_password_value) = mail.smtp_password {
                self.mail.smtp_password = Some(smtp_password_value.into());
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CASEFLOW_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CASEFLOW_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("CASEFLOW_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CASEFLOW_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CASEFLOW_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CASEFLOW_SERVER_PORT") {
            self.server.port = parse_u16("CASEFLOW_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("CASEFLOW_ENGINE_EXPIRED_DAY_LIMIT") {
            self.engine.expired_day_limit = parse_i64("CASEFLOW_ENGINE_EXPIRED_DAY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_ENGINE_RESUBMIT_TIMEOUT_MINS") {
            self.engine.resubmit_timeout_mins =
                parse_i64("CASEFLOW_ENGINE_RESUBMIT_TIMEOUT_MINS", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_ENGINE_SWEEP_INTERVAL_SECS") {
            self.engine.sweep_interval_secs =
                parse_u64("CASEFLOW_ENGINE_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("CASEFLOW_ENGINE_DEFAULT_AGENT") {
            self.engine.default_agent = value;
        }
        if let Some(value) = read_env("CASEFLOW_ENGINE_UTC_OFFSET_HOURS") {
            self.engine.utc_offset_hours = parse_i64("CASEFLOW_ENGINE_UTC_OFFSET_HOURS", &value)?
                as i32;
        }

        if let Some(value) = read_env("CASEFLOW_MAIL_FROM_ADDRESS") {
            self.mail.from_address = value;
        }
        if let Some(value) = read_env("CASEFLOW_MAIL_SMTP_HOST") {
            self.mail.smtp_host = value;
        }
        if let Some(value) = read_env("CASEFLOW_MAIL_SMTP_PASSWORD") {
            self.mail.smtp_password = Some(value.into());
        }

        let log_level =
            read_env("CASEFLOW_LOGGING_LEVEL").or_else(|| read_env("CASEFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CASEFLOW_LOGGING_FORMAT").or_else(|| read_env("CASEFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(default_agent) = overrides.default_agent {
            self.engine.default_agent = default_agent;
        }
        if let Some(expired_day_limit) = overrides.expired_day_limit {
            self.engine.expired_day_limit = expired_day_limit;
        }
        if let Some(sweep_interval_secs) = overrides.sweep_interval_secs {
            self.engine.sweep_interval_secs = sweep_interval_secs;
        }
        if let Some(mail_from_address) = overrides.mail_from_address {
            self.mail.from_address = mail_from_address;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_engine(&self.engine)?;
        validate_locking(&self.locking)?;
        validate_mail(&self.mail)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("caseflow.toml"), PathBuf::from("config/caseflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn parse_holidays(raw: &[String]) -> Result<Vec<NaiveDate>, ConfigError> {
    raw.iter()
        .map(|value| {
            NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
                ConfigError::Validation(format!(
                    "engine.holidays entries must be ISO dates (got `{value}`)"
                ))
            })
        })
        .collect()
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url = url.starts_with("sqlite:") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::memory:`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if !(1..=60).contains(&engine.expired_day_limit) {
        return Err(ConfigError::Validation(
            "engine.expired_day_limit must be in range 1..=60 business days".to_string(),
        ));
    }
    if engine.resubmit_timeout_mins <= 0 {
        return Err(ConfigError::Validation(
            "engine.resubmit_timeout_mins must be greater than zero".to_string(),
        ));
    }
    if engine.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "engine.sweep_interval_secs must be greater than zero".to_string(),
        ));
    }
    if engine.default_agent.trim().is_empty() {
        return Err(ConfigError::Validation("engine.default_agent must be set".to_string()));
    }
    if !(-12..=14).contains(&engine.utc_offset_hours) {
        return Err(ConfigError::Validation(
            "engine.utc_offset_hours must be a valid UTC offset".to_string(),
        ));
    }
    if engine.notification_attempts == 0 {
        return Err(ConfigError::Validation(
            "engine.notification_attempts must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_locking(locking: &LockingConfig) -> Result<(), ConfigError> {
    if locking.lease_ms < 1_000 {
        return Err(ConfigError::Validation(
            "locking.lease_ms must be at least one second".to_string(),
        ));
    }
    if locking.backoff_base_ms == 0 || locking.backoff_cap_ms < locking.backoff_base_ms {
        return Err(ConfigError::Validation(
            "locking backoff must satisfy 0 < base <= cap".to_string(),
        ));
    }
    Ok(())
}

fn validate_mail(mail: &MailConfig) -> Result<(), ConfigError> {
    if !mail.from_address.contains('@') {
        return Err(ConfigError::Validation(
            "mail.from_address must be an email address".to_string(),
        ));
    }
    if mail.smtp_host.trim().is_empty() {
        return Err(ConfigError::Validation("mail.smtp_host must be set".to_string()));
    }
    if mail.smtp_port == 0 {
        return Err(ConfigError::Validation(
            "mail.smtp_port must be greater than zero".to_string(),
        ));
    }
    if let Some(password) = &mail.smtp_password {
        if password.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "mail.smtp_password must not be blank when provided".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_i64(key: &str, value: &str) -> Result<i64, ConfigError> {
    value.parse::<i64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    engine: Option<EnginePatch>,
    locking: Option<LockingPatch>,
    mail: Option<MailPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    expired_day_limit: Option<i64>,
    resubmit_timeout_mins: Option<i64>,
    sweep_interval_secs: Option<u64>,
    sweep_budget_ms: Option<u64>,
    default_agent: Option<String>,
    utc_offset_hours: Option<i32>,
    notification_attempts: Option<u32>,
    holidays: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LockingPatch {
    lease_ms: Option<i64>,
    acquire_wait_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MailPatch {
    from_address: Option<String>,
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    smtp_password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_and_carry_engine_tunables() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.engine.expired_day_limit == 5, "default expiry window should be 5 days")?;
        ensure(
            config.engine.resubmit_timeout_mins == 10,
            "default resubmit timeout should be 10 minutes",
        )?;
        ensure(config.locking.lease_ms == 300_000, "default lease should be 300 seconds")?;
        Ok(())
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_CASEFLOW_AGENT", "agent-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("caseflow.toml");
            fs::write(
                &path,
                r#"
[engine]
default_agent = "${TEST_CASEFLOW_AGENT}"
holidays = ["2026-03-03", "2026-05-01"]
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.engine.default_agent == "agent-from-env",
                "default agent should be loaded from environment",
            )?;
            ensure(config.engine.holidays.len() == 2, "holiday feed should be parsed")?;
            Ok(())
        })();

        clear_vars(&["TEST_CASEFLOW_AGENT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CASEFLOW_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CASEFLOW_ENGINE_DEFAULT_AGENT", "agent-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("caseflow.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[engine]
default_agent = "agent-from-file"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.engine.default_agent == "agent-from-env",
                "env default agent should win over file and defaults",
            )?;
            Ok(())
        })();

        clear_vars(&["CASEFLOW_DATABASE_URL", "CASEFLOW_ENGINE_DEFAULT_AGENT"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CASEFLOW_ENGINE_EXPIRED_DAY_LIMIT", "0");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("expired_day_limit")
            );
            ensure(has_message, "validation failure should mention expired_day_limit")
        })();

        clear_vars(&["CASEFLOW_ENGINE_EXPIRED_DAY_LIMIT"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CASEFLOW_LOG_LEVEL", "warn");
        env::set_var("CASEFLOW_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warn log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["CASEFLOW_LOG_LEVEL", "CASEFLOW_LOG_FORMAT"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CASEFLOW_MAIL_SMTP_PASSWORD", "smtp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("smtp-secret-value"),
                "debug output should not contain the smtp password",
            )
        })();

        clear_vars(&["CASEFLOW_MAIL_SMTP_PASSWORD"]);
        result
    }
}

use crate::policy::ThresholdConfig;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config.json";

fn config_file_path() -> PathBuf {
    env_value("HVAC_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_value(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("{key} has an invalid value `{raw}`"))
        })
        .transpose()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    t_min: Option<f64>,
    #[serde(default)]
    t_max: Option<f64>,
    #[serde(default)]
    ticks: Option<u32>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    db_host: Option<String>,
    #[serde(default)]
    db_name: Option<String>,
    #[serde(default)]
    db_user: Option<String>,
    #[serde(default)]
    db_password: Option<String>,
    #[serde(default)]
    db_port: Option<u16>,
    #[serde(default)]
    db_pool_min: Option<u32>,
    #[serde(default)]
    db_pool_max: Option<u32>,
}

fn load_file_config() -> Option<FileConfig> {
    let path = config_file_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "hvac-controller failed to read config file; using env only"
            );
            return None;
        }
    };
    match parse_file_config(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "hvac-controller failed to parse config file; using env only"
            );
            None
        }
    }
}

fn parse_file_config(contents: String) -> Result<FileConfig, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub bootstrap_schema: bool,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub keep_alive_secs: u64,
    pub retry_interval_secs: u64,
    pub max_attempts: u32,
    pub server_timeout_secs: u64,
}

impl HubConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_secs(self.server_timeout_secs)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 10,
            retry_interval_secs: 5,
            max_attempts: 999,
            server_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub token: String,
    pub thresholds: ThresholdConfig,
    pub ticks: u32,
    pub actuator_timeout_secs: u64,
    pub hub: HubConfig,
    pub database: DatabaseConfig,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let file = load_file_config().unwrap_or_default();
        Self::resolve(&file)
    }

    fn resolve(file: &FileConfig) -> Result<Self> {
        let host = env_value("HOST")
            .or_else(|| non_blank(file.host.as_ref()))
            .context("HOST is required (or `host` in the config file)")?;
        let token = env_value("TOKEN")
            .or_else(|| non_blank(file.token.as_ref()))
            .context("TOKEN is required (or `token` in the config file)")?;

        let t_min = env_parsed::<f64>("T_MIN")?
            .or(file.t_min)
            .context("T_MIN is required (or `t_min` in the config file)")?;
        let t_max = env_parsed::<f64>("T_MAX")?
            .or(file.t_max)
            .context("T_MAX is required (or `t_max` in the config file)")?;
        if t_min.is_nan() || t_max.is_nan() {
            bail!("temperature bounds must be numbers");
        }
        let thresholds = ThresholdConfig::new(t_min, t_max);
        if thresholds.is_inverted() {
            tracing::warn!(t_min, t_max, "T_MAX <= T_MIN; cooling takes precedence");
        }

        let ticks = env_parsed::<u32>("TICKS")?.or(file.ticks).unwrap_or(10);
        let actuator_timeout_secs =
            env_parsed::<u64>("HVAC_ACTUATOR_TIMEOUT_SECS")?.unwrap_or(10);

        let defaults = HubConfig::default();
        let hub = HubConfig {
            keep_alive_secs: env_parsed("HVAC_HUB_KEEPALIVE_SECS")?
                .unwrap_or(defaults.keep_alive_secs),
            retry_interval_secs: env_parsed("HVAC_HUB_RETRY_SECS")?
                .unwrap_or(defaults.retry_interval_secs),
            max_attempts: env_parsed("HVAC_HUB_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            server_timeout_secs: env_parsed("HVAC_HUB_SERVER_TIMEOUT_SECS")?
                .unwrap_or(defaults.server_timeout_secs),
        };
        if hub.keep_alive_secs == 0 {
            bail!("HVAC_HUB_KEEPALIVE_SECS must be greater than zero");
        }
        if hub.server_timeout_secs == 0 {
            bail!("HVAC_HUB_SERVER_TIMEOUT_SECS must be greater than zero");
        }

        let database = resolve_database(file)?;
        let otlp_endpoint = env_value("OTEL_EXPORTER_OTLP_ENDPOINT");

        Ok(Self {
            host,
            token,
            thresholds,
            ticks,
            actuator_timeout_secs,
            hub,
            database,
            otlp_endpoint,
        })
    }

    pub fn actuator_timeout(&self) -> Duration {
        Duration::from_secs(self.actuator_timeout_secs)
    }
}

fn resolve_database(file: &FileConfig) -> Result<DatabaseConfig> {
    let url = env_value("DATABASE_URL")
        .or_else(|| non_blank(file.database_url.as_ref()))
        .map(normalize_database_url);

    let min_connections = env_parsed("HVAC_DB_POOL_MIN")?
        .or(file.db_pool_min)
        .unwrap_or(1);
    let max_connections = env_parsed::<u32>("HVAC_DB_POOL_MAX")?
        .or(file.db_pool_max)
        .unwrap_or(10)
        .max(1);
    let acquire_timeout_secs = env_parsed("HVAC_DB_ACQUIRE_TIMEOUT_SECS")?.unwrap_or(5);
    let write_timeout_secs = env_parsed::<u64>("HVAC_DB_WRITE_TIMEOUT_SECS")?
        .unwrap_or(10)
        .max(1);
    let bootstrap_schema = env_value("HVAC_DB_BOOTSTRAP_SCHEMA")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let field = |env_key: &str, from_file: Option<&String>| -> Option<String> {
        env_value(env_key).or_else(|| non_blank(from_file))
    };
    let host = field("DB_HOST", file.db_host.as_ref());
    let name = field("DB_NAME", file.db_name.as_ref());
    let user = field("DB_USER", file.db_user.as_ref());
    let password = field("DB_PASSWORD", file.db_password.as_ref()).unwrap_or_default();
    let port = env_parsed::<u16>("DB_PORT")?.or(file.db_port).unwrap_or(5432);

    let (host, name, user) = if url.is_some() {
        (
            host.unwrap_or_default(),
            name.unwrap_or_default(),
            user.unwrap_or_default(),
        )
    } else {
        (
            host.context("DB_HOST or DATABASE_URL is required")?,
            name.context("DB_NAME or DATABASE_URL is required")?,
            user.context("DB_USER or DATABASE_URL is required")?,
        )
    };

    Ok(DatabaseConfig {
        url,
        host,
        port,
        name,
        user,
        password,
        min_connections: min_connections.min(max_connections),
        max_connections,
        acquire_timeout_secs,
        write_timeout_secs,
        bootstrap_schema,
    })
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

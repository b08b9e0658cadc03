use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::Provider;

#[derive(Debug, Clone)]
pub struct Config {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub host: IpAddr,
    pub port: u16,
    pub log_level: String,
    pub max_body_size: usize,
    pub policy_file: Option<PathBuf>,
    pub execution: ExecutionConfig,
    pub scheduler: SchedulerConfig,
    pub webhooks: WebhookConfig,
    pub terraform: TerraformConfig,
    pub providers: ProviderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Retry budget and per-step ceilings for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub validate_timeout: Duration,
    pub apply_timeout: Duration,
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            validate_timeout: Duration::from_secs(30),
            apply_timeout: Duration::from_secs(600),
            verify_timeout: Duration::from_secs(300),
            verify_poll: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(1000),
            liveness_timeout: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub urls: Vec<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TerraformConfig {
    pub binary: PathBuf,
    pub workdir: PathBuf,
    pub templates: PathBuf,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            workdir: PathBuf::from("./data/terraform"),
            templates: PathBuf::from("./templates"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderMode {
    Simulated,
    Gateway,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub mode: ProviderMode,
    pub gateways: Vec<(Provider, String)>,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let store = match env_or("CLOUDPILOT_STORE", "postgres").as_str() {
            "postgres" => StoreKind::Postgres,
            "memory" => StoreKind::Memory,
            other => return Err(format!("Invalid CLOUDPILOT_STORE: {other}")),
        };
        let database_url = match store {
            StoreKind::Postgres => Some(env_required("DATABASE_URL")?),
            StoreKind::Memory => std::env::var("DATABASE_URL").ok(),
        };
        let jwt_secret = env_required("JWT_SECRET")?;

        let host: IpAddr = env_or("CLOUDPILOT_HOST", "0.0.0.0")
            .parse()
            .map_err(|e| format!("Invalid CLOUDPILOT_HOST: {e}"))?;
        let port: u16 = env_parse("CLOUDPILOT_PORT", "3000")?;
        let log_level = env_or("CLOUDPILOT_LOG_LEVEL", "info");
        let max_body_size: usize = env_parse("CLOUDPILOT_MAX_BODY_SIZE", "1048576")?;
        let policy_file = std::env::var("CLOUDPILOT_POLICY_FILE").ok().map(PathBuf::from);

        let execution = ExecutionConfig {
            max_attempts: env_parse("CLOUDPILOT_MAX_ATTEMPTS", "3")?,
            backoff_base: Duration::from_millis(env_parse("CLOUDPILOT_BACKOFF_BASE_MS", "500")?),
            backoff_max: Duration::from_millis(env_parse("CLOUDPILOT_BACKOFF_MAX_MS", "30000")?),
            validate_timeout: Duration::from_secs(env_parse(
                "CLOUDPILOT_VALIDATE_TIMEOUT_SECS",
                "30",
            )?),
            apply_timeout: Duration::from_secs(env_parse("CLOUDPILOT_APPLY_TIMEOUT_SECS", "600")?),
            verify_timeout: Duration::from_secs(env_parse(
                "CLOUDPILOT_VERIFY_TIMEOUT_SECS",
                "300",
            )?),
            verify_poll: Duration::from_millis(env_parse("CLOUDPILOT_VERIFY_POLL_MS", "2000")?),
        };
        if execution.max_attempts == 0 {
            return Err("CLOUDPILOT_MAX_ATTEMPTS must be at least 1".to_string());
        }

        let scheduler = SchedulerConfig {
            worker_count: env_parse("CLOUDPILOT_WORKER_COUNT", "4")?,
            poll_interval: Duration::from_millis(env_parse("CLOUDPILOT_POLL_INTERVAL_MS", "1000")?),
            liveness_timeout: Duration::from_secs(env_parse(
                "CLOUDPILOT_LIVENESS_TIMEOUT_SECS",
                "900",
            )?),
        };
        if scheduler.worker_count == 0 {
            return Err("CLOUDPILOT_WORKER_COUNT must be at least 1".to_string());
        }

        let webhooks = WebhookConfig {
            urls: env_or("CLOUDPILOT_WEBHOOK_URLS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    reqwest::Url::parse(s)
                        .map(|_| s.to_string())
                        .map_err(|e| format!("Invalid CLOUDPILOT_WEBHOOK_URLS entry '{s}': {e}"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            secret: std::env::var("CLOUDPILOT_WEBHOOK_SECRET").ok(),
        };

        let terraform = TerraformConfig {
            binary: PathBuf::from(env_or("CLOUDPILOT_TERRAFORM_BIN", "terraform")),
            workdir: PathBuf::from(env_or("CLOUDPILOT_TERRAFORM_WORKDIR", "./data/terraform")),
            templates: PathBuf::from(env_or("CLOUDPILOT_TERRAFORM_TEMPLATES", "./templates")),
        };

        let mode = match env_or("CLOUDPILOT_PROVIDER_MODE", "simulated").as_str() {
            "simulated" => ProviderMode::Simulated,
            "gateway" => ProviderMode::Gateway,
            other => return Err(format!("Invalid CLOUDPILOT_PROVIDER_MODE: {other}")),
        };
        let gateways: Vec<(Provider, String)> = Provider::ALL
            .iter()
            .filter_map(|p| {
                let key = format!("CLOUDPILOT_{}_GATEWAY_URL", p.as_str().to_uppercase());
                std::env::var(key).ok().map(|url| (*p, url))
            })
            .collect();
        if mode == ProviderMode::Gateway && gateways.is_empty() {
            return Err(
                "CLOUDPILOT_PROVIDER_MODE=gateway needs at least one CLOUDPILOT_<PROVIDER>_GATEWAY_URL"
                    .to_string(),
            );
        }

        Ok(Config {
            store,
            database_url,
            jwt_secret,
            host,
            port,
            log_level,
            max_body_size,
            policy_file,
            execution,
            scheduler,
            webhooks,
            terraform,
            providers: ProviderConfig { mode, gateways },
        })
    }
}

fn env_required(key: &str) -> Result<String, String> {
    std::env::var(key).map_err(|_| format!("Missing required environment variable: {key}"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e| format!("Invalid {key}: {e}"))
}

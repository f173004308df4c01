use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub worker_count: usize,
    pub poll_interval_ms: u64,
    pub lease_seconds: u64,
    pub max_retries: i32,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
    pub queue_retention_days: u32,
    pub history_limit: i64,
    pub apply_ssh_user: String,
    pub apply_ssh_key_path: PathBuf,
    pub apply_ssh_port: u16,
    pub ssh_known_hosts_path: PathBuf,
    pub strict_host_key_check: bool,
    pub connect_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,
    pub authorized_keys_templates: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("KEYFLEET_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("KEYFLEET_DATABASE_URL must be set for the engine runtime")?;
        let database_url = normalize_database_url(database_url);

        let worker_count = env_u64("KEYFLEET_WORKER_COUNT", 4).clamp(1, 32) as usize;
        let poll_interval_ms = env_u64("KEYFLEET_POLL_INTERVAL_MS", 500).clamp(50, 10_000);
        let lease_seconds = env_u64("KEYFLEET_LEASE_SECONDS", 180).clamp(30, 3_600);
        let max_retries = env_u64("KEYFLEET_MAX_RETRIES", 3).clamp(1, 10) as i32;
        let retry_backoff_base_seconds =
            env_u64("KEYFLEET_RETRY_BACKOFF_BASE_SECONDS", 60).clamp(1, 3_600);
        let retry_backoff_cap_seconds =
            env_u64("KEYFLEET_RETRY_BACKOFF_CAP_SECONDS", 3_600).clamp(60, 24 * 3_600);
        let queue_retention_days = env_u64("KEYFLEET_QUEUE_RETENTION_DAYS", 7).clamp(1, 365) as u32;
        let history_limit = env_u64("KEYFLEET_HISTORY_LIMIT", 100).clamp(1, 1_000) as i64;

        let apply_ssh_user = env_string("KEYFLEET_APPLY_SSH_USER", "root");
        let apply_ssh_key_path =
            env_path("KEYFLEET_APPLY_SSH_KEY_PATH", "/etc/keyfleet/apply_key")?;
        let apply_ssh_port = env_u16("KEYFLEET_APPLY_SSH_PORT", 22);
        let ssh_known_hosts_path = env_path(
            "KEYFLEET_SSH_KNOWN_HOSTS_PATH",
            "/var/lib/keyfleet/known_hosts",
        )?;
        let strict_host_key_check = env_bool("KEYFLEET_STRICT_HOST_KEY_CHECK", false);
        let connect_timeout_seconds = env_u64("KEYFLEET_CONNECT_TIMEOUT_SECONDS", 10).clamp(1, 120);
        let operation_timeout_seconds =
            env_u64("KEYFLEET_OPERATION_TIMEOUT_SECONDS", 60).clamp(5, 600);

        let mut authorized_keys_templates = default_authorized_keys_templates();
        if let Some(raw) = env_optional_string("KEYFLEET_AUTHORIZED_KEYS_TEMPLATES") {
            let overrides = parse_template_overrides(&raw)
                .context("KEYFLEET_AUTHORIZED_KEYS_TEMPLATES is not a valid JSON object")?;
            authorized_keys_templates.extend(overrides);
        }
        for (family, template) in &authorized_keys_templates {
            if !template.contains("{user}") {
                anyhow::bail!(
                    "authorized_keys template for os family {family} must contain a {{user}} placeholder"
                );
            }
        }

        Ok(Self {
            database_url,
            worker_count,
            poll_interval_ms,
            lease_seconds,
            max_retries,
            retry_backoff_base_seconds,
            retry_backoff_cap_seconds,
            queue_retention_days,
            history_limit,
            apply_ssh_user,
            apply_ssh_key_path,
            apply_ssh_port,
            ssh_known_hosts_path,
            strict_host_key_check,
            connect_timeout_seconds,
            operation_timeout_seconds,
            authorized_keys_templates,
        })
    }
}

pub fn default_authorized_keys_templates() -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    templates.insert(
        "linux".to_string(),
        "/home/{user}/.ssh/authorized_keys".to_string(),
    );
    templates.insert(
        "darwin".to_string(),
        "/Users/{user}/.ssh/authorized_keys".to_string(),
    );
    templates
}

fn parse_template_overrides(raw: &str) -> Result<BTreeMap<String, String>> {
    let overrides: BTreeMap<String, String> = serde_json::from_str(raw)?;
    Ok(overrides
        .into_iter()
        .map(|(family, template)| (family.trim().to_lowercase(), template.trim().to_string()))
        .filter(|(family, template)| !family.is_empty() && !template.is_empty())
        .collect())
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key)
        .ok()
        .map(|value| value.trim().to_lowercase())
    {
        Some(value) if value == "1" || value == "true" || value == "yes" => true,
        Some(value) if value == "0" || value == "false" || value == "no" => false,
        _ => default,
    }
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).unwrap_or_else(|| default.to_string());
    let path = PathBuf::from(value);
    if path.as_os_str().is_empty() {
        anyhow::bail!("{key} resolved to an empty path");
    }
    Ok(path)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

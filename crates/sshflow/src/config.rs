use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::ssh::{RemoteConfig, SshAuth, SshConfig};
use crate::worker::WorkerOptions;

/// Runtime configuration for a worker process, loaded from environment
/// variables (with a `.env` file honored in development).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub queue_name: String,
    pub worker_concurrency: usize,
    pub poll_interval_ms: u64,
    pub stalled_timeout_ms: i64,
    pub migrate_on_startup: bool,
    pub remote: RemoteConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL is missing".into()))?;

        let queue_name =
            env_or_fallback("SSHFLOW_QUEUE", "QUEUE").unwrap_or_else(|| "default".to_string());

        let worker_concurrency = env_or_fallback("SSHFLOW_CONCURRENCY", "WORKER_CONCURRENCY")
            .and_then(|s| s.parse().ok())
            .unwrap_or(1)
            .clamp(1, 64);

        let poll_interval_ms = env_or_fallback("SSHFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000)
            .clamp(1, 3_600_000);

        let stalled_timeout_ms =
            env_or_fallback("SSHFLOW_STALLED_TIMEOUT_MS", "STALLED_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(60_000)
                .max(1);

        let migrate_on_startup = env_bool("SSHFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let host = env_or_fallback("SSHFLOW_SSH_HOST", "SSH_HOST")
            .ok_or_else(|| Error::Config("SSH_HOST is missing".into()))?;

        let port = env_or_fallback("SSHFLOW_SSH_PORT", "SSH_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(22);

        let username = env_or_fallback("SSHFLOW_SSH_USERNAME", "SSH_USERNAME")
            .ok_or_else(|| Error::Config("SSH_USERNAME is missing".into()))?;

        let auth = select_auth(
            env_or_fallback("SSHFLOW_SSH_PASSWORD", "SSH_PASSWORD"),
            env_or_fallback("SSHFLOW_SSH_PRIVATE_KEY_PATH", "SSH_PRIVATE_KEY_PATH"),
            env_or_fallback("SSHFLOW_SSH_PASSPHRASE", "SSH_PASSPHRASE"),
        )?;

        let ready_timeout_ms = env_or_fallback("SSHFLOW_SSH_READY_TIMEOUT_MS", "SSH_READY_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(10_000)
            .clamp(100, 300_000);

        let working_dir = env_or_fallback("SSHFLOW_WORKING_DIR", "REMOTE_WORKING_DIR");

        let env = match env_or_fallback("SSHFLOW_REMOTE_ENV", "REMOTE_ENV") {
            Some(raw) => parse_remote_env(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            database_url,
            queue_name,
            worker_concurrency,
            poll_interval_ms,
            stalled_timeout_ms,
            migrate_on_startup,
            remote: RemoteConfig {
                ssh: SshConfig {
                    host,
                    port,
                    username,
                    auth,
                    ready_timeout_ms,
                },
                working_dir,
                env,
            },
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            queue_name: self.queue_name.clone(),
            concurrency: self.worker_concurrency,
            poll_interval_ms: self.poll_interval_ms,
            stalled_timeout_ms: self.stalled_timeout_ms,
        }
    }

    /// Every in-flight job appends logs concurrently with the scheduling
    /// loop, so the pool carries a little headroom over the concurrency.
    pub fn pool_size(&self) -> u32 {
        self.worker_concurrency as u32 + 2
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            std::env::var(fallback)
                .ok()
                .filter(|s| !s.trim().is_empty())
        })
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn select_auth(
    password: Option<String>,
    private_key_path: Option<String>,
    passphrase: Option<String>,
) -> Result<SshAuth> {
    match (password, private_key_path) {
        (Some(password), None) => Ok(SshAuth::Password(password)),
        (None, Some(path)) => Ok(SshAuth::Key {
            private_key_path: PathBuf::from(path),
            passphrase,
        }),
        (Some(_), Some(_)) => Err(Error::Config(
            "provide either SSH_PASSWORD or SSH_PRIVATE_KEY_PATH, not both".into(),
        )),
        (None, None) => Err(Error::Config(
            "one of SSH_PASSWORD or SSH_PRIVATE_KEY_PATH is required".into(),
        )),
    }
}

/// `KEY=value,OTHER=value` pairs exported into the remote shell. Values
/// are shell-escaped at command build time; keys must be valid shell
/// identifiers so escaping them never becomes necessary.
fn parse_remote_env(raw: &str) -> Result<Vec<(String, String)>> {
    let mut env = Vec::new();

    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("remote env entry {pair:?} is not KEY=value")))?;
        let key = key.trim();
        if !is_valid_env_key(key) {
            return Err(Error::Config(format!(
                "remote env key {key:?} is not a valid shell identifier"
            )));
        }
        env.push((key.to_string(), value.to_string()));
    }

    Ok(env)
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

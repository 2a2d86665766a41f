use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub custom_id: Option<String>,
    pub name: String,
    pub command: String,
    pub args: Json<Vec<String>>,
    pub working_dir: Option<String>,
    /// Seconds; None means the command may run indefinitely.
    pub timeout: Option<i32>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
    pub exit_code: Option<i32>,
    pub status: String,
    pub priority: i32,
    pub max_attempts: i32,
    pub attempts_made: i32,
    pub failed_reason: Option<String>,
    pub stack_trace: Option<String>,
    pub lock_token: Option<String>,
    pub keep_logs: i32,
    pub queue_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stalled,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Stalled => "STALLED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobLog {
    pub id: Uuid,
    pub job_id: i64,
    pub message: String,
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
}

/// The recognized per-job options. Producers pass a partial camelCase bag;
/// queue-level `default_job_options` use the same shape and are
/// shallow-merged underneath at insertion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct JobOptions {
    pub custom_id: Option<String>,
    pub priority: i32,
    pub max_attempts: i32,
    /// Seconds.
    pub timeout: Option<i32>,
    pub working_dir: Option<String>,
    pub keep_logs: i32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            custom_id: None,
            priority: 0,
            max_attempts: 1,
            timeout: None,
            working_dir: None,
            keep_logs: 50,
        }
    }
}

impl JobOptions {
    /// Shallow-merge two option bags (queue defaults under per-job
    /// overrides), fill the remaining fields with defaults, validate.
    pub fn merged(defaults: Option<&Value>, overrides: Option<&Value>) -> Result<Self> {
        let mut bag = serde_json::Map::new();

        for source in [defaults, overrides].into_iter().flatten() {
            let object = source
                .as_object()
                .ok_or_else(|| Error::InvalidOptions("options must be a JSON object".into()))?;
            for (key, value) in object {
                if !value.is_null() {
                    bag.insert(key.clone(), value.clone());
                }
            }
        }

        let options: JobOptions = serde_json::from_value(Value::Object(bag))
            .map_err(|e| Error::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidOptions(format!(
                "maxAttempts must be >= 1, got {}",
                self.max_attempts
            )));
        }
        if self.keep_logs < 1 {
            return Err(Error::InvalidOptions(format!(
                "keepLogs must be >= 1, got {}",
                self.keep_logs
            )));
        }
        if let Some(timeout) = self.timeout {
            if timeout < 1 {
                return Err(Error::InvalidOptions(format!(
                    "timeout must be >= 1 second, got {timeout}"
                )));
            }
        }
        Ok(())
    }
}

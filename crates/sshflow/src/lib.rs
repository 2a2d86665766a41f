pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod queues;
pub mod ssh;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use jobs::{Job, JobLog, JobOptions, JobStatus, JobsRepo};
pub use queues::{Queue, QueueStats, QueueStatus, QueuesRepo};
pub use ssh::{
    ExecResult, OutputChunk, RemoteConfig, RemoteExecutor, ServerInfo, SshAuth, SshConfig,
    SshExecutor,
};
pub use worker::{Worker, WorkerEvent, WorkerOptions};

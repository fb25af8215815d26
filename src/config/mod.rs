use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::supervisor::SupervisorConfig;
use crate::services::video_analyzer::VideoOptions;

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// PostgreSQL connection string for the job registry
    #[garde(length(min = 1))]
    pub database_url: String,

    /// Redis connection string for the job queue
    #[garde(length(min = 1))]
    pub redis_url: String,

    /// Root data directory; uploads are staged in `<data_dir>/uploads`
    #[serde(default = "default_data_dir")]
    #[garde(skip)]
    pub data_dir: PathBuf,

    /// Per-file upload limit in megabytes
    #[serde(default = "default_max_content_length_mb")]
    #[garde(range(min = 1))]
    pub max_content_length_mb: u64,

    /// Registry pool size for the HTTP server
    #[serde(default = "default_db_max_connections")]
    #[garde(range(min = 1, max = 1000))]
    pub db_max_connections: u32,

    /// Worker slots per worker process
    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1, max = 256))]
    pub worker_concurrency: usize,

    /// Retention window for finished jobs
    #[serde(default = "default_result_ttl_secs")]
    #[garde(skip)]
    pub result_ttl_secs: u64,

    /// Claims older than this are recovered by the supervisor
    #[serde(default = "default_claim_timeout_secs")]
    #[garde(range(min = 1))]
    pub claim_timeout_secs: u64,

    /// Deliveries before a stalled job is failed
    #[serde(default = "default_max_deliveries")]
    #[garde(range(min = 1))]
    pub max_deliveries: u32,

    /// Decode every Nth video frame
    #[serde(default = "default_frame_stride")]
    #[garde(range(min = 1))]
    pub frame_stride: u32,

    /// Maximum sampled frames per video
    #[serde(default = "default_max_frames")]
    #[garde(range(min = 1))]
    pub max_frames: u32,

    /// How long one dequeue call blocks waiting for work
    #[serde(default = "default_dequeue_wait_secs")]
    #[garde(range(min = 1))]
    pub dequeue_wait_secs: u64,

    /// Supervisor pass interval
    #[serde(default = "default_supervisor_interval_secs")]
    #[garde(range(min = 1))]
    pub supervisor_interval_secs: u64,

    /// Optional Prometheus listener for worker processes (e.g., "0.0.0.0:9100")
    #[serde(default)]
    #[garde(skip)]
    pub worker_metrics_addr: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_content_length_mb() -> u64 {
    200
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_result_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_claim_timeout_secs() -> u64 {
    600
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_frame_stride() -> u32 {
    15
}

fn default_max_frames() -> u32 {
    300
}

fn default_dequeue_wait_secs() -> u64 {
    5
}

fn default_supervisor_interval_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn max_upload_bytes(&self) -> usize {
        (self.max_content_length_mb * 1024 * 1024) as usize
    }

    /// Registry pool size for a worker process: one connection per slot,
    /// one for the supervisor and one spare.
    pub fn worker_pool_size(&self) -> u32 {
        self.worker_concurrency as u32 + 2
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn dequeue_wait(&self) -> Duration {
        Duration::from_secs(self.dequeue_wait_secs)
    }

    pub fn video_options(&self) -> VideoOptions {
        VideoOptions {
            frame_stride: self.frame_stride,
            max_frames: self.max_frames,
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            claim_timeout: Duration::from_secs(self.claim_timeout_secs),
            max_deliveries: self.max_deliveries,
            interval: Duration::from_secs(self.supervisor_interval_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, envy::Error> {
        envy::from_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/defects"),
            ("REDIS_URL", "redis://localhost:6379/0"),
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.max_upload_bytes(), 200 * 1024 * 1024);
        assert_eq!(config.result_ttl(), Duration::from_secs(21_600));
        assert_eq!(config.video_options(), VideoOptions::default());
        assert_eq!(config.uploads_dir(), PathBuf::from("./data/uploads"));
        assert!(config.worker_metrics_addr.is_none());
        assert_eq!(config.db_max_connections, 10);
        assert_eq!(config.worker_pool_size(), 4);
    }

    #[test]
    fn test_worker_pool_follows_concurrency() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/defects"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("WORKER_CONCURRENCY", "8"),
            ("DB_MAX_CONNECTIONS", "25"),
        ])
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_pool_size(), 10);
        assert_eq!(config.db_max_connections, 25);
    }

    #[test]
    fn test_zero_stride_is_rejected() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/defects"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("FRAME_STRIDE", "0"),
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_redis_url() {
        assert!(from_pairs(&[("DATABASE_URL", "postgres://localhost/defects")]).is_err());
    }
}

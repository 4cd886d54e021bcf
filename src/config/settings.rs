use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration settings for the application.
///
/// Groups the broker endpoint, the request-layer credentials, the HTTP
/// bind address and the worker's retry and sink policy.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rabbitmq: RabbitSettings,
    pub auth: BasicAuthSettings,
    pub server: ServerSettings,
    pub worker: WorkerSettings,
}

/// Where and how to reach the message broker.
#[derive(Debug, Deserialize, Clone)]
pub struct RabbitSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Name of the single durable work queue.
    pub queue: String,
    pub heartbeat_secs: u16,
    /// How long a broker operation may stall on a blocked connection before
    /// the connection is considered dead.
    pub blocked_timeout_secs: u64,
}

impl RabbitSettings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_secs))
    }

    pub fn blocked_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_timeout_secs)
    }
}

/// Credentials required by `POST /message`.
#[derive(Debug, Deserialize, Clone)]
pub struct BasicAuthSettings {
    pub username: String,
    pub password: String,
}

/// Configuration settings for the HTTP server.
///
/// Defines the host and port the server will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Consumer-side policy.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub log_path: PathBuf,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl WorkerSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Flat view of everything that can come from a config file or the
/// environment. Keys match the environment variable names, lower-cased, so
/// `RABBITMQ_HOST` and `rabbitmq_host = "..."` in a file mean the same thing.
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub rabbitmq_host: Option<String>,
    pub rabbitmq_port: Option<u16>,
    pub rabbitmq_vhost: Option<String>,
    pub rabbitmq_username: Option<String>,
    pub rabbitmq_password: Option<String>,
    pub rabbitmq_queue: Option<String>,
    pub rabbitmq_heartbeat: Option<u16>,
    pub rabbitmq_blocked_timeout: Option<u64>,
    pub basic_auth_username: Option<String>,
    pub basic_auth_password: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub worker_log_path: Option<PathBuf>,
    pub worker_max_retries: Option<u32>,
    pub worker_retry_delay: Option<u64>,
}

impl PartialSettings {
    /// Overlays the provided values on top of `defaults`.
    pub fn merge(self, defaults: Settings) -> Settings {
        Settings {
            rabbitmq: RabbitSettings {
                host: self.rabbitmq_host.unwrap_or(defaults.rabbitmq.host),
                port: self.rabbitmq_port.unwrap_or(defaults.rabbitmq.port),
                vhost: self.rabbitmq_vhost.unwrap_or(defaults.rabbitmq.vhost),
                username: self.rabbitmq_username.unwrap_or(defaults.rabbitmq.username),
                password: self.rabbitmq_password.unwrap_or(defaults.rabbitmq.password),
                queue: self.rabbitmq_queue.unwrap_or(defaults.rabbitmq.queue),
                heartbeat_secs: self
                    .rabbitmq_heartbeat
                    .unwrap_or(defaults.rabbitmq.heartbeat_secs),
                blocked_timeout_secs: self
                    .rabbitmq_blocked_timeout
                    .unwrap_or(defaults.rabbitmq.blocked_timeout_secs),
            },
            auth: BasicAuthSettings {
                username: self.basic_auth_username.unwrap_or(defaults.auth.username),
                password: self.basic_auth_password.unwrap_or(defaults.auth.password),
            },
            server: ServerSettings {
                host: self.server_host.unwrap_or(defaults.server.host),
                port: self.server_port.unwrap_or(defaults.server.port),
            },
            worker: WorkerSettings {
                log_path: self.worker_log_path.unwrap_or(defaults.worker.log_path),
                max_retries: self.worker_max_retries.unwrap_or(defaults.worker.max_retries),
                retry_delay_secs: self
                    .worker_retry_delay
                    .unwrap_or(defaults.worker.retry_delay_secs),
            },
        }
    }
}

/// Provides default values for `Settings`.
///
/// These match the docker-compose deployment the service was written for.
impl Default for Settings {
    fn default() -> Self {
        Self {
            rabbitmq: RabbitSettings {
                host: "rabbitmq".to_string(),
                port: 5672,
                vhost: "/".to_string(),
                username: "admin".to_string(),
                password: "secret".to_string(),
                queue: "messages".to_string(),
                heartbeat_secs: 600,
                blocked_timeout_secs: 300,
            },
            auth: BasicAuthSettings {
                username: "admin".to_string(),
                password: "secret".to_string(),
            },
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8000,
            },
            worker: WorkerSettings {
                log_path: PathBuf::from("/app/data/messages.log"),
                max_retries: 5,
                retry_delay_secs: 5,
            },
        }
    }
}

//! Configuration for the ingest worker

use core_config::nats::NatsConfig;
use core_config::{env_or_default, env_parse_or, ConfigError, Environment, FromEnv};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub environment: Environment,
    pub nats: NatsConfig,
    /// JSON file listing the monitored scopes
    pub scopes_file: PathBuf,
    pub health_port: u16,
}

impl FromEnv for WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            environment: Environment::from_env(),
            nats: NatsConfig::from_env()?,
            scopes_file: PathBuf::from(env_or_default("SCOPES_FILE", "scopes.json")),
            health_port: env_parse_or("HEALTH_PORT", 8081)?,
        })
    }
}

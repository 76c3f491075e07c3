//! Application identity.
//!
//! Every resource derives its default identity from the application: Kafka
//! client ids and consumer groups default to the application name, while
//! instance ids and transactional ids default to the derived instance name.
//! The instance name must be stable across restarts of the same logical
//! instance, since the broker binds transactional state to it.

use crate::config::{ConfigError, EnvReader, FromEnv};

/// Environment literals accepted for `ENCLAVE_APP_ENVIRONMENT`.
pub const ENVIRONMENTS: &[&str] = &[
    "production",
    "staging",
    "development",
    "prod",
    "stage",
    "stg",
    "dev",
    "local",
    "sandbox",
    "pilot",
    "snx",
];

/// Application metadata read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Application name (`ENCLAVE_APP_NAME`, required)
    pub name: String,
    /// Application version (`ENCLAVE_APP_VERSION`)
    pub version: String,
    /// Deployment environment (`ENCLAVE_APP_ENVIRONMENT`)
    pub environment: String,
    /// Explicit instance id (`ENCLAVE_APP_INSTANCE_ID`)
    pub instance_id: Option<String>,
}

impl FromEnv for AppConfig {
    fn from_reader(env: &EnvReader<'_>) -> Result<Self, ConfigError> {
        let name = env.required("ENCLAVE_APP_NAME")?;
        let environment = env.string_or("ENCLAVE_APP_ENVIRONMENT", "local");
        if !ENVIRONMENTS.contains(&environment.as_str()) {
            return Err(ConfigError::invalid(
                "ENCLAVE_APP_ENVIRONMENT",
                &environment,
                format!("expected one of {}", ENVIRONMENTS.join(", ")),
            ));
        }

        Ok(Self {
            name,
            version: env.string_or("ENCLAVE_APP_VERSION", "v0.1.0-alpha"),
            environment,
            instance_id: env
                .string("ENCLAVE_APP_INSTANCE_ID")
                .or_else(|| env.string("HOSTNAME")),
        })
    }
}

/// Resolved identity of a running application instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    name: String,
    version: String,
    environment: String,
    instance_id: String,
}

impl AppIdentity {
    /// Build an identity directly, mostly useful in tests.
    #[must_use]
    pub fn new(name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "v0.1.0-alpha".to_string(),
            environment: "local".to_string(),
            instance_id: instance_id.into(),
        }
    }

    /// Resolve the identity from configuration; the instance id falls back to `"0"`.
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            environment: config.environment.clone(),
            instance_id: config.instance_id.clone().unwrap_or_else(|| "0".to_string()),
        }
    }

    /// Application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Application version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Deployment environment.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Derived instance name, `"{name}-{instance_id}"`.
    #[must_use]
    pub fn instance_name(&self) -> String {
        format!("{}-{}", self.name, self.instance_id)
    }

    /// Emit the startup record describing this instance and its host.
    pub fn log_startup(&self) {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        tracing::info!(
            app = %self.name,
            environment = %self.environment,
            version = %self.version,
            instance_id = %self.instance_id,
            cpus,
            os = std::env::consts::OS,
            arch = std::env::consts::ARCH,
            "Starting application"
        );
    }
}

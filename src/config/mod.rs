//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to
//! prevent log leaks.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::lease::{DEFAULT_CLAIM_ATTEMPTS, DEFAULT_TTL, LeasePolicy};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Which store backs the coordinator.
#[derive(Debug)]
pub enum Backend {
    Fs {
        root: PathBuf,
    },
    Postgres {
        database_url: SecretString,
        max_connections: u32,
    },
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Fs { .. } => "fs",
            Backend::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub backend: Backend,
    pub lease_ttl: Duration,
    pub claim_attempts: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = match var("CLAIMQ_BACKEND").as_deref().map(str::trim) {
            None | Some("fs") => Backend::Fs {
                root: PathBuf::from(required_var(&var, "CLAIMQ_ITEMS_DIR")?),
            },
            Some("postgres") => Backend::Postgres {
                database_url: SecretString::from(required_var(&var, "DATABASE_URL")?),
                max_connections: parsed_var(&var, "CLAIMQ_DB_MAX_CONNECTIONS")?
                    .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            },
            Some(other) => {
                return Err(Error::Config(format!(
                    "CLAIMQ_BACKEND must be \"fs\" or \"postgres\", got \"{other}\""
                )));
            }
        };

        let lease_ttl = parsed_var::<u64>(&var, "CLAIMQ_LEASE_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TTL);
        let claim_attempts =
            parsed_var(&var, "CLAIMQ_CLAIM_ATTEMPTS")?.unwrap_or(DEFAULT_CLAIM_ATTEMPTS);

        Ok(Self {
            backend,
            lease_ttl,
            claim_attempts,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            ttl: self.lease_ttl,
            claim_attempts: self.claim_attempts,
        }
    }
}

fn required_var(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<String> {
    var(name).ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// A positive integer variable, or `None` when unset.
fn parsed_var<T>(var: impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value != T::default() => Ok(Some(value)),
        _ => Err(Error::Config(format!(
            "{name} must be a positive integer, got \"{raw}\""
        ))),
    }
}

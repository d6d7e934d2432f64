use std::env;
use std::path::PathBuf;
use std::time::Duration;

use queue_listener::messaging::{ConnectionDescriptor, DispatchMode, DEFAULT_RECONNECT_DELAY};

const DEFAULT_QUEUE_NAME: &str = "QUEUE_SERVICE";

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_host: String,
    pub rabbitmq_user: String,
    pub rabbitmq_password: String,
    pub rabbitmq_port: u16,
    pub server_port: u16,
    pub queue_name: String,
    pub reconnect_delay: Duration,
    pub max_in_flight: Option<usize>,
    pub rust_log: String,
}

impl Config {
    /// Reads the process environment, after loading `.env` if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        check_dotenv(dotenvy::dotenv())?;
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::MissingRequired(name));

        let rabbitmq_host = required("RABBITMQ_DB_HOST")?;
        let rabbitmq_user = required("RABBITMQ_DB_USER")?;
        let rabbitmq_password = required("RABBITMQ_DB_PASSWORD")?;
        let rabbitmq_port = parse("RABBITMQ_DB_PORT", &required("RABBITMQ_DB_PORT")?)?;
        let server_port = parse("PORT", &required("PORT")?)?;

        let queue_name = lookup("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());

        let reconnect_delay = match lookup("RECONNECT_DELAY_SECS") {
            Some(value) => match parse::<u64>("RECONNECT_DELAY_SECS", &value)? {
                0 => {
                    return Err(ConfigError::Invalid {
                        name: "RECONNECT_DELAY_SECS",
                        value,
                    });
                }
                secs => Duration::from_secs(secs),
            },
            None => DEFAULT_RECONNECT_DELAY,
        };

        let max_in_flight = match lookup("MAX_IN_FLIGHT") {
            Some(value) => match parse::<usize>("MAX_IN_FLIGHT", &value)? {
                0 => return Err(ConfigError::Invalid { name: "MAX_IN_FLIGHT", value }),
                n => Some(n),
            },
            None => None,
        };

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            rabbitmq_host,
            rabbitmq_user,
            rabbitmq_password,
            rabbitmq_port,
            server_port,
            queue_name,
            reconnect_delay,
            max_in_flight,
            rust_log,
        })
    }

    /// `amqp` for a local broker, `amqps` for anything else.
    pub fn connection_uri(&self) -> String {
        let scheme = if self.rabbitmq_host == "localhost" {
            "amqp"
        } else {
            "amqps"
        };

        format!(
            "{}://{}:{}@{}:{}",
            scheme, self.rabbitmq_user, self.rabbitmq_password, self.rabbitmq_host, self.rabbitmq_port
        )
    }

    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::new(self.connection_uri(), self.queue_name.clone())
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        match self.max_in_flight {
            Some(n) => DispatchMode::Bounded(n),
            None => DispatchMode::Unbounded,
        }
    }
}

/// A missing `.env` is fine; an unreadable or malformed one is not.
fn check_dotenv(result: Result<PathBuf, dotenvy::Error>) -> Result<(), ConfigError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(ConfigError::DotEnv(e.to_string())),
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for environment variable {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("Failed to load .env file: {0}")]
    DotEnv(String),
}

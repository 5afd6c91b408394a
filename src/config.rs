use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub sweep_interval: Duration,
    pub outbox_capacity: usize,
    pub max_blob_bytes: usize,
    /// Shared room secret. `None` leaves every room open.
    pub room_passkey: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://roomcast.db?mode=rwc".to_owned(),
            db_max_connections: 16,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            sweep_interval: Duration::from_secs(60),
            outbox_capacity: 256,
            max_blob_bytes: 5 * 1024 * 1024,
            room_passkey: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            bind_addr: parse_or(&lookup, "BIND_ADDR", defaults.bind_addr)?,
            sweep_interval: Duration::from_secs(
                parse_or(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?.max(1),
            ),
            outbox_capacity: parse_or(&lookup, "OUTBOX_CAPACITY", defaults.outbox_capacity)?.max(1),
            max_blob_bytes: parse_or(&lookup, "MAX_BLOB_BYTES", defaults.max_blob_bytes)?,
            room_passkey: lookup("ROOM_PASSKEY").filter(|key| !key.is_empty()),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

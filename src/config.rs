//! Environment-derived settings for the two binaries.
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_INGEST_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CHAIN_ID: &str = "1";
pub const DEFAULT_STORE_PATH: &str = "data/ingestion_records.jsonl";

#[derive(Debug, Clone, PartialEq)]
pub struct FaucetConfig {
    pub port: u16,
    /// Fraction of faucet requests answered with an injected 500, in `[0, 1]`.
    pub force_error_rate: f64,
}

impl FaucetConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            port: parse_port(lookup("PORT")),
            force_error_rate: lookup("FORCE_ERROR_RATE")
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|f| (0.0..=1.0).contains(f))
                .unwrap_or(0.0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub port: u16,
    pub chain_id: String,
    pub interval: Duration,
    pub store_path: PathBuf,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let interval = lookup("INGEST_INTERVAL_SEC")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|n| *n > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_INGEST_INTERVAL);
        Self {
            port: parse_port(lookup("PORT")),
            chain_id: non_empty(lookup("CHAIN_ID")).unwrap_or_else(|| DEFAULT_CHAIN_ID.to_string()),
            interval,
            store_path: non_empty(lookup("INGEST_STORE_PATH"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

/// Accepts `8080` or `:8080`.
fn parse_port(raw: Option<String>) -> u16 {
    let Some(raw) = non_empty(raw) else {
        return DEFAULT_PORT;
    };
    let trimmed = raw.trim_start_matches(':');
    match trimmed.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            warn!("Ignoring invalid PORT {:?}, using {}", raw, DEFAULT_PORT);
            DEFAULT_PORT
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn faucet_defaults() {
        let cfg = FaucetConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.force_error_rate, 0.0);
    }

    #[test]
    fn port_accepts_leading_colon() {
        assert_eq!(FaucetConfig::from_lookup(lookup(&[("PORT", ":9090")])).port, 9090);
        assert_eq!(FaucetConfig::from_lookup(lookup(&[("PORT", "9091")])).port, 9091);
        assert_eq!(FaucetConfig::from_lookup(lookup(&[("PORT", ":")])).port, 8080);
        assert_eq!(FaucetConfig::from_lookup(lookup(&[("PORT", "http")])).port, 8080);
    }

    #[test]
    fn force_error_rate_must_be_a_fraction() {
        let rate = |v: &str| {
            FaucetConfig::from_lookup(lookup(&[("FORCE_ERROR_RATE", v)])).force_error_rate
        };
        assert_eq!(rate("0.25"), 0.25);
        assert_eq!(rate("1"), 1.0);
        assert_eq!(rate("1.5"), 0.0);
        assert_eq!(rate("-0.1"), 0.0);
        assert_eq!(rate("lots"), 0.0);
    }

    #[test]
    fn ingest_reads_overrides_and_rejects_zero_interval() {
        let cfg = IngestConfig::from_lookup(lookup(&[
            ("CHAIN_ID", "chain1"),
            ("INGEST_INTERVAL_SEC", "5"),
            ("INGEST_STORE_PATH", "/tmp/records.jsonl"),
        ]));
        assert_eq!(cfg.chain_id, "chain1");
        assert_eq!(cfg.interval, Duration::from_secs(5));
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/records.jsonl"));

        let cfg = IngestConfig::from_lookup(lookup(&[("INGEST_INTERVAL_SEC", "0")]));
        assert_eq!(cfg.interval, DEFAULT_INGEST_INTERVAL);
        assert_eq!(cfg.chain_id, DEFAULT_CHAIN_ID);
        assert_eq!(cfg.store_path, PathBuf::from(DEFAULT_STORE_PATH));
    }
}

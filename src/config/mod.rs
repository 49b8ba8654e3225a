use std::time::Duration;

use anyhow::{bail, ensure, Context};

pub const ENV_REDIS_ADDRESSES: &str = "REDIS_ADDRESSES";
pub const ENV_LISTEN_PORT: &str = "LATCH_LISTEN_PORT";
pub const ENV_REQUEST_DEADLINE: &str = "LATCH_REQUEST_DEADLINE";
pub const ENV_REPLICA_TIMEOUT: &str = "LATCH_REPLICA_TIMEOUT";
pub const ENV_MAX_TTL: &str = "LATCH_MAX_TTL";

pub const DEFAULT_LISTEN_PORT: u16 = 8181;
pub const DEFAULT_REQUEST_DEADLINE: Duration = Duration::from_secs(5);
pub const DEFAULT_REPLICA_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(600);

// Boot-time configuration. The replica list is immutable after boot;
// changing it requires a restart.
#[derive(Debug, Clone)]
pub struct Config {
    pub replica_addresses: Vec<String>,
    pub listen_port: u16,
    pub request_deadline: Duration,
    pub replica_timeout: Duration,
    pub max_ttl: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        let addresses = std::env::var(ENV_REDIS_ADDRESSES)
            .with_context(|| format!("{} must be set", ENV_REDIS_ADDRESSES))?;
        let replica_addresses = parse_addresses(&addresses)?;

        let listen_port = match std::env::var(ENV_LISTEN_PORT) {
            Ok(port) => port
                .parse::<u16>()
                .with_context(|| format!("invalid {}: '{}'", ENV_LISTEN_PORT, port))?,
            Err(_) => DEFAULT_LISTEN_PORT,
        };

        Ok(Config {
            replica_addresses,
            listen_port,
            request_deadline: duration_env(ENV_REQUEST_DEADLINE, DEFAULT_REQUEST_DEADLINE)?,
            replica_timeout: duration_env(ENV_REPLICA_TIMEOUT, DEFAULT_REPLICA_TIMEOUT)?,
            max_ttl: duration_env(ENV_MAX_TTL, DEFAULT_MAX_TTL)?,
        })
    }
}

fn duration_env(key: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(key) {
        Ok(v) => Ok(humantime::parse_duration(&v)
            .with_context(|| format!("invalid {}: '{}'", key, v))?),
        Err(_) => Ok(default),
    }
}

// Parses a comma-separated list of host:port entries. The count must be
// odd and at least 3, otherwise quorum arithmetic degenerates.
pub fn parse_addresses(list: &str) -> anyhow::Result<Vec<String>> {
    let mut addresses = Vec::new();
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (host, port) = match entry.rsplit_once(':') {
            Some(parts) => parts,
            None => bail!("replica address '{}' is missing a port", entry),
        };
        ensure!(!host.is_empty(), "replica address '{}' has an empty host", entry);
        port.parse::<u16>()
            .with_context(|| format!("replica address '{}' has an invalid port", entry))?;
        addresses.push(entry.to_owned());
    }

    ensure!(
        addresses.len() >= 3,
        "at least 3 replica addresses are required, got {}",
        addresses.len()
    );
    ensure!(
        addresses.len() % 2 == 1,
        "replica count must be odd, got {}",
        addresses.len()
    );

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        list: &'static str,
        ok: bool,
    }

    #[test]
    fn test_parse_addresses() {
        let cases = [
            Case {
                list: "a:6379,b:6379,c:6379",
                ok: true,
            },
            // Whitespace and trailing commas are tolerated.
            Case {
                list: " a:6379 , b:6380 ,c:6381,",
                ok: true,
            },
            // Even count.
            Case {
                list: "a:6379,b:6379",
                ok: false,
            },
            // Below the minimum.
            Case {
                list: "a:6379",
                ok: false,
            },
            Case {
                list: "",
                ok: false,
            },
            // Missing port.
            Case {
                list: "a,b:6379,c:6379",
                ok: false,
            },
            // Port is not numeric.
            Case {
                list: "a:x,b:6379,c:6379",
                ok: false,
            },
            // Empty host.
            Case {
                list: ":6379,b:6379,c:6379",
                ok: false,
            },
        ];
        for (i, case) in cases.iter().enumerate() {
            let got = parse_addresses(case.list);
            assert_eq!(got.is_ok(), case.ok, "case {}: {:?}", i, got);
        }
    }

    #[test]
    fn test_parse_addresses_preserves_order() {
        let got = parse_addresses("a:1,b:2,c:3").unwrap();
        assert_eq!(got, vec!["a:1", "b:2", "c:3"]);
    }
}

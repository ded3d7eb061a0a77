/// Configuration management
use crate::error::{Result, SyncError};
use crate::subscriber::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_PORT: u16 = 17082;

/// Engine and demo-server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP API address for the UI process
    pub api_addr: SocketAddr,

    /// Optional JSON seed for the in-memory remote
    pub seed_path: Option<PathBuf>,

    /// Identity signed in at startup (demo only; `None` starts signed out)
    pub identity: Option<String>,

    /// First reconnect delay after a channel drops
    pub reconnect_initial_backoff: Duration,

    /// Upper bound for the doubling reconnect delay
    pub reconnect_max_backoff: Duration,

    /// Give up on a channel after this many consecutive failures (`None` = never)
    pub max_reconnect_attempts: Option<u32>,

    /// Pull a fresh snapshot on this interval in addition to event triggers
    pub poll_interval: Option<Duration>,

    /// Capacity of the broadcast channel feeding `/events` subscribers
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT)),
            seed_path: None,
            identity: None,
            reconnect_initial_backoff: Duration::from_millis(500),
            reconnect_max_backoff: Duration::from_secs(30),
            max_reconnect_attempts: None,
            poll_interval: None,
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 2 {
            return Err(SyncError::Config(format!(
                "Usage: {} <api-port> [--seed <path>] [--identity <id>] [--poll-secs <n>] [--max-reconnects <n>]",
                args.first().map(String::as_str).unwrap_or("inbox-sync")
            )));
        }

        let port = args[1]
            .parse::<u16>()
            .map_err(|_| SyncError::Config("Port must be a valid number (0-65535)".to_string()))?;

        let mut seed_path: Option<PathBuf> = None;
        let mut identity: Option<String> = None;
        let mut poll_secs: Option<u64> = None;
        let mut max_reconnect_attempts: Option<u32> = None;

        let mut i = 2;
        while i < args.len() {
            match args[i].as_str() {
                "--seed" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--seed requires a path argument".to_string())
                    })?;
                    seed_path = Some(PathBuf::from(path));
                    i += 2;
                }
                "--identity" => {
                    let id = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--identity requires an id argument".to_string())
                    })?;
                    identity = Some(id.clone());
                    i += 2;
                }
                "--poll-secs" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--poll-secs requires a number".to_string())
                    })?;
                    poll_secs = Some(n.parse::<u64>().map_err(|_| {
                        SyncError::Config("--poll-secs must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                "--max-reconnects" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        SyncError::Config("--max-reconnects requires a number".to_string())
                    })?;
                    max_reconnect_attempts = Some(n.parse::<u32>().map_err(|_| {
                        SyncError::Config("--max-reconnects must be a positive number".to_string())
                    })?);
                    i += 2;
                }
                other => {
                    return Err(SyncError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(path) = std::env::var("INBOX_SYNC_SEED") {
            seed_path = Some(PathBuf::from(path));
        }
        if let Ok(id) = std::env::var("INBOX_SYNC_IDENTITY") {
            identity = Some(id);
        }
        if let Some(n) = std::env::var("INBOX_SYNC_POLL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            poll_secs = Some(n);
        }

        Ok(Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            seed_path,
            identity: identity.filter(|id| !id.trim().is_empty()),
            poll_interval: poll_secs.filter(|n| *n > 0).map(Duration::from_secs),
            max_reconnect_attempts,
            ..Default::default()
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: self.reconnect_initial_backoff,
            max_backoff: self.reconnect_max_backoff.max(self.reconnect_initial_backoff),
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_args_requires_port() {
        let err = Config::from_args(&args(&["inbox-sync"])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_from_args_flags() {
        let config = Config::from_args(&args(&[
            "inbox-sync",
            "18000",
            "--max-reconnects",
            "3",
        ]))
        .unwrap();
        assert_eq!(config.api_addr.port(), 18000);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.reconnect_policy().max_attempts, Some(3));
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        assert!(Config::from_args(&args(&["inbox-sync", "port"])).is_err());
        assert!(Config::from_args(&args(&["inbox-sync", "18000", "--poll-secs", "x"])).is_err());
        assert!(Config::from_args(&args(&["inbox-sync", "18000", "--seed"])).is_err());
        assert!(Config::from_args(&args(&["inbox-sync", "18000", "--bogus"])).is_err());
    }

    #[test]
    fn test_reconnect_policy_caps_backoff() {
        let config = Config {
            reconnect_initial_backoff: Duration::from_secs(5),
            reconnect_max_backoff: Duration::from_secs(1),
            ..Default::default()
        };
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
    }
}

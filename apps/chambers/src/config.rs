use std::env;
#[cfg(test)]
use std::sync::Mutex;

pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8000";

/// Public address-discovery servers used when none are configured. Same
/// defaults the web client ships with.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Chambers client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the signaling relay (http(s) or ws(s) scheme).
    pub relay_url: String,
    /// STUN server URLs handed to the negotiation engine. May be empty,
    /// e.g. for loopback-only test runs.
    pub stun_servers: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `CHAMBERS_STUN_SERVERS` is a comma-separated list; setting it to an
    /// empty string disables address discovery entirely.
    pub fn from_env() -> Self {
        let relay_url =
            env::var("CHAMBERS_RELAY_URL").unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        let stun_servers = match env::var("CHAMBERS_STUN_SERVERS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            relay_url,
            stun_servers,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Environment variable tests must not run in parallel.
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.stun_servers.len(), 2);
    }

    #[test]
    fn from_env_defaults_when_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::remove_var("CHAMBERS_RELAY_URL");
            env::remove_var("CHAMBERS_STUN_SERVERS");
        }
        let config = Config::from_env();
        assert_eq!(config.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(config.stun_servers.len(), 2);
    }

    #[test]
    fn from_env_reads_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("CHAMBERS_RELAY_URL", "https://relay.example.com");
            env::set_var(
                "CHAMBERS_STUN_SERVERS",
                "stun:one.example.com:3478, stun:two.example.com:3478",
            );
        }
        let config = Config::from_env();
        assert_eq!(config.relay_url, "https://relay.example.com");
        assert_eq!(
            config.stun_servers,
            vec!["stun:one.example.com:3478", "stun:two.example.com:3478"]
        );
        unsafe {
            env::remove_var("CHAMBERS_RELAY_URL");
            env::remove_var("CHAMBERS_STUN_SERVERS");
        }
    }

    #[test]
    fn empty_stun_list_disables_discovery() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("CHAMBERS_STUN_SERVERS", "");
        }
        let config = Config::from_env();
        assert!(config.stun_servers.is_empty());
        unsafe {
            env::remove_var("CHAMBERS_STUN_SERVERS");
        }
    }
}

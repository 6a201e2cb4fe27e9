//! Load config from file and environment.

use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration. File: ~/.config/lanshare/config.toml or /etc/lanshare/config.toml.
/// Env overrides: LANSHARE_NAME, LANSHARE_TCP_PORT, LANSHARE_DISCOVERY_PORT, LANSHARE_LOCAL_IP,
/// LANSHARE_DOWNLOAD_DIR, LANSHARE_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Display name shown to peers.
    #[serde(default = "default_name")]
    pub name: String,
    /// Peer TCP port (default 8888).
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Discovery UDP port (default 9999).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Web port advertised in discovery (default 8080). Nothing listens on it here.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// Address to bind and advertise; detected when unset.
    #[serde(default)]
    pub local_ip: Option<Ipv4Addr>,
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Peer addresses (`ip:port`) whose chat is dropped.
    #[serde(default)]
    pub blocked_users: Vec<String>,
    /// UDP discovery on/off. Loopback tests turn it off and dial directly.
    #[serde(skip, default = "default_true")]
    pub enable_discovery: bool,
    #[serde(skip)]
    pub timing: Timing,
}

/// Timers and limits. Not read from the file.
#[derive(Debug, Clone)]
pub struct Timing {
    pub announce_burst: u32,
    pub announce_spacing: Duration,
    pub reannounce_interval: Duration,
    pub dial_retries: u32,
    /// Linear: the n-th retry waits `n * dial_backoff`.
    pub dial_backoff: Duration,
    pub handshake_timeout: Duration,
    pub keepalive: Duration,
    pub dispatch_capacity: usize,
    pub gc_interval: Duration,
    pub gc_retention: Duration,
    pub listen_retries: u32,
    /// Ports tried after `tcp_port` when it stays busy.
    pub listen_fallback_ports: u16,
    pub stop_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            announce_burst: 3,
            announce_spacing: Duration::from_secs(1),
            reannounce_interval: Duration::from_secs(15),
            dial_retries: 3,
            dial_backoff: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            keepalive: Duration::from_secs(15),
            dispatch_capacity: 100,
            gc_interval: Duration::from_secs(5 * 60),
            gc_retention: Duration::from_secs(10 * 60),
            listen_retries: 3,
            listen_fallback_ports: 10,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

fn default_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}
fn default_tcp_port() -> u16 {
    8888
}
fn default_discovery_port() -> u16 {
    9999
}
fn default_web_port() -> u16 {
    8080
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            tcp_port: default_tcp_port(),
            discovery_port: default_discovery_port(),
            web_port: default_web_port(),
            local_ip: None,
            download_dir: default_download_dir(),
            log_level: default_log_level(),
            blocked_users: Vec::new(),
            enable_discovery: true,
            timing: Timing::default(),
        }
    }
}

impl NodeConfig {
    /// Apply `LANSHARE_*` overrides read through `var`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("LANSHARE_NAME") {
            if !s.trim().is_empty() {
                self.name = s;
            }
        }
        if let Some(p) = var("LANSHARE_TCP_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.tcp_port = p;
        }
        if let Some(p) = var("LANSHARE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.discovery_port = p;
        }
        if let Some(ip) = var("LANSHARE_LOCAL_IP").and_then(|s| s.parse::<Ipv4Addr>().ok()) {
            self.local_ip = Some(ip);
        }
        if let Some(dir) = var("LANSHARE_DOWNLOAD_DIR") {
            self.download_dir = PathBuf::from(dir);
        }
        if let Some(level) = var("LANSHARE_LOG") {
            self.log_level = level;
        }
    }
}

/// Result of [`load`]. Logging is not up yet while loading, so problems are returned
/// for the caller to report.
#[derive(Debug)]
pub struct Loaded {
    pub config: NodeConfig,
    pub source: Option<PathBuf>,
    pub warning: Option<String>,
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Loaded {
    let mut loaded = load_file();
    loaded
        .config
        .apply_overrides(|key| std::env::var(key).ok());
    loaded
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanshare/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanshare/config.toml"));
    out
}

fn load_file() -> Loaded {
    for p in config_paths() {
        if p.exists() {
            let warning = match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(config) => {
                        return Loaded {
                            config,
                            source: Some(p),
                            warning: None,
                        }
                    }
                    Err(e) => format!("{}: {}", p.display(), e),
                },
                Err(e) => format!("{}: {}", p.display(), e),
            };
            return Loaded {
                config: NodeConfig::default(),
                source: None,
                warning: Some(warning),
            };
        }
    }
    Loaded {
        config: NodeConfig::default(),
        source: None,
        warning: None,
    }
}

pub fn parse(s: &str) -> Result<NodeConfig, toml::de::Error> {
    toml::from_str::<NodeConfig>(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.tcp_port, 8888);
        assert_eq!(c.discovery_port, 9999);
        assert_eq!(c.web_port, 8080);
        assert_eq!(c.download_dir, PathBuf::from("downloads"));
        assert!(c.enable_discovery);
        assert_eq!(c.timing.dispatch_capacity, 100);
        assert_eq!(c.timing.dial_retries, 3);
    }

    #[test]
    fn file_values() {
        let c = parse(
            r#"
            name = "alice"
            tcp_port = 9000
            local_ip = "192.168.1.20"
            blocked_users = ["192.168.1.7:8888"]
            "#,
        )
        .unwrap();
        assert_eq!(c.name, "alice");
        assert_eq!(c.tcp_port, 9000);
        assert_eq!(c.local_ip, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(c.blocked_users, vec!["192.168.1.7:8888".to_string()]);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("LANSHARE_NAME", "bob"),
            ("LANSHARE_TCP_PORT", "7000"),
            ("LANSHARE_DISCOVERY_PORT", "not a port"),
            ("LANSHARE_LOCAL_IP", "10.1.2.3"),
            ("LANSHARE_LOG", "debug"),
        ]
        .into_iter()
        .collect();
        let mut c = parse("tcp_port = 9000").unwrap();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.name, "bob");
        assert_eq!(c.tcp_port, 7000);
        assert_eq!(c.discovery_port, 9999);
        assert_eq!(c.local_ip, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(c.log_level, "debug");
    }
}

use crate::error::{ProxyError, Result};
use artifact_store::PurgeSelector;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments, each with an environment variable fallback
#[derive(Debug, Parser)]
#[command(
    name = "artifact-proxy",
    version,
    about = "Caching download proxy backed by a prioritized list of mirrors"
)]
pub struct Args {
    /// Store root directory
    #[arg(long, env = "CACHE_ROOT", default_value = "./tmp")]
    pub cache_root: PathBuf,

    /// Listen address, `:PORT` binds all interfaces
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Mirror list file, one base URL per line
    #[arg(long, env = "MIRRORS_FILE")]
    pub mirrors: PathBuf,

    /// Timeout for connecting to a mirror and receiving response headers
    #[arg(long, env = "CLIENT_TIMEOUT_SECS", default_value_t = 15)]
    pub client_timeout_secs: u64,

    /// Interval between periodic purges
    #[arg(long, env = "PURGE_INTERVAL_SECS", default_value_t = 24 * 60 * 60)]
    pub purge_interval_secs: u64,

    /// Periodic purges remove entries older than this many days
    #[arg(long, env = "PURGE_OLDER_THAN_DAYS", default_value_t = 30)]
    pub purge_older_than_days: u64,

    /// How long open connections may keep running after a shutdown signal
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Directory served under /_ctrl/static
    #[arg(long, env = "STATIC_DIR", default_value = "./static")]
    pub static_dir: PathBuf,

    /// Enable debug logging
    #[arg(long, env = "LOG_DEBUG")]
    pub debug: bool,

    /// Emit structured JSON logs (also enabled by LOG_FORMAT=json)
    #[arg(long)]
    pub json_log: bool,

    /// Write own PID to this file
    #[arg(long, env = "PIDFILE")]
    pub pidfile: Option<PathBuf>,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub cache_root: PathBuf,
    pub listen: SocketAddr,
    pub mirrors_file: PathBuf,
    pub client_timeout: Duration,
    pub purge_interval: Duration,
    pub purge_selector: PurgeSelector,
    pub shutdown_grace: Duration,
    pub static_dir: PathBuf,
    pub debug: bool,
    pub json_log: bool,
    pub pidfile: Option<PathBuf>,
}

impl Args {
    pub fn into_config(self) -> Result<ProxyConfig> {
        let listen = parse_listen(&self.listen)?;

        if self.client_timeout_secs == 0 {
            return Err(ProxyError::Config(
                "client timeout must be greater than zero".to_string(),
            ));
        }
        if self.purge_interval_secs == 0 {
            return Err(ProxyError::Config(
                "purge interval must be greater than zero".to_string(),
            ));
        }

        let json_log = self.json_log
            || std::env::var("LOG_FORMAT")
                .map(|v| v == "json")
                .unwrap_or(false);

        Ok(ProxyConfig {
            cache_root: self.cache_root,
            listen,
            mirrors_file: self.mirrors,
            client_timeout: Duration::from_secs(self.client_timeout_secs),
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            purge_selector: PurgeSelector::older_than_days(self.purge_older_than_days),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            static_dir: self.static_dir,
            debug: self.debug,
            json_log,
            pidfile: self.pidfile,
        })
    }
}

fn parse_listen(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    addr.parse()
        .map_err(|e| ProxyError::Config(format!("invalid listen address {:?}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("artifact-proxy").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--mirrors", "mirrors.txt"]).into_config().unwrap();
        assert_eq!(config.cache_root, PathBuf::from("./tmp"));
        assert_eq!(config.listen, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.mirrors_file, PathBuf::from("mirrors.txt"));
        assert_eq!(config.client_timeout, Duration::from_secs(15));
        assert_eq!(config.purge_interval, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.purge_selector, PurgeSelector::older_than_days(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        assert!(config.pidfile.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--mirrors",
            "m",
            "--cache-root",
            "/var/cache/artifacts",
            "--listen",
            ":9090",
            "--client-timeout-secs",
            "3",
            "--purge-interval-secs",
            "60",
            "--purge-older-than-days",
            "7",
            "--shutdown-grace-secs",
            "0",
            "--debug",
            "--pidfile",
            "/run/artifact-proxy.pid",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.cache_root, PathBuf::from("/var/cache/artifacts"));
        assert_eq!(config.listen, "0.0.0.0:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(config.client_timeout, Duration::from_secs(3));
        assert_eq!(config.purge_interval, Duration::from_secs(60));
        assert_eq!(config.purge_selector, PurgeSelector::older_than_days(7));
        assert_eq!(config.shutdown_grace, Duration::ZERO);
        assert!(config.debug);
        assert_eq!(
            config.pidfile,
            Some(PathBuf::from("/run/artifact-proxy.pid"))
        );
    }

    #[test]
    fn test_mirrors_required() {
        assert!(Args::try_parse_from(["artifact-proxy"]).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let err = parse(&["--mirrors", "m", "--listen", "nowhere"])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));

        let err = parse(&["--mirrors", "m", "--client-timeout-secs", "0"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}

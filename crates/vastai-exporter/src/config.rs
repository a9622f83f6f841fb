//! Command-line surface.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Prometheus exporter and JSON API for the Vast.ai GPU marketplace.
#[derive(Parser, Debug)]
#[command(name = "vastai-exporter", version)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8622")]
    pub listen: SocketAddr,

    /// Vast.ai API key. Without it only global stats are served.
    #[arg(long)]
    pub key: Option<String>,

    /// How often to query Vast.ai for updates, in seconds.
    #[arg(long, default_value_t = 60, value_name = "SECONDS")]
    pub update_interval: u64,

    /// Path to store state files (default $HOME, then /tmp).
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Query offer data from a peer exporter instead of Vast.ai directly.
    #[arg(long, value_name = "URL")]
    pub master_url: Option<String>,

    /// Credentials for MaxMind GeoIP web services.
    #[arg(long, value_name = "USERID:KEY")]
    pub maxmind_key: Option<String>,

    /// Exclude IP ranges from geolocation.
    #[arg(long, value_name = "IP[/NN],IP[/NN],...", default_value = "")]
    pub no_geolocation: String,
}

impl Cli {
    /// The directory for the geolocation cache and payout state files.
    pub fn resolve_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) if !home.is_empty() => PathBuf::from(home),
            _ => PathBuf::from("/tmp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["vastai-exporter"]);
        assert_eq!(cli.listen, "0.0.0.0:8622".parse().unwrap());
        assert_eq!(cli.update_interval, 60);
        assert!(cli.key.is_none());
        assert!(cli.master_url.is_none());
        assert!(cli.maxmind_key.is_none());
        assert_eq!(cli.no_geolocation, "");
    }

    #[test]
    fn explicit_flags_parse() {
        let cli = Cli::parse_from([
            "vastai-exporter",
            "--listen",
            "127.0.0.1:9000",
            "--key",
            "secret",
            "--update-interval",
            "120",
            "--state-dir",
            "/var/lib/vastai",
            "--master-url",
            "https://peer.example.com",
            "--maxmind-key",
            "1000:abc",
            "--no-geolocation",
            "10.0.0.0/8,192.0.2.1",
        ]);
        assert_eq!(cli.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cli.key.as_deref(), Some("secret"));
        assert_eq!(cli.update_interval, 120);
        assert_eq!(cli.state_dir.as_deref(), Some(std::path::Path::new("/var/lib/vastai")));
        assert_eq!(cli.resolve_state_dir(), PathBuf::from("/var/lib/vastai"));
        assert_eq!(cli.no_geolocation, "10.0.0.0/8,192.0.2.1");
    }

    #[test]
    fn state_dir_falls_back_to_home() {
        let cli = Cli::parse_from(["vastai-exporter"]);
        let dir = cli.resolve_state_dir();
        // either $HOME or /tmp, depending on the environment
        assert!(!dir.as_os_str().is_empty());
    }
}

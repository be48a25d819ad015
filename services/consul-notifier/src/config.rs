//! Configuration for the notifier.
//!
//! Every option can be given as a flag or through the environment; the
//! environment names match what deployments of the notifier already set.

use clap::{ArgAction, Parser};

/// Default Docker daemon socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Default Consul agent address.
pub const DEFAULT_CONSUL_ADDR: &str = "127.0.0.1";

/// Port of the Consul HTTP API when the address does not name one.
pub const DEFAULT_CONSUL_PORT: u16 = 8500;

/// Auto-registration and de-registration of Docker Swarm services in Consul,
/// driven by the Docker daemon event stream.
#[derive(Debug, Clone, Parser)]
#[command(name = "consul-notifier")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Docker daemon socket (a `unix://` prefix is accepted).
    #[arg(long, env = "DOCKER_SOCKET", default_value = DEFAULT_DOCKER_SOCKET)]
    pub docker_socket: String,

    /// Consul agent address: host, host:port or URL.
    #[arg(long, env = "CONSUL_ADDR", default_value = DEFAULT_CONSUL_ADDR)]
    pub consul_addr: String,

    /// Consul ACL token.
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    pub consul_token: Option<String>,

    /// Address to register services under. Defaults to the Swarm node address.
    #[arg(long, env = "NOTIFIER_NODE_ADDR")]
    pub node_addr: Option<String>,

    /// Skip certificate verification on `https` health checks
    /// (services with `CONSUL_HEALTH_SSL` set).
    #[arg(long, env = "NOTIFIER_HEALTH_TLS_SKIP_VERIFY")]
    pub health_tls_skip_verify: bool,

    /// Re-subscribe and reconcile again when the event stream is lost,
    /// instead of exiting.
    #[arg(long, env = "NOTIFIER_RESYNC_ON_DISCONNECT")]
    pub resync_on_disconnect: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "NOTIFIER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Verbose logging; repeat for more. Logs event payloads at debug.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Config {
    /// Filesystem path of the Docker socket.
    pub fn socket_path(&self) -> String {
        let raw = self.docker_socket.trim();
        match raw.strip_prefix("unix://") {
            Some(path) if path.starts_with('/') => path.to_string(),
            Some(path) => format!("/{path}"),
            None => raw.to_string(),
        }
    }

    /// Base URL of the Consul HTTP API.
    pub fn consul_url(&self) -> String {
        let raw = self.consul_addr.trim().trim_end_matches('/');
        let (scheme, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("http", raw),
        };

        let authority = rest.split('/').next().unwrap_or(rest);
        if has_port(authority) {
            format!("{scheme}://{rest}")
        } else {
            let path = &rest[authority.len()..];
            format!("{scheme}://{authority}:{DEFAULT_CONSUL_PORT}{path}")
        }
    }

    /// Default tracing filter when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> String {
        match self.verbose {
            0 => self.log_level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

fn has_port(authority: &str) -> bool {
    match authority.strip_prefix('[') {
        // IPv6 literal: only a colon after the closing bracket is a port.
        Some(v6) => v6.contains("]:"),
        None => authority.contains(':'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["consul-notifier"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_socket_path_forms() {
        let config = parse(&["--docker-socket", "unix://var/run/docker.sock"]);
        assert_eq!(config.socket_path(), "/var/run/docker.sock");

        let config = parse(&["--docker-socket", "unix:///run/docker.sock"]);
        assert_eq!(config.socket_path(), "/run/docker.sock");

        let config = parse(&["--docker-socket", "/tmp/docker.sock"]);
        assert_eq!(config.socket_path(), "/tmp/docker.sock");
    }

    #[test]
    fn test_consul_url_forms() {
        let cases = [
            ("127.0.0.1", "http://127.0.0.1:8500"),
            ("consul:8501", "http://consul:8501"),
            ("https://consul.internal", "https://consul.internal:8500"),
            ("http://consul:9000/", "http://consul:9000"),
            ("[::1]", "http://[::1]:8500"),
            ("[::1]:8600", "http://[::1]:8600"),
        ];

        for (addr, expected) in cases {
            let config = parse(&["--consul-addr", addr]);
            assert_eq!(config.consul_url(), expected, "addr {addr}");
        }
    }

    #[test]
    fn test_verbosity_overrides_level() {
        assert_eq!(parse(&["--log-level", "warn"]).log_filter(), "warn");
        assert_eq!(parse(&["-v"]).log_filter(), "debug");
        assert_eq!(parse(&["-vv"]).log_filter(), "trace");
    }

    #[test]
    fn test_flags() {
        let config = parse(&["--resync-on-disconnect", "--node-addr", "10.1.2.3"]);
        assert!(config.resync_on_disconnect);
        assert!(!config.health_tls_skip_verify);
        assert!(parse(&["--health-tls-skip-verify"]).health_tls_skip_verify);
        assert_eq!(config.node_addr.as_deref(), Some("10.1.2.3"));
    }
}

//! Command-line interface definitions using clap.

use clap::Parser;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// stabilizer - reverse proxy that keeps hang-prone HTTP workers alive
///
/// Fronts a pool of identical worker subprocesses, enforces a per-request
/// deadline, and kills and respawns any worker that blows it.
#[derive(Parser, Debug)]
#[command(name = "stabilizer", version, about, long_about = None)]
pub struct Options {
    /// HTTP address to listen on.
    #[arg(long, default_value = ":8080")]
    pub listen: String,

    /// Number of worker subprocesses to spawn.
    #[arg(long, default_value_t = 8)]
    pub workers: usize,

    /// If a request to a worker takes longer than this, the worker is killed.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Request header used to override the default timeout value; an empty
    /// string disables per-request overrides.
    #[arg(long, default_value = "X-Stabilize-Timeout")]
    pub header: String,

    /// Number of concurrent requests to allow per worker.
    #[arg(long, default_value_t = 10)]
    pub concurrency: usize,

    /// Publish Prometheus metrics on this address; empty disables.
    #[arg(long, default_value = ":6060")]
    pub prometheus: String,

    /// App name prefix for the Prometheus restart counter.
    #[arg(long, default_value = "")]
    pub prometheus_app_name: String,

    /// Start an HTTP demo backend instead of proxying.
    #[arg(long)]
    pub demo: bool,

    /// HTTP address for the demo backend to listen on.
    #[arg(long, default_value = ":9700")]
    pub demo_listen: String,

    /// Worker command and arguments; occurrences of the literal `{{.Port}}`
    /// are replaced with the chosen port before spawning.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Resolve a listen address, accepting the bare-port form `:8080` as
/// shorthand for `0.0.0.0:8080` and resolving hostnames.
pub fn parse_listen_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    };
    full.to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("cannot resolve listen address {}", addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let opts = Options::try_parse_from(["stabilizer", "--", "server", "--port", "{{.Port}}"])
            .expect("parse");
        assert_eq!(opts.listen, ":8080");
        assert_eq!(opts.workers, 8);
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.header, "X-Stabilize-Timeout");
        assert_eq!(opts.concurrency, 10);
        assert_eq!(opts.prometheus, ":6060");
        assert_eq!(opts.prometheus_app_name, "");
        assert!(!opts.demo);
        assert_eq!(opts.demo_listen, ":9700");
        assert_eq!(
            opts.command,
            vec!["server", "--port", "{{.Port}}"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn duration_flags_accept_humantime_literals() {
        let opts =
            Options::try_parse_from(["stabilizer", "--timeout", "200ms", "--", "sh", "-c", "x"])
                .expect("parse");
        assert_eq!(opts.timeout, Duration::from_millis(200));
    }

    #[test]
    fn rejects_malformed_timeout() {
        assert!(Options::try_parse_from(["stabilizer", "--timeout", "banana"]).is_err());
    }

    #[test]
    fn command_captures_hyphenated_args() {
        let opts = Options::try_parse_from([
            "stabilizer",
            "--workers",
            "1",
            "--",
            "sh",
            "-c",
            "exec server --port {{.Port}}",
        ])
        .expect("parse");
        assert_eq!(opts.workers, 1);
        assert_eq!(opts.command.len(), 3);
        assert_eq!(opts.command[1], "-c");
    }

    #[test]
    fn listen_addr_accepts_bare_port_form() {
        let addr = parse_listen_addr(":8080").expect("parse");
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_unspecified());
    }

    #[test]
    fn listen_addr_accepts_explicit_host() {
        let addr = parse_listen_addr("127.0.0.1:9700").expect("parse");
        assert_eq!(addr.port(), 9700);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn listen_addr_rejects_garbage() {
        assert!(parse_listen_addr("not an address").is_err());
    }
}

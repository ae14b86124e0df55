//! rutun command-line interface
//!
//! `rutun [flags] user@host` brings up the proxy gateway against the
//! given SSH endpoint and serves until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ipnet::Ipv4Net;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rutun_engine::{Config, Engine};
use rutun_tun::{SubnetAlias, TunOptions};
use rutun_tunnel::HopAddr;

/// How long to wait for the engine to drain after a signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// SSH tunnel proxy gateway: HTTP, SOCKS5 and TUN over one SSH session
#[derive(Parser, Debug)]
#[command(name = "rutun", version, about, long_about = None)]
struct Cli {
    /// SSH endpoint, as user@host[:port]
    target: String,

    /// HTTP proxy listen address
    #[arg(long, alias = "listen", default_value = ":8080", value_name = "ADDR")]
    http: String,

    /// Enable the SOCKS5 frontend on this address
    #[arg(long, value_name = "ADDR")]
    socks5: Option<String>,

    /// SSH port applied when the host carries none
    #[arg(short = 'p', long, default_value_t = 22)]
    port: u16,

    /// Private key path for authentication
    #[arg(short = 'i', long = "identity_file", value_name = "PATH")]
    identity_file: Option<PathBuf>,

    /// SSH password (implies non-interactive; prefer the prompt)
    #[arg(long, value_name = "PASSWORD")]
    pass: Option<String>,

    /// Jump host chain, comma separated (user@host[:port])
    #[arg(short = 'J', long, value_delimiter = ',', value_name = "HOPS")]
    jump: Vec<String>,

    /// Dial timeout (e.g. 10s, 500ms)
    #[arg(long, value_parser = parse_duration, default_value = "10s")]
    timeout: Duration,

    /// Router rule file (YAML)
    #[arg(long, value_name = "PATH")]
    rules: Option<PathBuf>,

    /// Set and restore the OS proxy settings
    #[arg(long = "sys-proxy", default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
    sys_proxy: bool,

    /// Force all HTTP requests to this upstream host:port
    #[arg(long = "http-upstream", value_name = "HOST:PORT")]
    http_upstream: Option<String>,

    /// Enable the TUN data plane
    #[arg(long)]
    tun: bool,

    /// Global TUN mode: capture all IPv4 traffic (implies --tun)
    #[arg(short = 'g', long = "tun-global")]
    tun_global: bool,

    /// TUN interface address and prefix
    #[arg(long = "tun-ip", default_value = "10.0.0.1/24", value_name = "CIDR")]
    tun_ip: Ipv4Net,

    /// Route this CIDR into the TUN (repeatable)
    #[arg(long = "tun-route", value_name = "CIDR")]
    tun_route: Vec<Ipv4Net>,

    /// Subnet or IP alias, SRC:DST with equal prefix lengths (repeatable)
    #[arg(long = "tun-nat", value_name = "SRC:DST")]
    tun_nat: Vec<String>,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log to this file in addition to stdout
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let (value, unit) = s.split_at(s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len()));
    let value: u64 = value.parse().map_err(|_| format!("invalid duration: {}", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("invalid duration unit: {}", s)),
    }
}

fn init_logging(verbose: bool, log_file: Option<&PathBuf>) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("cannot create log directory for {:?}", path))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => registry.init(),
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<Config> {
    let target = HopAddr::parse(&cli.target, None, cli.port)
        .map_err(|e| anyhow::anyhow!("invalid SSH target {:?}: {}", cli.target, e))?;

    let tun = if cli.tun || cli.tun_global {
        let mut aliases = Vec::with_capacity(cli.tun_nat.len());
        for spec in &cli.tun_nat {
            aliases.push(SubnetAlias::parse(spec)?);
        }
        Some(TunOptions {
            cidr: cli.tun_ip,
            routes: cli.tun_route.clone(),
            global: cli.tun_global,
            aliases,
            ..TunOptions::default()
        })
    } else {
        None
    };

    Ok(Config {
        http_addr: cli.http.clone(),
        socks_addr: cli.socks5.clone(),
        ssh_user: target.user,
        ssh_host: target.host,
        ssh_port: target.port,
        jump_hosts: cli.jump.clone(),
        key_file: cli.identity_file.clone(),
        password: cli.pass.clone(),
        interactive: cli.pass.is_none(),
        dial_timeout: cli.timeout,
        rule_file: cli.rules.clone(),
        system_proxy: cli.sys_proxy,
        http_upstream: cli.http_upstream.clone(),
        tun,
    })
}

#[cfg(unix)]
fn check_tun_privileges() -> Result<()> {
    // SAFETY: geteuid has no preconditions
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("TUN mode needs root privileges; run under sudo");
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_tun_privileges() -> Result<()> {
    Ok(())
}

fn print_banner(config: &Config) {
    println!("\nproxy gateway started:");
    println!("  HTTP proxy:   http://{}", rutun_engine::config::client_addr(&config.http_addr));
    if let Some(socks) = &config.socks_addr {
        println!("  SOCKS5 proxy: socks5://{}", rutun_engine::config::client_addr(socks));
    }
    if let Some(tun) = &config.tun {
        let mode = if tun.global { "global" } else { "routed" };
        println!("  TUN:          {} ({} mode)", tun.cidr, mode);
    }
    if config.jump_hosts.is_empty() {
        println!("  SSH server:   {}:{}", config.ssh_host, config.ssh_port);
    } else {
        println!(
            "  SSH chain:    {} -> {}:{}",
            config.jump_hosts.join(" -> "),
            config.ssh_host,
            config.ssh_port
        );
    }
    if config.system_proxy {
        println!("  system proxy: enabled");
    }
    println!("press Ctrl+C to exit");
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            r = signal::ctrl_c() => {
                if r.is_ok() {
                    info!("received SIGINT");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log.as_ref())?;

    let config = build_config(&cli)?;
    if config.tun.is_some() {
        check_tun_privileges()?;
    }

    let mut engine = Engine::new(config.clone()).context("configuration error")?;
    let shutdown_tx = engine.create_shutdown_handle();

    let mut engine_handle = tokio::spawn(async move { engine.start().await });

    print_banner(&config);

    tokio::select! {
        _ = wait_for_shutdown() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut engine_handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    error!("shutdown error: {}", e);
                }
                Ok(Err(e)) => error!("engine task failed: {}", e),
                Err(_) => error!("engine did not stop within the grace period"),
            }
        }
        result = &mut engine_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("gateway failed: {}", e);
                    bail!("gateway failed: {}", e);
                }
                Err(e) => bail!("engine task failed: {}", e),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rutun_engine::config::DEFAULT_TIMEOUT;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn minimal_invocation() {
        let cli = parse(&["rutun", "alice@example.com"]);
        assert_eq!(cli.target, "alice@example.com");
        assert_eq!(cli.http, ":8080");
        assert_eq!(cli.port, 22);
        assert_eq!(cli.timeout, DEFAULT_TIMEOUT);
        assert!(cli.sys_proxy);
        assert!(!cli.tun);
    }

    #[test]
    fn listen_is_an_alias_for_http() {
        let cli = parse(&["rutun", "--listen", ":9999", "alice@example.com"]);
        assert_eq!(cli.http, ":9999");
    }

    #[test]
    fn jump_list_splits_on_commas() {
        let cli = parse(&["rutun", "-J", "a@b,c@d:2222", "alice@example.com"]);
        assert_eq!(cli.jump, vec!["a@b", "c@d:2222"]);
    }

    #[test]
    fn duration_parser_accepts_common_forms() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("oops").is_err());
    }

    #[test]
    fn tun_global_implies_tun() {
        let cli = parse(&["rutun", "-g", "alice@example.com"]);
        let config = build_config(&cli).unwrap();
        let tun = config.tun.expect("tun options");
        assert!(tun.global);
    }

    #[test]
    fn tun_nat_parses_aliases() {
        let cli = parse(&[
            "rutun",
            "--tun",
            "--tun-nat",
            "10.77.0.0/24:192.168.1.0/24",
            "alice@example.com",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.tun.unwrap().aliases.len(), 1);
    }

    #[test]
    fn bad_alias_fails_config_build() {
        let cli = parse(&[
            "rutun",
            "--tun",
            "--tun-nat",
            "10.0.0.0/24:172.16.0.0/16",
            "alice@example.com",
        ]);
        assert!(build_config(&cli).is_err());
    }

    #[test]
    fn target_port_in_spec_overrides_flag() {
        let cli = parse(&["rutun", "-p", "2200", "alice@example.com:2222"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.ssh_port, 2222);

        let cli = parse(&["rutun", "-p", "2200", "alice@example.com"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.ssh_port, 2200);
    }

    #[test]
    fn password_implies_non_interactive() {
        let cli = parse(&["rutun", "--pass", "hunter2", "alice@example.com"]);
        let config = build_config(&cli).unwrap();
        assert!(!config.interactive);
        assert_eq!(config.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn sys_proxy_can_be_disabled() {
        let cli = parse(&["rutun", "--sys-proxy", "false", "alice@example.com"]);
        assert!(!cli.sys_proxy);
    }
}

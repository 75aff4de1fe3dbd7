//! Bastion CLI - keep SSH tunnels through a bastion host up behind a local daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bastion_cli::config::{BastionConfig, ConfigManager};
use bastion_control::{ClientConnector, ConnectError, ControlServer, ProcessSpawner};
use bastion_tunnel::address::normalize_key_path;
use bastion_tunnel::{SshTransport, TunnelParams};

/// Bastion CLI - seamless SSH tunneling
#[derive(Parser, Debug)]
#[command(name = "bastion")]
#[command(about = "Keep SSH tunnels through a bastion host up behind a local daemon", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Path to file holding the daemon's discovery record
    #[arg(value_name = "STATE_FILE")]
    state_file: PathBuf,

    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Config file (defaults to ~/.bastion/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attempts made to reach the daemon before giving up
    #[arg(long)]
    attempts: Option<u32>,

    /// Seconds to wait between attempts
    #[arg(long)]
    backoff_secs: Option<u64>,

    /// SOCKS5 proxy (host[:port]) used to reach the bastion
    #[arg(long, env = "BASTION_SOCKS_PROXY")]
    socks_proxy: Option<String>,

    /// First port tried for the daemon's control endpoint
    #[arg(long)]
    control_base_port: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure a tunnel is maintained by the daemon, starting the daemon if needed
    Tunnel {
        /// Publicly accessible address of the bastion
        #[arg(long = "public_address")]
        public_address: String,

        /// Username for the bastion
        #[arg(long)]
        username: String,

        /// Path to the private key for the bastion
        #[arg(long)]
        pkey: String,

        /// Remote bind address (egress end of the tunnel)
        #[arg(long = "remote_bind")]
        remote_bind: String,

        /// Local bind address (ingress end of the tunnel)
        #[arg(long = "local_bind")]
        local_bind: String,
    },

    /// Run the daemon that keeps tunnels up
    Server {
        /// Suppress any output
        #[arg(long)]
        silent: bool,
    },

    /// Send a message to the running daemon
    Message {
        #[arg(value_enum)]
        message: MessageKind,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum MessageKind {
    /// List active tunnels
    Status,
    /// Stop all tunnels and the daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.command {
        Commands::Server { silent: true } => "off",
        _ => cli.log_level.as_str(),
    };
    init_logging(log_level)?;

    let config = load_config(&cli)?;
    let connector = build_connector(&cli, &config)?;

    match &cli.command {
        Commands::Tunnel {
            public_address,
            username,
            pkey,
            remote_bind,
            local_bind,
        } => {
            // Relative key paths are relative to the caller, not the daemon
            let params = TunnelParams {
                public_address: public_address.clone(),
                username: username.clone(),
                private_key: normalize_key_path(pkey).display().to_string(),
                remote_bind: remote_bind.clone(),
                local_bind: local_bind.clone(),
            };
            handle_tunnel(&connector, &params).await
        }
        Commands::Server { silent } => handle_server(&cli, &config, &connector, *silent).await,
        Commands::Message { message } => handle_message(&connector, *message).await,
    }
}

fn load_config(cli: &Cli) -> Result<BastionConfig> {
    let mut config = match &cli.config {
        Some(path) => ConfigManager::load_from(path)?,
        None => ConfigManager::load()?,
    };

    if let Some(attempts) = cli.attempts {
        config.connect_attempts = attempts;
    }
    if let Some(backoff) = cli.backoff_secs {
        config.retry_backoff_secs = backoff;
    }
    if let Some(proxy) = &cli.socks_proxy {
        config.socks_proxy = Some(proxy.clone());
    }
    if let Some(port) = cli.control_base_port {
        config.control_base_port = port;
    }

    Ok(config)
}

/// Connector whose spawned daemon inherits this invocation's settings
fn build_connector(cli: &Cli, config: &BastionConfig) -> Result<ClientConnector> {
    let mut daemon_args: Vec<OsString> = Vec::new();
    if let Some(path) = &cli.config {
        daemon_args.push("--config".into());
        daemon_args.push(path.into());
    }
    if let Some(proxy) = &config.socks_proxy {
        daemon_args.push("--socks-proxy".into());
        daemon_args.push(proxy.into());
    }
    daemon_args.push("--control-base-port".into());
    daemon_args.push(config.control_base_port.to_string().into());

    let spawner = ProcessSpawner::current_exe()
        .context("Failed to get current executable path")?
        .with_args(daemon_args);

    Ok(ClientConnector::new(
        config.connector_config(&cli.state_file),
        Arc::new(spawner),
    ))
}

async fn handle_tunnel(connector: &ClientConnector, params: &TunnelParams) -> Result<()> {
    let local_bind = match connector.ensure_tunnel(params).await {
        Ok(local_bind) => local_bind,
        Err(ConnectError::Unreachable { attempts }) => exit_unreachable(attempts),
        Err(ConnectError::Rejected(reason)) => {
            anyhow::bail!("Cannot start tunnel: {}", reason)
        }
        Err(e) => return Err(e.into()),
    };

    let output = serde_json::json!({
        "bastion_host": local_bind.host,
        "bastion_port": local_bind.port.to_string(),
    });
    println!("{}", output);
    Ok(())
}

async fn handle_server(
    cli: &Cli,
    config: &BastionConfig,
    connector: &ClientConnector,
    silent: bool,
) -> Result<()> {
    if connector.status().await.is_ok() {
        if !silent {
            println!("Server already running");
        }
        return Ok(());
    }

    let transport = Arc::new(SshTransport::new(config.transport_config()?));
    let server = ControlServer::bind(&config.server_config(&cli.state_file), transport)
        .await
        .context("Failed to start tunnel server")?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.shutdown();
        }
    });

    debug!("Serving control requests on {}", server.local_addr());
    server.run().await?;
    Ok(())
}

async fn handle_message(connector: &ClientConnector, message: MessageKind) -> Result<()> {
    let result = match message {
        MessageKind::Status => connector.status().await.map(|tunnels| tunnels.join("\n")),
        MessageKind::Stop => connector.stop_server().await,
    };

    match result {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(ConnectError::Unreachable { attempts }) => exit_unreachable(attempts),
        Err(e) => Err(e.into()),
    }
}

fn exit_unreachable(attempts: u32) -> ! {
    debug!("Gave up after {} attempt(s)", attempts);
    eprintln!("Cannot connect to server");
    std::process::exit(1);
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    // Logs go to stderr; stdout carries command output
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tunnel_command() {
        let cli = Cli::try_parse_from([
            "bastion",
            "/tmp/bastion.state",
            "tunnel",
            "--public_address",
            "bastion.example.com",
            "--username",
            "ops",
            "--pkey",
            "~/.ssh/id_rsa",
            "--remote_bind",
            "10.0.0.5:22",
            "--local_bind",
            "127.0.0.1:10022",
        ])
        .unwrap();

        assert_eq!(cli.state_file, PathBuf::from("/tmp/bastion.state"));
        match cli.command {
            Commands::Tunnel {
                public_address,
                remote_bind,
                ..
            } => {
                assert_eq!(public_address, "bastion.example.com");
                assert_eq!(remote_bind, "10.0.0.5:22");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_server_and_message() {
        let cli = Cli::try_parse_from(["bastion", "state", "server", "--silent"]).unwrap();
        assert!(matches!(cli.command, Commands::Server { silent: true }));

        let cli = Cli::try_parse_from(["bastion", "state", "message", "stop"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Message {
                message: MessageKind::Stop
            }
        ));

        assert!(Cli::try_parse_from(["bastion", "state", "message", "restart"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "bastion",
            "--attempts",
            "2",
            "--control-base-port",
            "7000",
            "--config",
            "/nonexistent/bastion/config.json",
            "state",
            "message",
            "status",
        ])
        .unwrap();

        let config = load_config(&cli).unwrap();
        assert_eq!(config.connect_attempts, 2);
        assert_eq!(config.control_base_port, 7000);
        assert_eq!(config.retry_backoff_secs, 5);
    }
}

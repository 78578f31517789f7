//! c8y-realtime CLI binary.
//!
//! Realtime notification client for the command line.
//!
//! # Commands
//!
//! - `listen` - Subscribe to channels and print pushed events as JSON lines
//! - `handshake` - Verify credentials and print the assigned client id
//!
//! Connection settings come from the config file, then `C8Y_*` environment
//! variables, then command line flags.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use realtime::{Config, RealtimeClient, VERSION};

#[derive(Parser)]
#[command(name = "c8y-realtime")]
#[command(version = VERSION)]
#[command(about = "Realtime notification client (Bayeux over websocket)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to channels and print events until Ctrl-C
    Listen {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Channel to subscribe to (repeatable), e.g. /operations/12345
        #[arg(short, long = "channel", required = true)]
        channels: Vec<String>,

        /// Pretty-print event payloads
        #[arg(long)]
        pretty: bool,
    },

    /// Perform a handshake and print the client id
    Handshake {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(Args)]
struct ConnectionArgs {
    /// Config file (default: <config dir>/c8y-realtime/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Platform URL
    #[arg(short, long)]
    url: Option<String>,

    /// Tenant id
    #[arg(short, long)]
    tenant: Option<String>,

    /// Login name
    #[arg(long)]
    user: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            connection,
            channels,
            pretty,
        } => cmd_listen(connection, channels, pretty),

        Commands::Handshake { connection } => cmd_handshake(connection),
    }
}

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn load_config(args: &ConnectionArgs) -> anyhow::Result<Config> {
    let base = match args.config.clone().or_else(Config::default_path) {
        Some(path) if path.exists() => Config::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        Some(path) if args.config.is_some() => {
            anyhow::bail!("config file {} not found", path.display())
        },
        _ => Config::default(),
    };

    let mut config = base.with_env();
    if let Some(url) = &args.url {
        config.connection.url = url.clone();
    }
    if let Some(tenant) = &args.tenant {
        config.connection.tenant = tenant.clone();
    }
    if let Some(user) = &args.user {
        config.connection.username = user.clone();
    }
    if let Some(timeout) = args.timeout {
        config.realtime = config.realtime.with_timeout(Duration::from_millis(timeout));
    }

    if config.connection.url.is_empty() {
        anyhow::bail!("no platform URL: pass --url or set C8Y_URL");
    }
    Ok(config)
}

async fn connect(config: Config) -> anyhow::Result<RealtimeClient> {
    let credentials = config.connection.credentials()?;
    let client = RealtimeClient::start(credentials, &config.connection.url, config.realtime)
        .await
        .context("starting realtime session")?;
    Ok(client)
}

fn cmd_listen(args: ConnectionArgs, channels: Vec<String>, pretty: bool) -> anyhow::Result<()> {
    init_logging(args.verbose);
    let config = load_config(&args)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = connect(config).await?;
        for channel in &channels {
            if let Err(e) = client.subscribe(channel).await {
                client.stop().await?;
                return Err(e).with_context(|| format!("subscribing to {channel}"));
            }
        }

        let mut events = client
            .take_events()
            .await
            .context("event stream already taken")?;
        let mut stdout = std::io::stdout();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, stopping");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::warn!("Session ended");
                        break;
                    };
                    let line = serde_json::json!({
                        "channel": event.channel,
                        "data": event.data,
                    });
                    if pretty {
                        writeln!(stdout, "{}", serde_json::to_string_pretty(&line)?)?;
                    } else {
                        writeln!(stdout, "{line}")?;
                    }
                    stdout.flush()?;
                }
            }
        }

        client.stop().await?;
        let stats = client.stats();
        tracing::info!(
            events = stats.events_delivered,
            cycles = stats.connect_cycles,
            dropped = stats.envelopes_dropped,
            "Done"
        );
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_handshake(args: ConnectionArgs) -> anyhow::Result<()> {
    init_logging(args.verbose);
    let config = load_config(&args)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = connect(config).await?;
        let client_id = client.client_id().await.unwrap_or_default();
        println!("{client_id}");
        client.stop().await?;
        Ok::<_, anyhow::Error>(())
    })
}

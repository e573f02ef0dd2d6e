use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use bustrack::actions::status::version;
use bustrack::log_format::TargetFirstFormat;
use bustrack::relay_config::RelayConfig;

mod commands;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser, Debug)]
#[command(
    name = "bustrack",
    version = version(),
    about = "Live bus position relay for drivers, passengers and admins"
)]
struct Cli {
    /// Path to a relay TOML config file
    #[arg(long, global = true, env = "BUSTRACK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay's HTTP and WebSocket server
    Serve {
        /// Interface to bind to
        #[arg(long)]
        interface: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Port for the Prometheus /metrics endpoint (disabled when unset)
        #[arg(long)]
        metrics_port: Option<u16>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    let dsn = std::env::var("SENTRY_DSN").ok().filter(|dsn| !dsn.is_empty())?;

    let environment = std::env::var("BUSTRACK_ENV").unwrap_or_else(|_| "development".into());

    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: Some(version().into()),
            environment: Some(environment.into()),
            attach_stacktrace: true,
            ..Default::default()
        },
    )))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = std::io::stderr().is_terminal();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi)
                .event_format(TargetFirstFormat::new(ansi)),
        )
        .with(sentry_tracing::layer())
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Keep the guard alive so buffered events are flushed on exit
    let _sentry = init_sentry();
    init_tracing();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bustrack-worker")
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = RelayConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            interface,
            port,
            metrics_port,
        } => {
            if let Some(interface) = interface {
                config.interface = interface;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if metrics_port.is_some() {
                config.metrics_port = metrics_port;
            }
            commands::handle_serve(config).await
        }
        Commands::Config => commands::handle_print_config(&config),
    }
}

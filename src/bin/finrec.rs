use clap::Parser;
use finrec::{
    config::SystemConfig,
    event::{Event, FnHandler},
    Error, System,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Print every dispatched event to stdout
    #[arg(short, long)]
    echo: bool,

    /// Enable debug mode
    #[arg(short, long)]
    verbose: bool,
}

async fn run(cli: &Cli) -> Result<(), Error> {
    let config = if cli.config.exists() {
        SystemConfig::from_file(&cli.config)?
    } else {
        // Default config
        SystemConfig::default()
    };
    info!("config loaded.");
    debug!("config: {:?}", config);

    let system = System::init(config).await?;

    if cli.echo {
        let echo = FnHandler::arc("stdout-echo", |event: Event| async move {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize {}: {}", event.correlation_id, e),
            }
            Ok(())
        });
        for event_type in system.event_registry().event_types() {
            system.event_bus().subscribe(event_type, echo.clone()).await;
        }
    }

    println!("finrec started. Reading events from stdin, Ctrl+C to shutdown.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => publish_line(&system, &line).await,
                    Ok(None) => break,
                    Err(e) => return Err(Error::internal(format!("Failed to read stdin: {}", e))),
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.map_err(|e| Error::internal(format!("Failed to wait for Ctrl+C: {}", e)))?;
                println!("Shutdown signal received, performing clean shutdown...");
                break;
            }
        }
    }

    let stats = system.session_manager().get_stats();
    info!(
        "Active sessions: {}, unique users: {}",
        stats.active_sessions, stats.unique_users
    );
    system.shutdown().await?;
    println!("System shutdown completed.");
    Ok(())
}

async fn publish_line(system: &System, line: &str) {
    let value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping malformed JSON line: {}", e);
            return;
        }
    };
    let event = match system.event_registry().parse_envelope(&value) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejected event: {}", e);
            return;
        }
    };
    match system.event_bus().publish(event).await {
        Ok(delivery) => debug!(
            "Accepted {} for {} subscribers",
            delivery.correlation_id,
            delivery.subscriber_count()
        ),
        Err(e) => warn!("Publish failed: {}", e),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use safeguard::config::Config;
use safeguard::detect::Severity;
use safeguard::storage::{self, EventFilter};

#[derive(Parser)]
#[command(
    name = "safeguard",
    about = "Real-time threat detection and alert pipeline for live video streams",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "safeguard.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + detection pipeline)
    Serve {
        /// Bind address (overrides config)
        #[arg(long)]
        bind: Option<String>,

        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },

    /// Inspect stored events
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },

    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Alert notification channel utilities
    Notify {
        #[command(subcommand)]
        action: NotifyAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the config file and print the resolved capabilities
    Check,
}

#[derive(Subcommand)]
enum NotifyAction {
    /// Send a synthetic critical alert through the notifier
    Test,
}

#[derive(Subcommand)]
enum EventsAction {
    /// List stored events, oldest first
    List {
        /// Only events for this session
        #[arg(long)]
        session: Option<String>,

        /// Minimum severity (low, medium, high, critical)
        #[arg(long)]
        min_severity: Option<String>,

        /// Maximum number of events to print
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind, db } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            if let Some(db) = db {
                config.storage.db_path = db;
            }
            tracing::info!(bind = %config.server.bind, "Starting SafeGuard daemon");
            safeguard::serve(config).await?;
        }
        Commands::Events { action } => match action {
            EventsAction::List {
                session,
                min_severity,
                limit,
            } => {
                let min_severity = match min_severity.as_deref() {
                    None => None,
                    Some(raw) => Some(
                        Severity::parse(raw)
                            .ok_or_else(|| anyhow::anyhow!("unknown severity '{raw}'"))?,
                    ),
                };
                let pool = storage::open_pool(&config.storage.db_path)?;
                let filter = EventFilter {
                    session_id: session,
                    min_severity,
                    limit: Some(limit),
                    ..Default::default()
                };
                let events = storage::query_events(&pool, &filter)?;
                if events.is_empty() {
                    println!("No events found.");
                } else {
                    println!(
                        "{:<26} | {:<10} | {:<15} | {:<8} | {:<5} | Diagnosis",
                        "Time", "Session", "Label", "Severity", "Conf"
                    );
                    println!(
                        "{:-<26}-|-{:-<10}-|-{:-<15}-|-{:-<8}-|-{:-<5}-|-{:-<30}",
                        "", "", "", "", "", ""
                    );
                    for ev in events {
                        println!(
                            "{:<26} | {:<10} | {:<15} | {:<8} | {:<5.2} | {}{}",
                            ev.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                            ev.session_id,
                            ev.label,
                            ev.severity.to_string(),
                            ev.confidence,
                            ev.diagnosis.as_deref().unwrap_or("-"),
                            if ev.fallback_diagnosis {
                                " (fallback)"
                            } else {
                                ""
                            },
                        );
                    }
                }
            }
        },
        Commands::Config {
            action: ConfigAction::Check,
        } => {
            // Config::load already validated; report what the daemon would run with.
            println!("Config OK: {}", cli.config);
            println!("  bind:              {}", config.server.bind);
            println!("  db_path:           {}", config.storage.db_path);
            println!(
                "  detector:          {}",
                config
                    .detector
                    .service_url
                    .as_deref()
                    .unwrap_or("(disabled)")
            );
            println!(
                "  diagnosis:         {}",
                if config.diagnosis.api_key.is_some() {
                    config.diagnosis.model.as_deref().unwrap_or("(unset)")
                } else {
                    "(disabled)"
                }
            );
            println!(
                "  notifier:          {}",
                config
                    .notifier
                    .webhook_url
                    .as_deref()
                    .unwrap_or("(disabled)")
            );
            println!(
                "  thresholds:        low={} medium={} high={}",
                config.severity.low_threshold,
                config.severity.medium_threshold,
                config.severity.high_threshold
            );
            println!(
                "  dangerous labels:  {}",
                config.severity.dangerous_labels.join(", ")
            );
            println!("  cooldown window:   {}s", config.cooldown.window_secs);
        }
        Commands::Notify {
            action: NotifyAction::Test,
        } => {
            use safeguard::notify;
            use safeguard::pipeline::Event;

            let notifier = notify::from_config(&config.notifier);
            let mut event = Event::new("notify-test", "test object", 0.99, Severity::Critical);
            event.diagnosis =
                Some("Synthetic alert generated by `safeguard notify test`.".to_string());

            if notifier.notify(&event).await {
                println!("Notification sent.");
            } else {
                println!("Notification FAILED, check notifier config and logs.");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

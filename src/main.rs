use clap::Parser;
use figment::{Figment, providers::Env};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use clawdfather::config::Config;
use clawdfather::services::{ServiceManager, ServiceResult, TickerService, WebService};
use clawdfather::sessions::{SessionManager, SessionRegistry};
use clawdfather::ssh::{self, OpensshLauncher, SshProber};
use clawdfather::state::AppState;
use clawdfather::store::{MemoryStore, PgStore, Store};
use clawdfather::ticker::CreditTicker;

/// Clawdfather - metered SSH sessions over chat
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = LogFormatter::Auto)]
    formatter: LogFormatter,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogFormatter {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
    /// Auto-select based on build mode (debug=pretty, release=json)
    Auto,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Configuration first; a missing master key or OAuth credential must
    // fail before anything else starts.
    let config: Config = Figment::new()
        .merge(Env::raw())
        .extract()
        .expect("Failed to load config");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,clawdfather={}", config.log_level))
    });

    let use_pretty = match args.formatter {
        LogFormatter::Pretty => true,
        LogFormatter::Json => false,
        LogFormatter::Auto => cfg!(debug_assertions),
    };
    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if use_pretty {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .pretty()
                .finish(),
        )
    } else {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .json()
                .finish(),
        )
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting clawdfather"
    );

    let config = Arc::new(config);

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .expect("Failed to connect to database");
            info!(backend = "postgres", "store ready");
            Arc::new(store)
        }
        None => {
            warn!(
                backend = "memory",
                "DATABASE_URL not set; state will not survive a restart"
            );
            Arc::new(MemoryStore::new())
        }
    };

    ssh::ensure_runtime_dir(&config.runtime_dir).expect("Failed to prepare runtime dir");

    let registry = Arc::new(SessionRegistry::new());
    let prober = Arc::new(SshProber::new(config.runtime_dir.clone()));
    let launcher = Arc::new(OpensshLauncher::new(config.runtime_dir.clone()));
    let manager = Arc::new(SessionManager::new(
        store.clone(),
        registry.clone(),
        prober,
        launcher,
        config.clone(),
    ));
    let ticker = Arc::new(CreditTicker::new(
        store.clone(),
        registry.clone(),
        manager.clone(),
        config.tick_interval,
    ));

    let app_state = AppState::new(store.clone(), registry, manager.clone(), config.clone());

    info!(
        port = config.web_port,
        tick_interval = ?config.tick_interval,
        session_cap = config.session_cap,
        "configuration loaded"
    );

    let mut service_manager = ServiceManager::new();
    service_manager.register(Box::new(WebService::new(config.web_port, app_state)));
    service_manager.register(Box::new(TickerService::new(ticker, manager, store)));
    service_manager.spawn_all();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("received ctrl+c, gracefully shutting down...");
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm_stream =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM signal handler");
        sigterm_stream.recv().await;
        info!("received SIGTERM, gracefully shutting down...");
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let mut exit_code = 0;

    tokio::select! {
        (service_name, result) = service_manager.run() => {
            match result {
                ServiceResult::GracefulShutdown => {
                    info!(service = service_name, "service completed gracefully");
                }
                ServiceResult::NormalCompletion => {
                    warn!(service = service_name, "service completed unexpectedly");
                    exit_code = 1;
                }
                ServiceResult::Error(e) => {
                    error!(service = service_name, error = ?e, "service failed");
                    exit_code = 1;
                }
            }
            if let Err(pending) = service_manager.shutdown(config.shutdown_timeout).await {
                warn!(pending = ?pending, "shutdown left services running");
                exit_code = if exit_code == 0 { 2 } else { exit_code };
            }
        }
        _ = ctrl_c => {
            if let Err(pending) = service_manager.shutdown(config.shutdown_timeout).await {
                warn!(pending = ?pending, "shutdown left services running");
                exit_code = 2;
            }
        }
        _ = sigterm => {
            if let Err(pending) = service_manager.shutdown(config.shutdown_timeout).await {
                warn!(pending = ?pending, "shutdown left services running");
                exit_code = 2;
            }
        }
    }

    info!(exit_code, "application shutdown complete");
    std::process::exit(exit_code);
}

use std::path::PathBuf;
use std::sync::Arc;

use mail_sentinel::classify::create_classifier;
use mail_sentinel::config::MonitorConfig;
use mail_sentinel::ledger::{Ledger, LibSqlLedger};
use mail_sentinel::notify::create_notifier;
use mail_sentinel::scheduler::PollScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _log_guard = init_tracing();

    let config_path = std::env::var("MAIL_SENTINEL_CONFIG")
        .map(PathBuf::from)
        .ok()
        .or_else(|| std::env::args().nth(1).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config/sentinel.json"));

    let config = MonitorConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error: failed to load {}: {e}", config_path.display());
        std::process::exit(1);
    });

    eprintln!("📬 mail-sentinel v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Poll interval: {}s", config.poll_interval_secs);
    eprintln!("   Oracle model: {}", config.classifier.model);

    // ── Ledger ───────────────────────────────────────────────────────────
    let ledger: Arc<dyn Ledger> = Arc::new(
        LibSqlLedger::new_local(&config.database_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: failed to open ledger at {}: {e}",
                    config.database_path.display()
                );
                std::process::exit(1);
            }),
    );
    if let Ok(count) = ledger.processed_count().await {
        eprintln!("   Messages processed in previous runs: {count}");
    }

    // ── Classifier + Notifier ────────────────────────────────────────────
    let classifier = create_classifier(&config.classifier).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    let notifier = create_notifier(&config.notifier).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    eprintln!("   Notifier: {}", notifier.name());

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler =
        PollScheduler::from_config(&config, ledger, classifier, notifier).unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        });
    eprintln!("   Accounts: {}\n", scheduler.account_count());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handles = scheduler.start(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received — draining in-flight polls");
    shutdown_tx.send(true).ok();
    for handle in handles {
        handle.await.ok();
    }
    tracing::info!("Monitor stopped");

    Ok(())
}

/// Initialize tracing: env-filtered console output, plus a daily-rotated
/// log file when `MAIL_SENTINEL_LOG_DIR` is set.
///
/// Returns the appender guard; dropping it flushes buffered file output.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    if let Ok(dir) = std::env::var("MAIL_SENTINEL_LOG_DIR") {
        let appender = tracing_appender::rolling::daily(dir, "sentinel.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_target(false)
            .init();
        None
    }
}

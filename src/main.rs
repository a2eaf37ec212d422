use std::sync::Arc;

use tracing::{info, warn};

use domain_sentinel::config::MonitorConfig;
use domain_sentinel::monitor::Monitor;
use domain_sentinel::notify::{
    EmailNotifier, Notifier, SmtpConfig, TelegramConfig, TelegramNotifier,
};
use domain_sentinel::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "domain_sentinel=info".into()),
        )
        .init();

    let db_path = std::env::var("SENTINEL_DB").unwrap_or_else(|_| "data/sentinel.db".into());
    let store = Arc::new(Store::open(&db_path)?);

    let config = MonitorConfig::load(&store)?;
    info!(
        "configuration: interval {:?}, concurrency {}, timeout {:?}",
        config.check_interval, config.concurrent_limit, config.timeout
    );

    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    let smtp = SmtpConfig::from_settings(&store)?;
    if smtp.enabled {
        info!("email notifications enabled via {}", smtp.host);
    }
    notifiers.push(Arc::new(EmailNotifier::new(smtp)));

    let telegram = TelegramConfig::from_settings(&store)?;
    if telegram.enabled {
        info!("telegram notifications enabled");
    }
    match TelegramNotifier::new(telegram) {
        Ok(notifier) => notifiers.push(Arc::new(notifier)),
        Err(e) => warn!("telegram notifier unavailable: {e}"),
    }

    let monitor = Monitor::new(config, store, notifiers)?;
    monitor.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    monitor.stop().await;

    Ok(())
}

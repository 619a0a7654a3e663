use std::sync::Arc;

use anyhow::Result;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use home_energy_service::{
    alerts::{
        notifier::{AlertNotifier, LogNotifier, WebhookNotifier},
        AlertSink,
    },
    analytics::AnalyticsEngine,
    api,
    config::Config,
    control::ControlService,
    db,
    ingest::{MessageDispatcher, TelemetryPipeline},
    liveness::LivenessMonitor,
    mqtt::ConnectionManager,
    reading_cache::ReadingCache,
    rejects::RejectArchive,
    service::EnergyService,
    store::{PgStore, Stores},
    telemetry::TelemetryRecorder,
    timesync::TimeSyncScheduler,
    ttl_cache::TtlCache,
    usage::UsageAggregator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; variables may also come from the environment
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_pool).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let stores = Stores::postgres(PgStore::new(pool));
    let (mqtt, inbound) = ConnectionManager::new(config.mqtt.clone());
    let publisher = Arc::new(mqtt.clone());

    let notifier: Arc<dyn AlertNotifier> = match &config.alert_webhook_url {
        Some(url) => {
            info!(url = %url, "Alerts forwarded to webhook");
            Arc::new(WebhookNotifier::new(
                url.clone(),
                config.alert_webhook_secret.clone(),
                config.alert_webhook_timeout,
            )?)
        }
        None => Arc::new(LogNotifier),
    };
    let alerts = AlertSink::new(stores.alerts.clone(), notifier);

    let cache = ReadingCache::new();
    let mut pipeline = TelemetryPipeline::new(
        stores.clone(),
        TelemetryRecorder::new(stores.clone(), cache),
        alerts.clone(),
        UsageAggregator::new(stores.usage.clone(), config.local_offset),
    );

    let time_sync = config.time_sync_device_id.as_ref().map(|device_id| {
        TimeSyncScheduler::new(
            publisher.clone(),
            stores.clone(),
            alerts.clone(),
            config.local_offset,
            device_id.clone(),
        )
    });
    if let Some(scheduler) = &time_sync {
        info!(device_id = %scheduler.reference_device(), "Daily time sync enabled");
        pipeline = pipeline.with_time_sync(scheduler.clone());
    }

    // Inbound broker traffic
    {
        let seen = Arc::new(TtlCache::new(config.dedup_ttl, config.dedup_max_entries));
        let mut dispatcher =
            MessageDispatcher::new(mqtt.topics().clone(), pipeline.clone(), seen.clone());
        seen.spawn_sweeper(config.dedup_sweep_interval);

        if let Some(dir) = &config.rejected_payload_dir {
            info!(dir = %dir.display(), "Rejected payloads archived");
            dispatcher = dispatcher.with_reject_archive(RejectArchive::new(dir.clone()));
        }
        tokio::spawn(dispatcher.run(inbound));
    }

    // A failed first connect schedules a reconnect; the HTTP API still starts.
    if let Err(e) = mqtt.connect().await {
        warn!(error = %e, "Initial MQTT connect failed; retrying in background");
    }

    if let Some(scheduler) = &time_sync {
        scheduler.start();
    }

    tokio::spawn(
        LivenessMonitor::new(stores.clone(), config.offline_after, config.liveness_interval).run(),
    );

    let control = ControlService::new(publisher, stores.clone());
    let analytics = AnalyticsEngine::new(stores.readings.clone(), config.local_offset);
    let service = EnergyService::new(stores, pipeline, control, analytics, config.local_offset);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, api::router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    mqtt.disconnect().await;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

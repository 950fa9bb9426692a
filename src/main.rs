use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleetwatch::*;
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn load_prices(config: &config::PricingConfig) -> Result<fleet::GpuPriceTable> {
    match &config.gpu_prices_path {
        Some(path) => {
            let table = fleet::GpuPriceTable::load(path, config.disk_cost_per_day)
                .map_err(|e| anyhow::anyhow!("GPU price table {}: {}", path, e))?;
            tracing::info!(path = %path, gpus = table.len(), "GPU price table loaded");
            Ok(table)
        }
        None => {
            tracing::warn!("pricing.gpu_prices_path not set; estimated costs will be 0");
            Ok(fleet::GpuPriceTable::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    let prices = load_prices(&app_config.pricing)?;

    let relay = Arc::new(providers::relay::RelayClient::new(
        &app_config.relay.base_url,
        Duration::from_secs(app_config.relay.request_timeout_secs),
    )?);
    let billing: Option<Arc<dyn providers::CostProvider>> = match &app_config.billing {
        Some(b) => Some(Arc::new(providers::billing::BillingClient::new(
            &b.base_url,
            b.token.clone(),
            b.cost_window,
            Duration::from_secs(b.request_timeout_secs),
        )?)),
        None => {
            tracing::info!("billing not configured; instance/credit alerts and health monitor disabled");
            None
        }
    };

    let collection = &app_config.collection;
    let store = Arc::new(store::MetricsStore::new(collection.window()));
    let (events_tx, events_rx) = mpsc::channel::<models::Notification>(collection.event_capacity);
    let (snapshot_tx, _) = broadcast::channel::<Arc<models::Snapshot>>(collection.broadcast_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (sink, max_message_len): (Arc<dyn notify::NotificationSink>, usize) =
        match &app_config.telegram {
            Some(t) => (
                Arc::new(notify::telegram::TelegramSink::new(
                    t.api_url.clone(),
                    t.token.clone(),
                    t.chat_id.clone(),
                    t.threads,
                    Duration::from_secs(app_config.relay.request_timeout_secs),
                )?),
                t.max_message_len,
            ),
            None => {
                tracing::info!("telegram not configured; notifications go to the log");
                (Arc::new(notify::LogSink), notify::DEFAULT_MAX_MESSAGE_LEN)
            }
        };
    let dispatcher_handle = notify::spawn_dispatcher(events_rx, sink, max_message_len);

    let builder = Arc::new(snapshot::SnapshotBuilder::new(
        relay,
        billing.clone(),
        prices,
        store.clone(),
        alerts::AlertMonitor::new(
            app_config.alerts.enabled,
            chrono::Duration::seconds(app_config.alerts.instance_mismatch_grace_secs as i64),
        ),
        snapshot::SnapshotBuilderConfig {
            credentials: providers::Credentials {
                email: app_config.relay.email.clone(),
                password: app_config.relay.password.clone(),
            },
            session_refresh: chrono::Duration::seconds(app_config.relay.session_refresh_secs as i64),
            include_cost: app_config.billing.as_ref().is_some_and(|b| b.include_cost),
        },
    ));

    let scheduler_handles = scheduler::spawn(
        scheduler::SchedulerDeps {
            builder,
            store: store.clone(),
            snapshot_tx,
            events: events_tx.clone(),
            shutdown_rx: shutdown_rx.clone(),
        },
        scheduler::SchedulerConfig {
            minute_interval: collection.minute_interval(),
            daily_schedule: collection.daily_schedule()?,
            hourly_report_interval: collection.hourly_report_interval(),
            report_offset: snapshot::report::report_offset(collection.report_utc_offset_hours),
        },
    );

    let health_handle = match (&billing, app_config.health.enabled) {
        (Some(cost), true) => {
            let monitor = Arc::new(health::HealthMonitor::new(
                cost.clone(),
                store.clone(),
                events_tx.clone(),
                app_config.health.to_health_config(),
            ));
            Some(monitor.spawn(shutdown_rx.clone()))
        }
        _ => None,
    };
    drop(events_tx);

    let server_handle = if app_config.server.enabled {
        let app = routes::app(store.clone());
        let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on http://{}", addr);
        let mut server_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, operation = "serve", "HTTP server stopped");
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;
    tracing::info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    scheduler_handles.join().await;
    if let Some(h) = health_handle {
        let _ = h.await;
    }
    if let Some(h) = server_handle {
        let _ = h.await;
    }
    // Every event sender is gone now; the dispatcher drains what is left and exits.
    let _ = dispatcher_handle.await;

    Ok(())
}

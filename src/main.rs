use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{error, info, warn};
use std::io::Write;
use tokio::sync::broadcast;

use pnc_ops_console::alerts::AlertFeed;
use pnc_ops_console::api_client::{ApiClient, IncidentQuery, UnitQuery};
use pnc_ops_console::auth::TokenStore;
use pnc_ops_console::config::AppConfig;
use pnc_ops_console::events::OpsEvent;
use pnc_ops_console::reconcile::{IncidentQueue, UnitBoard};
use pnc_ops_console::socket::SocketManager;

#[tokio::main]
async fn main() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("pnc-ops-console monitor started");

    let config = AppConfig::get();
    let tokens = TokenStore::open(&config.paths.session_file);
    let api = ApiClient::new(&config.api, tokens.clone())?;

    if !tokens.has_session() {
        let email =
            std::env::var("PNC_EMAIL").context("no stored session and PNC_EMAIL not set")?;
        let password =
            std::env::var("PNC_PASSWORD").context("no stored session and PNC_PASSWORD not set")?;
        let login = api.login(&email, &password).await.context("login failed")?;
        info!("logged in as {email} with role {:?}", login.role);
        if login.must_change {
            warn!("the account requires a password change");
        }
    }

    let mut queue = IncidentQueue::new(config.views.queue_limit);
    let mut units = UnitBoard::new();
    let alert_feed = AlertFeed::open(&config.paths.alerts_file, config.views.alert_limit);

    load_snapshot(&api, config.views.queue_limit, &mut queue, &mut units).await?;

    let manager = SocketManager::new(config.socket.clone(), tokens.clone());
    let mut subscription = manager.subscribe_ops();
    manager.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = subscription.recv() => match event {
                Ok(event) => {
                    if let OpsEvent::IncidentNew(created) = &event
                        && let Err(e) = alert_feed.push_incident(created)
                    {
                        warn!("failed to persist alert: {e:#}");
                    }
                    let queue_changed = queue.apply(&event);
                    let units_changed = units.apply(&event);
                    if queue_changed || units_changed {
                        info!(
                            "{} incidents in queue, {} units tracked, {} unread alerts",
                            queue.len(),
                            units.len(),
                            alert_feed.unread_count()
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missed events cannot be replayed; the snapshot is authoritative
                    warn!("event stream lagged by {n}, reloading snapshot");
                    reload_after_lag(&api, config.views.queue_limit, &mut queue, &mut units).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("event stream closed");
                    break;
                }
            },
        }
    }

    manager.disconnect();
    Ok(())
}

/// Best-effort snapshot reload after the event stream lagged. A failed
/// reload keeps the stale views; the next lag or reconnect retries.
async fn reload_after_lag(
    api: &ApiClient,
    queue_limit: usize,
    queue: &mut IncidentQueue,
    units: &mut UnitBoard,
) {
    if let Err(e) = load_snapshot(api, queue_limit, queue, units).await {
        warn!("snapshot reload failed, keeping stale view: {e:#}");
    }
}

async fn load_snapshot(
    api: &ApiClient,
    queue_limit: usize,
    queue: &mut IncidentQueue,
    units: &mut UnitBoard,
) -> Result<()> {
    let incidents = api
        .incidents(&IncidentQuery::active(queue_limit as u32))
        .await
        .context("failed to load incident snapshot")?;
    queue.replace_snapshot(incidents.items);

    let unit_page = api
        .units(&UnitQuery::default())
        .await
        .context("failed to load unit snapshot")?;
    units.replace_snapshot(unit_page.items);

    info!(
        "snapshot loaded: {} incidents, {} units",
        queue.len(),
        units.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pnc_ops_console::config::ApiConfig;
    use pnc_ops_console::types::{Incident, IncidentStatus};
    use std::time::Duration;

    #[tokio::test]
    async fn failed_snapshot_reload_keeps_the_stale_view() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::open(dir.path().join("session.json"));
        // Nothing listens here; every request fails
        let config = ApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            request_timeout: Duration::from_millis(200),
        };
        let api = ApiClient::new(&config, tokens).unwrap();

        let mut queue = IncidentQueue::new(10);
        queue.replace_snapshot(vec![Incident {
            id: "inc-1".to_string(),
            status: IncidentStatus::New,
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            lat: 14.63,
            lng: -90.5,
            accuracy: None,
            priority: None,
            battery: None,
        }]);
        let mut units = UnitBoard::new();

        reload_after_lag(&api, 10, &mut queue, &mut units).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.incidents()[0].id, "inc-1");
    }
}

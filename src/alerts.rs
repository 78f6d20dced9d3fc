//! Persistent alert feed fed by `incidents:new` events.
//!
//! Alerts survive restarts via a JSON file so an operator coming back after
//! a crash still sees what arrived while the console was up. The feed is
//! capped; old entries fall off the end.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::events::IncidentCreated;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub incident_id: String,
    pub message: String,
    /// Console path to the incident detail view
    pub href: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

#[derive(Clone)]
pub struct AlertFeed {
    inner: Arc<RwLock<Vec<Alert>>>,
    path: PathBuf,
    limit: usize,
}

impl AlertFeed {
    /// Open the feed backed by `path`. A missing or unreadable file starts
    /// the feed empty; persistence failures never block the console.
    pub fn open(path: impl Into<PathBuf>, limit: usize) -> Self {
        let path = path.into();
        let alerts = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<Alert>>(&raw) {
                Ok(alerts) => alerts,
                Err(e) => {
                    warn!("discarding corrupt alert file {path:?}: {e}");
                    vec![]
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
            Err(e) => {
                warn!("failed to read alert file {path:?}: {e}");
                vec![]
            }
        };
        Self {
            inner: Arc::new(RwLock::new(alerts)),
            path,
            limit,
        }
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.read().expect("alert feed lock").clone()
    }

    pub fn unread_count(&self) -> usize {
        self.inner
            .read()
            .expect("alert feed lock")
            .iter()
            .filter(|a| !a.read)
            .count()
    }

    /// Record an incoming incident as an unread alert at the head of the feed
    pub fn push_incident(&self, created: &IncidentCreated) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            incident_id: created.id.clone(),
            message: format!(
                "New incident at {:.5}, {:.5}",
                created.lat, created.lng
            ),
            href: format!("/incidents/{}", created.id),
            created_at: created.created_at,
            read: false,
        };
        {
            let mut alerts = self.inner.write().expect("alert feed lock");
            alerts.insert(0, alert.clone());
            alerts.truncate(self.limit);
        }
        self.persist()?;
        Ok(alert)
    }

    /// Add a free-form alert, e.g. from a system notice
    pub fn add(&self, incident_id: &str, message: &str, href: &str) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            message: message.to_string(),
            href: href.to_string(),
            created_at: Utc::now(),
            read: false,
        };
        {
            let mut alerts = self.inner.write().expect("alert feed lock");
            alerts.insert(0, alert.clone());
            alerts.truncate(self.limit);
        }
        self.persist()?;
        Ok(alert)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.inner
            .write()
            .expect("alert feed lock")
            .retain(|a| a.id != id);
        self.persist()
    }

    pub fn mark_all_read(&self) -> Result<()> {
        for alert in self.inner.write().expect("alert feed lock").iter_mut() {
            alert.read = true;
        }
        self.persist()
    }

    pub fn clear(&self) -> Result<()> {
        self.inner.write().expect("alert feed lock").clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let raw = {
            let alerts = self.inner.read().expect("alert feed lock");
            serde_json::to_string_pretty(&*alerts)?
        };
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write alert file {:?}", self.path))
    }
}

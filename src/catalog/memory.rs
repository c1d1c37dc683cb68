use anyhow::{anyhow, Result};
use std::sync::{Mutex, MutexGuard};

use super::{Catalog, DetectionEvent, StreamInfo, SubscribedObserver};

#[derive(Clone, Debug)]
struct StreamRow {
    id: i64,
    address: String,
    info: StreamInfo,
}

#[derive(Clone, Debug)]
struct SubscriptionRow {
    id: i64,
    observer_id: i64,
    stream_id: i64,
    alert: bool,
    alert_interval: String,
}

#[derive(Clone, Debug)]
struct AlertRow {
    subscription_id: i64,
    at: i64,
}

#[derive(Default)]
struct Tables {
    classes: Vec<(i64, String)>,
    streams: Vec<StreamRow>,
    observers: Vec<(i64, String)>,
    subscriptions: Vec<SubscriptionRow>,
    events: Vec<(i64, DetectionEvent)>,
    alerts: Vec<AlertRow>,
}

impl Tables {
    fn next_id(len: usize) -> i64 {
        len as i64 + 1
    }
}

/// In-memory catalog for tests and dry runs. Same semantics as `SqliteCatalog`.
#[derive(Default)]
pub struct InMemoryCatalog {
    tables: Mutex<Tables>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("catalog lock poisoned"))
    }

    pub fn add_class(&self, label: &str) -> Result<i64> {
        let mut tables = self.lock()?;
        if tables.classes.iter().any(|(_, l)| l == label) {
            return Err(anyhow!("class {} already exists", label));
        }
        let id = Tables::next_id(tables.classes.len());
        tables.classes.push((id, label.to_string()));
        Ok(id)
    }

    pub fn add_stream(&self, address: &str, name: &str, link: &str) -> Result<i64> {
        let mut tables = self.lock()?;
        let id = Tables::next_id(tables.streams.len());
        tables.streams.push(StreamRow {
            id,
            address: address.to_string(),
            info: StreamInfo {
                name: name.to_string(),
                link: link.to_string(),
            },
        });
        Ok(id)
    }

    pub fn add_observer(&self, email: &str) -> Result<i64> {
        let mut tables = self.lock()?;
        let id = Tables::next_id(tables.observers.len());
        tables.observers.push((id, email.to_string()));
        Ok(id)
    }

    pub fn subscribe(
        &self,
        observer_id: i64,
        stream_id: i64,
        alert_interval: &str,
        alert: bool,
    ) -> Result<i64> {
        let mut tables = self.lock()?;
        if !tables.observers.iter().any(|(id, _)| *id == observer_id) {
            return Err(anyhow!("unknown observer {}", observer_id));
        }
        if !tables.streams.iter().any(|s| s.id == stream_id) {
            return Err(anyhow!("unknown stream {}", stream_id));
        }
        let id = Tables::next_id(tables.subscriptions.len());
        tables.subscriptions.push(SubscriptionRow {
            id,
            observer_id,
            stream_id,
            alert,
            alert_interval: alert_interval.to_string(),
        });
        Ok(id)
    }

    pub fn events(&self) -> Result<Vec<(i64, DetectionEvent)>> {
        Ok(self.lock()?.events.clone())
    }

    pub fn alert_count(&self, subscription_id: i64) -> Result<usize> {
        Ok(self
            .lock()?
            .alerts
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .count())
    }
}

impl Catalog for InMemoryCatalog {
    fn class_id_for(&self, label: &str) -> Result<Option<i64>> {
        Ok(self
            .lock()?
            .classes
            .iter()
            .find(|(_, l)| l == label)
            .map(|(id, _)| *id))
    }

    fn persist_event(&self, event: &DetectionEvent) -> Result<i64> {
        let mut tables = self.lock()?;
        if !tables.classes.iter().any(|(id, _)| *id == event.class_id) {
            return Err(anyhow!("unknown class id {}", event.class_id));
        }
        let id = Tables::next_id(tables.events.len());
        tables.events.push((id, event.clone()));
        Ok(id)
    }

    fn subscribed_observers(&self, stream_address: &str) -> Result<Vec<SubscribedObserver>> {
        let tables = self.lock()?;
        let stream_ids: Vec<i64> = tables
            .streams
            .iter()
            .filter(|s| s.address == stream_address)
            .map(|s| s.id)
            .collect();

        let mut out = Vec::new();
        for sub in &tables.subscriptions {
            if !sub.alert || !stream_ids.contains(&sub.stream_id) {
                continue;
            }
            let Some((_, email)) = tables.observers.iter().find(|(id, _)| *id == sub.observer_id)
            else {
                continue;
            };
            out.push(SubscribedObserver {
                email: email.clone(),
                subscription_id: sub.id,
                alert_interval: sub.alert_interval.clone(),
            });
        }
        Ok(out)
    }

    fn last_alert_time(&self, subscription_id: i64) -> Result<Option<i64>> {
        Ok(self
            .lock()?
            .alerts
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .map(|a| a.at)
            .max())
    }

    fn record_alert(&self, subscription_id: i64, event_id: i64, at: i64) -> Result<()> {
        let mut tables = self.lock()?;
        if !tables.events.iter().any(|(id, _)| *id == event_id) {
            return Err(anyhow!("unknown detection event {}", event_id));
        }
        tables.alerts.push(AlertRow {
            subscription_id,
            at,
        });
        Ok(())
    }

    fn configured_stream_addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .streams
            .iter()
            .filter(|s| !s.address.is_empty())
            .map(|s| s.address.clone())
            .collect())
    }

    fn stream_info(&self, stream_address: &str) -> Result<Option<StreamInfo>> {
        Ok(self
            .lock()?
            .streams
            .iter()
            .find(|s| s.address == stream_address)
            .map(|s| s.info.clone()))
    }
}

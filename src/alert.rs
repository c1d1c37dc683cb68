//! Fan-out of a persisted detection event to subscribed observers.

use std::sync::Arc;

use crate::catalog::{Catalog, StreamInfo};
use crate::notify::{AlertMessage, Notifier};
use crate::throttle::{AlertThrottle, ThrottleDecision};

/// Shared by every pipeline task. Never fails: catalog and delivery errors are
/// logged per observer and the remaining observers are still processed.
pub struct AlertDispatcher {
    catalog: Arc<dyn Catalog>,
    notifier: Arc<dyn Notifier>,
    throttle: AlertThrottle,
}

impl AlertDispatcher {
    pub fn new(catalog: Arc<dyn Catalog>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            catalog,
            notifier,
            throttle: AlertThrottle::new(),
        }
    }

    /// Evaluate the throttle for every subscriber of `stream_address` and
    /// notify the ones it lets through. Returns the number of alerts sent.
    pub fn dispatch(
        &self,
        stream_address: &str,
        event_id: i64,
        class_name: &str,
        count: usize,
        now: i64,
    ) -> usize {
        let observers = match self.catalog.subscribed_observers(stream_address) {
            Ok(observers) => observers,
            Err(err) => {
                log::error!("failed to list observers of {}: {:#}", stream_address, err);
                return 0;
            }
        };
        if observers.is_empty() {
            return 0;
        }

        let stream = match self.catalog.stream_info(stream_address) {
            Ok(Some(info)) => info,
            Ok(None) => StreamInfo {
                name: stream_address.to_string(),
                link: String::new(),
            },
            Err(err) => {
                log::warn!("failed to load stream info for {}: {:#}", stream_address, err);
                StreamInfo {
                    name: stream_address.to_string(),
                    link: String::new(),
                }
            }
        };
        let message = AlertMessage::compose(class_name, count, &stream);

        let mut sent = 0;
        for observer in observers {
            let decision = match self.throttle.evaluate(
                self.catalog.as_ref(),
                observer.subscription_id,
                &observer.alert_interval,
                event_id,
                now,
            ) {
                Ok(decision) => decision,
                Err(err) => {
                    log::error!(
                        "throttle check failed for subscription {}: {:#}",
                        observer.subscription_id,
                        err
                    );
                    continue;
                }
            };
            if decision == ThrottleDecision::Suppress {
                log::debug!(
                    "alert for {} on {} suppressed (interval {})",
                    observer.email,
                    stream_address,
                    observer.alert_interval
                );
                continue;
            }

            log::info!("{}", message.body);
            match self
                .notifier
                .send(&observer.email, &message.subject, &message.body)
            {
                Ok(()) => sent += 1,
                Err(err) => log::warn!(
                    "{} delivery to {} failed: {:#}",
                    self.notifier.name(),
                    observer.email,
                    err
                ),
            }
        }
        sent
    }
}
